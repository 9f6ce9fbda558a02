use std::sync::Arc;

use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tinychat_llm::{ChatModel, GenerateRequest, ModelCatalog, ProviderError, ProviderMessage};
use tinychat_storage::{
    MessageRecord, MessageRole, NewMessage, NewSession, SessionId, SessionRecord, SessionSummary,
    Storage, StorageError,
};

use crate::chat::view::{TITLE_MAX_CHARS, truncate_chars};
use crate::settings::state::{AppSettings, SettingsError, SettingsStore};

pub const SEARCH_RESULT_LIMIT: u32 = 10;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AppError {
    #[snafu(display("failed to open chat history on `{stage}`: {source}"))]
    OpenDatabase {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("{source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("model call failed: {source}"))]
    Provider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("settings could not be saved: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("no {what} at position {position}; there are {count}"))]
    PositionOutOfRange {
        stage: &'static str,
        what: &'static str,
        position: usize,
        count: usize,
    },
    #[snafu(display("expected a user and an assistant record, storage returned {count}"))]
    UnexpectedBatch { stage: &'static str, count: usize },
    #[snafu(display("model id must not be blank"))]
    BlankModelId { stage: &'static str },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    Input {
        stage: &'static str,
        source: std::io::Error,
    },
}

impl AppError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Storage { source, .. } | Self::OpenDatabase { source, .. } => {
                source.is_not_found()
            }
            _ => false,
        }
    }

    /// Only startup and terminal failures end the loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::OpenDatabase { .. } | Self::Input { .. })
    }
}

/// A persisted user turn and the reply it produced.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub session_id: SessionId,
    pub created_session: bool,
    pub user: MessageRecord,
    pub assistant: MessageRecord,
}

/// Session state for one chat window: which session is open, and how to reach storage and the model.
pub struct ChatController<S, M>
where
    S: Storage,
    M: ChatModel + ?Sized,
{
    storage: Arc<S>,
    model: Arc<M>,
    settings: Arc<SettingsStore>,
    current: Option<SessionId>,
}

impl<S, M> ChatController<S, M>
where
    S: Storage,
    M: ChatModel + ?Sized,
{
    pub fn new(storage: Arc<S>, model: Arc<M>, settings: Arc<SettingsStore>) -> Self {
        Self {
            storage,
            model,
            settings,
            current: None,
        }
    }

    pub fn current_session(&self) -> Option<SessionId> {
        self.current
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.settings()
    }

    pub fn new_chat(&mut self) -> AppResult<SessionRecord> {
        let session = self
            .storage
            .create_session(NewSession::default())
            .context(StorageSnafu {
                stage: "new-chat-create-session",
            })?;
        tracing::info!(session_id = %session.id, "started new chat");
        self.current = Some(session.id);
        Ok(session)
    }

    /// Runs inference first and persists the exchange only when it succeeds.
    ///
    /// Blank input is ignored and yields `Ok(None)`.
    pub async fn send(&mut self, text: &str) -> AppResult<Option<Exchange>> {
        let prompt = text.trim();
        if prompt.is_empty() {
            return Ok(None);
        }

        let settings = self.settings.settings();
        let prior_messages = match self.current {
            Some(session_id) => self.storage.get_messages(session_id).context(StorageSnafu {
                stage: "send-load-history",
            })?,
            None => Vec::new(),
        };
        let is_first_exchange = prior_messages.is_empty();

        let request = GenerateRequest::new(settings.model.clone(), prompt)
            .with_history(history_window(&prior_messages, settings.history_limit))
            .with_temperature(settings.temperature)
            .with_top_p(settings.top_p)
            .with_max_tokens(settings.max_tokens);

        let reply = self.model.generate(request).await.context(ProviderSnafu {
            stage: "send-generate",
        })?;

        let title = session_title(prompt);
        let (session_id, created_session) = match self.current {
            Some(session_id) => (session_id, false),
            None => {
                let session = self
                    .storage
                    .create_session(NewSession::titled(title.clone()))
                    .context(StorageSnafu {
                        stage: "send-create-session",
                    })?;
                self.current = Some(session.id);
                (session.id, true)
            }
        };

        let appended = self.storage.append_messages(
            session_id,
            vec![NewMessage::user(prompt), NewMessage::assistant(reply)],
        );
        let stored = match appended {
            Ok(stored) => stored,
            Err(source) => {
                if created_session {
                    self.discard_empty_session(session_id);
                }
                return Err(AppError::Storage {
                    stage: "send-append-exchange",
                    source,
                });
            }
        };
        let [user, assistant]: [MessageRecord; 2] =
            stored
                .try_into()
                .map_err(|records: Vec<MessageRecord>| AppError::UnexpectedBatch {
                    stage: "send-append-exchange-result",
                    count: records.len(),
                })?;

        if is_first_exchange && !created_session {
            // Titling is cosmetic; the exchange is already saved.
            if let Err(error) = self.storage.rename_session(session_id, &title) {
                tracing::warn!(
                    session_id = %session_id,
                    error = %error,
                    "failed to title session from first message"
                );
            }
        }

        tracing::debug!(
            session_id = %session_id,
            user_seq = user.seq,
            assistant_seq = assistant.seq,
            "persisted exchange"
        );

        Ok(Some(Exchange {
            session_id,
            created_session,
            user,
            assistant,
        }))
    }

    /// Deletes the current session. Returns the deleted id, or `None` when nothing was open.
    pub fn clear_chat(&mut self) -> AppResult<Option<SessionId>> {
        let Some(session_id) = self.current else {
            return Ok(None);
        };

        self.storage
            .delete_session(session_id)
            .context(StorageSnafu {
                stage: "clear-chat-delete-session",
            })?;
        self.current = None;
        tracing::info!(session_id = %session_id, "cleared chat");
        Ok(Some(session_id))
    }

    pub fn sessions(&self) -> AppResult<Vec<SessionSummary>> {
        self.storage.list_sessions().context(StorageSnafu {
            stage: "list-sessions",
        })
    }

    /// 1-based, in `sessions()` order.
    pub fn session_at(&self, position: usize) -> AppResult<SessionSummary> {
        let sessions = self.sessions()?;
        let count = sessions.len();
        sessions
            .into_iter()
            .nth(position.wrapping_sub(1))
            .context(PositionOutOfRangeSnafu {
                stage: "session-at",
                what: "chat",
                position,
                count,
            })
    }

    pub fn open_session(&mut self, session_id: SessionId) -> AppResult<Vec<MessageRecord>> {
        let messages = self
            .storage
            .get_messages(session_id)
            .context(StorageSnafu {
                stage: "open-session-load-messages",
            })?;
        self.current = Some(session_id);
        Ok(messages)
    }

    pub fn delete(&mut self, session_id: SessionId) -> AppResult<()> {
        self.storage
            .delete_session(session_id)
            .context(StorageSnafu {
                stage: "delete-session",
            })?;
        if self.current == Some(session_id) {
            self.current = None;
        }
        tracing::info!(session_id = %session_id, "deleted chat");
        Ok(())
    }

    fn discard_empty_session(&mut self, session_id: SessionId) {
        if let Err(error) = self.storage.delete_session(session_id) {
            tracing::warn!(
                session_id = %session_id,
                error = %error,
                "failed to remove session left empty by a failed append"
            );
        }
        self.current = None;
    }

    pub fn current_messages(&self) -> AppResult<Vec<MessageRecord>> {
        match self.current {
            Some(session_id) => self.storage.get_messages(session_id).context(StorageSnafu {
                stage: "current-messages",
            }),
            None => Ok(Vec::new()),
        }
    }

    /// 1-based, in conversation order.
    pub fn message(&self, position: usize) -> AppResult<MessageRecord> {
        let messages = self.current_messages()?;
        let count = messages.len();
        messages
            .into_iter()
            .nth(position.wrapping_sub(1))
            .context(PositionOutOfRangeSnafu {
                stage: "message-at",
                what: "message",
                position,
                count,
            })
    }

    pub fn search(&self, query: &str) -> AppResult<Vec<MessageRecord>> {
        self.storage
            .search_messages(query, SEARCH_RESULT_LIMIT)
            .context(StorageSnafu {
                stage: "search-messages",
            })
    }

    pub fn select_model(&self, model_id: &str) -> AppResult<()> {
        let model_id = model_id.trim();
        ensure!(
            !model_id.is_empty(),
            BlankModelIdSnafu {
                stage: "select-model"
            }
        );

        let mut settings = (*self.settings.settings()).clone();
        settings.model = model_id.to_string();
        self.settings.update(settings).context(SettingsSnafu {
            stage: "select-model-persist",
        })?;
        tracing::info!(model_id, "selected model");
        Ok(())
    }

    pub async fn models(&self) -> AppResult<ModelCatalog> {
        self.model.list_models().await.context(ProviderSnafu {
            stage: "list-models",
        })
    }
}

/// The last `limit` messages, as provider turns.
fn history_window(messages: &[MessageRecord], limit: usize) -> Vec<ProviderMessage> {
    let start = messages.len().saturating_sub(limit);
    messages[start..]
        .iter()
        .map(|message| match message.role {
            MessageRole::User => ProviderMessage::user(message.content.clone()),
            MessageRole::Assistant => ProviderMessage::assistant(message.content.clone()),
        })
        .collect()
}

/// Title derived from the first user message of a session.
pub fn session_title(first_message: &str) -> String {
    truncate_chars(first_message, TITLE_MAX_CHARS)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::future::BoxFuture;
    use tempfile::TempDir;
    use tinychat_llm::{Model, ProviderResult, default_local_models};
    use tinychat_storage::{MessageStore, SessionStore, SqliteStorage, StorageResult};

    use super::*;

    struct FakeModel {
        fail: bool,
        fallback_models: Vec<Model>,
        requests: Mutex<Vec<GenerateRequest>>,
    }

    impl FakeModel {
        fn replying() -> Self {
            Self {
                fail: false,
                fallback_models: default_local_models(),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::replying()
            }
        }

        fn requests(&self) -> Vec<GenerateRequest> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    impl ChatModel for FakeModel {
        fn id(&self) -> &str {
            "fake"
        }

        fn default_model(&self) -> &str {
            "tinyllama"
        }

        fn fallback_models(&self) -> &[Model] {
            &self.fallback_models
        }

        fn list_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<ModelCatalog>> {
            Box::pin(async move {
                Ok(ModelCatalog::from_provider_api(self.fallback_models.clone()))
            })
        }

        fn generate<'a>(
            &'a self,
            request: GenerateRequest,
        ) -> BoxFuture<'a, ProviderResult<String>> {
            Box::pin(async move {
                let prompt = request.prompt.clone();
                self.requests.lock().expect("requests lock").push(request);
                if self.fail {
                    return Err(ProviderError::EmptyReply {
                        stage: "fake-generate",
                        model_id: "tinyllama".to_string(),
                    });
                }
                Ok(format!("echo: {prompt}"))
            })
        }
    }

    struct Harness {
        _temp_dir: TempDir,
        storage: Arc<SqliteStorage>,
        model: Arc<FakeModel>,
        controller: ChatController<SqliteStorage, FakeModel>,
    }

    async fn harness(model: FakeModel) -> Harness {
        let temp_dir = TempDir::new().expect("temp dir should be created");
        let db_path = temp_dir.path().join("chat_history.db");
        let storage = Arc::new(
            SqliteStorage::open(&db_path.display().to_string())
                .await
                .expect("storage should open"),
        );
        let settings = Arc::new(SettingsStore::new(temp_dir.path().join("settings.json")));
        let model = Arc::new(model);
        let controller = ChatController::new(storage.clone(), model.clone(), settings);

        Harness {
            _temp_dir: temp_dir,
            storage,
            model,
            controller,
        }
    }

    /// Delegates to SQLite but refuses every batch append.
    struct RejectingAppends(SqliteStorage);

    impl SessionStore for RejectingAppends {
        fn create_session(&self, input: NewSession) -> StorageResult<SessionRecord> {
            self.0.create_session(input)
        }

        fn list_sessions(&self) -> StorageResult<Vec<SessionSummary>> {
            self.0.list_sessions()
        }

        fn get_session(&self, session_id: SessionId) -> StorageResult<Option<SessionRecord>> {
            self.0.get_session(session_id)
        }

        fn rename_session(
            &self,
            session_id: SessionId,
            title: &str,
        ) -> StorageResult<SessionRecord> {
            self.0.rename_session(session_id, title)
        }

        fn delete_session(&self, session_id: SessionId) -> StorageResult<()> {
            self.0.delete_session(session_id)
        }
    }

    impl MessageStore for RejectingAppends {
        fn append_message(
            &self,
            session_id: SessionId,
            input: NewMessage,
        ) -> StorageResult<MessageRecord> {
            self.0.append_message(session_id, input)
        }

        fn append_messages(
            &self,
            _session_id: SessionId,
            _inputs: Vec<NewMessage>,
        ) -> StorageResult<Vec<MessageRecord>> {
            Err(StorageError::InvariantViolation {
                stage: "rejecting-append",
                details: "disk full".to_string(),
            })
        }

        fn get_messages(&self, session_id: SessionId) -> StorageResult<Vec<MessageRecord>> {
            self.0.get_messages(session_id)
        }

        fn search_messages(&self, query: &str, limit: u32) -> StorageResult<Vec<MessageRecord>> {
            self.0.search_messages(query, limit)
        }
    }

    #[tokio::test]
    async fn failed_append_removes_the_session_it_created() {
        let temp_dir = TempDir::new().expect("temp dir should be created");
        let db_path = temp_dir.path().join("chat_history.db");
        let storage = Arc::new(RejectingAppends(
            SqliteStorage::open(&db_path.display().to_string())
                .await
                .expect("storage should open"),
        ));
        let settings = Arc::new(SettingsStore::new(temp_dir.path().join("settings.json")));
        let mut controller =
            ChatController::new(storage.clone(), Arc::new(FakeModel::replying()), settings);

        let error = controller
            .send("Tell me about artificial intelligence")
            .await
            .expect_err("append failure should surface");

        assert!(matches!(
            error,
            AppError::Storage {
                stage: "send-append-exchange",
                ..
            }
        ));
        assert_eq!(controller.current_session(), None);
        assert!(storage.list_sessions().expect("sessions").is_empty());
    }

    #[tokio::test]
    async fn failed_append_keeps_an_existing_session() {
        let temp_dir = TempDir::new().expect("temp dir should be created");
        let db_path = temp_dir.path().join("chat_history.db");
        let storage = Arc::new(RejectingAppends(
            SqliteStorage::open(&db_path.display().to_string())
                .await
                .expect("storage should open"),
        ));
        let settings = Arc::new(SettingsStore::new(temp_dir.path().join("settings.json")));
        let mut controller =
            ChatController::new(storage.clone(), Arc::new(FakeModel::replying()), settings);
        let session = controller.new_chat().expect("new chat");

        controller
            .send("hello")
            .await
            .expect_err("append failure should surface");

        assert_eq!(controller.current_session(), Some(session.id));
        assert_eq!(storage.list_sessions().expect("sessions").len(), 1);
    }

    #[tokio::test]
    async fn first_send_creates_titled_session_with_two_messages() {
        let mut harness = harness(FakeModel::replying()).await;

        let exchange = harness
            .controller
            .send("  Tell me about artificial intelligence  ")
            .await
            .expect("send should succeed")
            .expect("non-blank input yields an exchange");

        assert!(exchange.created_session);
        assert_eq!(harness.controller.current_session(), Some(exchange.session_id));
        assert_eq!(exchange.user.content, "Tell me about artificial intelligence");
        assert_eq!(
            exchange.assistant.content,
            "echo: Tell me about artificial intelligence"
        );

        let messages = harness
            .storage
            .get_messages(exchange.session_id)
            .expect("messages should load");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].role, MessageRole::Assistant);

        let session = harness
            .storage
            .get_session(exchange.session_id)
            .expect("session lookup should succeed")
            .expect("session should exist");
        assert_eq!(session.title.as_deref(), Some("Tell me about artificial intel..."));
    }

    #[tokio::test]
    async fn failed_inference_persists_nothing() {
        let mut harness = harness(FakeModel::failing()).await;

        let error = harness
            .controller
            .send("hello")
            .await
            .expect_err("inference failure should surface");
        assert!(matches!(error, AppError::Provider { .. }));
        assert!(!error.is_fatal());

        assert_eq!(harness.controller.current_session(), None);
        assert!(harness.storage.list_sessions().expect("list").is_empty());
    }

    #[tokio::test]
    async fn failed_inference_in_open_session_leaves_history_untouched() {
        let mut harness = harness(FakeModel::failing()).await;
        let session = harness.controller.new_chat().expect("new chat");

        assert!(harness.controller.send("hello").await.is_err());
        assert!(
            harness
                .storage
                .get_messages(session.id)
                .expect("messages should load")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn blank_input_is_ignored() {
        let mut harness = harness(FakeModel::replying()).await;
        assert!(harness.controller.send("   ").await.expect("send").is_none());
        assert!(harness.model.requests().is_empty());
    }

    #[tokio::test]
    async fn new_chat_is_titled_by_first_message_and_carries_history() {
        let mut harness = harness(FakeModel::replying()).await;
        let session = harness.controller.new_chat().expect("new chat");

        harness.controller.send("first").await.expect("send");
        harness.controller.send("second").await.expect("send");

        let requests = harness.model.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].history.is_empty());
        assert_eq!(
            requests[1].history,
            vec![
                ProviderMessage::user("first"),
                ProviderMessage::assistant("echo: first"),
            ]
        );
        assert_eq!(requests[1].prompt, "second");

        let stored = harness
            .storage
            .get_session(session.id)
            .expect("lookup")
            .expect("session exists");
        assert_eq!(stored.title.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn history_is_limited_to_recent_messages() {
        let mut harness = harness(FakeModel::replying()).await;
        let mut settings = (*harness.controller.settings()).clone();
        settings.history_limit = 3;
        harness.controller.settings.update(settings).expect("settings update");

        for prompt in ["one", "two", "three"] {
            harness.controller.send(prompt).await.expect("send");
        }

        let last = harness.model.requests().pop().expect("three requests");
        assert_eq!(
            last.history,
            vec![
                ProviderMessage::assistant("echo: one"),
                ProviderMessage::user("two"),
                ProviderMessage::assistant("echo: two"),
            ]
        );
    }

    #[tokio::test]
    async fn clear_chat_deletes_current_session() {
        let mut harness = harness(FakeModel::replying()).await;
        assert_eq!(harness.controller.clear_chat().expect("no-op clear"), None);

        let exchange = harness
            .controller
            .send("hi")
            .await
            .expect("send")
            .expect("exchange");
        let cleared = harness.controller.clear_chat().expect("clear");

        assert_eq!(cleared, Some(exchange.session_id));
        assert_eq!(harness.controller.current_session(), None);
        assert!(harness.controller.sessions().expect("list").is_empty());
        let error = harness
            .controller
            .open_session(exchange.session_id)
            .expect_err("deleted session should not open");
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn open_and_delete_by_position() {
        let mut harness = harness(FakeModel::replying()).await;
        let older = harness.controller.new_chat().expect("older");
        let newer = harness.controller.new_chat().expect("newer");

        assert_eq!(harness.controller.session_at(1).expect("first").id, newer.id);
        let second = harness.controller.session_at(2).expect("second");
        assert_eq!(second.id, older.id);
        assert!(matches!(
            harness.controller.session_at(3),
            Err(AppError::PositionOutOfRange { count: 2, .. })
        ));
        assert!(harness.controller.session_at(0).is_err());

        harness.controller.open_session(older.id).expect("open");
        assert_eq!(harness.controller.current_session(), Some(older.id));

        harness.controller.delete(newer.id).expect("delete other");
        assert_eq!(harness.controller.current_session(), Some(older.id));
        harness.controller.delete(older.id).expect("delete current");
        assert_eq!(harness.controller.current_session(), None);

        let error = harness
            .controller
            .delete(older.id)
            .expect_err("second delete should fail");
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn message_lookup_is_one_based() {
        let mut harness = harness(FakeModel::replying()).await;
        assert!(harness.controller.message(1).is_err());

        harness.controller.send("copy me").await.expect("send");
        assert_eq!(harness.controller.message(1).expect("user").content, "copy me");
        assert_eq!(
            harness.controller.message(2).expect("assistant").content,
            "echo: copy me"
        );
        assert!(matches!(
            harness.controller.message(3),
            Err(AppError::PositionOutOfRange { position: 3, count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn search_spans_sessions() {
        let mut harness = harness(FakeModel::replying()).await;
        harness.controller.send("Neural networks?").await.expect("send");
        harness.controller.new_chat().expect("new chat");
        harness.controller.send("something else").await.expect("send");

        let results = harness.controller.search("neural").expect("search");
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|m| m.content.to_lowercase().contains("neural")));
    }

    #[tokio::test]
    async fn select_model_persists_and_applies_to_next_send() {
        let mut harness = harness(FakeModel::replying()).await;
        assert!(matches!(
            harness.controller.select_model("  "),
            Err(AppError::BlankModelId { .. })
        ));

        harness.controller.select_model("phi3:mini").expect("select");
        assert_eq!(harness.controller.settings().model, "phi3:mini");

        harness.controller.send("hi").await.expect("send");
        assert_eq!(harness.model.requests()[0].model_id, "phi3:mini");

        let catalog = harness.controller.models().await.expect("models");
        assert!(catalog.contains("tinyllama"));
    }
}
