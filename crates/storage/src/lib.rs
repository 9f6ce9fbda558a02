pub mod error;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{MessageId, SessionId};
pub use sqlite::SqliteStorage;
pub use types::{
    DEFAULT_SESSION_TITLE, MessageRecord, MessageRole, NewMessage, NewSession, SessionRecord,
    SessionSummary,
};

pub trait SessionStore: Send + Sync {
    fn create_session(&self, input: NewSession) -> StorageResult<SessionRecord>;
    /// Most recently created first.
    fn list_sessions(&self) -> StorageResult<Vec<SessionSummary>>;
    fn get_session(&self, session_id: SessionId) -> StorageResult<Option<SessionRecord>>;
    fn rename_session(&self, session_id: SessionId, title: &str) -> StorageResult<SessionRecord>;
    /// Removes the session and its messages in one transaction.
    fn delete_session(&self, session_id: SessionId) -> StorageResult<()>;
}

pub trait MessageStore: Send + Sync {
    fn append_message(
        &self,
        session_id: SessionId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord>;
    /// Appends every input or none of them.
    fn append_messages(
        &self,
        session_id: SessionId,
        inputs: Vec<NewMessage>,
    ) -> StorageResult<Vec<MessageRecord>>;
    /// Chronological order.
    fn get_messages(&self, session_id: SessionId) -> StorageResult<Vec<MessageRecord>>;
    fn search_messages(&self, query: &str, limit: u32) -> StorageResult<Vec<MessageRecord>>;
}

pub trait Storage: SessionStore + MessageStore {}

impl<T> Storage for T where T: SessionStore + MessageStore {}
