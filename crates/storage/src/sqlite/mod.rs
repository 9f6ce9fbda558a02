use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, InMemoryDatabaseSnafu, InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu,
    SqliteRuntimeInitSnafu, SqliteThreadSpawnSnafu, StorageError, StorageResult,
};
use super::ids::{MessageId, SessionId};
use super::types::{
    MessageRecord, MessageRole, NewMessage, NewSession, SessionRecord, SessionSummary,
};
use super::{MessageStore, SessionStore};

/// SQLite-backed chat history.
///
/// The handle only remembers where the database lives. Every store call opens
/// its own connection, runs inside it and drops it before returning, so no
/// connection outlives the operation that needed it.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure!(
            !is_in_memory_location(database_location),
            InMemoryDatabaseSnafu {
                stage: "sqlite-open-validate-location",
                database_location: database_location.to_string(),
            }
        );
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        // WAL is a property of the file, so later per-call connections inherit it.
        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "sqlite chat history ready");

        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // Store traits are sync, so each call executes on a dedicated worker thread
        // with its own current-thread runtime to avoid nested-runtime blocking panics.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-store-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-store-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-store-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite storage worker thread panicked".to_string(),
            }
            .fail(),
        }
    }
}

impl SessionStore for SqliteStorage {
    fn create_session(&self, input: NewSession) -> StorageResult<SessionRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("session-create", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-create-connect").await?;
            let session_id = SessionId::new_v7();
            let title = normalize_title(input.title.as_deref());
            let now = unix_timestamp_millis();

            sqlx::query(
                "INSERT INTO sessions (id, title, created_at, updated_at) VALUES (?, ?, ?, ?)",
            )
            .bind(session_id.to_string())
            .bind(title.clone())
            .bind(now)
            .bind(now)
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-create-insert",
            })?;

            tracing::debug!(session_id = %session_id, "created chat session");

            Ok(SessionRecord {
                id: session_id,
                title,
                created_at_unix_ms: i64_to_u64(now, "session-create-created-at")?,
                updated_at_unix_ms: i64_to_u64(now, "session-create-updated-at")?,
            })
        })
    }

    fn list_sessions(&self) -> StorageResult<Vec<SessionSummary>> {
        let database_url = self.database_url.clone();
        self.run_db_call("session-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-list-connect").await?;
            // rowid breaks ties between sessions created in the same millisecond.
            let rows = sqlx::query_as::<_, SessionSummaryRow>(
                "SELECT s.id, s.title, s.created_at, \
                 (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id) AS message_count, \
                 (SELECT m.content FROM messages m WHERE m.session_id = s.id AND m.role = 'user' ORDER BY m.seq ASC LIMIT 1) AS preview, \
                 (SELECT MAX(m.created_at) FROM messages m WHERE m.session_id = s.id) AS last_message_at \
                 FROM sessions s ORDER BY s.created_at DESC, s.rowid DESC",
            )
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-list-query",
            })?;

            rows.into_iter().map(session_summary_row_to_summary).collect()
        })
    }

    fn get_session(&self, session_id: SessionId) -> StorageResult<Option<SessionRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("session-get", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-get-connect").await?;
            let row = load_session_row(&mut connection, session_id, "session-get-query").await?;

            row.map(session_row_to_record).transpose()
        })
    }

    fn rename_session(&self, session_id: SessionId, title: &str) -> StorageResult<SessionRecord> {
        let database_url = self.database_url.clone();
        let title = normalize_title(Some(title));
        self.run_db_call("session-rename", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-rename-connect").await?;
            let now = unix_timestamp_millis();
            let update_result =
                sqlx::query("UPDATE sessions SET title = ?, updated_at = ? WHERE id = ?")
                    .bind(title)
                    .bind(now)
                    .bind(session_id.to_string())
                    .execute(&mut connection)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "session-rename-apply",
                    })?;

            if update_result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "session-rename-missing",
                    entity: "session",
                    id: session_id.to_string(),
                }
                .fail();
            }

            let row = load_session_row(&mut connection, session_id, "session-rename-load")
                .await?
                .context(NotFoundSnafu {
                    stage: "session-rename-load-missing",
                    entity: "session",
                    id: session_id.to_string(),
                })?;

            session_row_to_record(row)
        })
    }

    fn delete_session(&self, session_id: SessionId) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        self.run_db_call("session-delete", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-delete-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "session-delete-begin",
            })?;

            // Messages go first explicitly; the FK cascade covers databases opened
            // without foreign_keys, this keeps both paths identical.
            let removed_messages = sqlx::query("DELETE FROM messages WHERE session_id = ?")
                .bind(session_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "session-delete-messages",
                })?
                .rows_affected();

            let removed_sessions = sqlx::query("DELETE FROM sessions WHERE id = ?")
                .bind(session_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "session-delete-session",
                })?
                .rows_affected();

            if removed_sessions == 0 {
                // Dropping the transaction rolls back.
                return NotFoundSnafu {
                    stage: "session-delete-missing",
                    entity: "session",
                    id: session_id.to_string(),
                }
                .fail();
            }

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "session-delete-commit",
            })?;

            tracing::debug!(
                session_id = %session_id,
                removed_messages,
                "deleted chat session"
            );

            Ok(())
        })
    }
}

impl MessageStore for SqliteStorage {
    fn append_message(
        &self,
        session_id: SessionId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord> {
        let mut appended = self.append_messages(session_id, vec![input])?;
        appended.pop().context(InvariantViolationSnafu {
            stage: "message-append-single",
            details: "single-message append returned no record".to_string(),
        })
    }

    fn append_messages(
        &self,
        session_id: SessionId,
        inputs: Vec<NewMessage>,
    ) -> StorageResult<Vec<MessageRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-append", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-append-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "message-append-begin",
            })?;

            ensure_session_exists(&mut tx, session_id, "message-append-ensure-session").await?;

            if inputs.is_empty() {
                return Ok(Vec::new());
            }

            let first_seq = sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE session_id = ?",
            )
            .bind(session_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-next-seq",
            })?;

            let now = unix_timestamp_millis();
            let mut records = Vec::with_capacity(inputs.len());

            for (offset, input) in inputs.into_iter().enumerate() {
                let seq = first_seq + usize_to_i64(offset, "message-append-offset")?;
                let message_id = MessageId::new_v7();

                sqlx::query(
                    "INSERT INTO messages (id, session_id, seq, role, content, created_at) VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(message_id.to_string())
                .bind(session_id.to_string())
                .bind(seq)
                .bind(input.role.as_str())
                .bind(input.content.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-append-insert",
                })?;

                records.push(MessageRecord {
                    id: message_id,
                    session_id,
                    seq: i64_to_u64(seq, "message-append-seq")?,
                    role: input.role,
                    content: input.content,
                    created_at_unix_ms: i64_to_u64(now, "message-append-created-at")?,
                });
            }

            sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(session_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-append-touch-session",
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-append-commit",
            })?;

            Ok(records)
        })
    }

    fn get_messages(&self, session_id: SessionId) -> StorageResult<Vec<MessageRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-list-connect").await?;
            ensure_session_exists(&mut connection, session_id, "message-list-ensure-session")
                .await?;

            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, session_id, seq, role, content, created_at FROM messages WHERE session_id = ? ORDER BY seq ASC",
            )
            .bind(session_id.to_string())
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }

    fn search_messages(&self, query: &str, limit: u32) -> StorageResult<Vec<MessageRecord>> {
        let needle = query.trim();
        if needle.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let pattern = format!("%{}%", escape_like(needle));
        let database_url = self.database_url.clone();
        self.run_db_call("message-search", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-search-connect").await?;
            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, session_id, seq, role, content, created_at FROM messages WHERE content LIKE ? ESCAPE '\\' ORDER BY created_at DESC, rowid DESC LIMIT ?",
            )
            .bind(pattern)
            .bind(i64::from(limit))
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-search-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    title: Option<String>,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct SessionSummaryRow {
    id: String,
    title: Option<String>,
    created_at: i64,
    message_count: i64,
    preview: Option<String>,
    last_message_at: Option<i64>,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    session_id: String,
    seq: i64,
    role: String,
    content: String,
    created_at: i64,
}

fn session_row_to_record(row: SessionRow) -> StorageResult<SessionRecord> {
    Ok(SessionRecord {
        id: SessionId::parse(&row.id)?,
        title: row.title,
        created_at_unix_ms: i64_to_u64(row.created_at, "session-row-created-at")?,
        updated_at_unix_ms: i64_to_u64(row.updated_at, "session-row-updated-at")?,
    })
}

fn session_summary_row_to_summary(row: SessionSummaryRow) -> StorageResult<SessionSummary> {
    Ok(SessionSummary {
        id: SessionId::parse(&row.id)?,
        title: row.title,
        created_at_unix_ms: i64_to_u64(row.created_at, "session-summary-created-at")?,
        message_count: i64_to_u64(row.message_count, "session-summary-message-count")?,
        preview: row.preview,
        last_message_at_unix_ms: row
            .last_message_at
            .map(|value| i64_to_u64(value, "session-summary-last-message-at"))
            .transpose()?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        session_id: SessionId::parse(&row.session_id)?,
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        role: role_from_sql(&row.role)?,
        content: row.content,
        created_at_unix_ms: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-foreign-keys",
            pragma: "foreign_keys",
        })?;
    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

async fn load_session_row(
    connection: &mut SqliteConnection,
    session_id: SessionId,
    stage: &'static str,
) -> StorageResult<Option<SessionRow>> {
    sqlx::query_as::<_, SessionRow>(
        "SELECT id, title, created_at, updated_at FROM sessions WHERE id = ?",
    )
    .bind(session_id.to_string())
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu { stage })
}

async fn session_exists(
    connection: &mut SqliteConnection,
    session_id: SessionId,
) -> StorageResult<bool> {
    let existing = sqlx::query_scalar::<_, i64>("SELECT 1 FROM sessions WHERE id = ? LIMIT 1")
        .bind(session_id.to_string())
        .fetch_optional(&mut *connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "session-exists-query",
        })?;

    Ok(existing.is_some())
}

async fn ensure_session_exists(
    connection: &mut SqliteConnection,
    session_id: SessionId,
    stage: &'static str,
) -> StorageResult<()> {
    let exists = session_exists(connection, session_id).await?;
    if !exists {
        return NotFoundSnafu {
            stage,
            entity: "session",
            id: session_id.to_string(),
        }
        .fail();
    }

    Ok(())
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn normalize_title(title: Option<&str>) -> Option<String> {
    title
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .map(str::to_string)
}

/// Escapes LIKE wildcards so user input only ever matches literally.
fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for character in raw.chars() {
        if matches!(character, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(character);
    }
    escaped
}

fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn usize_to_i64(value: usize, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("usize '{value}' cannot map to sqlite i64"),
        })
}

// A private in-memory database lives only as long as one connection.
fn is_in_memory_location(database_location: &str) -> bool {
    let location = database_location.trim().to_ascii_lowercase();
    location == ":memory:"
        || location.starts_with("sqlite::memory:")
        || location.starts_with("sqlite://:memory:")
        || location.contains("mode=memory")
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    format!("sqlite://{database_location}")
}
