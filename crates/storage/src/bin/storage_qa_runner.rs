//! Scenario checks against a real database file.
//!
//! Usage: `storage_qa_runner --scenario <name> [--db <path>]`. Every check prints
//! `key=value` lines and the run ends with `runner_ok=true` or `runner_ok=false`.

use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::str::FromStr;

use snafu::{OptionExt, ResultExt, Snafu};

use tinychat_storage::{
    MessageId, MessageRole, MessageStore, NewMessage, NewSession, SessionId, SessionStore,
    SqliteStorage, StorageError,
};

/// Scenarios that need `--db`, in the order `all` runs them.
const DATABASE_SCENARIOS: [&str; 6] = [
    "schema_init",
    "fk_violation",
    "session_crud",
    "message_order",
    "missing_session_guard",
    "cascade_delete",
];

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("usage: storage_qa_runner --scenario <name> [--db <path>]"))]
    Usage { stage: &'static str },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("scenario '{scenario}' needs --db <path>"))]
    MissingDbPath {
        stage: &'static str,
        scenario: String,
    },
    #[snafu(display("storage call failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("sqlite query failed on `{stage}`: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
    #[snafu(display("failed to remove '{path}': {source}"))]
    FileIo {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
    println!("runner_ok=true");
}

async fn run() -> RunnerResult<()> {
    let (scenario, db_path) = parse_args(env::args().skip(1))?;
    println!("scenario={scenario}");

    match scenario.as_str() {
        "id_roundtrip" => run_id_roundtrip(),
        "id_invalid" => run_id_invalid(),
        "all" => {
            run_id_roundtrip()?;
            run_id_invalid()?;
            if let Some(path) = db_path.as_deref() {
                reset_sqlite_files(path)?;
                for name in DATABASE_SCENARIOS {
                    run_database_scenario(name, path).await?;
                }
            }
            Ok(())
        }
        name if DATABASE_SCENARIOS.contains(&name) => {
            let path = db_path.as_deref().context(MissingDbPathSnafu {
                stage: "require-db-path",
                scenario: name,
            })?;
            println!("db_path={path}");
            run_database_scenario(name, path).await
        }
        _ => UnknownScenarioSnafu {
            stage: "dispatch-scenario",
            raw: scenario.as_str(),
        }
        .fail(),
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<(String, Option<String>)> {
    let mut scenario = None;
    let mut db_path = None;
    let mut pending = args.into_iter();

    while let Some(flag) = pending.next() {
        let slot = match flag.as_str() {
            "--scenario" => &mut scenario,
            "--db" => &mut db_path,
            _ => return UsageSnafu { stage: "parse-args" }.fail(),
        };
        *slot = Some(pending.next().context(UsageSnafu {
            stage: "parse-args-value",
        })?);
    }

    let scenario = scenario.context(UsageSnafu {
        stage: "parse-args-scenario",
    })?;
    Ok((scenario, db_path))
}

async fn run_database_scenario(name: &str, db_path: &str) -> RunnerResult<()> {
    let storage = SqliteStorage::open(db_path)
        .await
        .context(StorageSnafu { stage: "open-storage" })?;

    match name {
        "schema_init" => run_schema_init(&storage).await,
        "fk_violation" => run_fk_violation(&storage).await,
        "session_crud" => run_session_crud(&storage),
        "message_order" => run_message_order(&storage),
        "missing_session_guard" => run_missing_session_guard(&storage).await,
        "cascade_delete" => run_cascade_delete(&storage).await,
        _ => UnknownScenarioSnafu {
            stage: "dispatch-database-scenario",
            raw: name,
        }
        .fail(),
    }
}

fn check(scenario: &'static str, passed: bool, reason: impl Into<String>) -> RunnerResult<()> {
    if passed {
        return Ok(());
    }
    ScenarioFailedSnafu {
        stage: "scenario-assert",
        scenario,
        reason: reason.into(),
    }
    .fail()
}

fn run_id_roundtrip() -> RunnerResult<()> {
    assert_id_roundtrip("session_id", SessionId::new_v7())?;
    assert_id_roundtrip("message_id", MessageId::new_v7())
}

fn run_id_invalid() -> RunnerResult<()> {
    let rejected = invalid_input_is_rejected::<SessionId>("not-a-valid-uuid")
        && invalid_input_is_rejected::<MessageId>("not-a-valid-uuid");
    println!("invalid_id_error={rejected}");
    check("id_invalid", rejected, "an id type accepted malformed UUID input")
}

async fn run_schema_init(storage: &SqliteStorage) -> RunnerResult<()> {
    let pool = storage.pool();
    let tables = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('sessions', 'messages')",
    )
    .fetch_all(pool)
    .await
    .context(SqliteQuerySnafu {
        stage: "schema-init-list-tables",
    })?
    .into_iter()
    .collect::<HashSet<_>>();
    let journal_mode = sqlx::query_scalar::<_, String>("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "schema-init-journal-mode",
        })?
        .to_lowercase();
    let foreign_keys = sqlx::query_scalar::<_, i64>("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "schema-init-foreign-keys",
        })?;

    let schema_ok = tables.len() == 2;
    println!("schema_ok={schema_ok}");
    println!("journal_mode={journal_mode}");
    println!("foreign_keys={foreign_keys}");

    check("schema_init", schema_ok, "sessions or messages table is missing")?;
    check(
        "schema_init",
        journal_mode == "wal" && foreign_keys == 1,
        format!("expected wal and foreign_keys=1, got {journal_mode} and {foreign_keys}"),
    )
}

async fn run_fk_violation(storage: &SqliteStorage) -> RunnerResult<()> {
    let insert_result = sqlx::query(
        "INSERT INTO messages (id, session_id, seq, role, content, created_at) VALUES (?, ?, 1, 'user', 'orphan', 0)",
    )
    .bind(MessageId::new_v7().to_string())
    .bind(SessionId::new_v7().to_string())
    .execute(storage.pool())
    .await;

    let blocked = match insert_result {
        Ok(_) => false,
        Err(error) if is_foreign_key_violation(&error) => true,
        Err(source) => {
            return Err(RunnerError::SqliteQuery {
                stage: "fk-violation-insert",
                source,
            });
        }
    };
    println!("fk_violation_blocked={blocked}");
    check("fk_violation", blocked, "orphan message insert succeeded")
}

fn run_session_crud(storage: &SqliteStorage) -> RunnerResult<()> {
    let titled = storage
        .create_session(NewSession::titled("session-a"))
        .context(StorageSnafu {
            stage: "session-crud-create-titled",
        })?;
    let untitled = storage
        .create_session(NewSession::default())
        .context(StorageSnafu {
            stage: "session-crud-create-untitled",
        })?;
    storage
        .rename_session(untitled.id, "session-b")
        .context(StorageSnafu {
            stage: "session-crud-rename",
        })?;

    let listed = storage.list_sessions().context(StorageSnafu {
        stage: "session-crud-list",
    })?;
    let listed_once = [titled.id, untitled.id]
        .iter()
        .all(|id| listed.iter().filter(|summary| summary.id == *id).count() == 1);
    let newest_first = listed
        .windows(2)
        .all(|pair| pair[0].created_at_unix_ms >= pair[1].created_at_unix_ms);
    let renamed = listed
        .iter()
        .any(|summary| summary.id == untitled.id && summary.display_title() == "session-b");

    println!("listed_once={listed_once}");
    println!("list_order_ok={newest_first}");
    println!("renamed={renamed}");

    check("session_crud", listed_once, "created sessions must be listed exactly once")?;
    check("session_crud", newest_first, "sessions are not listed newest first")?;
    check("session_crud", renamed, "rename did not reach the listing")
}

fn run_message_order(storage: &SqliteStorage) -> RunnerResult<()> {
    let session = storage
        .create_session(NewSession::default())
        .context(StorageSnafu {
            stage: "message-order-create-session",
        })?;
    for message in [NewMessage::user("hi"), NewMessage::assistant("hello")] {
        storage
            .append_message(session.id, message)
            .context(StorageSnafu {
                stage: "message-order-append",
            })?;
    }

    let observed = storage
        .get_messages(session.id)
        .context(StorageSnafu {
            stage: "message-order-get",
        })?
        .into_iter()
        .map(|message| (message.role, message.content))
        .collect::<Vec<_>>();
    let expected = vec![
        (MessageRole::User, "hi".to_string()),
        (MessageRole::Assistant, "hello".to_string()),
    ];

    println!("order_ok={}", observed == expected);
    check(
        "message_order",
        observed == expected,
        format!("unexpected messages: {observed:?}"),
    )
}

async fn run_missing_session_guard(storage: &SqliteStorage) -> RunnerResult<()> {
    let before = count_messages(storage).await?;
    let result = storage.append_message(SessionId::new_v7(), NewMessage::user("orphan"));
    let not_found = result.is_err_and(|error| error.is_not_found());
    let written = count_messages(storage).await? - before;

    println!("not_found={not_found}");
    println!("rows_written={written}");
    check(
        "missing_session_guard",
        not_found && written == 0,
        "append to a missing session must fail with NotFound and write nothing",
    )
}

async fn run_cascade_delete(storage: &SqliteStorage) -> RunnerResult<()> {
    let session = storage
        .create_session(NewSession::default())
        .context(StorageSnafu {
            stage: "cascade-delete-create-session",
        })?;
    storage
        .append_messages(
            session.id,
            vec![NewMessage::user("q"), NewMessage::assistant("a")],
        )
        .context(StorageSnafu {
            stage: "cascade-delete-append",
        })?;
    storage.delete_session(session.id).context(StorageSnafu {
        stage: "cascade-delete-delete",
    })?;

    let still_listed = storage
        .list_sessions()
        .context(StorageSnafu {
            stage: "cascade-delete-list",
        })?
        .iter()
        .any(|summary| summary.id == session.id);
    let unreachable = storage
        .get_messages(session.id)
        .is_err_and(|error| error.is_not_found());
    let orphan_rows =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE session_id = ?")
            .bind(session.id.to_string())
            .fetch_one(storage.pool())
            .await
            .context(SqliteQuerySnafu {
                stage: "cascade-delete-orphans",
            })?;

    println!("still_listed={still_listed}");
    println!("messages_unreachable={unreachable}");
    println!("orphan_rows={orphan_rows}");
    check(
        "cascade_delete",
        !still_listed && unreachable && orphan_rows == 0,
        "deleted session or its messages are still reachable",
    )
}

async fn count_messages(storage: &SqliteStorage) -> RunnerResult<i64> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages")
        .fetch_one(storage.pool())
        .await
        .context(SqliteQuerySnafu {
            stage: "count-messages",
        })
}

fn reset_sqlite_files(db_path: &str) -> RunnerResult<()> {
    for suffix in ["", "-wal", "-shm"] {
        let path = format!("{db_path}{suffix}");
        match std::fs::remove_file(Path::new(&path)) {
            Err(source) if source.kind() != std::io::ErrorKind::NotFound => {
                return Err(RunnerError::FileIo {
                    stage: "reset-sqlite-files",
                    path,
                    source,
                });
            }
            _ => {}
        }
    }
    Ok(())
}

fn assert_id_roundtrip<T>(label: &'static str, id: T) -> RunnerResult<()>
where
    T: Copy + Eq + FromStr<Err = StorageError> + std::fmt::Display,
{
    let decoded = id.to_string().parse::<T>().context(StorageSnafu {
        stage: "id-roundtrip-parse",
    })?;
    let roundtrip = decoded == id;
    println!("{label}_roundtrip={roundtrip}");
    check("id_roundtrip", roundtrip, format!("{label} changed across format and parse"))
}

fn invalid_input_is_rejected<T>(raw: &str) -> bool
where
    T: FromStr<Err = StorageError>,
{
    matches!(raw.parse::<T>(), Err(StorageError::InvalidId { .. }))
}

fn is_foreign_key_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(database_error) => {
            database_error.code().is_some_and(|code| code == "787")
                || database_error
                    .message()
                    .contains("FOREIGN KEY constraint failed")
        }
        _ => false,
    }
}
