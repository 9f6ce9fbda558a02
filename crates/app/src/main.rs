use std::process::ExitCode;
use std::sync::Arc;

use console::style;
use snafu::ResultExt;
use tracing_subscriber::EnvFilter;

use tinychat::app::{AppResult, ChatController, OpenDatabaseSnafu, ProviderSnafu};
use tinychat::chat::run_chat_loop;
use tinychat::settings::state::SettingsStore;
use tinychat_storage::SqliteStorage;

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so they never interleave with the chat transcript.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "tinychat exited with an error");
            eprintln!("  {} {error}", style("!").red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run() -> AppResult<()> {
    let settings_store = Arc::new(SettingsStore::load());
    let settings = settings_store.settings();

    let database_location = settings.database_location();
    let storage = SqliteStorage::open(&database_location.display().to_string())
        .await
        .context(OpenDatabaseSnafu {
            stage: "startup-open-database",
        })?;
    tracing::info!(
        database = %database_location.display(),
        config = %settings_store.config_path().display(),
        "chat history ready"
    );

    let model = tinychat_llm::create_model(settings.to_provider_config()).context(ProviderSnafu {
        stage: "startup-create-model",
    })?;

    let mut controller = ChatController::new(Arc::new(storage), model, settings_store);
    run_chat_loop(&mut controller).await
}

