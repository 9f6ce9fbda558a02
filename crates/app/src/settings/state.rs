use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tinychat_llm::{DEFAULT_LOCAL_MODEL, PLACEHOLDER_API_KEY, ProviderConfig};

pub const DEFAULT_PROVIDER_ID: &str = "ollama";
pub const DEFAULT_ENDPOINT: &str = "http://localhost:11434/v1";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.9;
pub const DEFAULT_MAX_TOKENS: u64 = 512;
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const SETTINGS_DIRECTORY_NAME: &str = "tinychat";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "chat_history.db";
pub const ENV_PREFIX: &str = "TINYCHAT_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    /// Prior messages sent with each prompt.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Empty means `<data_dir>/tinychat/chat_history.db`.
    #[serde(default)]
    pub database_path: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: default_api_key(),
            endpoint: default_endpoint(),
            model: default_model(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            history_limit: default_history_limit(),
            database_path: String::new(),
        }
    }
}

impl AppSettings {
    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(
            &self.provider_id,
            &self.api_key,
            &self.endpoint,
            Some(self.model.clone()),
        )
    }

    pub fn database_location(&self) -> PathBuf {
        if self.database_path.is_empty() {
            SettingsStore::default_data_dir().join(DATABASE_FILE_NAME)
        } else {
            PathBuf::from(&self.database_path)
        }
    }

    pub fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.api_key = non_blank_or(self.api_key, default_api_key);
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.model = non_blank_or(self.model, default_model);
        self.database_path = self.database_path.trim().to_string();

        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            self.temperature = default_temperature();
        }
        if !self.top_p.is_finite() || !(0.0..=1.0).contains(&self.top_p) {
            self.top_p = default_top_p();
        }
        if self.max_tokens == 0 {
            self.max_tokens = default_max_tokens();
        }
        if self.history_limit == 0 {
            self.history_limit = default_history_limit();
        }

        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<AppSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".tinychat"))
    }

    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".tinychat"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    /// Applies `settings` in memory and writes only the changed fields over the file layer,
    /// so values that came from `TINYCHAT_*` variables stay out of the settings file.
    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        let current = self.settings();
        let on_disk = carry_changes(
            Self::extract_or_default(Self::file_layer(&self.config_path), &self.config_path),
            &current,
            &normalized_settings,
        );
        self.persist(&on_disk)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn file_layer(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppSettings::default())).merge(Json::file(path))
    }

    fn load_from_disk(path: &Path) -> AppSettings {
        if !path.exists() {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
        }

        Self::extract_or_default(
            Self::file_layer(path).merge(Env::prefixed(ENV_PREFIX).split("__")),
            path,
        )
    }

    fn extract_or_default(figment: Figment, path: &Path) -> AppSettings {
        match figment.extract::<AppSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                AppSettings::default()
            }
        }
    }

    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn carry_changes(
    mut target: AppSettings,
    before: &AppSettings,
    after: &AppSettings,
) -> AppSettings {
    macro_rules! carry {
        ($($field:ident),+ $(,)?) => {
            $(
                if before.$field != after.$field {
                    target.$field = after.$field.clone();
                }
            )+
        };
    }

    carry!(
        provider_id,
        api_key,
        endpoint,
        model,
        temperature,
        top_p,
        max_tokens,
        history_limit,
        database_path,
    );
    target.normalized()
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_api_key() -> String {
    PLACEHOLDER_API_KEY.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_LOCAL_MODEL.to_string()
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_top_p() -> f64 {
    DEFAULT_TOP_P
}

fn default_max_tokens() -> u64 {
    DEFAULT_MAX_TOKENS
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}
