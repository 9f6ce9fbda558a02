use futures::future::BoxFuture;
use snafu::Snafu;

use crate::model::{Model, ModelCatalog};

/// Local servers ignore the key, but the OpenAI client refuses to build without one.
pub const PLACEHOLDER_API_KEY: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub default_model: Option<String>,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        default_model: Option<String>,
    ) -> Self {
        let api_key = api_key.into().trim().to_string();
        let default_model = default_model
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty());

        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: if api_key.is_empty() {
                PLACEHOLDER_API_KEY.to_string()
            } else {
                api_key
            },
            endpoint: endpoint.into().trim().trim_end_matches('/').to_string(),
            default_model,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: ProviderRole,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: ProviderRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ProviderRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ProviderRole::Assistant, content)
    }
}

/// One inference call: prior turns in `history`, the new user turn in `prompt`.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub model_id: String,
    pub history: Vec<ProviderMessage>,
    pub prompt: String,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl GenerateRequest {
    pub fn new(model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            history: Vec::new(),
            prompt: prompt.into(),
            preamble: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
        }
    }

    pub fn with_history(mut self, history: Vec<ProviderMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("generate request for model '{model_id}' has an empty prompt"))]
    EmptyPrompt {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("failed to finalize HTTP request body: {message}"))]
    BuildHttpRequestBody {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("provider model endpoint returned status {status}: {body}"))]
    ModelFetchStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to parse provider model list: {details}"))]
    ModelPayloadParse {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("model '{model_id}' returned an empty reply"))]
    EmptyReply {
        stage: &'static str,
        model_id: String,
    },
}

impl ProviderError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::UnsupportedProvider { stage, .. }
            | Self::EmptyPrompt { stage, .. }
            | Self::HttpClient { stage, .. }
            | Self::BuildHttpRequestBody { stage, .. }
            | Self::ModelFetchStatus { stage, .. }
            | Self::ModelPayloadParse { stage, .. }
            | Self::CompletionsFailed { stage, .. }
            | Self::EmptyReply { stage, .. } => stage,
        }
    }
}

pub trait ChatModel: Send + Sync {
    fn id(&self) -> &str;
    fn default_model(&self) -> &str;
    fn fallback_models(&self) -> &[Model];
    /// Falls back to cached or static models when the endpoint is unreachable.
    fn list_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<ModelCatalog>>;
    fn generate<'a>(&'a self, request: GenerateRequest) -> BoxFuture<'a, ProviderResult<String>>;
}
