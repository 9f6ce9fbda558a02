use std::sync::Arc;

use futures::future::BoxFuture;
use rig::completion::message::AssistantContent;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::http_client::{self, HttpClientExt, NoBody};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use snafu::{ResultExt, ensure};

use crate::model::{
    DEFAULT_LOCAL_MODEL, Model, ModelCache, ModelCatalog, default_local_models, get_model_cache,
};
use crate::provider::{
    ChatModel, CompletionsFailedSnafu, EmptyPromptSnafu, EmptyReplySnafu, GenerateRequest,
    HttpClientSnafu, ModelFetchStatusSnafu, ModelPayloadParseSnafu, ProviderConfig,
    ProviderError, ProviderMessage, ProviderResult, ProviderRole,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

const ROLE_MARKERS: [&str; 2] = ["<assistant>:", "Assistant:"];

pub struct RigChatModel {
    config: ProviderConfig,
    fallback_models: Vec<Model>,
    model_cache: Arc<ModelCache>,
}

impl RigChatModel {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            fallback_models: default_local_models(),
            model_cache: get_model_cache(),
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn cache_key(&self) -> String {
        format!("{}@{}", self.config.provider_id, self.config.endpoint)
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    async fn fetch_models_from_provider(&self) -> ProviderResult<Vec<Model>> {
        let client = Self::build_client(&self.config)?;
        let request = client
            .get("/models")
            .context(HttpClientSnafu {
                stage: "build-model-request",
            })?
            .body(NoBody)
            .map_err(|source| ProviderError::BuildHttpRequestBody {
                stage: "build-model-request-body",
                message: source.to_string(),
            })?;

        let response = client.send(request).await.context(HttpClientSnafu {
            stage: "send-model-request",
        })?;
        let status = response.status();
        let payload = http_client::text(response).await.context(HttpClientSnafu {
            stage: "read-model-response",
        })?;

        if !status.is_success() {
            return ModelFetchStatusSnafu {
                stage: "model-http-status",
                status: status.as_u16(),
                body: payload,
            }
            .fail();
        }

        let model_ids = extract_model_ids(&payload)?;
        ensure!(
            !model_ids.is_empty(),
            ModelPayloadParseSnafu {
                stage: "parse-model-response",
                details: "no model identifiers found in provider response".to_string(),
            }
        );

        Ok(model_ids.into_iter().map(Model::from_id).collect())
    }

    fn to_rig_message(message: &ProviderMessage) -> Option<RigMessage> {
        match message.role {
            ProviderRole::System => None,
            ProviderRole::User => Some(RigMessage::user(message.content.clone())),
            ProviderRole::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    fn merged_preamble(request: &GenerateRequest) -> Option<String> {
        let mut preamble_parts = Vec::new();

        if let Some(preamble) = &request.preamble
            && !preamble.trim().is_empty()
        {
            preamble_parts.push(preamble.clone());
        }

        // Rig takes a single preamble, so system turns from history are folded into it.
        for message in &request.history {
            if matches!(message.role, ProviderRole::System) && !message.content.trim().is_empty()
            {
                preamble_parts.push(message.content.clone());
            }
        }

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    async fn complete(config: &ProviderConfig, request: &GenerateRequest) -> ProviderResult<String> {
        ensure!(
            !request.prompt.trim().is_empty(),
            EmptyPromptSnafu {
                stage: "generate-validate-prompt",
                model_id: request.model_id.clone(),
            }
        );

        // Local servers share `/chat/completions`, not the newer responses route.
        let model = Self::build_client(config)?
            .completions_api()
            .completion_model(request.model_id.clone());

        let history = request
            .history
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();
        let mut builder = model
            .completion_request(RigMessage::user(request.prompt.clone()))
            .messages(history);

        if let Some(preamble) = Self::merged_preamble(request) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        if let Some(top_p) = request.top_p {
            builder = builder.additional_params(serde_json::json!({ "top_p": top_p }));
        }

        let response = builder.send().await.context(CompletionsFailedSnafu {
            stage: "generate-send",
        })?;

        let raw = response
            .choice
            .iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<String>();

        tracing::debug!(
            model_id = %request.model_id,
            history_len = request.history.len(),
            raw_len = raw.len(),
            "completion received"
        );

        match clean_reply(&raw) {
            Some(reply) => Ok(reply),
            None => EmptyReplySnafu {
                stage: "generate-clean-reply",
                model_id: request.model_id.clone(),
            }
            .fail(),
        }
    }
}

impl ChatModel for RigChatModel {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn default_model(&self) -> &str {
        self.config
            .default_model
            .as_deref()
            .unwrap_or(DEFAULT_LOCAL_MODEL)
    }

    fn fallback_models(&self) -> &[Model] {
        &self.fallback_models
    }

    fn list_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<ModelCatalog>> {
        Box::pin(async move {
            let cache_key = self.cache_key();
            if let Some(models) = self.model_cache.get_fresh(&cache_key).await {
                return Ok(ModelCatalog::from_cache_fresh(models));
            }

            // Endpoint first, then stale cache, then the built-in list.
            match self.fetch_models_from_provider().await {
                Ok(models) => {
                    self.model_cache.set(&cache_key, models.clone()).await;
                    Ok(ModelCatalog::from_provider_api(models))
                }
                Err(error) => {
                    let error_message = error.to_string();

                    if let Some(models) = self.model_cache.get_any(&cache_key).await {
                        tracing::warn!(
                            provider_id = %self.id(),
                            cached_model_count = models.len(),
                            error = %error_message,
                            "model fetch failed; serving stale cached models"
                        );
                        return Ok(ModelCatalog::from_cache_stale(models, error_message));
                    }

                    tracing::warn!(
                        provider_id = %self.id(),
                        fallback_model_count = self.fallback_models.len(),
                        error = %error_message,
                        "model fetch failed without cache; serving static fallback models"
                    );

                    Ok(ModelCatalog::from_static_fallback(
                        self.fallback_models.clone(),
                        error_message,
                    ))
                }
            }
        })
    }

    fn generate<'a>(&'a self, request: GenerateRequest) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(async move {
            let result = Self::complete(&self.config, &request).await;
            if let Err(error) = &result {
                tracing::error!(
                    provider_id = %self.config.provider_id,
                    model_id = %request.model_id,
                    stage = error.stage(),
                    error = %error,
                    "inference call failed"
                );
            }
            result
        })
    }
}

/// Trims the reply and drops any prompt echo up to the last role marker.
///
/// Returns `None` when nothing is left.
pub fn clean_reply(raw: &str) -> Option<String> {
    let mut reply = raw.trim();

    let last_marker_end = ROLE_MARKERS
        .iter()
        .filter_map(|marker| reply.rfind(marker).map(|start| start + marker.len()))
        .max();
    if let Some(end) = last_marker_end {
        reply = reply[end..].trim();
    }

    if reply.is_empty() {
        None
    } else {
        Some(reply.to_string())
    }
}

/// Reads ids from an OpenAI-style `{"data":[{"id":..}]}` list, or Ollama's `{"models":[{"name":..}]}`.
fn extract_model_ids(payload: &str) -> ProviderResult<Vec<String>> {
    let value: serde_json::Value =
        serde_json::from_str(payload).map_err(|source| ProviderError::ModelPayloadParse {
            stage: "parse-model-json",
            details: source.to_string(),
        })?;

    let entries = value
        .get("data")
        .or_else(|| value.get("models"))
        .and_then(serde_json::Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut ids = entries
        .iter()
        .filter_map(|entry| {
            entry
                .get("id")
                .or_else(|| entry.get("name"))
                .and_then(serde_json::Value::as_str)
        })
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();

    ids.sort();
    ids.dedup();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::model::ModelCatalogSource;

    #[derive(Debug, Clone)]
    struct RecordedRequest {
        line: String,
        body: String,
    }

    /// A one-shot-per-connection HTTP server answering fixed routes with JSON.
    struct MockEndpoint {
        base_url: String,
        requests: Arc<Mutex<Vec<RecordedRequest>>>,
    }

    impl MockEndpoint {
        async fn start(routes: Vec<(&'static str, &'static str)>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind mock endpoint");
            let address = listener.local_addr().expect("mock address");
            let requests = Arc::new(Mutex::new(Vec::new()));
            let recorded = Arc::clone(&requests);

            tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    let Ok(request) = read_request(&mut stream).await else {
                        continue;
                    };
                    let path = request.line.split_whitespace().nth(1).unwrap_or_default();
                    let (status, body) = routes
                        .iter()
                        .find(|(route, _)| *route == path)
                        .map(|(_, body)| ("200 OK", *body))
                        .unwrap_or(("404 Not Found", r#"{"error":"not found"}"#));
                    recorded.lock().expect("requests lock").push(request);

                    let response = format!(
                        "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                }
            });

            Self {
                base_url: format!("http://{address}/v1"),
                requests,
            }
        }

        fn requests(&self) -> Vec<RecordedRequest> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    async fn read_request(stream: &mut TcpStream) -> std::io::Result<RecordedRequest> {
        let mut buffer = Vec::new();
        let mut chunk = [0_u8; 4096];

        let header_end = loop {
            let read = stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            buffer.extend_from_slice(&chunk[..read]);
            if let Some(position) = buffer.windows(4).position(|window| window == b"\r\n\r\n") {
                break position + 4;
            }
        };

        let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
        let content_length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);

        while buffer.len() < header_end + content_length {
            let read = stream.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
        }

        Ok(RecordedRequest {
            line: head.lines().next().unwrap_or_default().to_string(),
            body: String::from_utf8_lossy(&buffer[header_end..]).to_string(),
        })
    }

    /// An endpoint on a port nothing listens on.
    async fn unreachable_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind a free port");
        let address = listener.local_addr().expect("unused address");
        drop(listener);
        format!("http://{address}/v1")
    }

    fn model_for(endpoint: &str, cache: Arc<ModelCache>) -> RigChatModel {
        RigChatModel {
            config: ProviderConfig::new("ollama", "", endpoint, None),
            fallback_models: default_local_models(),
            model_cache: cache,
        }
    }

    const CHAT_COMPLETION_BODY: &str = r#"{"id":"chatcmpl-1","object":"chat.completion","created":1,"model":"tinyllama","choices":[{"index":0,"message":{"role":"assistant","content":"<user>: What is AI?\n<assistant>: AI is the study of intelligent agents."},"finish_reason":"stop"}],"usage":{"prompt_tokens":12,"total_tokens":24}}"#;

    #[tokio::test]
    async fn generate_posts_to_chat_completions_and_cleans_reply() {
        let endpoint =
            MockEndpoint::start(vec![("/v1/chat/completions", CHAT_COMPLETION_BODY)]).await;
        let model = model_for(
            &endpoint.base_url,
            Arc::new(ModelCache::with_default_ttl()),
        );

        let request = GenerateRequest::new("tinyllama", "What is AI?")
            .with_history(vec![
                ProviderMessage::user("hello"),
                ProviderMessage::assistant("Hi! How can I help?"),
            ])
            .with_temperature(0.7)
            .with_top_p(0.9);
        let reply = model.generate(request).await.expect("completion succeeds");

        assert_eq!(reply, "AI is the study of intelligent agents.");

        let requests = endpoint.requests();
        assert_eq!(requests.len(), 1);
        assert!(
            requests[0].line.starts_with("POST /v1/chat/completions "),
            "unexpected request line: {}",
            requests[0].line
        );
        assert!(requests[0].body.contains(r#""model":"tinyllama""#));
        assert!(requests[0].body.contains(r#""top_p""#));
        assert!(requests[0].body.contains("Hi! How can I help?"));
    }

    #[tokio::test]
    async fn generate_surfaces_http_failures() {
        let endpoint = MockEndpoint::start(Vec::new()).await;
        let model = model_for(
            &endpoint.base_url,
            Arc::new(ModelCache::with_default_ttl()),
        );

        let result = model.generate(GenerateRequest::new("tinyllama", "hi")).await;
        assert!(matches!(result, Err(ProviderError::CompletionsFailed { .. })));
    }

    #[tokio::test]
    async fn list_models_reads_endpoint_and_fills_cache() {
        let endpoint = MockEndpoint::start(vec![(
            "/v1/models",
            r#"{"object":"list","data":[{"id":"tinyllama"},{"id":"phi3:mini"}]}"#,
        )])
        .await;
        let model = model_for(
            &endpoint.base_url,
            Arc::new(ModelCache::with_default_ttl()),
        );

        let catalog = model.list_models().await.expect("catalog");
        assert_eq!(catalog.source, ModelCatalogSource::ProviderApi);
        assert!(catalog.warning.is_none());
        assert!(catalog.contains("tinyllama") && catalog.contains("phi3:mini"));
        assert!(endpoint.requests()[0].line.starts_with("GET /v1/models "));

        let cached = model.list_models().await.expect("cached catalog");
        assert_eq!(cached.source, ModelCatalogSource::CacheFresh);
        assert_eq!(endpoint.requests().len(), 1);
    }

    #[tokio::test]
    async fn list_models_falls_back_to_built_in_list_when_unreachable() {
        let model = model_for(
            &unreachable_endpoint().await,
            Arc::new(ModelCache::with_default_ttl()),
        );

        let catalog = model.list_models().await.expect("fallback catalog");
        assert_eq!(catalog.source, ModelCatalogSource::StaticFallback);
        assert!(catalog.warning.is_some());
        assert_eq!(catalog.models, default_local_models());
    }

    #[tokio::test]
    async fn list_models_prefers_stale_cache_over_built_in_list() {
        let endpoint = unreachable_endpoint().await;
        let cache = Arc::new(ModelCache::new(Duration::ZERO));
        let model = model_for(&endpoint, Arc::clone(&cache));
        cache
            .set(&model.cache_key(), vec![Model::from_id("llama3.2:1b")])
            .await;

        let catalog = model.list_models().await.expect("stale catalog");
        assert_eq!(catalog.source, ModelCatalogSource::CacheStaleFallback);
        assert!(catalog.warning.is_some());
        assert_eq!(catalog.models, vec![Model::from_id("llama3.2:1b")]);
    }

    #[test]
    fn clean_reply_trims_plain_text() {
        assert_eq!(clean_reply("  Hello there.\n").as_deref(), Some("Hello there."));
    }

    #[test]
    fn clean_reply_strips_echoed_prompt() {
        let raw = "<user>: What is AI?\n<assistant>: AI is the study of intelligent agents.";
        assert_eq!(
            clean_reply(raw).as_deref(),
            Some("AI is the study of intelligent agents.")
        );
    }

    #[test]
    fn clean_reply_keeps_text_after_last_marker() {
        let raw = "User: hi\nAssistant: hello\nUser: again\nAssistant:  second answer ";
        assert_eq!(clean_reply(raw).as_deref(), Some("second answer"));
    }

    #[test]
    fn clean_reply_rejects_blank_output() {
        assert_eq!(clean_reply("   "), None);
        assert_eq!(clean_reply("<assistant>:   "), None);
    }

    #[test]
    fn merged_preamble_folds_system_history() {
        let request = GenerateRequest::new("tinyllama", "hi")
            .with_preamble("Be brief.")
            .with_history(vec![
                ProviderMessage::new(ProviderRole::System, "Answer in English."),
                ProviderMessage::user("earlier"),
                ProviderMessage::new(ProviderRole::System, "  "),
            ]);

        assert_eq!(
            RigChatModel::merged_preamble(&request).as_deref(),
            Some("Be brief.\n\nAnswer in English.")
        );
        assert_eq!(
            RigChatModel::merged_preamble(&GenerateRequest::new("tinyllama", "hi")),
            None
        );
    }

    #[test]
    fn system_turns_are_not_sent_as_chat_messages() {
        assert!(
            RigChatModel::to_rig_message(&ProviderMessage::new(ProviderRole::System, "x"))
                .is_none()
        );
        assert!(RigChatModel::to_rig_message(&ProviderMessage::user("x")).is_some());
    }

    #[test]
    fn extract_model_ids_reads_openai_and_ollama_shapes() -> ProviderResult<()> {
        let openai = r#"{"object":"list","data":[{"id":"tinyllama"},{"id":"phi3:mini"},{"id":"tinyllama"}]}"#;
        assert_eq!(extract_model_ids(openai)?, vec!["phi3:mini", "tinyllama"]);

        let ollama = r#"{"models":[{"name":"llama3.2:1b"}]}"#;
        assert_eq!(extract_model_ids(ollama)?, vec!["llama3.2:1b"]);

        assert!(extract_model_ids(r#"{"data":[]}"#)?.is_empty());
        Ok(())
    }

    #[test]
    fn extract_model_ids_rejects_non_json() {
        assert!(matches!(
            extract_model_ids("<html>bad gateway</html>"),
            Err(ProviderError::ModelPayloadParse { .. })
        ));
    }

    #[test]
    fn default_model_prefers_config() {
        let configured = RigChatModel::new(ProviderConfig::new(
            "ollama",
            "",
            "http://localhost:11434/v1",
            Some("phi3:mini".to_string()),
        ));
        assert_eq!(configured.default_model(), "phi3:mini");

        let unconfigured = RigChatModel::new(ProviderConfig::new("ollama", "", "", None));
        assert_eq!(unconfigured.default_model(), DEFAULT_LOCAL_MODEL);
    }

    #[tokio::test]
    async fn empty_prompt_fails_before_any_request() {
        let model = RigChatModel::new(ProviderConfig::new(
            "ollama",
            "",
            "http://127.0.0.1:9/v1",
            None,
        ));
        let result = model.generate(GenerateRequest::new("tinyllama", "  ")).await;
        assert!(matches!(result, Err(ProviderError::EmptyPrompt { .. })));
    }
}
