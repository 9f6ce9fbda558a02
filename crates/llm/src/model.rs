use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
        }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelCatalogSource {
    ProviderApi,
    CacheFresh,
    CacheStaleFallback,
    StaticFallback,
}

impl ModelCatalogSource {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ProviderApi => "endpoint",
            Self::CacheFresh => "cache",
            Self::CacheStaleFallback => "stale cache",
            Self::StaticFallback => "built-in list",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    pub models: Vec<Model>,
    pub source: ModelCatalogSource,
    pub warning: Option<String>,
}

impl ModelCatalog {
    pub fn from_provider_api(models: Vec<Model>) -> Self {
        Self {
            models,
            source: ModelCatalogSource::ProviderApi,
            warning: None,
        }
    }

    pub fn from_cache_fresh(models: Vec<Model>) -> Self {
        Self {
            models,
            source: ModelCatalogSource::CacheFresh,
            warning: None,
        }
    }

    pub fn from_cache_stale(models: Vec<Model>, warning: String) -> Self {
        Self {
            models,
            source: ModelCatalogSource::CacheStaleFallback,
            warning: Some(warning),
        }
    }

    pub fn from_static_fallback(models: Vec<Model>, warning: String) -> Self {
        Self {
            models,
            source: ModelCatalogSource::StaticFallback,
            warning: Some(warning),
        }
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.models.iter().any(|model| model.id == model_id)
    }
}

struct CacheEntry {
    models: Vec<Model>,
    fetched_at: Instant,
}

/// Model lists keyed by `provider_id@endpoint`.
pub struct ModelCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl ModelCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(Duration::from_secs(60 * 60))
    }

    pub async fn get_fresh(&self, key: &str) -> Option<Vec<Model>> {
        let entries = self.entries.read().await;
        entries.get(key).and_then(|entry| {
            if entry.fetched_at.elapsed() < self.ttl {
                Some(entry.models.clone())
            } else {
                None
            }
        })
    }

    pub async fn get_any(&self, key: &str) -> Option<Vec<Model>> {
        let entries = self.entries.read().await;
        entries.get(key).map(|entry| entry.models.clone())
    }

    pub async fn set(&self, key: &str, models: Vec<Model>) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            CacheEntry {
                models,
                fetched_at: Instant::now(),
            },
        );
    }
}

static MODEL_CACHE: OnceLock<Arc<ModelCache>> = OnceLock::new();

pub fn get_model_cache() -> Arc<ModelCache> {
    MODEL_CACHE
        .get_or_init(|| Arc::new(ModelCache::with_default_ttl()))
        .clone()
}

pub const DEFAULT_LOCAL_MODEL: &str = "tinyllama";

pub fn default_local_models() -> Vec<Model> {
    vec![
        Model::new("tinyllama", "TinyLlama 1.1B Chat")
            .with_description("Small chat-tuned model, runs on CPU"),
        Model::new("qwen2.5:0.5b", "Qwen2.5 0.5B Instruct")
            .with_description("Smallest instruct model in the list"),
        Model::new("llama3.2:1b", "Llama 3.2 1B Instruct"),
        Model::new("phi3:mini", "Phi-3 Mini").with_description("3.8B, better answers, slower"),
    ]
}
