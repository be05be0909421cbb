//! News provider adapter contracts + the REST providers the feed ships with.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cyberfeed_core::CanonicalArticle;
use cyberfeed_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub mod normalize;

pub use normalize::{humanize_since, normalize_article, normalize_articles, parse_timestamp};

pub const CRATE_NAME: &str = "cyberfeed-adapters";

pub const DEFAULT_QUERY: &str = "cybercrime";
pub const DEFAULT_PAGE_SIZE: u32 = 10;

const CONTEXTUAL_WEB_HOST: &str = "contextualwebsearch-websearch-v1.p.rapidapi.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    NewsApi,
    GNews,
    ContextualWeb,
}

impl ProviderKind {
    /// Key of the article array inside the response envelope.
    pub fn envelope_key(self) -> &'static str {
        match self {
            ProviderKind::NewsApi | ProviderKind::GNews => "articles",
            ProviderKind::ContextualWeb => "value",
        }
    }
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_enabled() -> bool {
    true
}

/// One provider entry of the source registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub source_id: String,
    pub label: String,
    pub kind: ProviderKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub base_url: String,
    pub endpoint: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Extra or overriding query parameters (e.g. `language: de`).
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub fetch_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn now() -> Self {
        Self {
            fetch_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no API key configured for {source_id} (set {env_var})")]
    MissingApiKey { source_id: String, env_var: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

/// Fully resolved GET request for one provider page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRequest {
    pub url: String,
    pub query: Vec<(&'static str, String)>,
    pub headers: Vec<(&'static str, String)>,
}

#[async_trait]
pub trait NewsProvider: Send + Sync {
    fn source_id(&self) -> &str;
    fn label(&self) -> &str;

    /// One GET for `page`, returning the raw provider article objects.
    async fn fetch_raw(&self, http: &HttpFetcher, page: u32) -> Result<Vec<JsonValue>, AdapterError>;

    /// Normalized page. Provider failures are logged and degrade to an empty list.
    async fn fetch_articles(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        page: u32,
    ) -> Result<Vec<CanonicalArticle>, AdapterError> {
        match self.fetch_raw(http, page).await {
            Ok(raw) => {
                debug!(source_id = self.source_id(), page, count = raw.len(), "provider page fetched");
                Ok(normalize_articles(&raw, self.label(), ctx.fetched_at))
            }
            Err(err) => {
                warn!(
                    source_id = self.source_id(),
                    page,
                    fetch_id = %ctx.fetch_id,
                    error = %err,
                    "provider fetch failed; continuing without its articles"
                );
                Ok(Vec::new())
            }
        }
    }
}

/// Article list from a provider envelope; anything but an array yields nothing.
pub fn extract_articles(kind: ProviderKind, body: &JsonValue) -> Vec<JsonValue> {
    body.get(kind.envelope_key())
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct RestNewsProvider {
    settings: ProviderSettings,
    query_term: String,
    api_key: Option<String>,
}

impl RestNewsProvider {
    pub fn new(settings: ProviderSettings, query_term: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            settings,
            query_term: query_term.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    fn require_api_key(&self) -> Result<&str, AdapterError> {
        self.api_key.as_deref().ok_or_else(|| AdapterError::MissingApiKey {
            source_id: self.settings.source_id.clone(),
            env_var: self
                .settings
                .api_key_env
                .clone()
                .unwrap_or_else(|| "<unset>".to_string()),
        })
    }

    pub fn build_request(&self, page: u32) -> Result<ProviderRequest, AdapterError> {
        let key = self.require_api_key()?.to_string();
        let page_size = self.settings.page_size.to_string();
        let q = self.query_term.clone();

        let (mut query, headers): (Vec<(&'static str, String)>, Vec<(&'static str, String)>) =
            match self.settings.kind {
                ProviderKind::NewsApi => (
                    vec![
                        ("q", q),
                        ("page", page.to_string()),
                        ("apiKey", key),
                        ("pageSize", page_size),
                        ("language", "en".to_string()),
                        ("sortBy", "publishedAt".to_string()),
                    ],
                    Vec::new(),
                ),
                ProviderKind::GNews => (
                    vec![
                        ("q", q),
                        ("apikey", key),
                        ("lang", "en".to_string()),
                        ("country", "us".to_string()),
                        ("max", page_size),
                        ("page", page.to_string()),
                    ],
                    Vec::new(),
                ),
                ProviderKind::ContextualWeb => (
                    vec![
                        ("q", q),
                        ("pageNumber", page.to_string()),
                        ("pageSize", page_size),
                        ("withThumbnails", "true".to_string()),
                        ("location", "us".to_string()),
                    ],
                    vec![
                        ("x-rapidapi-host", CONTEXTUAL_WEB_HOST.to_string()),
                        ("x-rapidapi-key", key),
                    ],
                ),
            };

        for (name, value) in &self.settings.params {
            match query.iter_mut().find(|(k, _)| *k == name.as_str()) {
                Some(slot) => slot.1 = value.clone(),
                None => warn!(
                    source_id = %self.settings.source_id,
                    param = %name,
                    "ignoring unknown provider parameter"
                ),
            }
        }

        Ok(ProviderRequest {
            url: format!(
                "{}{}",
                self.settings.base_url.trim_end_matches('/'),
                self.settings.endpoint
            ),
            query,
            headers,
        })
    }
}

#[async_trait]
impl NewsProvider for RestNewsProvider {
    fn source_id(&self) -> &str {
        &self.settings.source_id
    }

    fn label(&self) -> &str {
        &self.settings.label
    }

    async fn fetch_raw(&self, http: &HttpFetcher, page: u32) -> Result<Vec<JsonValue>, AdapterError> {
        let request = self.build_request(page)?;
        let response = http
            .get(
                &self.settings.source_id,
                &request.url,
                &request.query,
                &request.headers,
            )
            .await?;
        let body = response.json()?;
        Ok(extract_articles(self.settings.kind, &body))
    }
}

/// Builds the adapter for a registry entry, reading its API key from the environment.
pub fn adapter_for_source(settings: &ProviderSettings, query_term: &str) -> Box<dyn NewsProvider> {
    let api_key = settings
        .api_key_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok());
    Box::new(RestNewsProvider::new(settings.clone(), query_term, api_key))
}

pub fn newsapi_settings() -> ProviderSettings {
    ProviderSettings {
        source_id: "newsapi".to_string(),
        label: "NewsAPI".to_string(),
        kind: ProviderKind::NewsApi,
        enabled: true,
        base_url: "https://newsapi.org/v2".to_string(),
        endpoint: "/everything".to_string(),
        page_size: DEFAULT_PAGE_SIZE,
        params: BTreeMap::new(),
        api_key_env: Some("NEWSAPI_KEY".to_string()),
    }
}

pub fn gnews_settings() -> ProviderSettings {
    ProviderSettings {
        source_id: "gnews".to_string(),
        label: "GNews".to_string(),
        kind: ProviderKind::GNews,
        enabled: true,
        base_url: "https://gnews.io/api/v4".to_string(),
        endpoint: "/search".to_string(),
        page_size: DEFAULT_PAGE_SIZE,
        params: BTreeMap::new(),
        api_key_env: Some("GNEWS_KEY".to_string()),
    }
}

pub fn contextual_web_settings() -> ProviderSettings {
    ProviderSettings {
        source_id: "contextualweb".to_string(),
        label: "ContextualWeb".to_string(),
        kind: ProviderKind::ContextualWeb,
        enabled: true,
        base_url: format!("https://{CONTEXTUAL_WEB_HOST}"),
        endpoint: "/api/search/NewsSearchAPI".to_string(),
        page_size: DEFAULT_PAGE_SIZE,
        params: BTreeMap::new(),
        api_key_env: Some("CONTEXTUALWEB_KEY".to_string()),
    }
}

/// Provider registry used when no `sources.yaml` is present, in fixed feed order.
pub fn default_provider_settings() -> Vec<ProviderSettings> {
    vec![newsapi_settings(), gnews_settings(), contextual_web_settings()]
}

/// Reads a captured provider response (fixtures, offline debugging).
pub fn load_fixture_response(path: impl AsRef<Path>) -> Result<JsonValue> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
