//! Where worker scripts come from.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::version::JAILBOX_VERSION;

const BUILTIN_PREFIX: &str = "builtin:";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to load {url}\nHTTP response status code: {status}")]
    Status { url: String, status: u16 },

    #[error("no builtin script named {0}")]
    UnknownBuiltin(String),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

#[async_trait]
pub trait ScriptSource: Send + Sync {
    async fn fetch(&self, path: &str) -> Result<String, SourceError>;
}

/// `http://` and `https://` paths, case-insensitive.
pub fn is_remote(path: &str) -> bool {
    let lower = |n: usize| path.get(..n).map(str::to_ascii_lowercase);
    lower(7).as_deref() == Some("http://") || lower(8).as_deref() == Some("https://")
}

/// Bundled `builtin:` scripts, remote scripts over HTTP, local files otherwise.
pub struct DefaultScriptSource {
    client: reqwest::Client,
    builtins: HashMap<String, &'static str>,
}

impl DefaultScriptSource {
    pub fn new() -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(format!("jailbox/{JAILBOX_VERSION}"))
            .build()
            .map_err(SourceError::Client)?;
        Ok(Self {
            client,
            builtins: HashMap::new(),
        })
    }

    /// Register a bundled script under `builtin:<name>`; `name` may carry
    /// the prefix already.
    pub fn with_builtin(mut self, name: &str, code: &'static str) -> Self {
        let name = name.strip_prefix(BUILTIN_PREFIX).unwrap_or(name);
        self.builtins.insert(name.to_string(), code);
        self
    }

    async fn fetch_remote(&self, url: &str) -> Result<String, SourceError> {
        let http = |source| SourceError::Http {
            url: url.to_string(),
            source,
        };
        let response = self.client.get(url).send().await.map_err(http)?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(SourceError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response.text().await.map_err(http)
    }
}

#[async_trait]
impl ScriptSource for DefaultScriptSource {
    async fn fetch(&self, path: &str) -> Result<String, SourceError> {
        if let Some(name) = path.strip_prefix(BUILTIN_PREFIX) {
            return self
                .builtins
                .get(name)
                .map(|code| code.to_string())
                .ok_or_else(|| SourceError::UnknownBuiltin(path.to_string()));
        }
        if is_remote(path) {
            tracing::debug!(url = path, "Fetching remote script");
            return self.fetch_remote(path).await;
        }
        tokio::fs::read_to_string(path)
            .await
            .map_err(|source| SourceError::Io {
                path: path.to_string(),
                source,
            })
    }
}
