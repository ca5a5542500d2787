//! DGit smart HTTP transport
//!
//! Serves the git smart protocol over HTTP/1.1:
//! - `GET <repo>/info/refs?service=<svc>` reference advertisement
//! - `POST <repo>/git-upload-pack` fetch
//! - `POST <repo>/git-receive-pack` push
//! - `GET <repo>` plain text reference listing for browsers

pub mod classify;
pub mod handlers;

use bytes::Bytes;
use dgit_core::{
    FilesystemRegistry, MemoryRegistry, PackCodec, PackfileCodec, ProtocolError, StoreRegistry,
};
use http_body_util::Full;
use hyper::body::Body;
use hyper::header::{ALLOW, CONTENT_TYPE, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Where repositories live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Repositories are created on demand and lost on exit
    #[default]
    Memory,
    /// Bare repositories under the data directory
    Filesystem,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "filesystem" => Ok(Self::Filesystem),
            other => Err(format!(
                "unknown storage backend '{}' (expected memory or filesystem)",
                other
            )),
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Filesystem => f.write_str("filesystem"),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding one bare repository per id
    pub data_dir: PathBuf,
    /// Storage backend
    pub storage: StorageBackend,
    /// Decoded objects cached per repository (filesystem backend)
    pub object_cache_size: usize,
    /// Maximum request body size (bytes), applied after decompression too
    pub max_body_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/repos"),
            storage: StorageBackend::Memory,
            object_cache_size: 4096,
            max_body_size: 100 * 1024 * 1024, // 100 MB
        }
    }
}

impl Config {
    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml(text: &str) -> Result<Self, GitHttpError> {
        toml::from_str(text).map_err(|e| GitHttpError::Config(e.to_string()))
    }

    /// Load a TOML configuration file
    pub fn load(path: &Path) -> Result<Self, GitHttpError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GitHttpError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }
}

/// Build the repository registry described by `config`
pub fn build_registry(config: &Config) -> Arc<dyn StoreRegistry> {
    match config.storage {
        StorageBackend::Memory => Arc::new(MemoryRegistry::new()),
        StorageBackend::Filesystem => Arc::new(FilesystemRegistry::new(
            config.data_dir.clone(),
            config.object_cache_size,
        )),
    }
}

/// Git smart HTTP request handler
pub struct GitHttpHandler {
    config: Config,
    registry: Arc<dyn StoreRegistry>,
    codec: Arc<dyn PackCodec>,
}

impl GitHttpHandler {
    /// Create a handler over an existing registry
    pub fn new(config: Config, registry: Arc<dyn StoreRegistry>) -> Self {
        Self {
            config,
            registry,
            codec: Arc::new(PackfileCodec::new()),
        }
    }

    /// Create a handler with the registry the config asks for
    pub fn with_config(config: Config) -> Self {
        let registry = build_registry(&config);
        Self::new(config, registry)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn StoreRegistry> {
        &self.registry
    }

    pub fn codec(&self) -> &dyn PackCodec {
        self.codec.as_ref()
    }

    /// Handle an incoming HTTP request
    ///
    /// Client errors are turned into their responses here; the remaining
    /// errors are server faults for the caller to report.
    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, GitHttpError>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        tracing::debug!("Git request: {} {}", req.method(), req.uri());

        match self.route(req).await {
            Err(e) if e.status().is_client_error() => {
                tracing::debug!("Rejected request: {}", e);
                Ok(e.into_response())
            }
            other => other,
        }
    }

    async fn route<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, GitHttpError>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if let Some((repo, service)) = classify::list_refs_request(&req) {
            require_method(&req, &Method::GET)?;
            return handlers::info_refs(self, &repo, service).await;
        }

        if let Some((repo, service)) = classify::pack_request(&req) {
            require_method(&req, &Method::POST)?;
            return handlers::service_rpc(self, req, &repo, service).await;
        }

        if req.method() == Method::GET && classify::is_browser_request(&req) {
            let repo = req.uri().path().trim_matches('/').to_string();
            return handlers::browse(self, &repo).await;
        }

        Err(GitHttpError::NotFound(req.uri().path().to_string()))
    }
}

fn require_method<B>(req: &Request<B>, allowed: &Method) -> Result<(), GitHttpError> {
    if req.method() == allowed {
        Ok(())
    } else {
        Err(GitHttpError::MethodNotAllowed {
            method: req.method().to_string(),
            allowed: allowed.clone(),
        })
    }
}

/// HTTP transport errors
#[derive(Debug, thiserror::Error)]
pub enum GitHttpError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Method {method} not allowed")]
    MethodNotAllowed { method: String, allowed: Method },

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl GitHttpError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Protocol(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            Self::Protocol(_) | Self::Config(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Plain text response carrying the error message
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let mut response =
            handlers::text_response(self.status(), "text/plain", format!("{}\n", self));
        if let Self::MethodNotAllowed { allowed, .. } = &self {
            if let Ok(value) = HeaderValue::from_str(allowed.as_str()) {
                response.headers_mut().insert(ALLOW, value);
            }
        }
        response
    }
}

/// Content type of a response body, for logging
pub fn content_type<B>(response: &Response<B>) -> &str {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_toml() {
        let config = Config::default();
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.object_cache_size, 4096);

        let config = Config::from_toml(
            "data_dir = \"/srv/git\"\nstorage = \"filesystem\"\nmax_body_size = 1024\n",
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/git"));
        assert_eq!(config.storage, StorageBackend::Filesystem);
        assert_eq!(config.max_body_size, 1024);
        assert_eq!(config.object_cache_size, 4096);
    }

    #[test]
    fn test_config_rejects_unknown_backend() {
        assert!(matches!(
            Config::from_toml("storage = \"s3\""),
            Err(GitHttpError::Config(_))
        ));
        assert!("s3".parse::<StorageBackend>().is_err());
        assert_eq!(
            "filesystem".parse::<StorageBackend>(),
            Ok(StorageBackend::Filesystem)
        );
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GitHttpError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GitHttpError::Protocol(ProtocolError::Parse("bad".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GitHttpError::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        let response = GitHttpError::MethodNotAllowed {
            method: "PUT".into(),
            allowed: Method::POST,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "POST");
    }
}
