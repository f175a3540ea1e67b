//! Error handling: domain error enum, severity classification, and the
//! crate-wide `Result` alias.

use thiserror::Error;

/// Severity classes from the error-handling design: determines whether a
/// call site should propagate, log-and-retain, or silently drop an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Bootstrap,
    Refresh,
    ParseRecord,
    ParseDocument,
    FilterEmpty,
    GroupEmpty,
    Io,
    ScriptRuntime,
    Cancelled,
}

/// Domain errors raised anywhere in the provider pipeline.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("middleware error: {0}")]
    Middleware(#[from] reqwest_middleware::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yml::Error),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("dns error: {0}")]
    Dns(String),

    #[error("no subscription grammar matched (tried clash, raw-link, sing-box)")]
    ParseDocument,

    #[error("filter removed every outbound")]
    FilterEmpty,

    #[error("group '{0}' filter removed every member")]
    GroupEmpty(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("operation cancelled")]
    Cancelled,

    /// Adds operation-name / provider-tag context to a wrapped error,
    /// per §7's "outermost layer adds context" rule.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ProviderError>,
    },
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, ProviderError>;

impl ProviderError {
    pub fn context(self, context: impl Into<String>) -> Self {
        ProviderError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProviderError::Cancelled)
    }

    /// Best-effort classification for logging, unwrapping `Context` layers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Configuration(_) | ProviderError::Config(_) => ErrorKind::Configuration,
            ProviderError::ParseDocument => ErrorKind::ParseDocument,
            ProviderError::FilterEmpty => ErrorKind::FilterEmpty,
            ProviderError::GroupEmpty(_) => ErrorKind::GroupEmpty,
            ProviderError::Io(_) => ErrorKind::Io,
            ProviderError::Script(_) => ErrorKind::ScriptRuntime,
            ProviderError::Cancelled => ErrorKind::Cancelled,
            ProviderError::Context { source, .. } => source.kind(),
            ProviderError::Network(_)
            | ProviderError::Middleware(_)
            | ProviderError::Json(_)
            | ProviderError::Yaml(_)
            | ProviderError::Dns(_) => ErrorKind::Refresh,
        }
    }
}

pub(crate) trait ResultExt<T> {
    fn provider_context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn provider_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}
