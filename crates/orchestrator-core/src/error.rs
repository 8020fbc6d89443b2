use thiserror::Error;

/// Error taxonomy for the session orchestrator.
///
/// Variant names double as the surface names callers (REST dispatcher, WS
/// hubs) map onto status codes: `InvalidArgument` -> 400, `Unauthorized` ->
/// 401 / WS 4001, `NotFound` -> 404, `ConflictState` -> 409,
/// `ResourceExhausted` -> 503, `ContainerError` -> 500, `Internal` -> 500.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("conflicting state: {message}")]
    ConflictState { message: String },

    #[error("resource exhausted: {message}")]
    ResourceExhausted { message: String },

    #[error("container error: {message}")]
    ContainerError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::ConflictState {
            message: message.into(),
        }
    }

    pub fn resource_exhausted<S: Into<String>>(message: S) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }

    pub fn container<S: Into<String>>(message: S) -> Self {
        Self::ContainerError {
            message: message.into(),
            source: None,
        }
    }

    pub fn container_with_source<S, E>(message: S, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ContainerError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal_with_source<S, E>(message: S, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether this error reflects a condition the caller can simply retry
    /// (transient daemon hiccup), as opposed to one that needs different
    /// input or different session state.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ContainerError { .. } | Self::Internal { .. })
    }

    /// HTTP status code callers outside this crate (the REST dispatcher,
    /// the internal/client WS hubs when closing a socket) should map this
    /// error onto. WS close codes are handled separately by the hubs.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidArgument { .. } => 400,
            Self::Unauthorized { .. } => 401,
            Self::NotFound { .. } => 404,
            Self::ConflictState { .. } => 409,
            Self::ResourceExhausted { .. } => 503,
            Self::ContainerError { .. } => 500,
            Self::Internal { .. } => 500,
        }
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal {
            message: e.to_string(),
            source: Some(Box::new(e)),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal {
            message: e.to_string(),
            source: Some(Box::new(e)),
        }
    }
}

impl From<config::ConfigError> for OrchestratorError {
    fn from(e: config::ConfigError) -> Self {
        Self::Internal {
            message: e.to_string(),
            source: Some(Box::new(e)),
        }
    }
}
