//! Error types for the lab engine.

/// Result type alias for lab operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building, deploying, or destroying a lab.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Topology or lab configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Bind mount spec has fewer than two colon-separated components.
    #[error("invalid bind mount provided: {0}")]
    InvalidBind(String),

    /// Node kind is not present in the kind registry.
    #[error("unknown node kind {0:?}")]
    UnknownKind(String),

    /// Runtime name is not present in the runtime registry.
    #[error("unknown container runtime {0:?}")]
    UnknownRuntime(String),

    // =========================================================================
    // Runtime Backend Errors
    // =========================================================================
    /// The backend socket/endpoint is unreachable.
    #[error("container runtime {runtime:?} is unavailable: {reason}")]
    RuntimeUnavailable { runtime: String, reason: String },

    /// Image pull failed and the image is not present locally.
    #[error("failed to pull image {image:?}: {reason}")]
    ImagePull { image: String, reason: String },

    /// Name, IP, or network parameter collision.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The engine API returned a non-success status.
    #[error("engine API error (status {status}): {message}")]
    Api { status: u16, message: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// A node failed one of its lifecycle phases.
    #[error("node {node:?} failed {phase}: {reason}")]
    DeployFailed {
        node: String,
        phase: String,
        reason: String,
    },

    /// A link could not be wired.
    #[error("failed to wire link {link}: {reason}")]
    LinkWireFailed { link: String, reason: String },

    /// The lab deadline expired.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The operation was cancelled via the lab context.
    #[error("operation cancelled")]
    Cancelled,

    // =========================================================================
    // Transport / Encoding Errors
    // =========================================================================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Returns true if this error is an engine API "not found" response.
    ///
    /// Best-effort deletion paths treat missing containers and networks as
    /// success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Api { status: 404, .. })
    }

    /// Shorthand for an engine API error from a status code and body text.
    pub(crate) fn api(status: u16, message: impl Into<String>) -> Self {
        Error::Api {
            status,
            message: message.into(),
        }
    }
}
