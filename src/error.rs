use thiserror::Error;

#[derive(Error, Debug)]
pub enum BoxenvError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid sandbox configuration: {0}")]
    InvalidConfig(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Runtime daemon errors
    #[error("Cannot reach container runtime: {0}")]
    Connectivity(String),

    #[error("Sandbox not found: {id}")]
    SandboxNotFound { id: String },

    #[error("Path '{path}' not found in sandbox {id}")]
    PathNotFound { id: String, path: String },

    #[error("Sandbox {id} is not running (status: {status})")]
    NotRunning { id: String, status: String },

    #[error("Sandbox provisioning failed: {0}")]
    Provisioning(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    // Environment errors
    #[error("Execution environment for sandbox {id} has been released")]
    EnvironmentReleased { id: String },

    #[error("Sandbox {id} is attached, only the owning environment may {action} it")]
    NotOwner { id: String, action: String },

    #[error("Command timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    // File transfer errors
    #[error("Failed to write '{path}': {reason}")]
    Write { path: String, reason: String },

    #[error("Failed to read '{path}': {reason}")]
    Read { path: String, reason: String },

    #[error("Archive error: {0}")]
    Archive(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BoxenvError {
    /// True for a missing sandbox or a missing path inside one.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SandboxNotFound { .. } | Self::PathNotFound { .. })
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

pub type Result<T> = std::result::Result<T, BoxenvError>;
