use thiserror::Error;

/// Process exit codes.
///
/// `SUCCESS` covers both a clean exit and "another backend already owns the
/// instance lock": a second launch detecting an incumbent is the designed
/// singleton behavior, not a failure.
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const INTERNAL: i32 = 1;
    pub const USER_ERROR: i32 = 2;
    pub const STARTUP: i32 = 3;
}

#[derive(Error, Debug)]
pub enum ScryError {
    /// Another backend already owns the instance lock. Not a failure: the
    /// wrapper exits 0 when it sees this.
    #[error("Another backend instance already owns the lock")]
    AlreadyRunning,

    #[error("Failed to connect to backend: {0}")]
    BackendConnection(String),

    #[error("Backend protocol error: {0}")]
    BackendProtocol(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Gateway is not connected")]
    GatewayNotConnected,

    #[error("Gateway query timed out after {0:?}")]
    GatewayTimeout(std::time::Duration),

    #[error("Gateway connection closed with query pending")]
    GatewayClosed,

    #[error("Gateway peer was superseded by a new connection")]
    GatewaySuperseded,

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool registry is missing a handler for '{0}'")]
    UnregisteredTool(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Startup error: {0}")]
    Startup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ScryError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ScryError::AlreadyRunning => exit_codes::SUCCESS,

            ScryError::InvalidArgument(_) | ScryError::UnknownTool(_) => exit_codes::USER_ERROR,

            ScryError::Startup(_) | ScryError::Config(_) | ScryError::UnregisteredTool(_) => {
                exit_codes::STARTUP
            }

            ScryError::BackendConnection(_)
            | ScryError::BackendProtocol(_)
            | ScryError::Backend(_)
            | ScryError::GatewayNotConnected
            | ScryError::GatewayTimeout(_)
            | ScryError::GatewayClosed
            | ScryError::GatewaySuperseded
            | ScryError::Gateway(_)
            | ScryError::JobNotFound(_)
            | ScryError::Io(_)
            | ScryError::Json(_)
            | ScryError::Toml(_) => exit_codes::INTERNAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScryError>;
