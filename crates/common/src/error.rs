use thiserror::Error;
use serde::Serialize;

/// Common error type for LlamaRelay with clear taxonomy
#[derive(Error, Debug)]
pub enum Error {
    /// Inference process errors
    #[error("Failed to spawn inference server: {0}")]
    SpawnFailure(String),

    #[error("Inference server crashed: {0}")]
    ProcessCrash(String),

    #[error("Inference server not ready")]
    NotReady,

    /// Completion transport errors
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Malformed stream event: {0}")]
    MalformedEvent(String),

    /// Queue errors
    #[error("Request worker crashed: {0}")]
    WorkerCrash(String),

    #[error("Request queue is closed")]
    QueueClosed,

    /// Configuration errors
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Setting {0} not recognized")]
    UnknownSetting(String),

    #[error("Invalid value for setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Front-end errors
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// IO and serialization errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Get HTTP status code for the error
    pub fn status_code(&self) -> u16 {
        match self {
            // 4xx Client Errors
            Error::BadRequest(_) => 400,
            Error::UnknownSetting(_) => 400,
            Error::InvalidSetting { .. } => 400,
            Error::ModelNotFound(_) => 404,
            Error::ChannelNotFound(_) => 404,

            // 5xx Server Errors
            Error::NotReady => 503,
            Error::QueueClosed => 503,
            Error::SpawnFailure(_) => 500,
            Error::ProcessCrash(_) => 500,
            Error::WorkerCrash(_) => 500,
            Error::Transport(_) => 502,
            Error::MalformedEvent(_) => 502,

            // Internal Errors
            Error::ConfigError(_) => 500,
            Error::Io(_) => 500,
            Error::Serialization(_) => 500,
        }
    }

    /// Get error type for logging
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::SpawnFailure(_) => "spawn_failure",
            Error::ProcessCrash(_) => "process_crash",
            Error::NotReady => "not_ready",
            Error::Transport(_) => "transport_failure",
            Error::MalformedEvent(_) => "malformed_event",
            Error::WorkerCrash(_) => "worker_crash",
            Error::QueueClosed => "queue_closed",
            Error::ModelNotFound(_) => "model_not_found",
            Error::UnknownSetting(_) => "unknown_setting",
            Error::InvalidSetting { .. } => "invalid_setting",
            Error::ConfigError(_) => "config_error",
            Error::ChannelNotFound(_) => "channel_not_found",
            Error::BadRequest(_) => "bad_request",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
        }
    }
}

/// Error response for HTTP API
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: String,
    pub code: u16,
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        ErrorResponse {
            error: ErrorDetail {
                message: err.to_string(),
                r#type: err.error_type().to_string(),
                code: err.status_code(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
