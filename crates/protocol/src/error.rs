use serde::Serialize;
use thiserror::Error;

/// The bridge's error taxonomy, with a lossless mapping onto the numeric
/// error codes carried in `{error_code, error}` response envelopes.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no message provided")]
    NoMessage,

    #[error("invalid json: {0}")]
    InvalidJson(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("missing element: {0}")]
    MissingElement(String),

    #[error("invalid element: {0}")]
    InvalidElement(String),

    #[error("wrong state: {0}")]
    WrongState(String),

    #[error("missing sdp: {0}")]
    MissingSdp(String),

    #[error("invalid sdp: {0}")]
    InvalidSdp(String),

    #[error("io error: {0}")]
    IoError(String),

    #[error("recording error: {0}")]
    RecordingError(String),

    #[error("too strict: {0}")]
    TooStrict(String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// The numeric error code from the external interface's error table.
    pub const fn code(&self) -> u32 {
        match self {
            Error::NoMessage => 440,
            Error::InvalidJson(_) => 441,
            Error::InvalidRequest(_) => 442,
            Error::MissingElement(_) => 443,
            Error::InvalidElement(_) => 444,
            Error::WrongState(_) => 445,
            Error::MissingSdp(_) => 446,
            Error::InvalidSdp(_) => 447,
            Error::IoError(_) => 448,
            Error::RecordingError(_) => 449,
            Error::TooStrict(_) => 450,
            Error::Unknown(_) => 499,
        }
    }

    /// Render as the `{error_code, error}` envelope the host pushes back
    /// synchronously to the caller on request validation failure.
    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error_code: self.code(),
            error: self.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub error_code: u32,
    pub error: String,
}

pub type Result<T> = std::result::Result<T, Error>;
