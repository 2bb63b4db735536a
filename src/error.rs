use std::path::PathBuf;
use thiserror::Error;

/// Failure to extract one record from a sidecar text blob.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("missing required field \"{0}\"")]
    MissingField(String),

    #[error("field \"{field}\" is not a number: {value:?}")]
    NotANumber { field: String, value: String },

    #[error("field \"{field}\" is malformed: {reason}")]
    Malformed { field: String, reason: String },
}

#[derive(Debug, Error)]
pub enum OverrideError {
    #[error("failed to read override file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("override file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("override file {path} must contain a JSON object")]
    NotAnObject { path: PathBuf },

    #[error("overrides for {dir} are invalid: {source}")]
    Invalid {
        dir: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Normalized failure of a call against the generation service.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Forge is not running at {base_url}. Start it with --api and try again.")]
    NotRunning { base_url: String },

    #[error("{method} {endpoint} failed with status {status}: {body}")]
    Status {
        method: String,
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("{method} {endpoint} transport error: {message}")]
    Transport {
        method: String,
        endpoint: String,
        message: String,
    },

    #[error("{method} {endpoint} returned an unexpected body: {message}")]
    Decode {
        method: String,
        endpoint: String,
        message: String,
    },

    #[error("invalid API key header: {0}")]
    InvalidApiKey(String),
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("image sizes differ: {left:?} vs {right:?}")]
    DimensionMismatch { left: (u32, u32), right: (u32, u32) },
}

/// Failure of a single replay item. Never aborts the run.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("image {0} no longer exists")]
    MissingImage(PathBuf),

    #[error("model \"{0}\" is not known to the service")]
    UnknownModel(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("generation returned no images")]
    EmptyResponse,

    #[error("invalid image payload: {0}")]
    Payload(String),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error("file placement failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that abort a whole operation.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Overrides(#[from] OverrideError),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("interrupted")]
    Interrupted,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
