use std::time::Duration;
use thiserror::Error;

/// Failure of a single request. Recorded as a failed outcome, never fatal.
#[derive(Error, Debug)]
pub enum InvokeError {
    #[error("request exceeded deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("simulated failure: {0}")]
    Simulated(String),
}

impl From<reqwest::Error> for InvokeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            InvokeError::Decode(err.to_string())
        } else {
            InvokeError::Http(err.to_string())
        }
    }
}

/// Failure that aborts a whole cell; partial samples are discarded.
#[derive(Error, Debug)]
pub enum CellError {
    #[error("concurrency level must be greater than 0")]
    ZeroConcurrency,

    #[error("worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("worker was cancelled before draining")]
    WorkerCancelled,

    #[error("scheduled {scheduled} requests but {completed} outcomes were recorded")]
    Unreconciled { scheduled: u64, completed: u64 },
}

/// Cell-fatal failure tagged with the cell that produced it.
#[derive(Error, Debug)]
#[error("cell ({variant}, concurrency={concurrency}) failed: {source}")]
pub struct MatrixError {
    pub variant: String,
    pub concurrency: usize,
    #[source]
    pub source: CellError,
}

/// The invoker for a configured target could not be built.
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("target '{variant}': failed to build HTTP client: {reason}")]
    Client { variant: String, reason: String },

    #[error("target '{variant}': invalid base URL '{url}'")]
    BaseUrl { variant: String, url: String },
}
