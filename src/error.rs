use thiserror::Error;

/// Errors surfaced by the allocator core. Variants map onto the error
/// kinds from the control-loop design: most are logged and the current
/// iteration degrades gracefully rather than aborting the process.
#[derive(Error, Debug)]
pub enum AllocError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("controller transport failure: {0}")]
    TransportFailure(String),

    #[error("malformed telemetry sample: {0}")]
    MalformedSample(String),

    #[error("market-clearing search did not converge: {0}")]
    NoConvergence(String),

    #[error("allocation violates resource clamps: {0}")]
    AllocationViolatesClamps(String),

    #[error("unknown app_id: {0}")]
    UnknownApp(u32),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AllocError>;
