use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration detected at setup. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A quantized node kind was requested but its backend is not registered.
    /// Fatal at the point the variant is requested, not earlier.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("unknown module path: {0}")]
    UnknownModule(String),

    #[error("unknown adapter: {0}")]
    UnknownAdapter(String),
}

pub type Result<T> = std::result::Result<T, Error>;
