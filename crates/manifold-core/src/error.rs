//! Error types for dispatch operations

/// Result type for dispatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a compute backend
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backend cannot provide this operation
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A native runtime call failed
    #[error("{backend} error {code}: {message}")]
    Native {
        backend: &'static str,
        code: i64,
        message: String,
    },

    /// Program compilation failed; the payload carries the compiler log
    #[error("kernel build failed: {log}")]
    Build { log: String },

    /// File I/O for the binary cache or a library load
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Shared-library load or symbol resolution failed
    #[error("shared library error: {0}")]
    SharedLibrary(#[from] libloading::Error),
}

impl Error {
    /// Create an unsupported-operation error
    pub fn unsupported(what: &'static str) -> Self {
        Self::Unsupported(what)
    }

    /// Create a backend-native error with the runtime's code and message
    pub fn native(backend: &'static str, code: i64, message: impl Into<String>) -> Self {
        Self::Native {
            backend,
            code,
            message: message.into(),
        }
    }

    /// Create a build error carrying the compiler log
    pub fn build(log: impl Into<String>) -> Self {
        Self::Build { log: log.into() }
    }
}
