//! Error types for sandbox runtime operations.

/// Alias for `Result<T, matchlock::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by sandbox runtime operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Bad user input (unknown image, bad volume spec, invalid host).
    /// Surfaced verbatim; never retried.
    #[error("configuration: {0}")]
    Config(String),

    /// A named resource (VM, volume, image) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// VM state store failure (lock, parse, transition).
    #[error("lifecycle: {0}")]
    Lifecycle(String),

    /// The VMM process failed to start or died unexpectedly.
    #[error("vmm: {0}")]
    Vmm(String),

    /// A bounded wait expired.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The operation was cancelled (signal or caller deadline).
    #[error("cancelled")]
    Cancelled,

    /// Sandbox start failed; completed steps were rolled back.
    ///
    /// `rollback_errors` carries anything that went wrong while undoing the
    /// completed steps — reported alongside the root cause, never discarded.
    #[error("sandbox start failed at step '{step}': {cause}")]
    Startup {
        /// The step that failed.
        step: &'static str,
        /// Root cause.
        #[source]
        cause: Box<Error>,
        /// Errors hit while rolling back completed steps.
        rollback_errors: Vec<String>,
    },

    /// Teardown finished but some steps reported errors.
    #[error("teardown completed with errors: {}", .0.join("; "))]
    Teardown(Vec<String>),

    /// Image store error.
    #[error(transparent)]
    Store(#[from] matchlock_store::Error),

    /// Network mediation error.
    #[error(transparent)]
    Net(#[from] matchlock_net::Error),

    /// Virtual filesystem error.
    #[error(transparent)]
    Vfs(#[from] matchlock_vfs::VfsError),

    /// Filesystem or socket I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON state (de)serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wraps a failure as a startup error for the named step.
    pub fn startup(step: &'static str, cause: Self, rollback_errors: Vec<String>) -> Self {
        Self::Startup {
            step,
            cause: Box::new(cause),
            rollback_errors,
        }
    }
}
