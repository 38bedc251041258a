//! Crate-wide error type for the scheduler.
//!
//! Each variant corresponds to one of the error categories in spec.md §7:
//! configuration, state, runtime, and cooperative (abort-one-fire) errors.

/// A convenience `Result` alias using [`SchedulerError`].
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Top-level error type for the scheduler engine.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Invalid cron expression, unknown trigger variant, malformed
    /// descriptor, or a missing required field.
    #[error("configuration error: {0}")]
    Config(String),

    /// Duplicate identity, job/trigger not found, or mutation attempted
    /// after shutdown.
    #[error("state error: {0}")]
    State(String),

    /// A user job raised an unchecked failure, or a listener raised one
    /// (the latter is caught, logged, and never propagates out of the
    /// call site that notifies listeners).
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Cooperative abort of a single fire: interrupt requested or a
    /// required context parameter was missing. These are not failures —
    /// they are distinct [`crate::runner::CompletionCode`] values, but
    /// surfaced here too since some call sites (e.g. the CLI) want a
    /// uniform `Result` to report on.
    #[error("cooperative abort: {0}")]
    Cooperative(String),

    /// A YAML descriptor failed to parse or deserialize.
    #[error("descriptor error: {0}")]
    Descriptor(#[from] serde_yaml::Error),

    /// A standard I/O error (reading a descriptor file, watching it, ...).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
