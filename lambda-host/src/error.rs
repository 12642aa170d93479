//! Error taxonomy for the runtime host itself.
//!
//! This is distinct from [`crate::Error`], the boxed type handlers are
//! allowed to return: `HostError` covers failures in the host's own
//! machinery (config, lifecycle, transport), while `Error`/[`crate::Diagnostic`]
//! describe what a handler or middleware threw.

use thiserror::Error;

/// Failures raised by the runtime host's own machinery, as opposed to
/// failures raised by handler or middleware code.
#[derive(Debug, Error)]
pub enum HostError {
    /// Host options failed validation (e.g. a negative timeout).
    #[error("invalid host configuration: {0}")]
    Config(String),

    /// An init delegate returned `false` or threw.
    #[error("initialization failed: {0}")]
    Init(#[source] crate::Error),

    /// A handler or middleware threw, or the event failed to deserialize.
    #[error("invocation failed: {0}")]
    Invocation(#[source] crate::Error),

    /// The invocation's cancellation handle fired before completion, or the
    /// context's remaining time budget could not support a cancellation
    /// handle at all.
    #[error("cancellation error: {0}")]
    Cancellation(#[from] CancellationError),

    /// A network-level failure talking to the Runtime API.
    #[error("transport error: {0}")]
    Transport(#[from] crate::Error),
}

/// Failures specific to constructing or observing a deadline-bound
/// cancellation handle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CancellationError {
    /// The invocation record reports a remaining time that is not strictly
    /// positive, so no cancellation handle can be derived from it.
    #[error("invocation context has no remaining time budget")]
    InvalidContext,

    /// The invocation's remaining time is not enough to leave room for the
    /// configured cancellation buffer.
    #[error("remaining time budget is smaller than the cancellation buffer")]
    InsufficientBudget,
}

/// Aggregated failures from concurrently-run shutdown delegates.
#[derive(Debug, Error)]
#[error("{} shutdown delegate(s) failed: {}", .0.len(), join_messages(.0))]
pub struct ShutdownAggregateError(pub Vec<crate::Error>);

fn join_messages(errors: &[crate::Error]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}
