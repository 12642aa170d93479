//! Sequential init delegates with partial-failure semantics: every
//! registered delegate runs regardless of an earlier one's failure, and the
//! first error encountered is what gets reported to the Runtime API.

use futures::future::BoxFuture;

use crate::{context::LifecycleContext, Error};

/// A single init-phase delegate.
pub type InitDelegate = std::sync::Arc<dyn Fn(LifecycleContext) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Registers init delegates in the order they should run.
#[derive(Default)]
pub struct InitBuilder {
    delegates: Vec<InitDelegate>,
}

impl InitBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a delegate to the end of the init sequence.
    pub fn add(mut self, delegate: InitDelegate) -> Self {
        self.delegates.push(delegate);
        self
    }

    /// Finalizes the init sequence.
    pub fn build(self) -> CompiledInit {
        CompiledInit {
            delegates: self.delegates,
        }
    }
}

/// A finalized, ready-to-run init sequence.
pub struct CompiledInit {
    delegates: Vec<InitDelegate>,
}

impl CompiledInit {
    /// Runs every registered delegate in order, never stopping early.
    /// Returns the first error encountered, if any, after every delegate has
    /// had a chance to run.
    pub async fn run(&self, ctx: LifecycleContext) -> Result<(), Error> {
        let mut first_err = None;
        for delegate in &self.delegates {
            if let Err(err) = delegate(ctx.clone()).await {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
