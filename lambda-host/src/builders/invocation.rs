//! Middleware registration and exactly-once terminal-handler assembly.

use std::sync::Arc;

use crate::{
    context::LifecycleContext,
    middleware::{compose, Middleware, Terminal},
    Error,
};

/// Failures raised while assembling an invocation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum InvocationBuildError {
    /// `.handle()` was called more than once on the same builder.
    #[error("a handler has already been registered; `.handle()` may only be called once")]
    AlreadyHandled,
    /// `.build()` was called without a prior `.handle()` call.
    #[error("no handler was registered; call `.handle()` before `.build()`")]
    NotHandled,
}

/// Registers ordered middleware and exactly one terminal handler.
#[derive(Default)]
pub struct InvocationBuilder {
    middlewares: Vec<Arc<dyn Middleware>>,
    terminal: Option<Terminal>,
}

impl InvocationBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a middleware at the end of the current chain (outermost
    /// first, matching registration order).
    pub fn r#use(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Registers the terminal handler. May only be called once.
    pub fn handle(mut self, terminal: Terminal) -> Result<Self, InvocationBuildError> {
        if self.terminal.is_some() {
            return Err(InvocationBuildError::AlreadyHandled);
        }
        self.terminal = Some(terminal);
        Ok(self)
    }

    /// Finalizes the pipeline. Fails if no handler was registered.
    pub fn build(self) -> Result<CompiledInvocation, InvocationBuildError> {
        let terminal = self.terminal.ok_or(InvocationBuildError::NotHandled)?;
        Ok(CompiledInvocation {
            delegate: compose(self.middlewares, terminal),
        })
    }
}

/// A finalized, ready-to-run invocation pipeline.
#[derive(Clone)]
pub struct CompiledInvocation {
    delegate: Terminal,
}

impl CompiledInvocation {
    /// Dispatches one invocation through the composed pipeline.
    pub async fn dispatch(&self, ctx: LifecycleContext) -> Result<(), Error> {
        (self.delegate)(ctx).await
    }
}
