//! Concurrent shutdown delegates with aggregated failure reporting.

use futures::future::BoxFuture;

use crate::{context::LifecycleContext, error::ShutdownAggregateError, Error};

/// A single shutdown-phase delegate.
pub type ShutdownDelegate =
    std::sync::Arc<dyn Fn(LifecycleContext) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Registers shutdown delegates. Unlike init delegates, registration order
/// carries no meaning: every delegate runs concurrently.
#[derive(Default)]
pub struct ShutdownBuilder {
    delegates: Vec<ShutdownDelegate>,
}

impl ShutdownBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a delegate to run at shutdown.
    pub fn add(mut self, delegate: ShutdownDelegate) -> Self {
        self.delegates.push(delegate);
        self
    }

    /// Finalizes the shutdown sequence.
    pub fn build(self) -> CompiledShutdown {
        CompiledShutdown {
            delegates: self.delegates,
        }
    }
}

/// A finalized, ready-to-run shutdown sequence.
pub struct CompiledShutdown {
    delegates: Vec<ShutdownDelegate>,
}

impl CompiledShutdown {
    /// Runs every registered delegate concurrently, collecting every failure
    /// rather than stopping at the first.
    pub async fn run(&self, ctx: LifecycleContext) -> Result<(), ShutdownAggregateError> {
        let results = futures::future::join_all(self.delegates.iter().map(|d| d(ctx.clone()))).await;
        let errors: Vec<Error> = results.into_iter().filter_map(Result::err).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ShutdownAggregateError(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cancellation::CancellationFactory, context::InvocationRecord, features::FeatureCollectionFactory,
        services::ServiceProvider,
    };
    use std::{
        sync::{Arc, RwLock},
        time::Duration,
    };
    use tokio_util::sync::CancellationToken;

    fn test_context() -> LifecycleContext {
        let record = InvocationRecord {
            request_id: "shutdown".into(),
            deadline: tokio::time::Instant::now() + Duration::from_secs(5),
            invoked_function_arn: "arn".into(),
            trace_id: None,
            client_context: None,
            identity: None,
            event_bytes: bytes::Bytes::new(),
        };
        let cancellation = CancellationFactory::new(CancellationToken::new())
            .new_for_remaining_time(Duration::from_secs(5), Duration::from_secs(1))
            .unwrap();
        let features = FeatureCollectionFactory::default().create(vec![]);
        let scope = ServiceProvider::default().new_scope();
        LifecycleContext::new(record, Arc::new(RwLock::new(Default::default())), features, cancellation, scope)
    }

    #[tokio::test]
    async fn every_delegate_runs_even_if_others_fail() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let make = |fail: bool, calls: Arc<std::sync::atomic::AtomicUsize>| -> ShutdownDelegate {
            Arc::new(move |_ctx| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Box::pin(async move {
                    if fail {
                        Err::<(), Error>("drain failed".into())
                    } else {
                        Ok(())
                    }
                })
            })
        };

        let shutdown = ShutdownBuilder::new()
            .add(make(true, calls.clone()))
            .add(make(false, calls.clone()))
            .add(make(true, calls.clone()))
            .build();

        let err = shutdown.run(test_context()).await.unwrap_err();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(err.0.len(), 2);
    }

    #[tokio::test]
    async fn empty_sequence_succeeds() {
        let shutdown = ShutdownBuilder::new().build();
        assert!(shutdown.run(test_context()).await.is_ok());
    }
}
