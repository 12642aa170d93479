//! Runtime-registrable, ordered middleware chain.
//!
//! Middleware is registered at runtime via `Use()` calls in registration
//! order and composed into a single terminal delegate, rather than built
//! from a compile-time `tower::Layer` stack. This module builds that chain
//! out of dynamic, boxed trait objects composed once at
//! [`crate::builders::InvocationBuilder::build`] time.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::{context::LifecycleContext, Error};

/// The remainder of the pipeline, to be invoked by a middleware exactly
/// once (zero or more than once is allowed by the type system but is a
/// logic error the middleware author is responsible for avoiding).
pub struct Next {
    inner: Box<dyn FnOnce(LifecycleContext) -> BoxFuture<'static, Result<(), Error>> + Send>,
}

impl Next {
    /// Invokes the rest of the pipeline.
    pub async fn run(self, ctx: LifecycleContext) -> Result<(), Error> {
        (self.inner)(ctx).await
    }
}

/// A single composable wrapper around the terminal handler.
pub trait Middleware: Send + Sync {
    /// Runs this middleware's logic, calling `next.run(ctx)` to continue
    /// the pipeline (omitting the call short-circuits it).
    fn call(&self, ctx: LifecycleContext, next: Next) -> BoxFuture<'static, Result<(), Error>>;
}

impl<F> Middleware for F
where
    F: Fn(LifecycleContext, Next) -> BoxFuture<'static, Result<(), Error>> + Send + Sync,
{
    fn call(&self, ctx: LifecycleContext, next: Next) -> BoxFuture<'static, Result<(), Error>> {
        self(ctx, next)
    }
}

/// A terminal delegate, the innermost link in the composed chain.
pub type Terminal = Arc<dyn Fn(LifecycleContext) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Composes registered middleware (outer-to-inner, in registration order)
/// around a terminal delegate into one `(ctx) -> awaitable<Result<(),
/// Error>>` delegate.
pub fn compose(middlewares: Vec<Arc<dyn Middleware>>, terminal: Terminal) -> Terminal {
    let mut composed: Terminal = terminal;
    for mw in middlewares.into_iter().rev() {
        let inner = composed.clone();
        composed = Arc::new(move |ctx: LifecycleContext| {
            let mw = mw.clone();
            let inner = inner.clone();
            let next = Next {
                inner: Box::new(move |ctx| inner(ctx)),
            };
            mw.call(ctx, next)
        });
    }
    composed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cancellation::CancellationFactory, features::FeatureCollectionFactory, services::ServiceProvider,
    };
    use std::{
        sync::{atomic::{AtomicUsize, Ordering}, RwLock},
        time::Duration,
    };
    use tokio_util::sync::CancellationToken;

    fn test_context() -> LifecycleContext {
        let record = crate::context::InvocationRecord {
            request_id: "id".into(),
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
    async fn runs_middleware_outer_to_inner_then_terminal() {
        let order = Arc::new(std::sync::Mutex::new(Vec::<&'static str>::new()));

        let make_mw = |name: &'static str, order: Arc<std::sync::Mutex<Vec<&'static str>>>| -> Arc<dyn Middleware> {
            Arc::new(move |ctx: LifecycleContext, next: Next| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push(name);
                    next.run(ctx).await
                }) as BoxFuture<'static, Result<(), Error>>
            })
        };

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let terminal: Terminal = Arc::new(move |_ctx| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        });

        let composed = compose(vec![make_mw("outer", order.clone()), make_mw("inner", order.clone())], terminal);
        composed(test_context()).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["outer", "inner"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn middleware_can_short_circuit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let terminal: Terminal = Arc::new(move |_ctx| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        });

        let short_circuit: Arc<dyn Middleware> =
            Arc::new(|_ctx: LifecycleContext, _next: Next| Box::pin(async { Err("stopped".into()) }) as BoxFuture<'static, Result<(), Error>>);

        let composed = compose(vec![short_circuit], terminal);
        let result = composed(test_context()).await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
