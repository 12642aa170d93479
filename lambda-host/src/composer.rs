//! The Handler Composer: builds a uniform `(LifecycleContext) -> awaitable`
//! terminal delegate from an arbitrary user closure, without reflection.
//!
//! Parameter sources are registered explicitly through [`HandlerBuilder`]
//! combinators (`.event::<T>()`, `.keyed_service(key)`, `.cancellation()`,
//! `.context()`) rather than inferred from a callable's declared signature,
//! per the design notes this implementation follows. An unkeyed dependency-
//! container service is not tracked on the builder at all: it resolves to
//! `Option<S>` at dispatch time through [`compose_with_event_and_service`],
//! so there is nothing to register up front. A keyed service is mandatory —
//! [`compose_with_event_and_keyed_service`] errors at dispatch if nothing is
//! registered under the builder's key.

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::{context::LifecycleContext, deserializer, diagnostic::Diagnostic, middleware::Terminal, services::ServiceKey, Error};

/// Failures raised while *building* a handler (not while running it):
/// duplicate event/cancellation/context/keyed-service registrations, or
/// calling a `compose_*` entry point without the registration it requires.
#[derive(Debug, thiserror::Error)]
pub enum ComposerBuildError {
    /// `.event::<T>()` was called more than once.
    #[error("at most one event parameter may be registered")]
    DuplicateEvent,
    /// `.cancellation()` was called more than once.
    #[error("at most one cancellation-handle parameter may be registered")]
    DuplicateCancellation,
    /// `.context()` was called more than once.
    #[error("at most one context parameter may be registered")]
    DuplicateContext,
    /// `.keyed_service(key)` was called more than once.
    #[error("at most one keyed service parameter may be registered")]
    DuplicateKeyedService,
    /// A `compose_with_event_*` entry point was called on a builder that
    /// never registered `.event::<T>()`.
    #[error("the event parameter was never registered on this builder")]
    MissingEvent,
    /// `compose_with_event_and_cancellation` was called on a builder that
    /// never registered `.cancellation()`.
    #[error("the cancellation-handle parameter was never registered on this builder")]
    MissingCancellation,
    /// `compose_with_event_and_context` was called on a builder that never
    /// registered `.context()`.
    #[error("the context parameter was never registered on this builder")]
    MissingContext,
    /// `compose_with_event_and_keyed_service` was called on a builder that
    /// never registered `.keyed_service(key)`.
    #[error("the keyed service parameter was never registered on this builder")]
    MissingKeyedService,
}

/// Fluent builder for registering a handler's parameter sources without
/// reflecting over its declared signature.
#[derive(Default)]
pub struct HandlerBuilder {
    has_event: bool,
    has_cancellation: bool,
    has_context: bool,
    keyed_service_hash: Option<u64>,
}

impl HandlerBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the event as a parameter source, decoded lazily from the
    /// invocation's raw bytes the first time the composed handler runs.
    pub fn event<T: DeserializeOwned + Send + Sync + 'static>(mut self) -> Result<Self, ComposerBuildError> {
        if self.has_event {
            return Err(ComposerBuildError::DuplicateEvent);
        }
        self.has_event = true;
        Ok(self)
    }

    /// Marks the cancellation handle as a parameter source.
    pub fn cancellation(mut self) -> Result<Self, ComposerBuildError> {
        if self.has_cancellation {
            return Err(ComposerBuildError::DuplicateCancellation);
        }
        self.has_cancellation = true;
        Ok(self)
    }

    /// Marks the lifecycle context as a parameter source.
    pub fn context(mut self) -> Result<Self, ComposerBuildError> {
        if self.has_context {
            return Err(ComposerBuildError::DuplicateContext);
        }
        self.has_context = true;
        Ok(self)
    }

    /// Marks a keyed dependency-container service as a mandatory parameter
    /// source, resolved by `(TypeId::of::<S>(), key)` against the
    /// [`crate::services::ServiceProvider`] the invocation scope was opened
    /// from. Unlike a plain `.service::<S>()` resolution, the key
    /// disambiguates between multiple registrations of the same `S`.
    pub fn keyed_service(mut self, key: impl ServiceKey) -> Result<Self, ComposerBuildError> {
        if self.keyed_service_hash.is_some() {
            return Err(ComposerBuildError::DuplicateKeyedService);
        }
        self.keyed_service_hash = Some(key.key_hash());
        Ok(self)
    }
}

/// Marker trait implemented for every return type a composed handler may
/// produce: `()`, a serializable value, a `Result` of either. Installs a
/// Response Feature on success.
pub trait IntoHandlerOutcome: Send {
    /// Consumes the outcome, installing a response feature into `ctx` on
    /// success and returning an error on failure.
    fn install(self, ctx: &LifecycleContext) -> Result<(), Error>;
}

impl IntoHandlerOutcome for () {
    fn install(self, _ctx: &LifecycleContext) -> Result<(), Error> {
        Ok(())
    }
}

impl<T, E> IntoHandlerOutcome for Result<T, E>
where
    T: serde::Serialize + Send + Sync + 'static,
    E: Into<Error> + Send,
{
    fn install(self, ctx: &LifecycleContext) -> Result<(), Error> {
        match self {
            Ok(value) => {
                let json = serde_json::to_value(value)?;
                ctx.with_features(|f| f.set(ResponseFeature(json)));
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Installed into the feature collection by a successful handler;
/// consumed by the loop when posting `/response`.
pub struct ResponseFeature(pub serde_json::Value);

/// Installed into the feature collection by a handler that produces a
/// chunked streaming response instead of a single buffered value; consumed
/// by the loop when posting `/response` in streaming mode instead of
/// [`ResponseFeature`].
pub struct StreamingResponseFeature(pub crate::types::StreamResponse<lambda_host_api_client::body::Body>);

impl<E> IntoHandlerOutcome for Result<crate::types::StreamResponse<lambda_host_api_client::body::Body>, E>
where
    E: Into<Error> + Send,
{
    fn install(self, ctx: &LifecycleContext) -> Result<(), Error> {
        match self {
            Ok(response) => {
                ctx.with_features(|f| f.set(StreamingResponseFeature(response)));
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Builds the terminal delegate from a builder and a zero-argument async
/// closure returning an `IntoHandlerOutcome`. Additional arities (event,
/// service, cancellation, context parameters) are supported by the
/// `compose_with_event`/`compose_with_event_and_cancellation` family below;
/// only the shapes this crate's builders actually register are provided,
/// since the composer never needs to support an arity nobody registers.
pub fn compose_nullary<F, Fut, R>(_builder: HandlerBuilder, f: F) -> Terminal
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = R> + Send + 'static,
    R: IntoHandlerOutcome + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |ctx: LifecycleContext| {
        let f = f.clone();
        Box::pin(async move {
            let outcome = f().await;
            outcome.install(&ctx)
        })
    })
}

/// Builds the terminal delegate for a handler taking only the decoded
/// event.
pub fn compose_with_event<T, F, Fut, R>(builder: HandlerBuilder, f: F) -> Result<Terminal, ComposerBuildError>
where
    T: DeserializeOwned + Send + Sync + Clone + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = R> + Send + 'static,
    R: IntoHandlerOutcome + 'static,
{
    if !builder.has_event {
        // Building without `.event::<T>()` but calling this entry point is
        // a programmer error in this crate, not a user-facing one; the
        // public handler-registration surface always calls the matching
        // `compose_*` function for what it registered.
        return Err(ComposerBuildError::MissingEvent);
    }
    let f = Arc::new(f);
    Ok(Arc::new(move |ctx: LifecycleContext| {
        let f = f.clone();
        Box::pin(async move {
            let event_bytes = ctx.record().event_bytes.clone();
            let event: T = deserializer::deserialize(&event_bytes).map_err(|e| -> Error { Box::new(e) })?;
            let outcome = f(event).await;
            outcome.install(&ctx)
        })
    }))
}

/// Builds the terminal delegate for a handler taking the decoded event and
/// a dependency-container service.
pub fn compose_with_event_and_service<T, S, F, Fut, R>(
    builder: HandlerBuilder,
    f: F,
) -> Result<Terminal, ComposerBuildError>
where
    T: DeserializeOwned + Send + Sync + Clone + 'static,
    S: Clone + Send + Sync + 'static,
    F: Fn(T, Option<S>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = R> + Send + 'static,
    R: IntoHandlerOutcome + 'static,
{
    if !builder.has_event {
        return Err(ComposerBuildError::MissingEvent);
    }
    let f = Arc::new(f);
    Ok(Arc::new(move |ctx: LifecycleContext| {
        let f = f.clone();
        Box::pin(async move {
            let event_bytes = ctx.record().event_bytes.clone();
            let event: T = deserializer::deserialize(&event_bytes).map_err(|e| -> Error { Box::new(e) })?;
            let service = ctx.services().resolve::<S>();
            let outcome = f(event, service).await;
            outcome.install(&ctx)
        })
    }))
}

/// Builds the terminal delegate for a handler taking the decoded event and a
/// mandatory keyed dependency-container service. Unlike
/// [`compose_with_event_and_service`], resolution failure is not optional:
/// a missing registration for `builder`'s key surfaces as a handler error
/// rather than `None`.
pub fn compose_with_event_and_keyed_service<T, S, F, Fut, R>(
    builder: HandlerBuilder,
    f: F,
) -> Result<Terminal, ComposerBuildError>
where
    T: DeserializeOwned + Send + Sync + Clone + 'static,
    S: Clone + Send + Sync + 'static,
    F: Fn(T, S) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = R> + Send + 'static,
    R: IntoHandlerOutcome + 'static,
{
    if !builder.has_event {
        return Err(ComposerBuildError::MissingEvent);
    }
    let Some(key_hash) = builder.keyed_service_hash else {
        return Err(ComposerBuildError::MissingKeyedService);
    };
    let f = Arc::new(f);
    Ok(Arc::new(move |ctx: LifecycleContext| {
        let f = f.clone();
        Box::pin(async move {
            let event_bytes = ctx.record().event_bytes.clone();
            let event: T = deserializer::deserialize(&event_bytes).map_err(|e| -> Error { Box::new(e) })?;
            let service: S = ctx
                .services()
                .resolve_keyed_by_hash(key_hash)
                .ok_or("keyed service was not registered with the service provider")?;
            let outcome = f(event, service).await;
            outcome.install(&ctx)
        })
    }))
}

/// Builds the terminal delegate for a handler taking the decoded event and
/// the invocation's cancellation handle.
pub fn compose_with_event_and_cancellation<T, F, Fut, R>(
    builder: HandlerBuilder,
    f: F,
) -> Result<Terminal, ComposerBuildError>
where
    T: DeserializeOwned + Send + Sync + Clone + 'static,
    F: Fn(T, CancellationHandleRef) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = R> + Send + 'static,
    R: IntoHandlerOutcome + 'static,
{
    if !builder.has_event {
        return Err(ComposerBuildError::MissingEvent);
    }
    if !builder.has_cancellation {
        return Err(ComposerBuildError::MissingCancellation);
    }
    let f = Arc::new(f);
    Ok(Arc::new(move |ctx: LifecycleContext| {
        let f = f.clone();
        Box::pin(async move {
            let event_bytes = ctx.record().event_bytes.clone();
            let event: T = deserializer::deserialize(&event_bytes).map_err(|e| -> Error { Box::new(e) })?;
            let handle = CancellationHandleRef(ctx.clone());
            let outcome = f(event, handle).await;
            outcome.install(&ctx)
        })
    }))
}

/// Builds the terminal delegate for a handler taking the decoded event and
/// the lifecycle context itself.
pub fn compose_with_event_and_context<T, F, Fut, R>(
    builder: HandlerBuilder,
    f: F,
) -> Result<Terminal, ComposerBuildError>
where
    T: DeserializeOwned + Send + Sync + Clone + 'static,
    F: Fn(T, LifecycleContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = R> + Send + 'static,
    R: IntoHandlerOutcome + 'static,
{
    if !builder.has_event {
        return Err(ComposerBuildError::MissingEvent);
    }
    if !builder.has_context {
        return Err(ComposerBuildError::MissingContext);
    }
    let f = Arc::new(f);
    Ok(Arc::new(move |ctx: LifecycleContext| {
        let f = f.clone();
        Box::pin(async move {
            let event_bytes = ctx.record().event_bytes.clone();
            let event: T = deserializer::deserialize(&event_bytes).map_err(|e| -> Error { Box::new(e) })?;
            let outcome = f(event, ctx.clone()).await;
            outcome.install(&ctx)
        })
    }))
}

/// A cheap handle-to-the-context wrapper exposing only the cancellation
/// accessor, handed to handlers that registered `.cancellation()`.
#[derive(Clone)]
pub struct CancellationHandleRef(LifecycleContext);

impl CancellationHandleRef {
    /// Resolves once the invocation's cancellation handle fires.
    pub async fn cancelled(&self) {
        self.0.cancellation().cancelled().await
    }

    /// Returns `true` if the handle has already fired.
    pub fn is_cancelled(&self) -> bool {
        self.0.cancellation().is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cancellation::CancellationFactory, context::InvocationRecord, features::FeatureCollectionFactory,
        services::ServiceProvider,
    };
    use serde::Deserialize;
    use std::{sync::RwLock, time::Duration};
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Clone, Deserialize, serde::Serialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    fn test_context(event: &str) -> LifecycleContext {
        test_context_with_provider(event, ServiceProvider::default())
    }

    fn test_context_with_provider(event: &str, provider: ServiceProvider) -> LifecycleContext {
        let record = InvocationRecord {
            request_id: "id".into(),
            deadline: tokio::time::Instant::now() + Duration::from_secs(5),
            invoked_function_arn: "arn".into(),
            trace_id: None,
            client_context: None,
            identity: None,
            event_bytes: bytes::Bytes::from(event.to_string()),
        };
        let cancellation = CancellationFactory::new(CancellationToken::new())
            .new_for_remaining_time(Duration::from_secs(5), Duration::from_secs(1))
            .unwrap();
        let features = FeatureCollectionFactory::default().create(vec![]);
        let scope = provider.new_scope();
        LifecycleContext::new(record, Arc::new(RwLock::new(Default::default())), features, cancellation, scope)
    }

    #[tokio::test]
    async fn composed_handler_decodes_event_and_installs_response() {
        let builder = HandlerBuilder::new().event::<Ping>().unwrap();
        let terminal = compose_with_event::<Ping, _, _, _>(builder, |p: Ping| async move { Ok::<_, Error>(p.n * 2) }).unwrap();

        let ctx = test_context(r#"{"n": 21}"#);
        terminal(ctx.clone()).await.unwrap();

        let value = ctx.with_features(|f| f.get::<ResponseFeature>().map(|r| r.0.clone()));
        assert_eq!(value, Some(serde_json::json!(42)));
    }

    #[tokio::test]
    async fn composed_handler_surfaces_deserialize_errors() {
        let builder = HandlerBuilder::new().event::<Ping>().unwrap();
        let terminal = compose_with_event::<Ping, _, _, _>(builder, |p: Ping| async move { Ok::<_, Error>(p.n) }).unwrap();

        let ctx = test_context("not json");
        assert!(terminal(ctx).await.is_err());
    }

    #[tokio::test]
    async fn composed_handler_surfaces_handler_errors() {
        let builder = HandlerBuilder::new().event::<Ping>().unwrap();
        let terminal = compose_with_event::<Ping, _, _, _>(builder, |_p: Ping| async move {
            Err::<u32, Error>("boom".into())
        })
        .unwrap();

        let ctx = test_context(r#"{"n": 1}"#);
        let err = terminal(ctx).await.unwrap_err();
        let diagnostic: Diagnostic = err.into();
        assert_eq!(diagnostic.error_message, "boom");
    }

    #[tokio::test]
    async fn duplicate_event_registration_is_rejected() {
        let builder = HandlerBuilder::new().event::<Ping>().unwrap();
        assert!(matches!(builder.event::<Ping>(), Err(ComposerBuildError::DuplicateEvent)));
    }

    #[test]
    fn compose_with_event_and_cancellation_rejects_missing_cancellation() {
        let builder = HandlerBuilder::new().event::<Ping>().unwrap();
        let result = compose_with_event_and_cancellation::<Ping, _, _, _>(builder, |_p, _handle| async move {});
        assert!(matches!(result, Err(ComposerBuildError::MissingCancellation)));
    }

    #[test]
    fn compose_with_event_and_context_rejects_missing_context() {
        let builder = HandlerBuilder::new().event::<Ping>().unwrap();
        let result =
            compose_with_event_and_context::<Ping, _, _, _>(builder, |_p, _ctx| async move {});
        assert!(matches!(result, Err(ComposerBuildError::MissingContext)));
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Greeter(String);

    #[tokio::test]
    async fn keyed_service_resolves_the_registration_matching_its_key() {
        let provider = ServiceProvider::builder()
            .keyed_scoped::<Greeter, _>("primary", |_| Greeter("primary".into()))
            .keyed_scoped::<Greeter, _>("secondary", |_| Greeter("secondary".into()))
            .build();

        let builder = HandlerBuilder::new().event::<Ping>().unwrap().keyed_service("secondary").unwrap();
        let terminal = compose_with_event_and_keyed_service::<Ping, Greeter, _, _, _>(builder, |p: Ping, greeter: Greeter| async move {
            Ok::<_, Error>(format!("{}:{}", greeter.0, p.n))
        })
        .unwrap();

        let ctx = test_context_with_provider(r#"{"n": 7}"#, provider);
        terminal(ctx.clone()).await.unwrap();

        let value = ctx.with_features(|f| f.get::<ResponseFeature>().map(|r| r.0.clone()));
        assert_eq!(value, Some(serde_json::json!("secondary:7")));
    }

    #[tokio::test]
    async fn keyed_service_without_a_matching_registration_errors_at_dispatch() {
        let builder = HandlerBuilder::new().event::<Ping>().unwrap().keyed_service("missing").unwrap();
        let terminal = compose_with_event_and_keyed_service::<Ping, Greeter, _, _, _>(builder, |_p: Ping, greeter: Greeter| async move {
            Ok::<_, Error>(greeter.0)
        })
        .unwrap();

        let ctx = test_context(r#"{"n": 1}"#);
        assert!(terminal(ctx).await.is_err());
    }

    #[test]
    fn compose_with_event_and_keyed_service_rejects_missing_registration() {
        let builder = HandlerBuilder::new().event::<Ping>().unwrap();
        let result = compose_with_event_and_keyed_service::<Ping, Greeter, _, _, _>(builder, |_p, _greeter| async move {
            Ok::<_, Error>(())
        });
        assert!(matches!(result, Err(ComposerBuildError::MissingKeyedService)));
    }

    #[test]
    fn duplicate_keyed_service_registration_is_rejected() {
        let builder = HandlerBuilder::new().keyed_service("primary").unwrap();
        assert!(matches!(
            builder.keyed_service("primary"),
            Err(ComposerBuildError::DuplicateKeyedService)
        ));
    }
}
