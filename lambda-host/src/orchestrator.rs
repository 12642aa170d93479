//! The Lifecycle Orchestrator: drives the Custom Runtime API long-poll loop
//! through Created → InitRunning → LoopRunning/InitFailed → Dispatching →
//! LoopRunning → ShutdownRunning → Stopped.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use futures::FutureExt;
use http_body_util::BodyExt;
use hyper::{body::Incoming, http::Response};
use lambda_host_api_client::{body::Body, Client};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use crate::{
    builders::{CompiledInit, CompiledInvocation, CompiledShutdown},
    cancellation::CancellationFactory,
    config::{Config, HostOptions},
    context::{ClientContext, CognitoIdentity, InvocationRecord, LifecycleContext},
    diagnostic::Diagnostic,
    error::HostError,
    features::FeatureCollectionFactory,
    requests::{EventCompletionRequest, EventErrorRequest, InitErrorRequest, IntoRequest, NextEventRequest},
    services::ServiceProvider,
    Error,
};

/// Observability-only marker of where the orchestrator currently is;
/// transitions are logged, not branched on, since the control flow below
/// is linear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Created,
    InitRunning,
    LoopRunning,
    InitFailed,
    Dispatching,
    ShutdownRunning,
    Stopped,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            LifecycleState::Created => "created",
            LifecycleState::InitRunning => "init_running",
            LifecycleState::LoopRunning => "loop_running",
            LifecycleState::InitFailed => "init_failed",
            LifecycleState::Dispatching => "dispatching",
            LifecycleState::ShutdownRunning => "shutdown_running",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// A cloneable request to stop the dispatch loop and begin shutdown, handed
/// out by [`Orchestrator::stop_handle`]. Cloning shares the same underlying
/// signal, so any handle (or the feature-gated SIGTERM listener) can stop
/// the loop.
#[derive(Debug, Clone)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    /// Requests that the dispatch loop exit after its current poll and
    /// proceed to the shutdown phase. Idempotent.
    pub fn stop(&self) {
        self.0.cancel();
    }
}

/// Owns the Runtime API connection and drives one process's worth of the
/// lifecycle: a single init phase, the dispatch loop, and a single shutdown
/// phase.
pub struct Orchestrator {
    client: Client,
    options: HostOptions,
    services: ServiceProvider,
    feature_factory: FeatureCollectionFactory,
    init: CompiledInit,
    invocation: CompiledInvocation,
    shutdown: CompiledShutdown,
    process_stop: CancellationToken,
    properties: Arc<RwLock<HashMap<String, Box<dyn std::any::Any + Send + Sync>>>>,
}

impl Orchestrator {
    /// Assembles an orchestrator from its finalized phases.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        options: HostOptions,
        services: ServiceProvider,
        feature_factory: FeatureCollectionFactory,
        init: CompiledInit,
        invocation: CompiledInvocation,
        shutdown: CompiledShutdown,
    ) -> Self {
        Self {
            client,
            options,
            services,
            feature_factory,
            init,
            invocation,
            shutdown,
            process_stop: CancellationToken::new(),
            properties: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// A cloneable handle that can request a graceful stop from outside
    /// [`Orchestrator::run`] — the explicit administrative counterpart to the
    /// SIGTERM listener installed under the `graceful-shutdown` feature, and
    /// the only stop path on non-unix targets or in tests.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.process_stop.clone())
    }

    /// Drives the full lifecycle to completion: init, the dispatch loop
    /// (until the process stop signal fires), then shutdown.
    pub async fn run(self) -> Result<(), HostError> {
        self.options.validate()?;
        let mut state = LifecycleState::Created;

        state = self.transition(state, LifecycleState::InitRunning);
        if let Err(err) = self.run_init().await {
            self.transition(state, LifecycleState::InitFailed);
            let diagnostic = self.diagnostic("runtime.InitError", err.to_string());
            let req = InitErrorRequest::new(diagnostic).into_req().map_err(HostError::Transport)?;
            let _ = self.client.call(req).await;
            return Err(HostError::Init(err));
        }
        state = self.transition(state, LifecycleState::LoopRunning);

        #[cfg(feature = "graceful-shutdown")]
        let mut sigterm = install_sigterm_listener();
        #[cfg(feature = "graceful-shutdown")]
        let stop_on_signal = self.process_stop.clone();
        #[cfg(feature = "graceful-shutdown")]
        let signal_task = tokio::spawn(async move {
            wait_for_signal(&mut sigterm).await;
            stop_on_signal.cancel();
        });

        let incoming = self.incoming();
        tokio::pin!(incoming);
        loop {
            let next = tokio::select! {
                biased;
                _ = self.process_stop.cancelled() => break,
                next = incoming.next() => next,
            };

            let Some(response) = next else { break };
            state = self.transition(state, LifecycleState::Dispatching);
            self.dispatch_one(response?).await;
            state = self.transition(state, LifecycleState::LoopRunning);
        }
        #[cfg(feature = "graceful-shutdown")]
        signal_task.abort();

        state = self.transition(state, LifecycleState::ShutdownRunning);
        self.process_stop.cancel();
        let shutdown_result = self.run_shutdown().await;
        self.transition(state, LifecycleState::Stopped);
        shutdown_result.map_err(|e| HostError::Invocation(Box::new(e)))
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> LifecycleState {
        trace!(%from, %to, "lifecycle transition");
        to
    }

    async fn run_init(&self) -> Result<(), Error> {
        let cancellation = CancellationFactory::new(self.process_stop.clone()).new_for_duration(self.options.init_timeout);
        let ctx = self.new_context(InvocationRecord {
            request_id: "init".into(),
            deadline: tokio::time::Instant::now() + self.options.init_timeout,
            invoked_function_arn: String::new(),
            trace_id: None,
            client_context: None,
            identity: None,
            event_bytes: bytes::Bytes::new(),
        }, cancellation);
        tokio::time::timeout(self.options.init_timeout, self.init.run(ctx))
            .await
            .unwrap_or_else(|_| Err("init phase exceeded its timeout".into()))
    }

    async fn run_shutdown(&self) -> Result<(), crate::error::ShutdownAggregateError> {
        let budget = self.options.shutdown_budget();
        let cancellation = CancellationFactory::new(self.process_stop.clone()).new_for_duration(budget);
        let ctx = self.new_context(InvocationRecord {
            request_id: "shutdown".into(),
            deadline: tokio::time::Instant::now() + budget,
            invoked_function_arn: String::new(),
            trace_id: None,
            client_context: None,
            identity: None,
            event_bytes: bytes::Bytes::new(),
        }, cancellation);
        match tokio::time::timeout(budget, self.shutdown.run(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(crate::error::ShutdownAggregateError(vec![
                "shutdown phase exceeded its budget".into(),
            ])),
        }
    }

    async fn dispatch_one(&self, response: Response<Incoming>) {
        let (parts, body) = response.into_parts();

        #[cfg(debug_assertions)]
        if parts.status == http::StatusCode::NO_CONTENT {
            // The harness (or a real orchestrator in debug mode) may emit an
            // empty poll result to keep the connection warm; nothing to do.
            return;
        }

        let record = match build_invocation_record(&parts.headers, body).await {
            Ok(record) => record,
            Err(err) => {
                error!(?err, "failed to read next invocation");
                return;
            }
        };
        let request_id = record.request_id.clone();

        let cancellation = match CancellationFactory::new(self.process_stop.clone())
            .new_for_remaining_time(record.remaining_time(), self.options.invocation_cancellation_buffer)
        {
            Ok(handle) => handle,
            Err(err) => {
                let diagnostic = self.diagnostic("runtime.CancellationError", err.to_string());
                self.post_error(&request_id, diagnostic).await;
                return;
            }
        };

        let ctx = self.new_context(record, cancellation);
        let outcome = std::panic::AssertUnwindSafe(self.invocation.dispatch(ctx.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panic_message(panic).into()));
        match outcome {
            Ok(()) => self.post_response(&request_id, ctx).await,
            Err(err) => {
                let diagnostic: Diagnostic = err.into();
                let diagnostic = self.diagnostic(&diagnostic.error_type, diagnostic.error_message);
                self.post_error(&request_id, diagnostic).await;
            }
        }
    }

    /// Builds a [`Diagnostic`], stripping ANSI formatting from the message
    /// when [`HostOptions::clear_output_formatting`] is set.
    fn diagnostic(&self, error_type: impl Into<String>, error_message: impl Into<String>) -> Diagnostic {
        let error_message = error_message.into();
        let error_message = if self.options.clear_output_formatting {
            crate::config::strip_ansi(&error_message)
        } else {
            error_message
        };
        Diagnostic { error_type: error_type.into(), error_message }
    }

    async fn post_response(&self, request_id: &str, ctx: LifecycleContext) {
        let streaming = ctx.with_features(|f| f.remove::<crate::composer::StreamingResponseFeature>());
        let req = match streaming {
            Some(crate::composer::StreamingResponseFeature(response)) => {
                let req = EventCompletionRequest {
                    request_id,
                    body: response,
                    _unused_b: std::marker::PhantomData::<serde_json::Value>,
                    _unused_s: std::marker::PhantomData::<Body>,
                };
                req.into_req()
            }
            None => {
                let value = ctx.with_features(|f| f.get::<crate::composer::ResponseFeature>().map(|r| r.0.clone()));
                let body = value.unwrap_or(serde_json::Value::Null);
                let req = EventCompletionRequest {
                    request_id,
                    body,
                    _unused_b: std::marker::PhantomData::<serde_json::Value>,
                    _unused_s: std::marker::PhantomData::<Body>,
                };
                req.into_req()
            }
        };
        match req {
            Ok(req) => {
                if let Err(err) = self.client.call(req).await {
                    error!(?err, "failed to post invocation response");
                }
            }
            Err(err) => error!(?err, "failed to build invocation response request"),
        }
    }

    async fn post_error(&self, request_id: &str, diagnostic: Diagnostic) {
        let req = EventErrorRequest::new(request_id, diagnostic);
        if let Ok(req) = req.into_req() {
            let _ = self.client.call(req).await;
        }
    }

    fn new_context(&self, record: InvocationRecord, cancellation: crate::cancellation::CancellationHandle) -> LifecycleContext {
        let features = self.feature_factory.create(vec![]);
        let scope = self.services.new_scope();
        LifecycleContext::new(record, self.properties.clone(), features, cancellation, scope)
    }

    fn incoming(&self) -> impl Stream<Item = Result<Response<Incoming>, Error>> + Send + '_ {
        async_stream::stream! {
            loop {
                trace!("waiting for next event");
                let req = NextEventRequest.into_req().expect("failed to construct next-event request");
                yield self.client.call(req).await;
            }
        }
    }
}

/// Recovers a human-readable message from a caught panic payload, mirroring
/// the formatting `std`'s default panic hook applies to `&str`/`String`
/// payloads. Anything else becomes a generic placeholder.
fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked with a non-string payload".to_string()
    }
}

async fn build_invocation_record(headers: &http::HeaderMap, body: Incoming) -> Result<InvocationRecord, Error> {
    let request_id = headers
        .get("lambda-runtime-aws-request-id")
        .ok_or("missing lambda-runtime-aws-request-id header")?
        .to_str()?
        .to_owned();
    let deadline_ms: u64 = headers
        .get("lambda-runtime-deadline-ms")
        .ok_or("missing lambda-runtime-deadline-ms header")?
        .to_str()?
        .parse()?;
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let remaining = deadline_ms.saturating_sub(now_ms);
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(remaining);

    let invoked_function_arn = headers
        .get("lambda-runtime-invoked-function-arn")
        .map(|v| String::from_utf8_lossy(v.as_bytes()).to_string())
        .unwrap_or_default();
    let trace_id = headers
        .get("lambda-runtime-trace-id")
        .map(|v| String::from_utf8_lossy(v.as_bytes()).to_string());
    let client_context: Option<ClientContext> = match headers.get("lambda-runtime-client-context") {
        Some(v) => {
            let parsed: ClientContext = serde_json::from_str(v.to_str()?)?;
            Some(parsed)
        }
        None => None,
    };
    let identity: Option<CognitoIdentity> = match headers.get("lambda-runtime-cognito-identity") {
        Some(v) => {
            let parsed: CognitoIdentity = serde_json::from_str(v.to_str()?)?;
            Some(parsed)
        }
        None => None,
    };

    let event_bytes = body.collect().await?.to_bytes();

    Ok(InvocationRecord {
        request_id,
        deadline,
        invoked_function_arn,
        trace_id,
        client_context,
        identity,
        event_bytes,
    })
}

#[cfg(feature = "graceful-shutdown")]
fn install_sigterm_listener() -> tokio::signal::unix::Signal {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler")
}

#[cfg(feature = "graceful-shutdown")]
async fn wait_for_signal(sig: &mut tokio::signal::unix::Signal) {
    sig.recv().await;
}

/// Produces a process-wide [`Config`] used only for its function-metadata
/// fields; the orchestrator itself consumes [`HostOptions`] for its own
/// timeouts.
pub(crate) fn describe(config: &Config) -> String {
    format!("{}@{}", config.function_name, config.version)
}
