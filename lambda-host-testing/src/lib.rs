//! A loopback Runtime API test harness: an in-process HTTP server that
//! implements the same four endpoints the real Runtime API exposes, plus a
//! client facade for driving invocations from integration tests without a
//! real Lambda environment.
//!
//! Point [`lambda_host::HostOptions::runtime_api_endpoint`] at
//! [`Harness::endpoint`] and run the orchestrator in a background task
//! against it.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tokio::{
    net::TcpListener,
    sync::{oneshot, Mutex, Notify},
};

/// One event queued for a future `/runtime/invocation/next` poll.
#[derive(Debug, Clone)]
pub struct QueuedInvocation {
    /// `Lambda-Runtime-Aws-Request-Id` to report for this event.
    pub request_id: String,
    /// `Lambda-Runtime-Deadline-Ms` to report for this event.
    pub deadline_ms: u64,
    /// `Lambda-Runtime-Invoked-Function-Arn` to report for this event.
    pub invoked_function_arn: String,
    /// `Lambda-Runtime-Trace-Id` to report for this event, if any.
    pub trace_id: Option<String>,
    /// The event body.
    pub event: Value,
}

impl QueuedInvocation {
    /// A queued invocation with a freshly generated request id and a
    /// deadline `remaining` in the future.
    pub fn new(event: Value, remaining: std::time::Duration) -> Self {
        Self {
            request_id: next_request_id(),
            deadline_ms: now_ms() + remaining.as_millis() as u64,
            invoked_function_arn: "arn:aws:lambda:us-east-1:123456789012:function:test".into(),
            trace_id: None,
            event,
        }
    }
}

/// What the function under test reported for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// A successful `POST .../response` with its body.
    Response(Value),
    /// A `POST .../error` with its diagnostic fields.
    Error {
        /// `errorType` field.
        error_type: String,
        /// `errorMessage` field.
        error_message: String,
    },
}

/// Failures raised by the harness itself, as opposed to outcomes reported
/// by the function under test.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The server task dropped the correlated waiter before an outcome
    /// arrived, most often because the harness itself was dropped.
    #[error("the harness closed before an outcome arrived for this invocation")]
    Disconnected,
    /// The harness failed to bind its loopback listener.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Whether the function under test's init phase has resolved, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    /// The orchestrator completed init and reached its dispatch loop (it
    /// polled `/runtime/invocation/next` at least once).
    Succeeded,
    /// The orchestrator posted `/runtime/init/error`.
    Failed,
}

struct Shared {
    queue: Mutex<VecDeque<QueuedInvocation>>,
    queue_notify: Notify,
    waiters: Mutex<HashMap<String, oneshot::Sender<InvocationOutcome>>>,
    init_errors: Mutex<VecDeque<InvocationOutcome>>,
    init_notify: Notify,
    init_succeeded: Notify,
    init_succeeded_flag: std::sync::atomic::AtomicBool,
}

/// A running loopback Runtime API double. Drop to stop the server.
pub struct Harness {
    shared: Arc<Shared>,
    addr: SocketAddr,
    accept_loop: tokio::task::JoinHandle<()>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

impl Harness {
    /// Binds an ephemeral loopback port and starts serving.
    pub async fn start() -> Result<Self, HarnessError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            waiters: Mutex::new(HashMap::new()),
            init_errors: Mutex::new(VecDeque::new()),
            init_notify: Notify::new(),
            init_succeeded: Notify::new(),
            init_succeeded_flag: std::sync::atomic::AtomicBool::new(false),
        });

        let accept_shared = shared.clone();
        let accept_loop = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::error!(?err, "harness listener accept failed");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let conn_shared = accept_shared.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(conn_shared.clone(), req));
                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        tracing::trace!(?err, "harness connection closed");
                    }
                });
            }
        });

        Ok(Self { shared, addr, accept_loop })
    }

    /// The base URL to hand to
    /// [`HostOptions::runtime_api_endpoint`][lambda_host::HostOptions].
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Queues `event` with a deadline `remaining` from now, and awaits the
    /// matching response or error.
    pub async fn invoke(&self, event: Value, remaining: std::time::Duration) -> Result<InvocationOutcome, HarnessError> {
        self.invoke_queued(QueuedInvocation::new(event, remaining)).await
    }

    /// Queues a fully specified [`QueuedInvocation`] and awaits its outcome.
    pub async fn invoke_queued(&self, queued: QueuedInvocation) -> Result<InvocationOutcome, HarnessError> {
        let (tx, rx) = oneshot::channel();
        self.shared.waiters.lock().await.insert(queued.request_id.clone(), tx);
        self.shared.queue.lock().await.push_back(queued);
        self.shared.queue_notify.notify_one();
        rx.await.map_err(|_| HarnessError::Disconnected)
    }

    /// Awaits the next `POST /runtime/init/error`, if one has not already
    /// arrived.
    pub async fn wait_for_init_error(&self) -> InvocationOutcome {
        loop {
            if let Some(outcome) = self.shared.init_errors.lock().await.pop_front() {
                return outcome;
            }
            self.shared.init_notify.notified().await;
        }
    }

    /// Awaits whichever of init success or init failure resolves first: the
    /// orchestrator either posts `/runtime/init/error` or reaches its
    /// dispatch loop and polls `/runtime/invocation/next`.
    pub async fn wait_for_init_status(&self) -> InitStatus {
        loop {
            if self.shared.init_succeeded_flag.load(Ordering::Relaxed) {
                return InitStatus::Succeeded;
            }
            if !self.shared.init_errors.lock().await.is_empty() {
                return InitStatus::Failed;
            }
            tokio::select! {
                _ = self.shared.init_succeeded.notified() => {}
                _ = self.shared.init_notify.notified() => {}
            }
        }
    }
}

fn next_request_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("test-request-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

async fn handle(shared: Arc<Shared>, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, ["2018-06-01", "runtime", "invocation", "next"]) => {
            if !shared.init_succeeded_flag.swap(true, Ordering::Relaxed) {
                shared.init_succeeded.notify_waiters();
            }
            next_event(&shared).await
        }
        (&Method::POST, ["2018-06-01", "runtime", "invocation", request_id, "response"]) => {
            complete_response(&shared, request_id, req).await
        }
        (&Method::POST, ["2018-06-01", "runtime", "invocation", request_id, "error"]) => {
            complete_error(&shared, request_id, req).await
        }
        (&Method::POST, ["2018-06-01", "runtime", "init", "error"]) => init_error(&shared, req).await,
        _ => empty(StatusCode::NOT_FOUND),
    };

    Ok(response)
}

async fn next_event(shared: &Shared) -> Response<Full<Bytes>> {
    loop {
        if let Some(queued) = shared.queue.lock().await.pop_front() {
            let body = match serde_json::to_vec(&queued.event) {
                Ok(bytes) => bytes,
                Err(err) => return text(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            };
            let mut builder = Response::builder()
                .status(StatusCode::OK)
                .header("lambda-runtime-aws-request-id", queued.request_id)
                .header("lambda-runtime-deadline-ms", queued.deadline_ms.to_string())
                .header("lambda-runtime-invoked-function-arn", queued.invoked_function_arn);
            if let Some(trace_id) = queued.trace_id {
                builder = builder.header("lambda-runtime-trace-id", trace_id);
            }
            return builder.body(Full::new(Bytes::from(body))).expect("well-formed harness response");
        }
        shared.queue_notify.notified().await;
    }
}

/// Separates the JSON metadata prelude from the stream body in a chunked
/// streaming response, matching the `"\u{0}".repeat(8)` separator the
/// orchestrator's request builder writes after the prelude.
const STREAMING_PRELUDE_SEPARATOR: &[u8] = &[0u8; 8];

async fn complete_response(shared: &Shared, request_id: &str, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let streaming = req
        .headers()
        .get("lambda-runtime-function-response-mode")
        .is_some_and(|v| v.as_bytes() == b"streaming");
    let bytes = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => return text(StatusCode::BAD_REQUEST, err.to_string()),
    };

    let value = if streaming {
        // The body is `<metadata prelude JSON><8 NUL bytes><raw stream
        // bytes>`; tests only need the decoded stream content.
        match bytes.windows(STREAMING_PRELUDE_SEPARATOR.len()).position(|w| w == STREAMING_PRELUDE_SEPARATOR) {
            Some(at) => {
                let stream_bytes = &bytes[at + STREAMING_PRELUDE_SEPARATOR.len()..];
                Value::String(String::from_utf8_lossy(stream_bytes).into_owned())
            }
            None => return text(StatusCode::BAD_REQUEST, "streaming response missing metadata prelude separator"),
        }
    } else {
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => return text(StatusCode::BAD_REQUEST, err.to_string()),
        }
    };
    deliver(shared, request_id, InvocationOutcome::Response(value)).await;
    empty(StatusCode::ACCEPTED)
}

async fn complete_error(shared: &Shared, request_id: &str, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let bytes = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => return text(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let diagnostic: serde_json::Map<String, Value> = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => return text(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let outcome = InvocationOutcome::Error {
        error_type: diagnostic.get("errorType").and_then(Value::as_str).unwrap_or_default().to_owned(),
        error_message: diagnostic.get("errorMessage").and_then(Value::as_str).unwrap_or_default().to_owned(),
    };
    deliver(shared, request_id, outcome).await;
    empty(StatusCode::ACCEPTED)
}

async fn init_error(shared: &Shared, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let bytes = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => return text(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let diagnostic: serde_json::Map<String, Value> = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => return text(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let outcome = InvocationOutcome::Error {
        error_type: diagnostic.get("errorType").and_then(Value::as_str).unwrap_or_default().to_owned(),
        error_message: diagnostic.get("errorMessage").and_then(Value::as_str).unwrap_or_default().to_owned(),
    };
    shared.init_errors.lock().await.push_back(outcome);
    shared.init_notify.notify_waiters();
    empty(StatusCode::ACCEPTED)
}

async fn deliver(shared: &Shared, request_id: &str, outcome: InvocationOutcome) {
    if let Some(tx) = shared.waiters.lock().await.remove(request_id) {
        let _ = tx.send(outcome);
    }
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder().status(status).body(Full::new(Bytes::new())).expect("well-formed harness response")
}

fn text(status: StatusCode, body: impl Into<String>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.into())))
        .expect("well-formed harness response")
}
