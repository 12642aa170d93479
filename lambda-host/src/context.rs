//! The invocation record and lifecycle context: per-invocation state
//! threaded through middleware, the composed handler, and lifecycle
//! delegates.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use tokio::time::Instant;

use crate::{
    cancellation::CancellationHandle,
    features::FeatureCollection,
    services::ServiceScope,
};

/// Opaque client context forwarded from a mobile SDK invocation, if any.
pub type ClientContext = serde_json::Value;
/// Opaque Amazon Cognito identity forwarded with the invocation, if any.
pub type CognitoIdentity = serde_json::Value;

/// The unit of work dequeued from the Runtime API's `/next` endpoint.
#[derive(Debug, Clone)]
pub struct InvocationRecord {
    /// `Lambda-Runtime-Aws-Request-Id`.
    pub request_id: String,
    /// Absolute deadline, derived from `Lambda-Runtime-Deadline-Ms`.
    pub deadline: Instant,
    /// `Lambda-Runtime-Invoked-Function-Arn`.
    pub invoked_function_arn: String,
    /// `Lambda-Runtime-Trace-Id`, if present.
    pub trace_id: Option<String>,
    /// `Lambda-Runtime-Client-Context`, parsed as JSON, if present.
    pub client_context: Option<ClientContext>,
    /// `Lambda-Runtime-Cognito-Identity`, parsed as JSON, if present.
    pub identity: Option<CognitoIdentity>,
    /// The raw event bytes, not yet deserialized.
    pub event_bytes: bytes::Bytes,
}

impl InvocationRecord {
    /// Time remaining before `deadline`, clamped to zero.
    pub fn remaining_time(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Keys reserved by the host itself in [`LifecycleContext`]'s scratchpad.
/// User code should avoid colliding with these.
pub mod reserved_keys {
    /// Key under which a clone of the owning [`super::LifecycleContext`] is
    /// stashed, the explicit substitute for an async-local "current
    /// context" accessor.
    pub const CURRENT_CONTEXT: &str = "__lambda_host_current_context";
}

/// Per-invocation view shared by middleware, the composed handler, and (in
/// a degenerate single-invocation form) the init/shutdown delegates.
#[derive(Clone)]
pub struct LifecycleContext {
    inner: Arc<LifecycleContextInner>,
}

struct LifecycleContextInner {
    record: InvocationRecord,
    properties: Arc<RwLock<HashMap<String, Box<dyn std::any::Any + Send + Sync>>>>,
    features: std::sync::Mutex<FeatureCollection>,
    scratchpad: std::sync::Mutex<HashMap<String, Box<dyn std::any::Any + Send>>>,
    cancellation: CancellationHandle,
    service_scope: ServiceScope,
}

impl LifecycleContext {
    /// Constructs a context for one invocation.
    pub fn new(
        record: InvocationRecord,
        properties: Arc<RwLock<HashMap<String, Box<dyn std::any::Any + Send + Sync>>>>,
        features: FeatureCollection,
        cancellation: CancellationHandle,
        service_scope: ServiceScope,
    ) -> Self {
        Self {
            inner: Arc::new(LifecycleContextInner {
                record,
                properties,
                features: std::sync::Mutex::new(features),
                scratchpad: std::sync::Mutex::new(HashMap::new()),
                cancellation,
                service_scope,
            }),
        }
    }

    /// The invocation's metadata.
    pub fn record(&self) -> &InvocationRecord {
        &self.inner.record
    }

    /// The invocation's cancellation handle.
    pub fn cancellation(&self) -> &CancellationHandle {
        &self.inner.cancellation
    }

    /// The invocation's dependency-resolution scope.
    pub fn services(&self) -> &ServiceScope {
        &self.inner.service_scope
    }

    /// Runs `f` against the invocation's feature collection.
    pub fn with_features<R>(&self, f: impl FnOnce(&mut FeatureCollection) -> R) -> R {
        let mut features = self.inner.features.lock().expect("feature collection mutex poisoned");
        f(&mut features)
    }

    /// Reads a per-process property installed by init or a prior
    /// invocation. Concurrency-safety of the stored value across
    /// invocations is the caller's responsibility.
    pub fn get_property<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<T> {
        let properties = self.inner.properties.read().expect("properties lock poisoned");
        properties.get(key).and_then(|v| v.downcast_ref::<T>()).cloned()
    }

    /// Installs or replaces a per-process property, visible to every
    /// subsequent invocation in this process.
    pub fn set_property<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        let mut properties = self.inner.properties.write().expect("properties lock poisoned");
        properties.insert(key.into(), Box::new(value));
    }

    /// Per-invocation scratchpad, cleared when the context drops.
    pub fn get_item<T: Clone + Send + 'static>(&self, key: &str) -> Option<T> {
        let scratchpad = self.inner.scratchpad.lock().expect("scratchpad mutex poisoned");
        scratchpad.get(key).and_then(|v| v.downcast_ref::<T>()).cloned()
    }

    /// Installs a per-invocation scratchpad entry.
    pub fn set_item<T: Send + 'static>(&self, key: impl Into<String>, value: T) {
        let mut scratchpad = self.inner.scratchpad.lock().expect("scratchpad mutex poisoned");
        scratchpad.insert(key.into(), Box::new(value));
    }
}

impl std::fmt::Debug for LifecycleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleContext")
            .field("request_id", &self.inner.record.request_id)
            .finish()
    }
}
