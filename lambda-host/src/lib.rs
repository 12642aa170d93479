#![deny(clippy::all, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]
#![warn(missing_docs, nonstandard_style, rust_2018_idioms)]

//! A host for the AWS Lambda Custom Runtime API built around explicit,
//! non-reflective composition rather than a single `tower::Service`.
//!
//! A function author assembles three phases — [`builders::InitBuilder`],
//! [`builders::InvocationBuilder`] and [`builders::ShutdownBuilder`] —
//! registers any dependency-container services through [`ServiceProvider`],
//! and hands the result to [`run`]. The [`Orchestrator`] then owns the
//! long-poll loop against the Runtime API for the lifetime of the process.

pub mod builders;
mod cancellation;
pub mod composer;
pub mod config;
pub mod context;
mod deserializer;
mod diagnostic;
pub mod error;
pub mod features;
pub mod middleware;
mod orchestrator;
mod requests;
pub mod services;
/// Utilities for chunked streaming responses.
pub mod streaming;
mod types;

pub use cancellation::CancellationHandle;
pub use composer::{
    compose_nullary, compose_with_event, compose_with_event_and_cancellation, compose_with_event_and_context,
    compose_with_event_and_keyed_service, compose_with_event_and_service, CancellationHandleRef, ComposerBuildError,
    HandlerBuilder, IntoHandlerOutcome, ResponseFeature, StreamingResponseFeature,
};
pub use config::{Config, HostOptions};
pub use context::{ClientContext, CognitoIdentity, InvocationRecord, LifecycleContext};
pub use diagnostic::Diagnostic;
pub use error::{CancellationError, HostError, ShutdownAggregateError};
pub use features::{FeatureCollection, FeatureCollectionFactory, FeatureProvider, MissingFeature};
pub use middleware::{Middleware, Next, Terminal};
pub use orchestrator::{Orchestrator, StopHandle};
pub use services::{ServiceKey, ServiceProvider, ServiceProviderBuilder, ServiceScope};
pub use types::{FunctionResponse, IntoFunctionResponse, MetadataPrelude, StreamResponse};

use builders::{CompiledInit, CompiledInvocation, CompiledShutdown};
use tracing::trace;

/// The error type a handler, middleware, or lifecycle delegate may return.
/// Distinct from [`HostError`], which covers failures in the host's own
/// machinery.
pub type Error = lambda_host_api_client::BoxError;

/// Assembles and runs the lifecycle orchestrator for one process, using
/// [`HostOptions::default`].
///
/// Reads [`Config`] from the environment, builds the Runtime API client, and
/// drives init, the dispatch loop, and shutdown to completion.
pub async fn run(
    init: CompiledInit,
    invocation: CompiledInvocation,
    shutdown: CompiledShutdown,
    services: ServiceProvider,
) -> Result<(), HostError> {
    run_with_options(init, invocation, shutdown, services, HostOptions::default()).await
}

/// Like [`run`], but with explicit [`HostOptions`] instead of the defaults.
pub async fn run_with_options(
    init: CompiledInit,
    invocation: CompiledInvocation,
    shutdown: CompiledShutdown,
    services: ServiceProvider,
    mut options: HostOptions,
) -> Result<(), HostError> {
    options.validate()?;
    #[cfg(feature = "tracing")]
    if options.install_default_subscriber {
        lambda_host_api_client::tracing::init_default_subscriber();
    }
    let config = Config::from_env()?;
    trace!(function = %orchestrator::describe(&config), "starting lambda-host");

    let client = match options.transport_client_override.take() {
        Some(client) => client,
        None => {
            let mut builder = lambda_host_api_client::Client::builder();
            if let Some(endpoint) = &options.runtime_api_endpoint {
                let uri: http::Uri = endpoint
                    .parse()
                    .map_err(|e: http::uri::InvalidUri| HostError::Config(e.to_string()))?;
                builder = builder.with_endpoint(uri);
            }
            builder
                .build()
                .map_err(|e| HostError::Config(format!("failed to build runtime API client: {e}")))?
        }
    };

    let feature_factory = FeatureCollectionFactory::default();
    let orchestrator = Orchestrator::new(client, options, services, feature_factory, init, invocation, shutdown);
    orchestrator.run().await
}
