//! End-to-end scenarios driven through a real [`Orchestrator`] against a
//! loopback [`lambda_host_testing::Harness`], covering the lifecycle's
//! testable properties: sequential dispatch, FIFO correlation, deadline
//! bound, init abort, shutdown completeness and middleware ordering.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::future::BoxFuture;
use lambda_host::{
    builders::{InitBuilder, InvocationBuilder, ShutdownBuilder},
    composer::{compose_with_event, compose_with_event_and_cancellation, HandlerBuilder},
    context::LifecycleContext,
    middleware::{Middleware, Next},
    services::ServiceProvider,
    Error, HostOptions, Orchestrator,
};
use lambda_host_testing::{Harness, InitStatus, InvocationOutcome, QueuedInvocation};

async fn spawn_orchestrator(
    harness: &Harness,
    init: lambda_host::builders::CompiledInit,
    invocation: lambda_host::builders::CompiledInvocation,
    shutdown: lambda_host::builders::CompiledShutdown,
) -> (lambda_host::StopHandle, tokio::task::JoinHandle<Result<(), lambda_host::HostError>>) {
    let options = HostOptions {
        runtime_api_endpoint: Some(harness.endpoint()),
        invocation_cancellation_buffer: Duration::from_millis(100),
        ..Default::default()
    };
    let client = lambda_host_api_client::Client::builder()
        .with_endpoint(options.runtime_api_endpoint.as_ref().unwrap().parse().unwrap())
        .build()
        .unwrap();
    let services = ServiceProvider::default();
    let feature_factory = lambda_host::features::FeatureCollectionFactory::default();
    let orchestrator = Orchestrator::new(client, options, services, feature_factory, init, invocation, shutdown);
    let stop = orchestrator.stop_handle();
    let handle = tokio::spawn(orchestrator.run());
    (stop, handle)
}

fn greet_invocation() -> lambda_host::builders::CompiledInvocation {
    let builder = HandlerBuilder::new().event::<String>().unwrap();
    let terminal = compose_with_event::<String, _, _, _>(builder, |name: String| async move {
        if name.is_empty() {
            return Err::<String, Error>("Name is required. (Parameter 'name')".into());
        }
        Ok::<_, Error>(format!("Hello {name}!"))
    })
    .unwrap();
    InvocationBuilder::new().handle(terminal).unwrap().build().unwrap()
}

#[tokio::test]
async fn scenario_1_hello_jonas() {
    let harness = Harness::start().await.unwrap();
    let (stop, handle) = spawn_orchestrator(
        &harness,
        InitBuilder::new().build(),
        greet_invocation(),
        ShutdownBuilder::new().build(),
    )
    .await;

    let outcome = harness
        .invoke(serde_json::json!("Jonas"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(outcome, InvocationOutcome::Response(serde_json::json!("Hello Jonas!")));

    stop.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn scenario_2_empty_name_reports_exact_error_message() {
    let harness = Harness::start().await.unwrap();
    let (stop, handle) = spawn_orchestrator(
        &harness,
        InitBuilder::new().build(),
        greet_invocation(),
        ShutdownBuilder::new().build(),
    )
    .await;

    let outcome = harness
        .invoke(serde_json::json!(""), Duration::from_secs(5))
        .await
        .unwrap();
    match outcome {
        InvocationOutcome::Error { error_message, .. } => {
            assert_eq!(error_message, "Name is required. (Parameter 'name')");
        }
        other => panic!("expected an error outcome, got {other:?}"),
    }

    stop.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn scenario_3_five_concurrent_submissions_are_each_correlated() {
    let harness = Arc::new(Harness::start().await.unwrap());
    let (stop, handle) = spawn_orchestrator(
        &harness,
        InitBuilder::new().build(),
        greet_invocation(),
        ShutdownBuilder::new().build(),
    )
    .await;

    let mut invocations = Vec::new();
    for n in 1..=5 {
        let harness = harness.clone();
        invocations.push(tokio::spawn(async move {
            let name = format!("User{n}");
            let outcome = harness.invoke(serde_json::json!(name), Duration::from_secs(5)).await.unwrap();
            (name, outcome)
        }));
    }

    for join in invocations {
        let (name, outcome) = join.await.unwrap();
        assert_eq!(outcome, InvocationOutcome::Response(serde_json::json!(format!("Hello {name}!"))));
    }

    stop.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn scenario_4_init_delegate_failure_aborts_before_any_dispatch() {
    let harness = Harness::start().await.unwrap();
    let init = InitBuilder::new()
        .add(Arc::new(|_ctx| Box::pin(async { Err::<(), Error>("bootstrap failed".into()) }) as BoxFuture<'static, Result<(), Error>>))
        .build();

    let options = HostOptions {
        runtime_api_endpoint: Some(harness.endpoint()),
        ..Default::default()
    };
    let client = lambda_host_api_client::Client::builder()
        .with_endpoint(options.runtime_api_endpoint.as_ref().unwrap().parse().unwrap())
        .build()
        .unwrap();
    let orchestrator = Orchestrator::new(
        client,
        options,
        ServiceProvider::default(),
        lambda_host::features::FeatureCollectionFactory::default(),
        init,
        greet_invocation(),
        ShutdownBuilder::new().build(),
    );
    let result = orchestrator.run().await;

    assert!(result.is_err());
    assert_eq!(harness.wait_for_init_status().await, InitStatus::Failed);
}

#[tokio::test]
async fn scenario_5_handler_is_cancelled_near_its_deadline() {
    let harness = Harness::start().await.unwrap();
    let builder = HandlerBuilder::new().event::<String>().unwrap().cancellation().unwrap();
    let terminal = compose_with_event_and_cancellation::<String, _, _, _>(builder, |_name, cancellation| async move {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(60)) => Ok::<_, Error>("too slow".to_owned()),
            _ = cancellation.cancelled() => Err::<String, Error>("invocation cancelled at its deadline".into()),
        }
    })
    .unwrap();
    let invocation = InvocationBuilder::new().handle(terminal).unwrap().build().unwrap();

    let (stop, handle) = spawn_orchestrator(&harness, InitBuilder::new().build(), invocation, ShutdownBuilder::new().build()).await;

    let started = tokio::time::Instant::now();
    let outcome = harness
        .invoke_queued(QueuedInvocation::new(serde_json::json!("x"), Duration::from_secs(1)))
        .await
        .unwrap();
    assert!(started.elapsed() <= Duration::from_secs(1), "cancellation must fire at or before the deadline");
    match outcome {
        InvocationOutcome::Error { error_message, .. } => {
            assert_eq!(error_message, "invocation cancelled at its deadline");
        }
        other => panic!("expected a cancellation error, got {other:?}"),
    }

    stop.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn scenario_7_streaming_handler_posts_chunked_response() {
    let builder = HandlerBuilder::new().event::<()>().unwrap();
    let terminal = compose_with_event::<(), _, _, _>(builder, |_event| async move {
        let (mut tx, rx) = lambda_host::streaming::channel();
        tokio::spawn(async move {
            let _ = tx.try_send(Ok(bytes::Bytes::from_static(b"hello ")));
            let _ = tx.try_send(Ok(bytes::Bytes::from_static(b"world")));
        });
        Ok::<_, Error>(lambda_host::streaming::Response::from(rx))
    })
    .unwrap();
    let invocation = InvocationBuilder::new().handle(terminal).unwrap().build().unwrap();

    let harness = Harness::start().await.unwrap();
    let (stop, handle) = spawn_orchestrator(&harness, InitBuilder::new().build(), invocation, ShutdownBuilder::new().build()).await;

    let outcome = harness.invoke(serde_json::json!(null), Duration::from_secs(5)).await.unwrap();
    assert_eq!(outcome, InvocationOutcome::Response(serde_json::json!("hello world")));

    stop.stop();
    handle.await.unwrap().unwrap();
}

#[derive(Clone)]
struct LoggingMiddleware {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl Middleware for LoggingMiddleware {
    fn call(&self, ctx: LifecycleContext, next: Next) -> BoxFuture<'static, Result<(), Error>> {
        let name = self.name;
        let log = self.log.clone();
        Box::pin(async move {
            log.lock().unwrap().push(format!("{name}-before"));
            let result = next.run(ctx).await;
            log.lock().unwrap().push(format!("{name}-after"));
            result
        })
    }
}

#[tokio::test]
async fn scenario_6_two_middleware_run_outer_to_inner_around_the_handler() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let builder = HandlerBuilder::new().event::<()>().unwrap();
    let handler_log = log.clone();
    let terminal = compose_with_event::<(), _, _, _>(builder, move |_event| {
        let handler_log = handler_log.clone();
        async move {
            handler_log.lock().unwrap().push("handler".to_owned());
            Ok::<_, Error>("H".to_owned())
        }
    })
    .unwrap();

    let invocation = InvocationBuilder::new()
        .r#use(LoggingMiddleware { name: "A", log: log.clone() })
        .r#use(LoggingMiddleware { name: "B", log: log.clone() })
        .handle(terminal)
        .unwrap()
        .build()
        .unwrap();

    let harness = Harness::start().await.unwrap();
    let (stop, handle) = spawn_orchestrator(&harness, InitBuilder::new().build(), invocation, ShutdownBuilder::new().build()).await;

    let outcome = harness.invoke(serde_json::json!(null), Duration::from_secs(5)).await.unwrap();
    assert_eq!(outcome, InvocationOutcome::Response(serde_json::json!("H")));
    assert_eq!(*log.lock().unwrap(), vec!["A-before", "B-before", "handler", "B-after", "A-after"]);

    stop.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_delegates_all_run_once_before_the_process_stops() {
    let calls = Arc::new(AtomicUsize::new(0));
    let make_shutdown_delegate = |calls: Arc<AtomicUsize>| -> lambda_host::builders::ShutdownDelegate {
        Arc::new(move |_ctx| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), Error>(())
            })
        })
    };
    let shutdown = ShutdownBuilder::new()
        .add(make_shutdown_delegate(calls.clone()))
        .add(make_shutdown_delegate(calls.clone()))
        .add(make_shutdown_delegate(calls.clone()))
        .build();

    let harness = Harness::start().await.unwrap();
    let (stop, handle) = spawn_orchestrator(&harness, InitBuilder::new().build(), greet_invocation(), shutdown).await;

    harness.invoke(serde_json::json!("Jonas"), Duration::from_secs(5)).await.unwrap();
    stop.stop();
    handle.await.unwrap().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
