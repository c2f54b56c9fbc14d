#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Runnable resources backed by real `flowpool worker` processes.
//!
//! Verifies that:
//! - a lazy pool spawns its processes only once work arrives
//! - handler failures and panics come back as statuses, not crashes
//! - the async handler runs requests concurrently inside one process
//! - stop enqueues one STOP per worker and joins every process

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use flowpool_core::StatusCode;
use flowpool_engine::builtin::{CapsRequest, CapsResponse};
use flowpool_engine::launcher::ProcessLauncher;
use flowpool_engine::proxy::ProxyError;
use flowpool_engine::resource::{ResourceSettings, ResourceState, RunnableResource, StopReport};

const TIMEOUT: Duration = Duration::from_secs(20);

fn settings(name: &str, handler: &str) -> ResourceSettings {
    let mut settings = ResourceSettings::new(name, handler);
    settings.poll_interval = Duration::from_millis(10);
    settings.new_msg_check_interval = Duration::from_millis(10);
    settings.usage_check_interval = Duration::from_millis(50);
    settings
}

fn process_resource(settings: ResourceSettings) -> RunnableResource {
    let launcher = ProcessLauncher::new(env!("CARGO_BIN_EXE_flowpool"));
    RunnableResource::new(settings, Arc::new(launcher)).unwrap()
}

#[tokio::test]
async fn lazy_pool_starts_on_first_task() {
    let res = process_resource(settings("caps-lazy", "caps").with_replicas(2).lazy(true));
    let mut states = res.subscribe_state();

    res.start().await;
    assert_eq!(res.state(), ResourceState::LazyWaiting);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!res.started());

    let proxy = res.proxy();
    let request = CapsRequest {
        text: "The WHO and UNICEF report".into(),
        language: Some("en".into()),
    };
    let response: CapsResponse = tokio::time::timeout(TIMEOUT, proxy.request(&request))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.candidates, vec!["WHO", "UNICEF"]);

    tokio::time::timeout(TIMEOUT, states.wait_for(|s| *s == ResourceState::Started))
        .await
        .unwrap()
        .unwrap();
    assert!(res.started());

    let report = res.stop().await;
    assert_eq!(
        report,
        StopReport {
            stop_messages: 2,
            joined_workers: 2
        }
    );
    assert_eq!(res.state(), ResourceState::Stopped);
    assert_eq!(res.stop().await, StopReport::default());
}

#[tokio::test]
async fn handler_failures_become_statuses() {
    let res = process_resource(settings("echo-failures", "echo"));
    res.start().await;
    let proxy = res.proxy();

    let err = tokio::time::timeout(TIMEOUT, proxy.request_value(json!({"fail": true})))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(&err, ProxyError::Handling { .. }));
    assert_eq!(err.status().code, StatusCode::InternalError);

    let err = tokio::time::timeout(TIMEOUT, proxy.request_value(json!({"panic": true})))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.status().code, StatusCode::InternalError);

    // The worker survived both and still serves.
    let reply = tokio::time::timeout(TIMEOUT, proxy.request_value(json!({"text": "still here"})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, json!({"text": "still here"}));

    res.stop().await;
}

#[tokio::test]
async fn invalid_requests_are_invalid_input() {
    let res = process_resource(settings("caps-invalid", "caps"));
    res.start().await;
    let proxy = res.proxy();

    let err = tokio::time::timeout(
        TIMEOUT,
        proxy.request_value(json!({"text": "NATO", "language": "klingon"})),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert_eq!(err.status().code, StatusCode::InvalidInput);

    let err = tokio::time::timeout(TIMEOUT, proxy.request_value(json!({"no_text": 1})))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.status().code, StatusCode::InvalidInput);

    res.stop().await;
}

#[tokio::test]
async fn async_worker_overlaps_requests() {
    let mut delay = settings("delay", "delay");
    delay.async_task_limit = 4;
    let res = process_resource(delay);
    res.start().await;
    let proxy = res.proxy();

    // Warm up so process start-up is not part of the measurement.
    tokio::time::timeout(TIMEOUT, proxy.request_value(json!({"ms": 1})))
        .await
        .unwrap()
        .unwrap();

    let started = Instant::now();
    let requests = (0..4).map(|n| {
        let proxy = proxy.clone();
        async move { proxy.request_value(json!({"ms": 300, "n": n})).await }
    });
    let replies = tokio::time::timeout(TIMEOUT, futures_join_all(requests))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    for (n, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply.unwrap()["n"], json!(n));
    }
    assert!(
        elapsed < Duration::from_millis(1100),
        "four 300ms requests took {elapsed:?}"
    );

    let report = res.stop().await;
    assert_eq!(report.joined_workers, 1);
}

#[tokio::test]
async fn concurrent_callers_get_their_own_replies() {
    let res = process_resource(settings("echo-many", "echo").with_replicas(3));
    res.start().await;
    let proxy = res.proxy();

    let mut tasks = tokio::task::JoinSet::new();
    for n in 0..30 {
        let proxy = proxy.clone();
        tasks.spawn(async move { (n, proxy.request_value(json!({"n": n})).await) });
    }
    let mut seen = 0;
    while let Some(joined) = tokio::time::timeout(TIMEOUT, tasks.join_next()).await.unwrap() {
        let (n, reply) = joined.unwrap();
        assert_eq!(reply.unwrap(), json!({"n": n}));
        seen += 1;
    }
    assert_eq!(seen, 30);

    let report = res.stop().await;
    assert_eq!(report.stop_messages, 3);
    assert!(res.queues().inbound.is_empty());
}

/// Await every future, keeping input order.
async fn futures_join_all<F, T>(futures: impl IntoIterator<Item = F>) -> Vec<T>
where
    F: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let handles: Vec<_> = futures.into_iter().map(tokio::spawn).collect();
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        out.push(handle.await.unwrap());
    }
    out
}
