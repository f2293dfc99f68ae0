use crate::{
    Backpressure, Completion, CorrelationToken, EndpointConfig, Error, ErrorKind, Handler,
    HandlerFactory, HandlerFailure, HandlerLogic, HandlerPool, Payload, PoolConfig,
    RequestContext, ReusePolicy, SpawnError, WorkRequest, spawn_worker,
};
use core::time::Duration;
use serde_json::json;
use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};
use tokio::{sync::mpsc, time::sleep};

/// Test logic: echoes the request with its instance id and per-instance
/// request count. Honors `sleep_ms`, `fail` and `panic` request fields.
struct Scripted {
    instance: u64,
    seen: u64,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl HandlerLogic for Scripted {
    async fn handle(
        &mut self,
        request: Payload,
        _context: &RequestContext,
    ) -> Result<Payload, HandlerFailure> {
        self.seen += 1;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(ms) = request.get("sleep_ms").and_then(Payload::as_u64) {
            sleep(Duration::from_millis(ms)).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if request.get("panic").is_some() {
            panic!("handler crashed");
        }
        if request.get("fail").is_some() {
            return Err(HandlerFailure::new("invalid_input", "asked to fail"));
        }
        Ok(json!({
            "instance": self.instance,
            "seen": self.seen,
            "echo": request,
        }))
    }
}

/// A misbehaving handler: before answering a request it replays a
/// completion for the request it served previously, and it answers every
/// request twice.
fn spawn_duplicating() -> Handler {
    let (input_tx, mut input_rx) = mpsc::channel(1);
    let (events_tx, events_rx) = mpsc::channel(8);
    let task = tokio::spawn(async move {
        let mut previous: Option<CorrelationToken> = None;
        while let Some(work) = input_rx.recv().await {
            match work {
                WorkRequest::Process(envelope) => {
                    if let Some(stale) = previous {
                        let _ = events_tx.send(Completion::ok(stale, json!("stale"))).await;
                    }
                    let _ = events_tx
                        .send(Completion::ok(envelope.token, envelope.request))
                        .await;
                    let _ = events_tx
                        .send(Completion::ok(envelope.token, json!("duplicate")))
                        .await;
                    previous = Some(envelope.token);
                }
                WorkRequest::Shutdown { response } => {
                    let _ = response.send(());
                    break;
                }
            }
        }
    });
    Handler::new(input_tx, events_rx).with_task(task.abort_handle())
}

#[derive(Default)]
struct TestFactory {
    created: AtomicU64,
    /// Creations numbered at or above this fail.
    fail_from: Option<u64>,
    /// How long each creation takes.
    spawn_delay: Option<Duration>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl TestFactory {
    fn failing_from(n: u64) -> Self {
        Self {
            fail_from: Some(n),
            ..Self::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            spawn_delay: Some(delay),
            ..Self::default()
        }
    }

    fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }
}

impl HandlerFactory for Arc<TestFactory> {
    async fn create(&self, endpoint: &str) -> Result<Handler, SpawnError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.spawn_delay {
            sleep(delay).await;
        }
        if self.fail_from.is_some_and(|from| n >= from) {
            return Err(SpawnError::Init(format!("{endpoint}: refused")));
        }
        match endpoint {
            "Duplicating" => Ok(spawn_duplicating()),
            _ => Ok(spawn_worker(
                endpoint.to_string(),
                Scripted {
                    instance: n,
                    seen: 0,
                    active: Arc::clone(&self.active),
                    peak: Arc::clone(&self.peak),
                },
            )),
        }
    }
}

fn ctx(id: &str) -> RequestContext {
    RequestContext::new(id)
}

async fn start(config: PoolConfig, factory: &Arc<TestFactory>) -> HandlerPool<Arc<TestFactory>> {
    HandlerPool::start(config, Arc::clone(factory)).await.unwrap()
}

/// Polls `check` until it holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn warm_start_serves_without_cold_spawns() {
    let factory = Arc::new(TestFactory::default());
    let pool = start(
        PoolConfig::new().endpoint("Echo", EndpointConfig::new()),
        &factory,
    )
    .await;

    // Pre-warm finished before start returned.
    let status = pool.status("Echo").unwrap();
    assert_eq!(status.idle, 2);
    assert_eq!(factory.created(), 2);

    let response = pool.submit("Echo", json!({"n": 1}), ctx("r1")).await.unwrap();
    assert_eq!(response["echo"], json!({"n": 1}));
    assert_eq!(pool.metrics().cold_spawns, 0);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_concurrent_then_sequential_respects_bounds() {
    let factory = Arc::new(TestFactory::default());
    let config = EndpointConfig::new()
        .min_idle(2)
        .max_idle(4)
        .max_size(10)
        .reuse(ReusePolicy::Reuse);
    let pool = start(PoolConfig::new().endpoint("Echo", config), &factory).await;

    let burst = (0..10).map(|i| {
        pool.submit(
            "Echo",
            json!({"n": i, "sleep_ms": 30}),
            ctx(&format!("burst-{i}")),
        )
    });
    let responses = futures::future::join_all(burst).await;
    for (i, response) in responses.into_iter().enumerate() {
        assert_eq!(response.unwrap()["echo"]["n"], json!(i));
    }

    let status = pool.status("Echo").unwrap();
    assert!(status.idle <= 4, "idle above max_idle: {status:?}");
    assert!(status.total() <= 10);
    assert_eq!(status.busy, 0);

    for i in 0..5 {
        let response = pool
            .submit("Echo", json!({"n": i}), ctx(&format!("seq-{i}")))
            .await
            .unwrap();
        assert_eq!(response["echo"]["n"], json!(i));
        let status = pool.status("Echo").unwrap();
        assert!(status.idle <= 4);
    }
    assert!(factory.peak.load(Ordering::SeqCst) <= 10);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fresh_instance_per_request_by_default() {
    let factory = Arc::new(TestFactory::default());
    let pool = start(
        PoolConfig::new().endpoint("Echo", EndpointConfig::new().max_size(8)),
        &factory,
    )
    .await;

    let concurrent = (0..8).map(|i| {
        pool.submit("Echo", json!({"sleep_ms": 20}), ctx(&format!("c-{i}")))
    });
    let mut instances = HashSet::new();
    for response in futures::future::join_all(concurrent).await {
        let response = response.unwrap();
        // No state from an earlier request is visible.
        assert_eq!(response["seen"], 1);
        assert!(instances.insert(response["instance"].as_u64().unwrap()));
    }

    for i in 0..5 {
        let response = pool
            .submit("Echo", json!({}), ctx(&format!("s-{i}")))
            .await
            .unwrap();
        assert_eq!(response["seen"], 1);
        assert!(instances.insert(response["instance"].as_u64().unwrap()));
    }
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reuse_opt_in_keeps_the_same_instance() {
    let factory = Arc::new(TestFactory::default());
    let config = EndpointConfig::new()
        .min_idle(1)
        .max_idle(1)
        .max_size(1)
        .reuse(ReusePolicy::Reuse);
    let pool = start(PoolConfig::new().endpoint("Echo", config), &factory).await;

    for expected in 1..=3 {
        let response = pool.submit("Echo", json!({}), ctx("r")).await.unwrap();
        assert_eq!(response["seen"], expected);
    }
    assert_eq!(factory.created(), 1);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn burst_above_max_size_fails_fast() {
    let factory = Arc::new(TestFactory::default());
    let config = EndpointConfig::new()
        .min_idle(0)
        .max_idle(0)
        .max_size(3)
        .backpressure(Backpressure::FailFast);
    let pool = start(PoolConfig::new().endpoint("Echo", config), &factory).await;

    let burst = (0..5).map(|i| {
        pool.submit("Echo", json!({"sleep_ms": 100}), ctx(&format!("b-{i}")))
    });
    let results = futures::future::join_all(burst).await;

    let served = results.iter().filter(|r| r.is_ok()).count();
    let exhausted = results
        .iter()
        .filter(|r| matches!(r, Err(Error::PoolExhausted { .. })))
        .count();
    assert_eq!(served, 3);
    assert_eq!(exhausted, 2);
    assert_eq!(pool.metrics().exhausted, 2);
    assert!(factory.peak.load(Ordering::SeqCst) <= 3);

    let err = results.into_iter().find_map(Result::err).unwrap();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert!(err.is_retryable());
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiting_callers_get_freed_slots() {
    let factory = Arc::new(TestFactory::default());
    let config = EndpointConfig::new()
        .min_idle(0)
        .max_idle(2)
        .max_size(2)
        .acquire_timeout(Duration::from_secs(3));
    let pool = start(PoolConfig::new().endpoint("Echo", config), &factory).await;

    let burst = (0..6).map(|i| {
        pool.submit("Echo", json!({"sleep_ms": 30}), ctx(&format!("w-{i}")))
    });
    for result in futures::future::join_all(burst).await {
        result.unwrap();
    }
    assert!(factory.peak.load(Ordering::SeqCst) <= 2);
    assert!(pool.status("Echo").unwrap().total() <= 2);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiting_caller_times_out() {
    let factory = Arc::new(TestFactory::default());
    let config = EndpointConfig::new()
        .min_idle(0)
        .max_idle(1)
        .max_size(1)
        .acquire_timeout(Duration::from_millis(50));
    let pool = start(PoolConfig::new().endpoint("Echo", config), &factory).await;

    let slow = pool.submit("Echo", json!({"sleep_ms": 300}), ctx("slow"));
    let waiting = async {
        sleep(Duration::from_millis(10)).await;
        pool.submit("Echo", json!({}), ctx("waiting")).await
    };
    let (slow, waiting) = tokio::join!(slow, waiting);
    slow.unwrap();
    assert!(matches!(waiting, Err(Error::AcquireTimeout { .. })));
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_and_duplicate_completions_never_cross_requests() {
    let factory = Arc::new(TestFactory::default());
    let reused = EndpointConfig::new()
        .min_idle(1)
        .max_idle(1)
        .max_size(1)
        .reuse(ReusePolicy::Reuse);
    let pool = start(
        PoolConfig::new()
            .endpoint("Duplicating", reused)
            .endpoint("Echo", EndpointConfig::new()),
        &factory,
    )
    .await;

    let background = {
        let pool = pool.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                pool.submit("Echo", json!({"bg": i}), ctx(&format!("bg-{i}")))
                    .await
                    .unwrap();
            }
        })
    };

    for round in 0..5 {
        let a = json!({"request": "A", "round": round});
        let b = json!({"request": "B", "round": round});
        let response_a = pool
            .submit("Duplicating", a.clone(), ctx(&format!("a-{round}")))
            .await
            .unwrap();
        let response_b = pool
            .submit("Duplicating", b.clone(), ctx(&format!("b-{round}")))
            .await
            .unwrap();
        assert_eq!(response_a, a);
        assert_eq!(response_b, b);
    }
    background.await.unwrap();

    let metrics = pool.endpoint_metrics("Duplicating").unwrap();
    assert!(metrics.anomalies > 0);
    // Every tainted slot was thrown away rather than reused.
    assert!(metrics.slots_discarded > 0);
    assert_eq!(pool.endpoint_metrics("Echo").unwrap().anomalies, 0);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeout_is_isolated_to_its_slot_and_endpoint() {
    let factory = Arc::new(TestFactory::default());
    let slow = EndpointConfig::new()
        .min_idle(1)
        .max_idle(2)
        .request_timeout(Duration::from_millis(50))
        .reuse(ReusePolicy::Reuse);
    let pool = start(
        PoolConfig::new()
            .endpoint("Slow", slow)
            .endpoint("Echo", EndpointConfig::new()),
        &factory,
    )
    .await;

    let hung = pool.submit("Slow", json!({"sleep_ms": 500}), ctx("hung"));
    let fast = async {
        let mut instances = Vec::new();
        for i in 0..5 {
            let response = pool
                .submit("Echo", json!({"i": i}), ctx(&format!("f-{i}")))
                .await
                .unwrap();
            instances.push(response["instance"].as_u64().unwrap());
        }
        instances
    };
    let (hung, _fast) = tokio::join!(hung, fast);
    let err = hung.unwrap_err();
    assert!(matches!(err, Error::DispatchTimeout { .. }));
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let status = pool.status("Slow").unwrap();
    assert_eq!(status.busy, 0);
    let metrics = pool.endpoint_metrics("Slow").unwrap();
    assert_eq!(metrics.timeouts, 1);
    assert!(metrics.slots_discarded >= 1);

    // The next request lands on a healthy instance.
    let response = pool.submit("Slow", json!({}), ctx("after")).await.unwrap();
    assert_eq!(response["seen"], 1);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn business_errors_keep_reusable_slots() {
    let factory = Arc::new(TestFactory::default());
    let config = EndpointConfig::new()
        .min_idle(1)
        .max_idle(1)
        .max_size(1)
        .reuse(ReusePolicy::Reuse);
    let pool = start(PoolConfig::new().endpoint("Echo", config), &factory).await;

    let err = pool
        .submit("Echo", json!({"fail": true}), ctx("f"))
        .await
        .unwrap_err();
    match &err {
        Error::HandlerError { failure, .. } => assert_eq!(failure.code, "invalid_input"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::Handler);
    assert!(!err.is_retryable());

    let response = pool.submit("Echo", json!({}), ctx("ok")).await.unwrap();
    assert_eq!(response["seen"], 2);
    assert_eq!(factory.created(), 1);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crashed_handler_reports_disconnect() {
    let factory = Arc::new(TestFactory::default());
    let pool = start(
        PoolConfig::new().endpoint("Echo", EndpointConfig::new()),
        &factory,
    )
    .await;

    let err = pool
        .submit("Echo", json!({"panic": true}), ctx("boom"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HandlerDisconnected { .. }));
    assert_eq!(pool.metrics().disconnects, 1);

    pool.submit("Echo", json!({}), ctx("after")).await.unwrap();
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_idle_leak_after_failures() {
    let factory = Arc::new(TestFactory::default());
    let config = EndpointConfig::new()
        .min_idle(2)
        .max_idle(3)
        .max_size(6)
        .request_timeout(Duration::from_millis(40));
    let pool = start(PoolConfig::new().endpoint("Echo", config), &factory).await;

    let mixed = (0..12).map(|i| {
        let request = match i % 3 {
            0 => json!({"sleep_ms": 200}),
            1 => json!({"fail": true}),
            _ => json!({}),
        };
        pool.submit("Echo", request, ctx(&format!("m-{i}")))
    });
    let _results = futures::future::join_all(mixed).await;

    let settled = eventually(|| {
        let status = pool.status("Echo").unwrap();
        status.busy == 0 && status.spawning == 0 && status.idle == 2
    })
    .await;
    assert!(settled, "pool did not settle: {:?}", pool.status("Echo"));
    assert!(pool.metrics().replacement_spawns > 0);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn discarded_slots_are_replaced_in_the_background() {
    let factory = Arc::new(TestFactory::default());
    let pool = start(
        PoolConfig::new().endpoint("Echo", EndpointConfig::new()),
        &factory,
    )
    .await;

    pool.submit("Echo", json!({}), ctx("one")).await.unwrap();
    assert!(
        eventually(|| pool.status("Echo").is_some_and(|s| s.idle == 2)).await,
        "idle set not restored"
    );
    let metrics = pool.metrics();
    assert_eq!(metrics.replacement_spawns, 1);
    assert_eq!(metrics.slots_discarded, 1);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_caller_discards_its_slot() {
    let factory = Arc::new(TestFactory::default());
    let config = EndpointConfig::new()
        .min_idle(1)
        .max_idle(1)
        .max_size(2)
        .reuse(ReusePolicy::Reuse);
    let pool = start(PoolConfig::new().endpoint("Echo", config), &factory).await;

    let abandoned = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.submit("Echo", json!({"sleep_ms": 500}), ctx("gone"))
                .await
        })
    };
    sleep(Duration::from_millis(50)).await;
    abandoned.abort();
    let _ = abandoned.await;

    assert_eq!(pool.status("Echo").unwrap().busy, 0);
    assert_eq!(pool.metrics().slots_discarded, 1);

    let response = pool.submit("Echo", json!({}), ctx("next")).await.unwrap();
    assert_eq!(response["seen"], 1);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_cold_spawn_returns_its_capacity() {
    let factory = Arc::new(TestFactory::slow(Duration::from_millis(300)));
    let config = EndpointConfig::new()
        .min_idle(0)
        .max_idle(1)
        .max_size(1)
        .backpressure(Backpressure::FailFast);
    let pool = start(PoolConfig::new().endpoint("Echo", config), &factory).await;

    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        pool.submit("Echo", json!({}), ctx("impatient")),
    )
    .await;
    assert!(cancelled.is_err());

    let status = pool.status("Echo").unwrap();
    assert_eq!(status.spawning, 0, "reservation leaked: {status:?}");
    assert_eq!(status.total(), 0);

    let response = pool.submit("Echo", json!({"n": 2}), ctx("patient")).await.unwrap();
    assert_eq!(response["echo"]["n"], 2);
    assert_eq!(pool.metrics().cold_spawns, 2);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_endpoint_is_rejected() {
    let factory = Arc::new(TestFactory::default());
    let pool = start(
        PoolConfig::new().endpoint("Echo", EndpointConfig::new()),
        &factory,
    )
    .await;

    let err = pool
        .submit("Missing", json!({}), ctx("r"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownEndpoint { ref endpoint } if endpoint == "Missing"));
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!pool.has_endpoint("Missing"));
    assert_eq!(pool.endpoints().collect::<Vec<_>>(), ["Echo"]);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_prewarm_fails_startup() {
    let factory = Arc::new(TestFactory::failing_from(1));
    let result = HandlerPool::start(
        PoolConfig::new().endpoint("Echo", EndpointConfig::new()),
        Arc::clone(&factory),
    )
    .await;
    assert!(matches!(
        result,
        Err(Error::SpawnFailure {
            source: SpawnError::Init(_),
            ..
        })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cold_spawn_failure_is_reported() {
    let factory = Arc::new(TestFactory::failing_from(0));
    let config = EndpointConfig::new().min_idle(0).max_idle(0);
    let pool = start(PoolConfig::new().endpoint("Echo", config), &factory).await;

    let err = pool.submit("Echo", json!({}), ctx("r")).await.unwrap_err();
    assert!(matches!(err, Error::SpawnFailure { .. }));
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(pool.status("Echo").unwrap().total(), 0);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_config_is_rejected_before_spawning() {
    let factory = Arc::new(TestFactory::default());
    let result = HandlerPool::start(
        PoolConfig::new().endpoint("Echo", EndpointConfig::new().min_idle(5).max_idle(4)),
        Arc::clone(&factory),
    )
    .await;
    assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    assert_eq!(factory.created(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_drains_in_flight_then_refuses() {
    let factory = Arc::new(TestFactory::default());
    let pool = start(
        PoolConfig::new()
            .endpoint("Echo", EndpointConfig::new())
            .shutdown_grace(Duration::from_secs(2)),
        &factory,
    )
    .await;

    let in_flight = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.submit("Echo", json!({"sleep_ms": 100}), ctx("late"))
                .await
        })
    };
    sleep(Duration::from_millis(20)).await;
    pool.shutdown().await;

    assert!(in_flight.await.unwrap().is_ok());
    assert!(pool.is_closed());
    let err = pool.submit("Echo", json!({}), ctx("after")).await.unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));
    let status = pool.status("Echo").unwrap();
    assert_eq!(status.total(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_cancels_work_past_the_grace_period() {
    let factory = Arc::new(TestFactory::default());
    let pool = start(
        PoolConfig::new()
            .endpoint("Echo", EndpointConfig::new())
            .shutdown_grace(Duration::from_millis(50)),
        &factory,
    )
    .await;

    let in_flight = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.submit("Echo", json!({"sleep_ms": 1000}), ctx("stuck"))
                .await
        })
    };
    sleep(Duration::from_millis(20)).await;
    pool.shutdown().await;

    let result = in_flight.await.unwrap();
    assert!(matches!(result, Err(Error::ShuttingDown)));
}
