//! End-to-end tests driven against a real (ephemeral, loopback) HTTP server
//! rather than mocked transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::response::{IntoResponse, Redirect};
use axum::routing::get;
use axum::Router;

use dispatcher_common::clock::{Clock, SystemClock};
use dispatcher_common::config::{Config, EnvMsDuration};
use dispatcher_common::error_value::ErrorValue;
use dispatcher_common::headers::HeaderMultiMap;
use dispatcher_common::job_queue::{FakeJobQueue, JobPayload};
use dispatcher_common::kv::FakeKv;
use dispatcher_common::request::{Method, Request};
use dispatcher_common::response::{CallbackArgs, Response};
use dispatcher_common::task::{RequestTask, TaskHandler};
use dispatcher_core::registry::InflightRegistry;
use dispatcher_core::Dispatcher;

#[derive(Default)]
struct Recorder {
    completes: Mutex<Vec<Response>>,
    errors: Mutex<Vec<ErrorValue>>,
    retries: AtomicUsize,
}

#[async_trait::async_trait]
impl TaskHandler for Recorder {
    async fn on_complete(&self, response: &Response, _callback_class_name: &str) {
        self.completes.lock().unwrap().push(response.clone());
    }

    async fn on_error(&self, error: &ErrorValue, _callback_class_name: &str) {
        self.errors.lock().unwrap().push(error.clone());
    }

    async fn retry(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }
}

fn get_request(url: &str) -> Request {
    Request::new(Method::Get, url, HeaderMultiMap::new(), None, None, None, None).unwrap()
}

fn post_request(url: &str, body: Vec<u8>) -> Request {
    Request::new(Method::Post, url, HeaderMultiMap::new(), Some(body), None, None, None).unwrap()
}

fn base_config() -> Config {
    Config {
        max_connections: 128,
        request_timeout: EnvMsDuration(Duration::from_secs(5)),
        shutdown_timeout: EnvMsDuration(Duration::from_millis(500)),
        max_response_size: 10 * 1024 * 1024,
        user_agent: None,
        raise_error_responses: false,
        max_redirects: 10,
        connection_pool_size: 16,
        connection_timeout: None,
        proxy_url: None,
        retries: 0,
        payload_store_threshold: 65536,
        heartbeat_interval: EnvMsDuration(Duration::from_millis(50)),
        orphan_threshold: EnvMsDuration(Duration::from_millis(500)),
        host: "0.0.0.0".into(),
        port: 0,
        redis_url: "redis://localhost/".into(),
    }
}

async fn new_dispatcher(config: Config) -> Dispatcher {
    let dispatcher = Dispatcher::new(
        config,
        Arc::new(FakeKv::new()),
        Arc::new(FakeJobQueue::new()),
        Arc::new(SystemClock),
        "test-process",
    );
    dispatcher.start().await.unwrap();
    dispatcher
}

async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn happy_get_completes_with_body_and_clears_inflight_gauge() {
    let app = Router::new().route(
        "/pong",
        get(|| async {
            tokio::time::sleep(Duration::from_millis(25)).await;
            "pong"
        }),
    );
    let base = spawn_server(app).await;

    let dispatcher = new_dispatcher(base_config()).await;
    let recorder = Arc::new(Recorder::default());
    let task = RequestTask::new(get_request(&format!("{base}/pong")), recorder.clone(), "Cb", CallbackArgs::new(), false, 10);

    dispatcher.enqueue(task).unwrap();
    assert!(dispatcher.wait_for_idle(Duration::from_secs(2)).await);

    let completes = recorder.completes.lock().unwrap();
    assert_eq!(completes.len(), 1);
    assert_eq!(completes[0].status, 200);
    assert_eq!(completes[0].body.as_ref().unwrap().value, "pong");
    assert!(completes[0].duration >= Duration::from_millis(20));
    assert!(completes[0].redirects.is_empty());

    dispatcher.stop(Duration::from_secs(1)).await;
}

#[derive(Clone, Default)]
struct RedirectState;

async fn redirect_from_a(State(_): State<RedirectState>) -> impl IntoResponse {
    Redirect::to("/b")
}

#[tokio::test]
async fn redirect_chain_follows_as_get_without_body() {
    let app = Router::new()
        .route("/a", axum::routing::post(redirect_from_a))
        .route("/b", get(|| async { "done" }))
        .with_state(RedirectState);
    let base = spawn_server(app).await;

    let dispatcher = new_dispatcher(base_config()).await;
    let recorder = Arc::new(Recorder::default());
    let task = RequestTask::new(
        post_request(&format!("{base}/a"), b"X".to_vec()),
        recorder.clone(),
        "Cb",
        CallbackArgs::new(),
        false,
        10,
    );
    let root_id = task.id();

    dispatcher.enqueue(task).unwrap();
    assert!(dispatcher.wait_for_idle(Duration::from_secs(2)).await);

    let completes = recorder.completes.lock().unwrap();
    assert_eq!(completes.len(), 1);
    assert_eq!(completes[0].status, 200);
    assert_eq!(completes[0].redirects, vec![format!("{base}/a")]);
    assert_eq!(completes[0].request_id, format!("{root_id}/2"));

    dispatcher.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn oversized_response_yields_response_too_large_error() {
    let app = Router::new().route("/large", get(|| async { vec![0u8; 2048] }));
    let base = spawn_server(app).await;

    let mut config = base_config();
    config.max_response_size = 1024;
    let dispatcher = new_dispatcher(config).await;

    let recorder = Arc::new(Recorder::default());
    let task = RequestTask::new(get_request(&format!("{base}/large")), recorder.clone(), "Cb", CallbackArgs::new(), false, 10);

    dispatcher.enqueue(task).unwrap();
    assert!(dispatcher.wait_for_idle(Duration::from_secs(2)).await);

    assert!(recorder.completes.lock().unwrap().is_empty());
    let errors = recorder.errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        &errors[0],
        ErrorValue::Transport {
            kind: dispatcher_common::error_value::TransportKind::ResponseTooLarge,
            ..
        }
    ));

    dispatcher.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn capacity_is_refused_at_max_connections() {
    let app = Router::new().route(
        "/slow",
        get(|| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            "ok"
        }),
    );
    let base = spawn_server(app).await;

    let mut config = base_config();
    config.max_connections = 2;
    let dispatcher = new_dispatcher(config).await;

    let r1 = Arc::new(Recorder::default());
    let r2 = Arc::new(Recorder::default());
    dispatcher
        .enqueue(RequestTask::new(get_request(&format!("{base}/slow")), r1.clone(), "Cb", CallbackArgs::new(), false, 10))
        .unwrap();
    dispatcher
        .enqueue(RequestTask::new(get_request(&format!("{base}/slow")), r2.clone(), "Cb", CallbackArgs::new(), false, 10))
        .unwrap();

    assert!(dispatcher.wait_for_processing(Duration::from_secs(1)).await);
    // Give both requests a chance to move from pending to inflight before
    // probing capacity; only `inflight_count` is checked on enqueue.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let r3 = Arc::new(Recorder::default());
    let err = dispatcher
        .enqueue(RequestTask::new(get_request(&format!("{base}/slow")), r3, "Cb", CallbackArgs::new(), false, 10))
        .unwrap_err();
    assert!(matches!(err, dispatcher_core::error::DispatcherError::Refused));

    assert!(dispatcher.wait_for_idle(Duration::from_secs(2)).await);
    assert_eq!(r1.completes.lock().unwrap().len(), 1);
    assert_eq!(r2.completes.lock().unwrap().len(), 1);

    dispatcher.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn stop_retries_stranded_tasks_exactly_once() {
    let app = Router::new().route(
        "/slow",
        get(|| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            "ok"
        }),
    );
    let base = spawn_server(app).await;

    // Share the KV/job queue with a second, independent registry standing in
    // for another live process, so this test can also assert that `Stop`'s
    // own cleanup leaves nothing behind for that process's orphan GC to
    // re-discover and double-`Push`.
    let shared_kv = Arc::new(FakeKv::new());
    let shared_job_queue = Arc::new(FakeJobQueue::new());
    let dispatcher = Dispatcher::new(base_config(), shared_kv.clone(), shared_job_queue.clone(), Arc::new(SystemClock), "stopping-process");
    dispatcher.start().await.unwrap();

    let r1 = Arc::new(Recorder::default());
    let r2 = Arc::new(Recorder::default());
    dispatcher
        .enqueue(RequestTask::new(get_request(&format!("{base}/slow")), r1.clone(), "Cb", CallbackArgs::new(), false, 10))
        .unwrap();
    dispatcher
        .enqueue(RequestTask::new(get_request(&format!("{base}/slow")), r2.clone(), "Cb", CallbackArgs::new(), false, 10))
        .unwrap();

    assert!(dispatcher.wait_for_processing(Duration::from_secs(1)).await);

    dispatcher.stop(Duration::from_millis(50)).await;

    assert!(r1.completes.lock().unwrap().is_empty());
    assert!(r2.completes.lock().unwrap().is_empty());
    assert_eq!(r1.retries.load(Ordering::SeqCst), 1);
    assert_eq!(r2.retries.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.state(), dispatcher_core::State::Stopped);

    // A different process's orphan GC must find nothing left to re-enqueue:
    // `Stop` already removed this process's own inflight KV entries.
    let other_process_registry = InflightRegistry::new(shared_kv, shared_job_queue.clone(), "other-process");
    assert!(other_process_registry.acquire_gc_lock(Duration::from_secs(5)).await.unwrap());
    let cleaned = other_process_registry.cleanup_orphans(Duration::from_millis(1), SystemClock.now_ms()).await.unwrap();
    assert_eq!(cleaned, 0);
    assert!(shared_job_queue.pushed().is_empty());
}

#[tokio::test]
async fn callback_args_round_trip_as_a_json_envelope() {
    let app = Router::new().route("/pong", get(|| async { "pong" }));
    let base = spawn_server(app).await;

    let dispatcher = new_dispatcher(base_config()).await;
    let recorder = Arc::new(Recorder::default());

    let mut callback_args = CallbackArgs::new();
    callback_args.insert("user_id".to_owned(), serde_json::json!(42));
    let task = RequestTask::new(get_request(&format!("{base}/pong")), recorder.clone(), "Cb", callback_args.clone(), false, 10);

    dispatcher.enqueue(task).unwrap();
    assert!(dispatcher.wait_for_idle(Duration::from_secs(2)).await);

    let completes = recorder.completes.lock().unwrap();
    let json = serde_json::to_value(&completes[0]).unwrap();
    let back: Response = serde_json::from_value(json).unwrap();
    assert_eq!(back.callback_args, callback_args);

    dispatcher.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn orphan_gc_re_enqueues_a_stranded_entry_from_a_dead_process() {
    // Shared KV and job queue simulate the cross-process visibility an
    // `InflightRegistry` relies on: the entry below is written by a
    // registry standing in for a different, now-dead process, and the
    // running dispatcher's own monitor discovers and re-enqueues it.
    let shared_kv = Arc::new(FakeKv::new());
    let shared_job_queue = Arc::new(FakeJobQueue::new());
    let clock = SystemClock;

    let dead_process_registry = InflightRegistry::new(shared_kv.clone(), shared_job_queue.clone(), "dead-process");
    let stale_payload = JobPayload {
        class: "OrphanCallback".into(),
        jid: "orphan-task".into(),
        args: vec![serde_json::json!({"task_id": "orphan-task"})],
    };
    // Registered with a timestamp 10s in the past: well past the
    // orphan_threshold configured below, so the live dispatcher's monitor
    // should treat it as abandoned.
    dead_process_registry
        .register("orphan-task", clock.now_ms() - 10_000, &stale_payload, Duration::from_secs(60))
        .await
        .unwrap();

    let mut config = base_config();
    config.heartbeat_interval = EnvMsDuration(Duration::from_millis(100));
    config.orphan_threshold = EnvMsDuration(Duration::from_millis(300));

    let dispatcher = Dispatcher::new(config, shared_kv, shared_job_queue.clone(), Arc::new(SystemClock), "live-process");
    dispatcher.start().await.unwrap();

    // Give the monitor several heartbeat/GC cycles to notice and clean up
    // the orphan; well within spec's "within 6s" bound for much shorter
    // intervals.
    let mut pushed = Vec::new();
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        pushed = shared_job_queue.pushed();
        if !pushed.is_empty() {
            break;
        }
    }

    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].jid, "orphan-task");

    dispatcher.stop(Duration::from_secs(1)).await;
}
