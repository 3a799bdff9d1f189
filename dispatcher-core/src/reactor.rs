//! The `Reactor`: a single-threaded cooperative scheduler running on its own
//! OS thread. A dedicated thread hosting a `tokio::task::LocalSet` gives
//! cooperative per-task fibers that suspend only at I/O and explicit
//! timers; redirect followers run in the same `LocalSet` task as their
//! predecessor rather than being re-queued.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dispatcher_common::clock::Clock;
use dispatcher_common::error_value::{ErrorContext, ErrorValue, TransportKind};
use dispatcher_common::headers::HeaderMultiMap;
use dispatcher_common::job_queue::JobPayload;
use dispatcher_common::payload::encode_body;
use dispatcher_common::response::Response;
use dispatcher_common::task::RequestTask;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::lifecycle::LifecycleManager;
use crate::pool::HttpClientPool;
use crate::registry::InflightRegistry;
use crate::tasks_state::TasksState;

const CHANNEL_RECV_TIMEOUT: Duration = Duration::from_millis(100);
const EMPTY_POLL_SLEEP: Duration = Duration::from_millis(10);
const INFLIGHT_PUBLISH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ReactorConfig {
    pub max_connections: usize,
    pub request_timeout: Duration,
    pub max_response_size: usize,
    pub user_agent: Option<String>,
    pub raise_error_responses: bool,
    pub orphan_threshold: Duration,
}

pub struct Reactor {
    config: ReactorConfig,
    pool: Arc<HttpClientPool>,
    registry: Arc<InflightRegistry>,
    lifecycle: Arc<LifecycleManager>,
    tasks: Arc<TasksState>,
    clock: Arc<dyn Clock>,
}

impl Reactor {
    pub fn new(
        config: ReactorConfig,
        pool: Arc<HttpClientPool>,
        registry: Arc<InflightRegistry>,
        lifecycle: Arc<LifecycleManager>,
        tasks: Arc<TasksState>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            pool,
            registry,
            lifecycle,
            tasks,
            clock,
        }
    }

    /// Spawn the reactor on a dedicated OS thread with its own current-thread
    /// runtime and `LocalSet`. Returns the channel used by `Enqueue` and the
    /// thread's join handle.
    pub fn spawn(self) -> (mpsc::UnboundedSender<RequestTask>, std::thread::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = std::thread::Builder::new()
            .name("async-http-reactor".into())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build reactor runtime");
                let local = tokio::task::LocalSet::new();
                local.block_on(&runtime, self.run(rx));
            })
            .expect("failed to spawn reactor thread");
        (tx, handle)
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<RequestTask>) {
        let inner = Arc::new(self);
        inner.lifecycle.mark_running();
        info!("reactor started");

        let mut last_publish = Instant::now();

        loop {
            if matches!(
                inner.lifecycle.state(),
                crate::lifecycle::State::Stopping | crate::lifecycle::State::Stopped
            ) {
                break;
            }

            if last_publish.elapsed() >= INFLIGHT_PUBLISH_INTERVAL {
                let inflight = inner.tasks.inflight_count();
                metrics::gauge!("async_http_inflight_count").set(inflight as f64);
                metrics::gauge!("async_http_max_connections").set(inner.config.max_connections as f64);
                last_publish = Instant::now();
            }

            match tokio::time::timeout(CHANNEL_RECV_TIMEOUT, rx.recv()).await {
                Ok(Some(task)) => {
                    let handler = task.task_handler().clone();
                    inner.tasks.insert_pending(task.id(), handler);
                    let inner = inner.clone();
                    tokio::task::spawn_local(async move {
                        inner.process_request(task).await;
                    });
                }
                Ok(None) => break, // channel closed
                Err(_timeout) => {
                    tokio::time::sleep(EMPTY_POLL_SLEEP).await;
                }
            }
        }

        info!("reactor exiting main loop");
    }

    async fn process_request(self: Arc<Self>, mut task: RequestTask) {
        let task_id = task.id();
        self.tasks.move_to_inflight(&task_id, task.task_handler().clone());

        let job_payload = JobPayload {
            class: task.callback_class_name.clone(),
            jid: task_id.clone(),
            args: vec![serde_json::json!({"root_id": task.root_id(), "task_id": task_id})],
        };
        if let Err(e) = self
            .registry
            .register(&task_id, self.clock.now_ms(), &job_payload, self.config.orphan_threshold)
            .await
        {
            warn!("failed to register task {task_id} with inflight registry: {e}");
        }

        task.started();
        metrics::counter!("async_http_requests_started").increment(1);

        let outcome = drive_request(&self.config, &self.pool, &mut task).await;

        match outcome {
            Ok(Outcome::Completed(response)) => {
                task.completed(response).await;
                metrics::counter!("async_http_requests_completed").increment(1);
            }
            Ok(Outcome::Errored(error_value)) => {
                task.errored(error_value).await;
                metrics::counter!("async_http_requests_errored").increment(1);
            }
            Err(transport_error) => {
                task.errored_transport(&transport_error).await;
                metrics::counter!("async_http_requests_errored").increment(1);
            }
        }

        self.tasks.remove(&task_id);
        if let Err(e) = self.registry.unregister(&task_id).await {
            warn!("failed to unregister task {task_id} from inflight registry: {e}");
        }
    }
}

pub enum Outcome {
    Completed(Response),
    Errored(ErrorValue),
}

fn error_context(task: &RequestTask) -> ErrorContext {
    ErrorContext {
        url: task.request.url.clone(),
        http_method: task.request.method,
        duration: task.duration().unwrap_or_default(),
        request_id: task.id(),
        callback_args: task.callback_args.clone(),
    }
}

/// Builds the request, issues it, follows redirects in the same fiber, and
/// classifies the final outcome. Shared by the reactor's per-task fiber and
/// `SynchronousExecutor`.
pub async fn drive_request(config: &ReactorConfig, pool: &HttpClientPool, task: &mut RequestTask) -> Result<Outcome, reqwest::Error> {
    loop {
        let request = task.request.clone();
        let url = match url::Url::parse(&request.url) {
            Ok(u) => u,
            Err(_) => {
                return Ok(Outcome::Errored(ErrorValue::transport(
                    TransportKind::Unknown,
                    "url::ParseError",
                    "invalid request url",
                    error_context(task),
                )));
            }
        };

        let client = match pool.client_for(&url) {
            Ok(c) => c,
            Err(e) => {
                return Ok(Outcome::Errored(ErrorValue::transport(
                    TransportKind::Connection,
                    "PoolError",
                    e.to_string(),
                    error_context(task),
                )));
            }
        };

        let mut builder = client.request(request.method.into(), url.clone());
        let mut headers: reqwest::header::HeaderMap = (&request.headers).try_into().unwrap_or_default();
        if !headers.contains_key("x-request-id") {
            headers.insert(
                "x-request-id",
                reqwest::header::HeaderValue::from_str(&task.id()).unwrap_or_else(|_| reqwest::header::HeaderValue::from_static("unknown")),
            );
        }
        if !headers.contains_key(reqwest::header::USER_AGENT) {
            if let Some(ua) = &config.user_agent {
                if let Ok(value) = reqwest::header::HeaderValue::from_str(ua) {
                    headers.insert(reqwest::header::USER_AGENT, value);
                }
            }
        }
        builder = builder.headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        let timeout = request.timeout.unwrap_or(config.request_timeout);
        builder = builder.timeout(timeout);

        let start = Instant::now();
        let send_result = builder.send().await;

        let response = match send_result {
            Ok(r) => r,
            Err(e) => return Err(e),
        };

        let status = response.status().as_u16();
        let resp_headers = HeaderMultiMap::from(response.headers());

        if (300..400).contains(&status) {
            if let Some(location) = resp_headers.get("location") {
                match task.redirect_to(status, location) {
                    Ok(next) => {
                        *task = next;
                        continue;
                    }
                    Err(redirect_err) => {
                        if let Some(error_value) = task.redirect_error_value(&redirect_err) {
                            return Ok(Outcome::Errored(error_value));
                        }
                        // MissingLocation/InvalidLocation: fall through and
                        // treat the 3xx as a terminal response instead.
                        let _ = redirect_err;
                    }
                }
            }
        }

        let content_type = resp_headers.get("content-type").unwrap_or("").to_owned();
        let body_bytes = match read_body_capped(response, config.max_response_size).await {
            Ok(b) => b,
            Err(()) => {
                return Ok(Outcome::Errored(ErrorValue::transport(
                    TransportKind::ResponseTooLarge,
                    "ResponseTooLarge",
                    "response body exceeded max_response_size",
                    error_context(task),
                )));
            }
        };

        let encoded_body = (!body_bytes.is_empty()).then(|| encode_body(&body_bytes, &content_type));
        let duration = start.elapsed();

        let response = Response {
            status,
            headers: resp_headers,
            body: encoded_body,
            duration,
            request_id: task.id(),
            url: request.url.clone(),
            http_method: request.method,
            callback_args: task.callback_args.clone(),
            redirects: task.redirects.clone(),
        };

        if config.raise_error_responses && !(200..300).contains(&status) {
            return Ok(Outcome::Errored(ErrorValue::Http { response }));
        }
        return Ok(Outcome::Completed(response));
    }
}

async fn read_body_capped(response: reqwest::Response, max_size: usize) -> Result<Vec<u8>, ()> {
    if let Some(len) = response.content_length() {
        if len as usize > max_size {
            return Err(());
        }
    }

    use futures::StreamExt;
    let mut stream = response.bytes_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|_| ())?;
        if buf.len() + chunk.len() > max_size {
            return Err(());
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}
