//! `RequestTask`: the mutable, single-owner lifecycle object wrapping a
//! `Request` as it moves through `created → enqueued → started → (completed |
//! errored)`.
//!
//! A `RequestTask` is moved into the reactor's per-task future at `started`
//! and is never shared behind a lock; registries hold a reference only to
//! read `id`/`queue`/timestamps for bookkeeping, never to mutate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error_value::{ErrorContext, ErrorValue, RedirectKind};
use crate::request::{Method, Request};
use crate::response::{CallbackArgs, Response};

/// Callback identity + re-enqueue hook, provided by the producer. Mirrors the
/// shape of `hook_common`'s job-completion hooks, generalized to cover the
/// redirect/error/retry paths this spec requires.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    async fn on_complete(&self, response: &Response, callback_class_name: &str);
    async fn on_error(&self, error: &ErrorValue, callback_class_name: &str);
    /// Re-enqueue the original producer job. Must be safe to call at most
    /// once per task; implementations typically re-push the original job
    /// hash to the host job system.
    async fn retry(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Enqueued,
    Started,
    Completed,
    Errored,
}

/// The observable terminal outcome of a task, once it has one.
#[derive(Debug, Clone)]
pub enum Outcome {
    Response(Response),
    Error(ErrorValue),
}

#[derive(thiserror::Error, Debug)]
pub enum RedirectError {
    #[error("redirect response had no Location header")]
    MissingLocation,
    #[error("redirect location is not a valid URL relative to {0}")]
    InvalidLocation(String),
    #[error("too many redirects")]
    TooMany,
    #[error("recursive redirect detected")]
    Recursive,
}

/// A single HTTP transaction's worth of lifecycle state, from admission
/// through to a terminal response or error.
pub struct RequestTask {
    root_id: String,
    hop: u32,
    pub request: Request,
    task_handler: Arc<dyn TaskHandler>,
    pub callback_class_name: String,
    pub callback_args: CallbackArgs,
    pub raise_error_responses: bool,
    pub redirects: Vec<String>,
    pub default_max_redirects: u32,

    state: State,
    enqueued_at: Option<Instant>,
    started_at: Option<Instant>,
    completed_at: Option<Instant>,
    outcome: Option<Outcome>,
}

impl RequestTask {
    pub fn new(
        request: Request,
        task_handler: Arc<dyn TaskHandler>,
        callback_class_name: impl Into<String>,
        callback_args: CallbackArgs,
        raise_error_responses: bool,
        default_max_redirects: u32,
    ) -> Self {
        Self {
            root_id: Uuid::now_v7().to_string(),
            hop: 1,
            request,
            task_handler,
            callback_class_name: callback_class_name.into(),
            callback_args,
            raise_error_responses,
            redirects: Vec::new(),
            default_max_redirects,
            state: State::Created,
            enqueued_at: None,
            started_at: None,
            completed_at: None,
            outcome: None,
        }
    }

    /// The task id: the root UUID for the first hop, `"<root>/<hop>"` for
    /// tasks spawned by following a redirect.
    pub fn id(&self) -> String {
        if self.hop <= 1 {
            self.root_id.clone()
        } else {
            format!("{}/{}", self.root_id, self.hop)
        }
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn max_redirects(&self) -> u32 {
        self.request.max_redirects.unwrap_or(self.default_max_redirects)
    }

    pub fn is_enqueued(&self) -> bool {
        !matches!(self.state, State::Created)
    }

    pub fn is_started(&self) -> bool {
        matches!(self.state, State::Started | State::Completed | State::Errored)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, State::Completed | State::Errored)
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn task_handler(&self) -> &Arc<dyn TaskHandler> {
        &self.task_handler
    }

    /// `created → enqueued`. Monotonic: calling twice is a no-op on the
    /// timestamp (first call wins), matching "transitions are monotonic".
    pub fn enqueued(&mut self) {
        if self.enqueued_at.is_none() {
            self.enqueued_at = Some(Instant::now());
        }
        self.state = State::Enqueued;
    }

    /// `enqueued → started`.
    pub fn started(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
        self.state = State::Started;
    }

    /// Elapsed time since `started`, or `None` if not yet started.
    /// Uses `completed_at` if the task is terminal, else `Instant::now()`.
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Instant::now);
        Some(end.saturating_duration_since(started))
    }

    fn error_context(&self) -> ErrorContext {
        ErrorContext {
            url: self.request.url.clone(),
            http_method: self.request.method,
            duration: self.duration().unwrap_or_default(),
            request_id: self.id(),
            callback_args: self.callback_args.clone(),
        }
    }

    /// `started → completed`, delegating to `TaskHandler::on_complete`.
    pub async fn completed(&mut self, response: Response) {
        self.completed_at = Some(Instant::now());
        self.state = State::Completed;
        self.task_handler.on_complete(&response, &self.callback_class_name).await;
        self.outcome = Some(Outcome::Response(response));
    }

    /// `started → errored` from an already-classified `ErrorValue`,
    /// delegating to `TaskHandler::on_error`.
    pub async fn errored(&mut self, error: ErrorValue) {
        self.completed_at = Some(Instant::now());
        self.state = State::Errored;
        self.task_handler.on_error(&error, &self.callback_class_name).await;
        self.outcome = Some(Outcome::Error(error));
    }

    /// `started → errored` from a raw `reqwest::Error`, classifying it into
    /// a `Transport` `ErrorValue` first.
    pub async fn errored_transport(&mut self, error: &reqwest::Error) {
        let context = self.error_context();
        let value = ErrorValue::classify_reqwest_error(error, context);
        self.errored(value).await;
    }

    /// Construct the follower task for a 3xx response. Does not mutate
    /// `self`; the reactor replaces its working task with the result and
    /// loops without re-queueing.
    pub fn redirect_to(&self, status: u16, location: &str) -> Result<RequestTask, RedirectError> {
        if location.is_empty() {
            return Err(RedirectError::MissingLocation);
        }

        if self.redirects.len() as u32 >= self.max_redirects() {
            return Err(RedirectError::TooMany);
        }

        let base = url::Url::parse(&self.request.url).map_err(|_| RedirectError::InvalidLocation(self.request.url.clone()))?;
        let resolved = base
            .join(location)
            .map_err(|_| RedirectError::InvalidLocation(location.to_owned()))?
            .to_string();

        if resolved == self.request.url || self.redirects.contains(&resolved) {
            return Err(RedirectError::Recursive);
        }

        let preserve_method_and_body = matches!(status, 307 | 308);
        let (method, body) = if preserve_method_and_body {
            (self.request.method, self.request.body.clone())
        } else {
            (Method::Get, None)
        };

        let mut redirects = self.redirects.clone();
        redirects.push(self.request.url.clone());

        let request = Request {
            method,
            url: resolved,
            headers: self.request.headers.clone(),
            body,
            timeout: self.request.timeout,
            max_redirects: self.request.max_redirects,
        };

        Ok(RequestTask {
            root_id: self.root_id.clone(),
            hop: self.hop + 1,
            request,
            task_handler: self.task_handler.clone(),
            callback_class_name: self.callback_class_name.clone(),
            callback_args: self.callback_args.clone(),
            raise_error_responses: self.raise_error_responses,
            redirects,
            default_max_redirects: self.default_max_redirects,
            state: State::Started,
            enqueued_at: self.enqueued_at,
            started_at: self.started_at,
            completed_at: None,
            outcome: None,
        })
    }

    /// Build the terminal `Redirect` `ErrorValue` for a `RedirectError`,
    /// using `self` (the task that failed to redirect further) as context.
    pub fn redirect_error_value(&self, error: &RedirectError) -> Option<ErrorValue> {
        let kind = match error {
            RedirectError::TooMany => RedirectKind::TooMany,
            RedirectError::Recursive => RedirectKind::Recursive,
            RedirectError::MissingLocation | RedirectError::InvalidLocation(_) => return None,
        };
        Some(ErrorValue::redirect(kind, self.redirects.clone(), self.error_context()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderMultiMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        completes: AtomicUsize,
        errors: AtomicUsize,
        retries: AtomicUsize,
        last: Mutex<Option<String>>,
    }

    #[async_trait::async_trait]
    impl TaskHandler for RecordingHandler {
        async fn on_complete(&self, response: &Response, _callback_class_name: &str) {
            self.completes.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().await = Some(format!("complete:{}", response.status));
        }

        async fn on_error(&self, error: &ErrorValue, _callback_class_name: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().await = Some(format!("error:{error:?}"));
        }

        async fn retry(&self) {
            self.retries.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn task(handler: Arc<RecordingHandler>) -> RequestTask {
        let request = Request::new(Method::Get, "http://x.test/a", HeaderMultiMap::new(), None, None, None, None).unwrap();
        RequestTask::new(request, handler, "MyCallback", CallbackArgs::new(), false, 20)
    }

    #[test]
    fn root_id_is_the_task_id_for_the_first_hop() {
        let handler = Arc::new(RecordingHandler::default());
        let t = task(handler);
        assert_eq!(t.id(), t.root_id());
    }

    #[tokio::test]
    async fn duration_is_none_before_start_and_monotonic_after() {
        let handler = Arc::new(RecordingHandler::default());
        let mut t = task(handler);
        assert!(t.duration().is_none());
        t.enqueued();
        t.started();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let d1 = t.duration().unwrap();
        assert!(d1 >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn completed_delegates_to_handler() {
        let handler = Arc::new(RecordingHandler::default());
        let mut t = task(handler.clone());
        t.enqueued();
        t.started();
        let response = Response {
            status: 200,
            headers: HeaderMultiMap::new(),
            body: None,
            duration: Duration::from_millis(1),
            request_id: t.id(),
            url: t.request.url.clone(),
            http_method: Method::Get,
            callback_args: CallbackArgs::new(),
            redirects: vec![],
        };
        t.completed(response).await;
        assert!(t.is_terminal());
        assert_eq!(handler.completes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn redirect_302_downgrades_to_get_without_body() {
        let handler = Arc::new(RecordingHandler::default());
        let request = Request::new(Method::Post, "http://x.test/a", HeaderMultiMap::new(), Some(vec![1, 2, 3]), None, None, None).unwrap();
        let t = RequestTask::new(request, handler, "Cb", CallbackArgs::new(), false, 20);
        let follower = t.redirect_to(302, "/b").unwrap();
        assert_eq!(follower.request.method, Method::Get);
        assert!(follower.request.body.is_none());
        assert_eq!(follower.redirects, vec!["http://x.test/a".to_string()]);
        assert_eq!(follower.id(), format!("{}/2", t.root_id()));
    }

    #[test]
    fn redirect_307_preserves_method_and_body() {
        let handler = Arc::new(RecordingHandler::default());
        let request = Request::new(Method::Post, "http://x.test/a", HeaderMultiMap::new(), Some(vec![1, 2, 3]), None, None, None).unwrap();
        let t = RequestTask::new(request, handler, "Cb", CallbackArgs::new(), false, 20);
        let follower = t.redirect_to(307, "/b").unwrap();
        assert_eq!(follower.request.method, Method::Post);
        assert_eq!(follower.request.body, Some(vec![1, 2, 3]));
    }

    #[test]
    fn redirect_missing_location_is_rejected() {
        let handler = Arc::new(RecordingHandler::default());
        let t = task(handler);
        assert!(matches!(t.redirect_to(302, ""), Err(RedirectError::MissingLocation)));
    }

    #[test]
    fn redirect_beyond_max_redirects_is_rejected() {
        let handler = Arc::new(RecordingHandler::default());
        let request = Request::new(Method::Get, "http://x.test/a", HeaderMultiMap::new(), None, None, None, Some(0)).unwrap();
        let t = RequestTask::new(request, handler, "Cb", CallbackArgs::new(), false, 20);
        assert!(matches!(t.redirect_to(302, "/b"), Err(RedirectError::TooMany)));
    }

    #[test]
    fn redirect_to_same_url_is_recursive() {
        let handler = Arc::new(RecordingHandler::default());
        let t = task(handler);
        assert!(matches!(t.redirect_to(302, "http://x.test/a"), Err(RedirectError::Recursive)));
    }

    #[test]
    fn redirect_revisiting_a_prior_hop_is_recursive() {
        let handler = Arc::new(RecordingHandler::default());
        let t = task(handler);
        let hop2 = t.redirect_to(302, "/b").unwrap();
        assert!(matches!(hop2.redirect_to(302, "/a"), Err(RedirectError::Recursive)));
    }
}
