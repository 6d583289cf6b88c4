//! Request lifecycle core shared by every request kind
//!
//! A request moves `Created -> Active -> (Suspended <-> Active)* -> terminal`
//! and never leaves a terminal state. Transports plug in through [`Driver`]
//! and report back through [`TaskEvents`]; everything observable (state,
//! progress, exactly-once completion, replay to late observers) lives here,
//! so the real adapter and test doubles behave the same way.

use std::{
    fmt,
    marker::PhantomData,
    mem,
    ops::Range,
    path::PathBuf,
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::{header::HeaderMap, StatusCode};
use tokio::sync::oneshot;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::{
    download::ResumeToken,
    error::HttpError,
    queue::DeliveryQueue,
    request::{Credentials, RequestInfo},
    response::{HttpResponse, ResponseSerializer},
};

/// Lifecycle state of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Created,
    Active,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }
}

/// Transfer progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub completed: u64,
    pub total: Option<u64>,
}

impl Progress {
    pub fn new(completed: u64, total: Option<u64>) -> Self {
        Self { completed, total }
    }

    /// Completed share in `0.0..=1.0`, when the total is known
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.completed as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

/// Status line and headers of a response
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Where the response body ended up
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    Empty,
    Bytes(Bytes),
    File(PathBuf),
}

/// Terminal result of a request, as reported by its driver
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    pub meta: Option<ResponseMeta>,
    pub payload: Payload,
    pub error: Option<HttpError>,
    pub resume_token: Option<ResumeToken>,
}

impl Outcome {
    pub fn success(meta: ResponseMeta, payload: Payload) -> Self {
        Self {
            meta: Some(meta),
            payload,
            ..Default::default()
        }
    }

    pub fn failure(meta: Option<ResponseMeta>, error: HttpError) -> Self {
        Self {
            meta,
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn cancelled(resume_token: Option<ResumeToken>) -> Self {
        Self {
            error: Some(HttpError::Cancelled),
            resume_token,
            ..Default::default()
        }
    }

    pub fn with_resume_token(mut self, token: Option<ResumeToken>) -> Self {
        self.resume_token = token;
        self
    }

    fn is_cancelled(&self) -> bool {
        self.error.as_ref().is_some_and(HttpError::is_cancelled)
    }
}

/// The seam a transport implements to run requests
///
/// `start` is called at most once, on the first resume. After `cancel` the
/// driver must still report a terminal outcome through [`TaskEvents::finish`].
pub trait Driver: Send + Sync + 'static {
    fn start(&self, events: TaskEvents);

    fn suspend(&self) {}

    fn resume(&self) {}

    fn cancel(&self, keep_partial_data: bool);
}

/// Driver that ends every request with a fixed error
pub(crate) struct Rejecting(pub(crate) HttpError);

impl Driver for Rejecting {
    fn start(&self, events: TaskEvents) {
        events.finish(Outcome::failure(None, self.0.clone()));
    }

    fn cancel(&self, _keep_partial_data: bool) {}
}

/// Sink through which a driver reports on its request
#[derive(Clone)]
pub struct TaskEvents {
    core: Arc<Core>,
}

impl TaskEvents {
    pub fn request(&self) -> &RequestInfo {
        &self.core.info
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.core.inner.lock().credentials.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.state() == RequestState::Cancelled
    }

    pub fn progress(&self, progress: Progress) {
        self.core.report_progress(progress);
    }

    pub fn response(&self, meta: ResponseMeta) {
        self.core.inner.lock().meta = Some(meta);
    }

    pub fn record_retry(&self) {
        self.core.inner.lock().retry_count += 1;
    }

    pub fn finish(&self, outcome: Outcome) {
        self.core.finish(outcome);
    }
}

impl fmt::Debug for TaskEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEvents")
            .field("request_id", &self.core.id)
            .finish_non_exhaustive()
    }
}

type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;
type CompletionCallback = Box<dyn FnOnce(Arc<Outcome>, u32) + Send>;

struct ProgressObserver {
    queue: DeliveryQueue,
    callback: ProgressCallback,
}

struct CompletionObserver {
    queue: DeliveryQueue,
    callback: CompletionCallback,
}

struct Inner {
    state: RequestState,
    credentials: Option<Credentials>,
    validators: Vec<Range<u16>>,
    progress: Progress,
    meta: Option<ResponseMeta>,
    retry_count: u32,
    progress_observers: Vec<ProgressObserver>,
    completion_observers: Vec<CompletionObserver>,
    terminal: Option<Arc<Outcome>>,
}

pub(crate) struct Core {
    id: Uuid,
    info: RequestInfo,
    driver: Box<dyn Driver>,
    default_queue: DeliveryQueue,
    inner: Mutex<Inner>,
}

enum Transition {
    Start,
    Resume,
}

impl Core {
    pub(crate) fn new(info: RequestInfo, driver: Box<dyn Driver>, default_queue: DeliveryQueue) -> Arc<Self> {
        let core = Arc::new(Self {
            id: Uuid::new_v4(),
            info,
            driver,
            default_queue,
            inner: Mutex::new(Inner {
                state: RequestState::Created,
                credentials: None,
                validators: Vec::new(),
                progress: Progress::default(),
                meta: None,
                retry_count: 0,
                progress_observers: Vec::new(),
                completion_observers: Vec::new(),
                terminal: None,
            }),
        });
        debug!(
            request_id = %core.id,
            method = %core.info.method,
            url = %core.info.url,
            "Request created"
        );
        core
    }

    fn state(&self) -> RequestState {
        self.inner.lock().state
    }

    fn resume(self: &Arc<Self>) {
        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                RequestState::Created => {
                    inner.state = RequestState::Active;
                    Some(Transition::Start)
                }
                RequestState::Suspended => {
                    inner.state = RequestState::Active;
                    Some(Transition::Resume)
                }
                _ => None,
            }
        };

        match transition {
            Some(Transition::Start) => {
                debug!(request_id = %self.id, "Request started");
                self.driver.start(TaskEvents {
                    core: Arc::clone(self),
                });
            }
            Some(Transition::Resume) => {
                debug!(request_id = %self.id, "Request resumed");
                self.driver.resume();
            }
            None => {}
        }
    }

    fn suspend(&self) {
        let suspended = {
            let mut inner = self.inner.lock();
            if inner.state == RequestState::Active {
                inner.state = RequestState::Suspended;
                true
            } else {
                false
            }
        };
        if suspended {
            debug!(request_id = %self.id, "Request suspended");
            self.driver.suspend();
        }
    }

    fn cancel(&self, keep_partial_data: bool) {
        let prior = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            mem::replace(&mut inner.state, RequestState::Cancelled)
        };
        debug!(request_id = %self.id, keep_partial_data, "Request cancelled");

        if prior == RequestState::Created {
            self.finish(Outcome::cancelled(None));
        } else {
            self.driver.cancel(keep_partial_data);
        }
    }

    fn report_progress(self: &Arc<Self>, progress: Progress) {
        let observers: Vec<(DeliveryQueue, ProgressCallback)> = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.progress = progress;
            inner
                .progress_observers
                .iter()
                .map(|o| (o.queue.clone(), Arc::clone(&o.callback)))
                .collect()
        };

        for (queue, callback) in observers {
            let core = Arc::clone(self);
            queue.execute(Box::new(move || {
                if core.state() != RequestState::Cancelled {
                    callback(progress);
                }
            }));
        }
    }

    fn finish(&self, outcome: Outcome) {
        let (observers, outcome, retry_count) = {
            let mut inner = self.inner.lock();
            if inner.terminal.is_some() {
                debug!(request_id = %self.id, "Ignoring duplicate terminal event");
                return;
            }

            let mut outcome = outcome;
            if outcome.meta.is_none() {
                outcome.meta = inner.meta.clone();
            }
            if inner.state == RequestState::Cancelled && !outcome.is_cancelled() {
                outcome = Outcome {
                    meta: outcome.meta,
                    resume_token: outcome.resume_token,
                    ..Outcome::cancelled(None)
                };
            }
            if outcome.error.is_none() {
                outcome.error = validate(&inner.validators, &outcome);
            }

            inner.state = match &outcome.error {
                None => RequestState::Completed,
                Some(HttpError::Cancelled) => RequestState::Cancelled,
                Some(_) => RequestState::Failed,
            };
            let outcome = Arc::new(outcome);
            inner.terminal = Some(Arc::clone(&outcome));
            inner.progress_observers.clear();
            (
                mem::take(&mut inner.completion_observers),
                outcome,
                inner.retry_count,
            )
        };

        debug!(
            request_id = %self.id,
            status = ?outcome.meta.as_ref().map(|m| m.status),
            error = ?outcome.error.as_ref().map(ToString::to_string),
            "Request finished"
        );

        for CompletionObserver { queue, callback } in observers {
            let outcome = Arc::clone(&outcome);
            queue.execute(Box::new(move || callback(outcome, retry_count)));
        }
    }

    fn observe_progress(&self, queue: Option<DeliveryQueue>, callback: ProgressCallback) {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.progress_observers.push(ProgressObserver {
            queue: queue.unwrap_or_else(|| self.default_queue.clone()),
            callback,
        });
    }

    /// Register a completion observer; runs it right away on the calling
    /// thread when the result is already known
    pub(crate) fn observe_completion(&self, queue: Option<DeliveryQueue>, callback: CompletionCallback) {
        let (outcome, retry_count) = {
            let mut inner = self.inner.lock();
            match inner.terminal.clone() {
                Some(outcome) => (outcome, inner.retry_count),
                None => {
                    inner.completion_observers.push(CompletionObserver {
                        queue: queue.unwrap_or_else(|| self.default_queue.clone()),
                        callback,
                    });
                    return;
                }
            }
        };
        callback(outcome, retry_count);
    }
}

fn validate(validators: &[Range<u16>], outcome: &Outcome) -> Option<HttpError> {
    let meta = outcome.meta.as_ref()?;
    let status = meta.status.as_u16();
    if validators.iter().all(|range| range.contains(&status)) {
        return None;
    }
    let message = match &outcome.payload {
        Payload::Bytes(bytes) if !bytes.is_empty() => {
            String::from_utf8_lossy(&bytes[..bytes.len().min(512)]).into_owned()
        }
        _ => meta
            .status
            .canonical_reason()
            .unwrap_or("unacceptable status")
            .to_string(),
    };
    Some(HttpError::HttpStatus {
        status: meta.status,
        message,
    })
}

/// Request kinds
pub mod kind {
    /// Plain data request
    #[derive(Debug)]
    pub enum Data {}

    /// Download to memory or a file
    #[derive(Debug)]
    pub enum Download {}

    /// Upload of bytes, a file, a stream or a multipart body
    #[derive(Debug)]
    pub enum Upload {}
}

/// Handle to one request
///
/// Clones share the same request. Capabilities come from the traits in this
/// module; [`Request<Download>`] adds resume-data cancellation.
pub struct Request<K> {
    core: Arc<Core>,
    kind: PhantomData<fn() -> K>,
}

/// Plain data request
pub type DataRequest = Request<kind::Data>;
/// Download request
pub type DownloadRequest = Request<kind::Download>;
/// Upload request
pub type UploadRequest = Request<kind::Upload>;

impl<K> Clone for Request<K> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            kind: PhantomData,
        }
    }
}

impl<K> fmt::Debug for Request<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.core.id)
            .field("method", &self.core.info.method)
            .field("url", &self.core.info.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl<K> Request<K> {
    pub(crate) fn from_core(core: Arc<Core>) -> Self {
        Self {
            core,
            kind: PhantomData,
        }
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub fn id(&self) -> Uuid {
        self.core.id
    }

    pub fn info(&self) -> &RequestInfo {
        &self.core.info
    }

    pub fn state(&self) -> RequestState {
        self.core.state()
    }

    pub fn progress(&self) -> Progress {
        self.core.inner.lock().progress
    }

    pub fn retry_count(&self) -> u32 {
        self.core.inner.lock().retry_count
    }

    /// Fail the request unless the status is `200..300`
    pub fn validate(&self) -> &Self {
        self.validate_status(200..300)
    }

    /// Fail the request unless the status falls in `range`
    pub fn validate_status(&self, range: Range<u16>) -> &Self {
        self.core.inner.lock().validators.push(range);
        self
    }

    /// Wait for the terminal result
    pub async fn response<S>(&self, serializer: S) -> HttpResponse<S::Output>
    where
        S: ResponseSerializer,
    {
        let (tx, rx) = oneshot::channel();
        self.on_complete(serializer, Some(DeliveryQueue::inline()), move |response| {
            let _ = tx.send(response);
        });
        rx.await
            .unwrap_or_else(|_| HttpResponse::detached(HttpError::Cancelled))
    }
}

impl Request<kind::Download> {
    /// Cancel, keeping downloaded bytes behind a resume token when possible
    ///
    /// The token arrives on the terminal response; its absence is normal.
    pub fn cancel_producing_resume_data(&self) {
        self.core.cancel(true);
    }

    /// Resume token of a terminated download, if one was produced
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.core
            .inner
            .lock()
            .terminal
            .as_ref()
            .and_then(|outcome| outcome.resume_token.clone())
    }
}

/// Requests that can be cancelled
pub trait Cancelable {
    fn cancel(&self);
}

/// Requests that can be paused and continued
pub trait Resumable {
    fn resume(&self);
    fn suspend(&self);
}

/// Requests that report transfer progress
pub trait ProgressReporting {
    fn on_progress<F>(&self, queue: Option<DeliveryQueue>, callback: F) -> &Self
    where
        F: Fn(Progress) + Send + Sync + 'static;
}

/// Requests that deliver one terminal response
pub trait Completable {
    fn on_complete<S, F>(&self, serializer: S, queue: Option<DeliveryQueue>, callback: F) -> &Self
    where
        S: ResponseSerializer,
        F: FnOnce(HttpResponse<S::Output>) + Send + 'static;
}

/// Requests that accept credentials
pub trait Authenticating {
    fn authenticate(&self, credentials: Credentials) -> &Self;
}

impl<K> Cancelable for Request<K> {
    fn cancel(&self) {
        self.core.cancel(false);
    }
}

impl<K> Resumable for Request<K> {
    fn resume(&self) {
        self.core.resume();
    }

    fn suspend(&self) {
        self.core.suspend();
    }
}

impl<K> ProgressReporting for Request<K> {
    fn on_progress<F>(&self, queue: Option<DeliveryQueue>, callback: F) -> &Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.core.observe_progress(queue, Arc::new(callback));
        self
    }
}

impl<K> Completable for Request<K> {
    fn on_complete<S, F>(&self, serializer: S, queue: Option<DeliveryQueue>, callback: F) -> &Self
    where
        S: ResponseSerializer,
        F: FnOnce(HttpResponse<S::Output>) + Send + 'static,
    {
        self.core.observe_completion(
            queue,
            Box::new(move |outcome, retry_count| {
                callback(HttpResponse::from_outcome(&outcome, &serializer, retry_count));
            }),
        );
        self
    }
}

impl<K> Authenticating for Request<K> {
    fn authenticate(&self, credentials: Credentials) -> &Self {
        self.core.inner.lock().credentials = Some(credentials);
        self
    }
}
