//! Scripted in-process client for tests
//!
//! [`FakeClient`] answers from stubs instead of the network but runs every
//! request through the same preparation and lifecycle code as
//! [`SessionClient`](crate::client::SessionClient), so code written against
//! [`Client`] observes the same states, progress and terminal results.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{executor, StreamExt};
use parking_lot::{Mutex, RwLock};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    Method, StatusCode,
};
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, warn};
use url::Url;

use crate::{
    client::{launch, reject_resume, Client},
    config::ClientConfig,
    download::{discard_partial, finalize_blocking, plan_resume, staging_file, DestinationPolicy, ResumeState, ResumeToken},
    error::{HttpError, Result},
    queue::DeliveryQueue,
    request::{prepare, prepare_upload, BodyDescriptor, RequestBody, RequestInfo, RequestOptions, Target, UploadPayload},
    task::{DataRequest, DownloadRequest, Driver, Outcome, Payload, Progress, ResponseMeta, TaskEvents, UploadRequest},
    transport::Job,
};

const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Canned response
#[derive(Debug, Clone)]
pub struct FakeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Body is delivered in chunks of this size, one progress event each
    pub chunk_size: usize,
    /// Answer range requests with `206`; otherwise resumes are refused
    pub range_support: bool,
    /// Retry count reported on the terminal response
    pub retries: u32,
}

impl FakeResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            range_support: true,
            retries: 0,
        }
    }

    pub fn json(status: u16, value: &Value) -> Self {
        Self::new(status)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_body(value.to_string())
    }

    pub fn text(status: u16, text: impl Into<String>) -> Self {
        Self::new(status)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))
            .with_body(text.into())
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn without_range_support(mut self) -> Self {
        self.range_support = false;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// How a stubbed endpoint behaves
#[derive(Debug, Clone)]
pub enum Reply {
    Respond(FakeResponse),
    /// Fail before any response arrives
    Fail(HttpError),
    /// Send a `200`, deliver `partial`, then hang until cancelled
    Stall { partial: Bytes, total: Option<u64> },
}

impl From<FakeResponse> for Reply {
    fn from(response: FakeResponse) -> Self {
        Reply::Respond(response)
    }
}

/// Which client operation produced a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Data,
    Download,
    ResumedDownload,
    Upload,
}

/// A request as the fake saw it
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub kind: CallKind,
    pub method: Method,
    pub url: Url,
    /// Headers as sent, credentials included once the request starts
    pub headers: HeaderMap,
    pub body: BodyDescriptor,
    /// Body bytes, once the request has started
    pub sent_body: Option<Bytes>,
}

struct Stub {
    method: Method,
    url: String,
    reply: Reply,
}

/// In-process [`Client`] answering from stubs
pub struct FakeClient {
    config: RwLock<Arc<ClientConfig>>,
    queue: DeliveryQueue,
    stubs: Mutex<Vec<Stub>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl FakeClient {
    /// Observers run inline unless a call names a queue
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            queue: DeliveryQueue::inline(),
            stubs: Mutex::new(Vec::new()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ClientConfig::default())
    }

    pub fn with_delivery_queue(mut self, queue: DeliveryQueue) -> Self {
        self.queue = queue;
        self
    }

    /// Answer `method url` with `reply`; later stubs shadow earlier ones
    ///
    /// A stub URL without a query also matches requests that carry one.
    /// Requests with no stub get an empty `404`.
    pub fn stub(&self, method: Method, url: &str, reply: impl Into<Reply>) -> &Self {
        let url = Url::parse(url).map(String::from).unwrap_or_else(|_| url.to_string());
        self.stubs.lock().push(Stub {
            method,
            url,
            reply: reply.into(),
        });
        self
    }

    /// Calls made so far, in creation order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn update_config(&self, update: impl FnOnce(&mut ClientConfig)) {
        let mut guard = self.config.write();
        let mut config = ClientConfig::clone(&guard);
        update(&mut config);
        *guard = Arc::new(config);
    }

    fn reply_for(&self, info: &RequestInfo) -> Reply {
        let mut bare = info.url.clone();
        bare.set_query(None);
        bare.set_fragment(None);

        self.stubs
            .lock()
            .iter()
            .rev()
            .find(|stub| {
                stub.method == info.method && (stub.url == info.url.as_str() || stub.url == bare.as_str())
            })
            .map(|stub| stub.reply.clone())
            .unwrap_or_else(|| {
                debug!(method = %info.method, url = %info.url, "No stub matched; answering 404");
                Reply::Respond(FakeResponse::new(404))
            })
    }

    fn record(&self, kind: CallKind, info: &RequestInfo) -> usize {
        let mut calls = self.calls.lock();
        calls.push(RecordedCall {
            kind,
            method: info.method.clone(),
            url: info.url.clone(),
            headers: info.headers.clone(),
            body: info.body.clone(),
            sent_body: None,
        });
        calls.len() - 1
    }

    fn driver(&self, kind: CallKind, info: &RequestInfo, job: Job) -> Box<dyn Driver> {
        let index = self.record(kind, info);
        Box::new(FakeDriver {
            reply: self.reply_for(info),
            job: Mutex::new(Some(job)),
            call: CallSlot {
                calls: Arc::clone(&self.calls),
                index,
            },
            stalled: Arc::new(Mutex::new(None)),
            keep_partial: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[async_trait]
impl Client for FakeClient {
    fn config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config.read())
    }

    fn request(&self, target: Target, options: RequestOptions) -> Result<DataRequest> {
        let config = self.config();
        let (info, body) = prepare(target, options, &config)?;
        let driver = self.driver(CallKind::Data, &info, Job::Data(body));
        Ok(launch(info, driver, &self.queue, config.start_requests_immediately))
    }

    fn download(
        &self,
        target: Target,
        options: RequestOptions,
        destination: DestinationPolicy,
    ) -> Result<DownloadRequest> {
        let config = self.config();
        let (info, _) = prepare(target, options, &config)?;
        let job = Job::Download {
            destination,
            staging_dir: config.staging_dir(),
            resume: None,
        };
        let driver = self.driver(CallKind::Download, &info, job);
        Ok(launch(info, driver, &self.queue, config.start_requests_immediately))
    }

    fn download_resuming(&self, token: ResumeToken, destination: DestinationPolicy) -> DownloadRequest {
        let config = self.config();
        let plan = plan_resume(&token, config.timeout, &config.staging_dir());
        match plan.state {
            Ok(state) => {
                let job = Job::Download {
                    destination,
                    staging_dir: config.staging_dir(),
                    resume: Some(state),
                };
                let driver = self.driver(CallKind::ResumedDownload, &plan.info, job);
                launch(plan.info, driver, &self.queue, config.start_requests_immediately)
            }
            Err(e) => {
                self.record(CallKind::ResumedDownload, &plan.info);
                reject_resume(plan.info, e, &self.queue, config.start_requests_immediately)
            }
        }
    }

    fn upload(
        &self,
        payload: UploadPayload,
        target: Target,
        options: RequestOptions,
    ) -> Result<UploadRequest> {
        let config = self.config();
        let (info, body) = prepare_upload(payload, target, options, &config)?;
        let driver = self.driver(CallKind::Upload, &info, Job::Upload(body));
        Ok(launch(info, driver, &self.queue, config.start_requests_immediately))
    }
}

#[derive(Clone)]
struct CallSlot {
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    index: usize,
}

impl CallSlot {
    fn update(&self, update: impl FnOnce(&mut RecordedCall)) {
        if let Some(call) = self.calls.lock().get_mut(self.index) {
            update(call);
        }
    }
}

/// A stalled transfer waiting for cancellation
struct Stalled {
    events: TaskEvents,
    meta: ResponseMeta,
    partial: Option<(PathBuf, u64, Option<u64>)>,
}

struct FakeDriver {
    reply: Reply,
    job: Mutex<Option<Job>>,
    call: CallSlot,
    stalled: Arc<Mutex<Option<Stalled>>>,
    keep_partial: Arc<AtomicBool>,
}

impl Driver for FakeDriver {
    fn start(&self, events: TaskEvents) {
        let Some(job) = self.job.lock().take() else {
            return;
        };
        if let Some(credentials) = events.credentials() {
            self.call.update(|call| credentials.apply(&mut call.headers));
        }

        let delivery = Delivery {
            reply: self.reply.clone(),
            events,
            call: self.call.clone(),
            stalled: Arc::clone(&self.stalled),
            keep_partial: Arc::clone(&self.keep_partial),
        };
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || delivery.run(job));
            }
            Err(_) => delivery.run(job),
        }
    }

    fn cancel(&self, keep_partial_data: bool) {
        self.keep_partial.store(keep_partial_data, Ordering::SeqCst);
        let stalled = self.stalled.lock().take();
        if let Some(stalled) = stalled {
            stalled.release(keep_partial_data);
        }
    }
}

impl Stalled {
    fn release(self, keep: bool) {
        let outcome = match &self.partial {
            Some((path, received, total)) => interrupted(&self.events, path, *received, *total, keep),
            None => Outcome::cancelled(None),
        };
        self.events.finish(Outcome {
            meta: Some(self.meta),
            ..outcome
        });
    }
}

struct Delivery {
    reply: Reply,
    events: TaskEvents,
    call: CallSlot,
    stalled: Arc<Mutex<Option<Stalled>>>,
    keep_partial: Arc<AtomicBool>,
}

impl Delivery {
    fn run(self, job: Job) {
        let outcome = match (self.reply.clone(), job) {
            (Reply::Fail(error), Job::Data(body) | Job::Upload(body)) => {
                if let Err(e) = self.consume(body, false) {
                    warn!(error = %e, "Fake could not read request body");
                }
                Outcome::failure(None, error)
            }
            (Reply::Fail(error), Job::Download { .. }) => Outcome::failure(None, error),
            (Reply::Respond(response), Job::Data(body)) => self.respond(response, body, false),
            (Reply::Respond(response), Job::Upload(body)) => self.respond(response, body, true),
            (
                Reply::Respond(response),
                Job::Download {
                    destination,
                    staging_dir,
                    resume,
                },
            ) => self.download(response, destination, &staging_dir, resume),
            (Reply::Stall { partial, total }, job) => {
                self.stall(partial, total, job);
                return;
            }
        };
        self.events.finish(outcome);
    }

    fn meta(&self, status: StatusCode, headers: HeaderMap) -> ResponseMeta {
        let meta = ResponseMeta {
            url: self.events.request().url.clone(),
            status,
            headers,
        };
        self.events.response(meta.clone());
        meta
    }

    /// Read the request body, recording it and reporting upload progress
    fn consume(&self, body: RequestBody, report: bool) -> Result<()> {
        let bytes = match body {
            RequestBody::Empty => return Ok(()),
            RequestBody::Bytes(bytes) => bytes,
            RequestBody::File(path) => fs::read(&path)
                .map(Bytes::from)
                .map_err(|e| HttpError::io(&path, e))?,
            RequestBody::Stream(mut stream) => {
                let mut buffer = BytesMut::new();
                executor::block_on(async {
                    while let Some(chunk) = stream.next().await {
                        buffer.extend_from_slice(&chunk.map_err(HttpError::transport)?);
                    }
                    Ok::<_, HttpError>(())
                })?;
                buffer.freeze()
            }
        };

        if report {
            let total = bytes.len() as u64;
            let mut sent = 0;
            for chunk in bytes.chunks(DEFAULT_CHUNK_SIZE) {
                sent += chunk.len() as u64;
                self.events.progress(Progress::new(sent, Some(total)));
            }
        }
        self.call.update(|call| call.sent_body = Some(bytes));
        Ok(())
    }

    fn respond(&self, response: FakeResponse, body: RequestBody, upload: bool) -> Outcome {
        if let Err(e) = self.consume(body, upload) {
            return Outcome::failure(None, e);
        }
        for _ in 0..response.retries {
            self.events.record_retry();
        }

        let meta = self.meta(response.status, response.headers);
        let total = response.body.len() as u64;
        let mut delivered = 0;
        for chunk in response.body.chunks(response.chunk_size.max(1)) {
            if self.events.is_cancelled() {
                return Outcome::cancelled(None);
            }
            delivered += chunk.len() as u64;
            if !upload {
                self.events.progress(Progress::new(delivered, Some(total)));
            }
        }
        Outcome::success(meta, Payload::Bytes(response.body))
    }

    fn download(
        &self,
        response: FakeResponse,
        destination: DestinationPolicy,
        staging_dir: &Path,
        resume: Option<ResumeState>,
    ) -> Outcome {
        for _ in 0..response.retries {
            self.events.record_retry();
        }
        let (path, offset) = match resume {
            Some(state) => (state.staging_path, state.received),
            None => (staging_file(staging_dir), 0),
        };

        let resumed = offset > 0;
        if resumed && (!response.range_support || offset > response.body.len() as u64) {
            let meta = self.meta(StatusCode::OK, response.headers);
            discard_partial(&path);
            return Outcome::failure(
                Some(meta),
                HttpError::ResumeUnsupported(format!(
                    "server answered the range request with {}",
                    StatusCode::OK
                )),
            );
        }

        let status = if resumed {
            StatusCode::PARTIAL_CONTENT
        } else {
            response.status
        };
        let meta = self.meta(status, response.headers);
        let total = response.body.len() as u64;
        let remaining = response.body.slice(offset as usize..);

        let mut file = match open_staging(&path, resumed) {
            Ok(file) => file,
            Err(e) => return Outcome::failure(Some(meta), e),
        };
        let mut received = offset;
        for chunk in remaining.chunks(response.chunk_size.max(1)) {
            if self.events.is_cancelled() {
                drop(file);
                let keep = self.keep_partial.load(Ordering::SeqCst);
                let outcome = interrupted(&self.events, &path, received, Some(total), keep);
                return Outcome {
                    meta: Some(meta),
                    ..outcome
                };
            }
            if let Err(e) = file.write_all(chunk) {
                drop(file);
                discard_partial(&path);
                return Outcome::failure(Some(meta), HttpError::io(&path, e));
            }
            received += chunk.len() as u64;
            self.events.progress(Progress::new(received, Some(total)));
        }
        drop(file);

        match finalize_blocking(&path, &destination) {
            Ok(payload) => Outcome::success(meta, payload),
            Err(e) => Outcome::failure(Some(meta), e),
        }
    }

    fn stall(self, partial: Bytes, total: Option<u64>, job: Job) {
        let staged = match job {
            Job::Data(body) | Job::Upload(body) => {
                if let Err(e) = self.consume(body, false) {
                    warn!(error = %e, "Fake could not read request body");
                }
                None
            }
            Job::Download {
                staging_dir, resume, ..
            } => {
                let (path, offset) = match resume {
                    Some(state) => (state.staging_path, state.received),
                    None => (staging_file(&staging_dir), 0),
                };
                let written = open_staging(&path, offset > 0)
                    .and_then(|mut file| file.write_all(&partial).map_err(|e| HttpError::io(&path, e)));
                if let Err(e) = written {
                    let meta = self.meta(StatusCode::OK, HeaderMap::new());
                    self.events.finish(Outcome::failure(Some(meta), e));
                    return;
                }
                let received = offset + partial.len() as u64;
                self.events.progress(Progress::new(received, total));
                Some((path, received, total))
            }
        };

        let meta = self.meta(StatusCode::OK, HeaderMap::new());
        if staged.is_none() {
            self.events
                .progress(Progress::new(partial.len() as u64, total));
        }

        *self.stalled.lock() = Some(Stalled {
            events: self.events.clone(),
            meta,
            partial: staged,
        });

        // cancelled while the stall was being set up
        if self.events.is_cancelled() {
            let stalled = self.stalled.lock().take();
            if let Some(stalled) = stalled {
                stalled.release(self.keep_partial.load(Ordering::SeqCst));
            }
        }
    }
}

fn open_staging(path: &Path, append: bool) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| HttpError::io(parent, e))?;
    }
    let mut options = OpenOptions::new();
    if append {
        options.append(true);
    } else {
        options.create(true).write(true).truncate(true);
    }
    options.open(path).map_err(|e| HttpError::io(path, e))
}

/// Cancelled download outcome, with a token when the bytes are kept
fn interrupted(events: &TaskEvents, path: &Path, received: u64, total: Option<u64>, keep: bool) -> Outcome {
    let token = if keep && path.exists() {
        ResumeState::new(events.request(), path.to_path_buf(), received, total, None).to_token()
    } else {
        None
    };
    if token.is_none() {
        discard_partial(path);
    }
    Outcome::cancelled(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientExt;
    use crate::response::{BytesSerializer, JsonSerializer};
    use crate::request::Credentials;
    use crate::task::{Authenticating, Cancelable, ProgressReporting, RequestState, Resumable};
    use serde_json::json;
    use tempfile::TempDir;

    fn client(dir: &TempDir) -> FakeClient {
        FakeClient::new(ClientConfig::default().with_staging_dir(dir.path()))
    }

    #[tokio::test]
    async fn test_unstubbed_request_gets_404() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);

        let response = client
            .get("https://example.com/missing")
            .unwrap()
            .response(BytesSerializer)
            .await;
        assert_eq!(response.status(), Some(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_stubbed_json() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);
        client.stub(
            Method::GET,
            "https://api.example.com/users",
            FakeResponse::json(200, &json!([{"id": 1}])),
        );

        let response = client
            .get("https://api.example.com/users?page=2")
            .unwrap()
            .response(JsonSerializer::default())
            .await;
        assert_eq!(response.into_result().unwrap(), json!([{"id": 1}]));
        assert_eq!(client.calls()[0].url.query(), Some("page=2"));
    }

    #[test]
    fn test_delivers_without_runtime() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);
        client.stub(Method::GET, "https://example.com/", FakeResponse::text(200, "hi"));

        let request = client.get("https://example.com/").unwrap();
        assert_eq!(request.state(), RequestState::Completed);
    }

    #[test]
    fn test_credentials_recorded_on_start() {
        let dir = TempDir::new().unwrap();
        let client = FakeClient::new(
            ClientConfig::default()
                .with_staging_dir(dir.path())
                .with_start_requests_immediately(false),
        );

        let request = client.get("https://example.com/secure").unwrap();
        request.authenticate(Credentials::basic("user", "pass"));
        assert!(client.calls()[0].headers.get("authorization").is_none());

        request.resume();
        assert_eq!(
            client.calls()[0].headers.get("authorization").unwrap(),
            "Basic dXNlcjpwYXNz"
        );
    }

    #[test]
    fn test_progress_per_chunk() {
        let dir = TempDir::new().unwrap();
        let client = FakeClient::new(
            ClientConfig::default()
                .with_staging_dir(dir.path())
                .with_start_requests_immediately(false),
        );
        client.stub(
            Method::GET,
            "https://example.com/big",
            FakeResponse::new(200)
                .with_body(vec![7u8; 100])
                .with_chunk_size(30),
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let request = client.get("https://example.com/big").unwrap();
        request.on_progress(None, move |p| sink.lock().push(p.completed));
        request.resume();

        assert_eq!(*seen.lock(), vec![30, 60, 90, 100]);
    }

    #[test]
    fn test_upload_body_is_recorded() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);
        client.stub(Method::PUT, "https://example.com/blob", FakeResponse::new(201));

        let request = client
            .upload_bytes("https://example.com/blob", Method::PUT, &b"contents"[..])
            .unwrap();
        assert_eq!(request.state(), RequestState::Completed);

        let calls = client.calls();
        let call = &calls[0];
        assert_eq!(call.kind, CallKind::Upload);
        assert_eq!(call.sent_body.as_deref(), Some(&b"contents"[..]));
        assert_eq!(call.body, BodyDescriptor::Bytes { len: 8 });
    }

    #[test]
    fn test_stall_and_cancel() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);
        client.stub(
            Method::GET,
            "https://example.com/slow",
            Reply::Stall {
                partial: Bytes::from_static(b"abc"),
                total: Some(10),
            },
        );

        let request = client.get("https://example.com/slow").unwrap();
        assert_eq!(request.state(), RequestState::Active);
        request.cancel();
        assert_eq!(request.state(), RequestState::Cancelled);
    }

    #[test]
    fn test_stalled_download_resumes() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);
        let url = "https://example.com/file.bin";
        client.stub(
            Method::GET,
            url,
            Reply::Stall {
                partial: Bytes::from_static(b"0123"),
                total: Some(10),
            },
        );

        let first = client
            .download(url.into(), RequestOptions::default(), DestinationPolicy::Memory)
            .unwrap();
        first.cancel_producing_resume_data();
        let token = first.resume_token().expect("token for kept bytes");

        client.stub(Method::GET, url, FakeResponse::new(200).with_body("0123456789"));
        let target = dir.path().join("out.bin");
        let second = client.download_resuming(token, DestinationPolicy::file(&target));

        assert_eq!(second.state(), RequestState::Completed);
        assert_eq!(fs::read(&target).unwrap(), b"0123456789");
        assert_eq!(client.calls()[1].kind, CallKind::ResumedDownload);
    }

    #[test]
    fn test_resume_refused_without_range_support() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);
        let url = "https://example.com/file.bin";
        client.stub(
            Method::GET,
            url,
            Reply::Stall {
                partial: Bytes::from_static(b"01"),
                total: None,
            },
        );
        let first = client
            .download(url.into(), RequestOptions::default(), DestinationPolicy::Memory)
            .unwrap();
        first.cancel_producing_resume_data();
        let token = first.resume_token().unwrap();

        client.stub(
            Method::GET,
            url,
            FakeResponse::new(200).with_body("0123").without_range_support(),
        );
        let second = client.download_resuming(token, DestinationPolicy::Memory);
        assert_eq!(second.state(), RequestState::Failed);
    }

    #[test]
    fn test_plain_cancel_discards_partial() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);
        client.stub(
            Method::GET,
            "https://example.com/file.bin",
            Reply::Stall {
                partial: Bytes::from_static(b"01"),
                total: None,
            },
        );
        let request = client
            .download(
                "https://example.com/file.bin".into(),
                RequestOptions::default(),
                DestinationPolicy::Memory,
            )
            .unwrap();
        request.cancel();

        assert!(request.resume_token().is_none());
        let leftovers = fs::read_dir(dir.path().join("downloads")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_retries_are_reported() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);
        client.stub(
            Method::GET,
            "https://example.com/flaky",
            FakeResponse::new(200).with_retries(2),
        );
        let request = client.get("https://example.com/flaky").unwrap();
        assert_eq!(request.retry_count(), 2);
    }
}
