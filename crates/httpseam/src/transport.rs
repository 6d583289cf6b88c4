//! reqwest-backed request driver

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::{Bytes, BytesMut};
use futures::{stream, Stream, StreamExt};
use parking_lot::Mutex;
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, IF_RANGE, RANGE},
    Body, Response, StatusCode,
};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    runtime::Handle,
    sync::watch,
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{debug, info, warn};

use crate::{
    download::{entity_validator, finalize_blocking, staging_file, DestinationPolicy, ResumeState},
    error::{HttpError, Result},
    request::RequestBody,
    task::{Driver, Outcome, Payload, Progress, ResponseMeta, TaskEvents},
};

const UPLOAD_CHUNK: usize = 64 * 1024;

/// Work a driver performs once started
pub(crate) enum Job {
    Data(RequestBody),
    Upload(RequestBody),
    Download {
        destination: DestinationPolicy,
        staging_dir: PathBuf,
        resume: Option<ResumeState>,
    },
}

pub(crate) struct ReqwestDriver {
    client: reqwest::Client,
    runtime: Option<Handle>,
    job: Mutex<Option<Job>>,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    keep_partial: Arc<AtomicBool>,
}

impl ReqwestDriver {
    pub(crate) fn new(client: reqwest::Client, runtime: Option<Handle>, job: Job) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            client,
            runtime,
            job: Mutex::new(Some(job)),
            cancel: CancellationToken::new(),
            paused,
            keep_partial: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Driver for ReqwestDriver {
    fn start(&self, events: TaskEvents) {
        let Some(job) = self.job.lock().take() else {
            return;
        };

        let Some(runtime) = self.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            warn!(url = %events.request().url, "No Tokio runtime to run the request on");
            events.finish(Outcome::failure(
                None,
                HttpError::BuildError("no Tokio runtime available".to_string()),
            ));
            return;
        };

        let transfer = Transfer {
            client: self.client.clone(),
            events,
            cancel: self.cancel.clone(),
            paused: self.paused.subscribe(),
            keep_partial: Arc::clone(&self.keep_partial),
        };
        runtime.spawn(transfer.run(job));
    }

    fn suspend(&self) {
        self.paused.send_replace(true);
    }

    fn resume(&self) {
        self.paused.send_replace(false);
    }

    fn cancel(&self, keep_partial_data: bool) {
        self.keep_partial.store(keep_partial_data, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

struct Transfer {
    client: reqwest::Client,
    events: TaskEvents,
    cancel: CancellationToken,
    paused: watch::Receiver<bool>,
    keep_partial: Arc<AtomicBool>,
}

/// Where a download stands when it stops early
struct Partial<'a> {
    path: &'a Path,
    received: u64,
    total: Option<u64>,
    validator: Option<String>,
}

impl Transfer {
    async fn run(mut self, job: Job) {
        let outcome = match job {
            Job::Data(body) => self.fetch(body, false).await,
            Job::Upload(body) => self.fetch(body, true).await,
            Job::Download {
                destination,
                staging_dir,
                resume,
            } => self.download(destination, &staging_dir, resume).await,
        };
        self.events.finish(outcome);
    }

    async fn fetch(&mut self, body: RequestBody, report_upload: bool) -> Outcome {
        let response = match self.send(body, report_upload, HeaderMap::new()).await {
            Ok(response) => response,
            Err(e) => return Outcome::failure(None, e),
        };
        let meta = self.record_response(&response);
        let total = response.content_length();
        let mut chunks = Box::pin(response.bytes_stream());
        let mut buffer = BytesMut::new();

        loop {
            match self.next_chunk(&mut chunks).await {
                Ok(Some(chunk)) => {
                    buffer.extend_from_slice(&chunk);
                    if !report_upload {
                        self.events
                            .progress(Progress::new(buffer.len() as u64, total));
                    }
                }
                Ok(None) => break,
                Err(e) => return Outcome::failure(Some(meta), e),
            }
        }

        Outcome::success(meta, Payload::Bytes(buffer.freeze()))
    }

    async fn download(
        &mut self,
        destination: DestinationPolicy,
        staging_dir: &Path,
        resume: Option<ResumeState>,
    ) -> Outcome {
        let (path, offset, prior_validator) = match resume {
            Some(state) => (state.staging_path, state.received, state.validator),
            None => (staging_file(staging_dir), 0, None),
        };

        let mut extra = HeaderMap::new();
        if offset > 0 {
            if let Ok(range) = HeaderValue::from_str(&format!("bytes={offset}-")) {
                extra.insert(RANGE, range);
            }
            if let Some(value) = prior_validator.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
                extra.insert(IF_RANGE, value);
            }
        }

        let response = match self.send(RequestBody::Empty, false, extra).await {
            Ok(response) => response,
            Err(e) => {
                let partial = Partial {
                    path: &path,
                    received: offset,
                    total: None,
                    validator: prior_validator,
                };
                return self.stop(None, e, partial).await;
            }
        };
        let meta = self.record_response(&response);

        let total = if offset > 0 {
            match resumed_total(&response, offset) {
                Ok(total) => total,
                Err(e) => {
                    discard(&path).await;
                    return Outcome::failure(Some(meta), e);
                }
            }
        } else {
            response.content_length()
        };
        let validator = entity_validator(&meta.headers).or(prior_validator);

        let opened = match path.parent() {
            Some(parent) if offset == 0 => fs::create_dir_all(parent).await,
            _ => Ok(()),
        };
        let file = match opened {
            Ok(()) if offset > 0 => OpenOptions::new().append(true).open(&path).await,
            Ok(()) => {
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&path)
                    .await
            }
            Err(e) => Err(e),
        };
        let mut file = match file {
            Ok(file) => file,
            Err(e) => return Outcome::failure(Some(meta), HttpError::io(&path, e)),
        };

        let mut received = offset;
        let mut chunks = Box::pin(response.bytes_stream());
        loop {
            match self.next_chunk(&mut chunks).await {
                Ok(Some(chunk)) => {
                    if let Err(e) = file.write_all(&chunk).await {
                        drop(file);
                        discard(&path).await;
                        return Outcome::failure(Some(meta), HttpError::io(&path, e));
                    }
                    received += chunk.len() as u64;
                    self.events.progress(Progress::new(received, total));
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = file.flush().await;
                    drop(file);
                    let partial = Partial {
                        path: &path,
                        received,
                        total,
                        validator,
                    };
                    return self.stop(Some(meta), e, partial).await;
                }
            }
        }

        if let Err(e) = file.flush().await {
            return Outcome::failure(Some(meta), HttpError::io(&path, e));
        }
        drop(file);

        let staged = path.clone();
        let placed = tokio::task::spawn_blocking(move || finalize_blocking(&staged, &destination))
            .await
            .unwrap_or_else(|e| Err(HttpError::io(&path, std::io::Error::other(e))));
        match placed {
            Ok(payload) => {
                info!(url = %meta.url, bytes = received, "Download finished");
                Outcome::success(meta, payload)
            }
            Err(e) => Outcome::failure(Some(meta), e),
        }
    }

    /// End a download early, keeping its bytes behind a resume token when
    /// the caller asked for it or the connection dropped
    async fn stop(&self, meta: Option<ResponseMeta>, error: HttpError, partial: Partial<'_>) -> Outcome {
        let keep = match &error {
            HttpError::Cancelled => self.keep_partial.load(Ordering::SeqCst),
            HttpError::Transport(_) | HttpError::Timeout(_) => true,
            _ => false,
        };
        let token = if keep && fs::metadata(partial.path).await.is_ok() {
            ResumeState::new(
                self.events.request(),
                partial.path.to_path_buf(),
                partial.received,
                partial.total,
                partial.validator,
            )
            .to_token()
        } else {
            None
        };

        if token.is_none() {
            discard(partial.path).await;
        } else {
            debug!(received = partial.received, "Kept partial download for resuming");
        }
        Outcome::failure(meta, error).with_resume_token(token)
    }

    async fn send(&self, body: RequestBody, report_upload: bool, extra: HeaderMap) -> Result<Response> {
        let info = self.events.request();
        let mut headers = info.headers.clone();
        headers.extend(extra);
        if let Some(credentials) = self.events.credentials() {
            credentials.apply(&mut headers);
        }

        let body = self.body(body, report_upload, &mut headers).await?;
        let mut builder = self
            .client
            .request(info.method.clone(), info.url.clone())
            .headers(headers)
            .timeout(info.timeout);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let timeout = info.timeout;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(HttpError::Cancelled),
            result = builder.send() => result.map_err(|e| HttpError::from_reqwest(e, timeout)),
        }
    }

    async fn body(&self, body: RequestBody, report_upload: bool, headers: &mut HeaderMap) -> Result<Option<Body>> {
        let body = match body {
            RequestBody::Empty => None,
            RequestBody::Bytes(bytes) if !report_upload => Some(Body::from(bytes)),
            RequestBody::Bytes(bytes) => {
                let total = bytes.len() as u64;
                headers.insert(CONTENT_LENGTH, HeaderValue::from(total));
                let chunks: Vec<std::io::Result<Bytes>> = (0..bytes.len())
                    .step_by(UPLOAD_CHUNK)
                    .map(|start| Ok(bytes.slice(start..(start + UPLOAD_CHUNK).min(bytes.len()))))
                    .collect();
                Some(self.counted(stream::iter(chunks), Some(total)))
            }
            RequestBody::File(path) => {
                let file = fs::File::open(&path)
                    .await
                    .map_err(|e| HttpError::io(&path, e))?;
                let total = file
                    .metadata()
                    .await
                    .map_err(|e| HttpError::io(&path, e))?
                    .len();
                headers.insert(CONTENT_LENGTH, HeaderValue::from(total));
                Some(self.counted(ReaderStream::new(file), Some(total)))
            }
            RequestBody::Stream(source) => Some(self.counted(source, None)),
        };
        Ok(body)
    }

    fn counted<S>(&self, source: S, total: Option<u64>) -> Body
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static,
    {
        let events = self.events.clone();
        let mut sent = 0u64;
        Body::wrap_stream(source.map(move |chunk| {
            if let Ok(bytes) = &chunk {
                sent += bytes.len() as u64;
                events.progress(Progress::new(sent, total));
            }
            chunk
        }))
    }

    fn record_response(&self, response: &Response) -> ResponseMeta {
        let meta = ResponseMeta {
            url: response.url().clone(),
            status: response.status(),
            headers: response.headers().clone(),
        };
        debug!(url = %meta.url, status = %meta.status, "Response received");
        self.events.response(meta.clone());
        meta
    }

    async fn next_chunk<S>(&mut self, chunks: &mut S) -> Result<Option<Bytes>>
    where
        S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
    {
        loop {
            let paused = *self.paused.borrow();
            if !paused {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(HttpError::Cancelled),
                changed = self.paused.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let timeout = self.events.request().timeout;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(HttpError::Cancelled),
            chunk = chunks.next() => chunk
                .transpose()
                .map_err(|e| HttpError::from_reqwest(e, timeout)),
        }
    }
}

/// Total size of a resumed body, checking the server honoured the range
fn resumed_total(response: &Response, offset: u64) -> Result<Option<u64>> {
    if response.status() != StatusCode::PARTIAL_CONTENT {
        return Err(HttpError::ResumeUnsupported(format!(
            "server answered the range request with {}",
            response.status()
        )));
    }

    let range = response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let Some(bytes_range) = range.strip_prefix("bytes ") else {
        return Ok(response.content_length().map(|len| offset + len));
    };
    let (span, total) = bytes_range.split_once('/').unwrap_or((bytes_range, "*"));
    let start = span.split('-').next().and_then(|s| s.trim().parse::<u64>().ok());
    if start != Some(offset) {
        return Err(HttpError::ResumeUnsupported(format!(
            "server resumed at {span} instead of byte {offset}"
        )));
    }
    Ok(total.trim().parse::<u64>().ok())
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial download");
        }
    }
}
