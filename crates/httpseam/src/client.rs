//! The client seam and its reqwest-backed implementation

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::{
    header::{HeaderValue, CONTENT_TYPE},
    Method,
};
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, warn};
use url::Url;

use crate::{
    config::ClientConfig,
    download::{plan_resume, DestinationPolicy, ResumeToken},
    error::{HttpError, Result},
    multipart::{discard_staged, MultipartEncodingResult, MultipartFormData, StagedBody},
    queue::DeliveryQueue,
    request::{prepare, prepare_upload, RequestDescriptor, RequestInfo, RequestOptions, Target, UploadPayload},
    task::{Core, DataRequest, DownloadRequest, Driver, Rejecting, Request, Resumable, UploadRequest},
    transport::{Job, ReqwestDriver},
};

/// Mockable HTTP client
///
/// Application code depends on `dyn Client` (or a generic `C: Client`) and
/// gets either [`SessionClient`] in production or
/// [`FakeClient`](crate::fake::FakeClient) in tests.
///
/// Creation fails only for programmer errors such as an unparseable URL.
/// Everything that can go wrong on the wire is delivered through the
/// returned handle.
#[async_trait]
pub trait Client: Send + Sync {
    /// Snapshot of the current configuration
    fn config(&self) -> Arc<ClientConfig>;

    /// Create a data request
    fn request(&self, target: Target, options: RequestOptions) -> Result<DataRequest>;

    /// Create a download
    fn download(
        &self,
        target: Target,
        options: RequestOptions,
        destination: DestinationPolicy,
    ) -> Result<DownloadRequest>;

    /// Continue a download from a resume token
    ///
    /// Never fails up front; an unusable token yields a handle that ends
    /// with [`HttpError::ResumeUnsupported`].
    fn download_resuming(&self, token: ResumeToken, destination: DestinationPolicy) -> DownloadRequest;

    /// Create an upload
    fn upload(
        &self,
        payload: UploadPayload,
        target: Target,
        options: RequestOptions,
    ) -> Result<UploadRequest>;

    /// Encode a multipart form and upload it
    ///
    /// Bodies smaller than `threshold` (the configured threshold when
    /// `None`) are encoded in memory; larger ones are written to a staging
    /// file that is removed once the upload terminates, or once every handle
    /// is dropped if it never started.
    async fn upload_multipart(
        &self,
        form: MultipartFormData,
        threshold: Option<u64>,
        target: Target,
        options: RequestOptions,
    ) -> Result<MultipartEncodingResult> {
        let config = self.config();
        let threshold = threshold.unwrap_or(config.multipart_memory_threshold);
        let staging_dir = config.staging_dir();
        let encoded = form.encode_with_threshold(threshold, &staging_dir).await?;
        let file_location = encoded.file_location().map(Path::to_path_buf);

        let request = match self.upload(UploadPayload::Multipart(encoded), target, options) {
            Ok(request) => request,
            Err(e) => {
                if let Some(path) = &file_location {
                    discard_staged(path);
                }
                return Err(e);
            }
        };

        if let Some(path) = file_location.clone() {
            let staged = StagedBody::new(path);
            request.core().observe_completion(
                Some(DeliveryQueue::inline()),
                Box::new(move |_, _| drop(staged)),
            );
        }

        Ok(MultipartEncodingResult {
            request,
            streaming_from_disk: file_location.is_some(),
            file_location,
        })
    }
}

/// Convenience verbs for every [`Client`]
pub trait ClientExt: Client {
    /// GET `target`
    fn get(&self, target: impl Into<Target>) -> Result<DataRequest> {
        self.request(target.into(), RequestOptions::new(Method::GET))
    }

    /// DELETE `target`
    fn delete(&self, target: impl Into<Target>) -> Result<DataRequest> {
        self.request(target.into(), RequestOptions::new(Method::DELETE))
    }

    /// POST `body` serialized as JSON
    fn post_json<T>(&self, url: &str, body: &T) -> Result<DataRequest>
    where
        T: Serialize + ?Sized,
    {
        let url = Url::parse(url).map_err(|e| HttpError::InvalidUrl(format!("{url}: {e}")))?;
        let body = serde_json::to_vec(body).map_err(|e| HttpError::Encoding(e.to_string()))?;
        let descriptor = RequestDescriptor::new(Method::POST, url)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_body(body);
        self.request(descriptor.into(), RequestOptions::default())
    }

    /// Download `target` to `path`, failing if the file exists
    fn download_to(&self, target: impl Into<Target>, path: impl AsRef<Path>) -> Result<DownloadRequest> {
        self.download(
            target.into(),
            RequestOptions::new(Method::GET),
            DestinationPolicy::file(path.as_ref()),
        )
    }

    /// Upload `bytes` with `method`
    fn upload_bytes(
        &self,
        target: impl Into<Target>,
        method: Method,
        bytes: impl Into<Bytes>,
    ) -> Result<UploadRequest> {
        self.upload(
            UploadPayload::Bytes(bytes.into()),
            target.into(),
            RequestOptions::new(method),
        )
    }
}

impl<C: Client + ?Sized> ClientExt for C {}

/// Wrap a prepared request in a handle, starting it when configured to
pub(crate) fn launch<K>(
    info: RequestInfo,
    driver: Box<dyn Driver>,
    queue: &DeliveryQueue,
    start_immediately: bool,
) -> Request<K> {
    let request = Request::from_core(Core::new(info, driver, queue.clone()));
    if start_immediately {
        request.resume();
    }
    request
}

/// Handle for a resume token that cannot be used
pub(crate) fn reject_resume(info: RequestInfo, error: HttpError, queue: &DeliveryQueue, start: bool) -> DownloadRequest {
    warn!(url = %info.url, error = %error, "Resume token rejected");
    launch(info, Box::new(Rejecting(error)), queue, start)
}

/// Production HTTP client
pub struct SessionClient {
    inner: reqwest::Client,
    config: RwLock<Arc<ClientConfig>>,
    queue: DeliveryQueue,
    runtime: Option<Handle>,
}

impl SessionClient {
    /// Create a new HTTP client with configuration
    ///
    /// Picks up the current Tokio runtime, if any, to run transfers on.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .redirect(if config.max_redirects > 0 {
                reqwest::redirect::Policy::limited(config.max_redirects)
            } else {
                reqwest::redirect::Policy::none()
            });

        // Configure proxy if provided
        if let Some(proxy_url) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| HttpError::InvalidProxy(e.to_string()))?;
            builder = builder.proxy(proxy);
        }

        // Configure connection pooling
        if config.pool_enabled {
            builder = builder.pool_idle_timeout(config.pool_idle_timeout);
        } else {
            builder = builder.pool_max_idle_per_host(0);
        }

        let inner = builder
            .build()
            .map_err(|e| HttpError::BuildError(e.to_string()))?;
        let queue = DeliveryQueue::for_mode(config.delivery)?;

        Ok(Self {
            inner,
            config: RwLock::new(Arc::new(config)),
            queue,
            runtime: Handle::try_current().ok(),
        })
    }

    /// Create HTTP client with default configuration
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Deliver observers on `queue` unless a call names its own
    pub fn with_delivery_queue(mut self, queue: DeliveryQueue) -> Self {
        self.queue = queue;
        self
    }

    /// Run transfers on `handle`
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Get underlying reqwest client (for advanced usage)
    pub fn inner(&self) -> &reqwest::Client {
        &self.inner
    }

    /// Default delivery queue
    pub fn delivery_queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    /// Change per-request settings for requests created from now on
    ///
    /// Connection settings (proxy, pooling, redirects, user agent) are fixed
    /// when the client is built.
    pub fn update_config(&self, update: impl FnOnce(&mut ClientConfig)) {
        let mut guard = self.config.write();
        let mut config = ClientConfig::clone(&guard);
        update(&mut config);
        *guard = Arc::new(config);
    }

    fn driver(&self, job: Job) -> Box<dyn Driver> {
        Box::new(ReqwestDriver::new(self.inner.clone(), self.runtime.clone(), job))
    }
}

#[async_trait]
impl Client for SessionClient {
    fn config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config.read())
    }

    fn request(&self, target: Target, options: RequestOptions) -> Result<DataRequest> {
        let config = self.config();
        let (info, body) = prepare(target, options, &config)?;
        debug!(method = %info.method, url = %info.url, "HTTP request");
        Ok(launch(
            info,
            self.driver(Job::Data(body)),
            &self.queue,
            config.start_requests_immediately,
        ))
    }

    fn download(
        &self,
        target: Target,
        options: RequestOptions,
        destination: DestinationPolicy,
    ) -> Result<DownloadRequest> {
        let config = self.config();
        let (info, _) = prepare(target, options, &config)?;
        debug!(method = %info.method, url = %info.url, "HTTP download");
        let job = Job::Download {
            destination,
            staging_dir: config.staging_dir(),
            resume: None,
        };
        Ok(launch(info, self.driver(job), &self.queue, config.start_requests_immediately))
    }

    fn download_resuming(&self, token: ResumeToken, destination: DestinationPolicy) -> DownloadRequest {
        let config = self.config();
        let plan = plan_resume(&token, config.timeout, &config.staging_dir());
        match plan.state {
            Ok(state) => {
                debug!(url = %plan.info.url, offset = state.received, "HTTP download resumed");
                let job = Job::Download {
                    destination,
                    staging_dir: config.staging_dir(),
                    resume: Some(state),
                };
                launch(plan.info, self.driver(job), &self.queue, config.start_requests_immediately)
            }
            Err(e) => reject_resume(plan.info, e, &self.queue, config.start_requests_immediately),
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
        debug!(method = %info.method, url = %info.url, body = ?info.body, "HTTP upload");
        Ok(launch(
            info,
            self.driver(Job::Upload(body)),
            &self.queue,
            config.start_requests_immediately,
        ))
    }
}

/// Create a shared HTTP client (Arc-wrapped for cloning)
pub fn shared_client(config: ClientConfig) -> Result<Arc<dyn Client>> {
    Ok(Arc::new(SessionClient::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryMode;
    use crate::task::RequestState;
    use std::time::Duration;

    fn offline() -> ClientConfig {
        ClientConfig::default()
            .with_delivery(DeliveryMode::Inline)
            .with_start_requests_immediately(false)
    }

    #[test]
    fn test_client_creation_with_defaults() {
        let client = SessionClient::with_defaults();
        assert!(client.is_ok());
    }

    #[test]
    fn test_client_creation_with_config() {
        let config = ClientConfig {
            timeout: Duration::from_secs(10),
            ..offline()
        };

        let client = SessionClient::new(config).unwrap();
        assert_eq!(client.config().timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_client_with_proxy() {
        let config = offline().with_proxy("http://proxy.example.com:8080");

        let client = SessionClient::new(config);
        assert!(client.is_ok());
    }

    #[test]
    fn test_invalid_proxy() {
        let config = offline().with_proxy("invalid-proxy");

        let result = SessionClient::new(config);
        assert!(matches!(result, Err(HttpError::InvalidProxy(_))));
    }

    #[test]
    fn test_invalid_url_fails_at_creation() {
        let client = SessionClient::new(offline()).unwrap();
        assert!(matches!(client.get("not a url"), Err(HttpError::InvalidUrl(_))));
        assert!(matches!(client.get("ftp://example.com/x"), Err(HttpError::InvalidUrl(_))));
    }

    #[test]
    fn test_deferred_start_leaves_request_created() {
        let client = SessionClient::new(offline()).unwrap();
        let request = client.get("https://example.com/").unwrap();
        assert_eq!(request.state(), RequestState::Created);
    }

    #[test]
    fn test_update_config_applies_to_new_requests() {
        let client = SessionClient::new(offline()).unwrap();
        let before = client.get("https://example.com/").unwrap();

        client.update_config(|config| config.timeout = Duration::from_secs(3));
        let after = client.get("https://example.com/").unwrap();

        assert_eq!(before.info().timeout, Duration::from_secs(60));
        assert_eq!(after.info().timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_bad_resume_token_yields_failed_handle() {
        let client = SessionClient::new(offline().with_start_requests_immediately(true)).unwrap();
        let request = client.download_resuming(ResumeToken::from("garbage".to_string()), DestinationPolicy::Memory);
        assert_eq!(request.state(), RequestState::Failed);
        assert!(request.resume_token().is_none());
    }

    #[test]
    fn test_shared_client_is_object_safe() {
        let client: Arc<dyn Client> = shared_client(offline()).unwrap();
        let request = client.get("https://example.com/").unwrap();
        assert_eq!(request.info().method, Method::GET);
    }
}
