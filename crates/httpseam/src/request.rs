//! Request descriptors, parameter encoding and credentials

use std::{fmt, path::PathBuf, pin::Pin, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use futures::Stream;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Method,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use url::Url;

use crate::{
    config::ClientConfig,
    error::{HttpError, Result},
    multipart::EncodedMultipart,
};

/// Request parameters, encoded per [`ParameterEncoding`]
pub type Parameters = serde_json::Map<String, Value>;

/// Streaming request body; consumed by the request that sends it
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static>>;

/// Where URL-encoded parameters go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UrlDestination {
    /// Query string for GET, HEAD and DELETE; body otherwise
    #[default]
    MethodDependent,
    /// Always the query string
    QueryString,
    /// Always the body
    HttpBody,
}

/// How parameters are attached to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParameterEncoding {
    /// `application/x-www-form-urlencoded`
    Url(UrlDestination),
    /// `application/json` body
    Json,
}

impl Default for ParameterEncoding {
    fn default() -> Self {
        ParameterEncoding::Url(UrlDestination::MethodDependent)
    }
}

impl ParameterEncoding {
    /// Encode `parameters` into `url` or a returned body
    ///
    /// Sets `Content-Type` when the encoding produces a body and the caller
    /// has not set one already.
    pub fn encode(
        &self,
        method: &Method,
        url: &mut Url,
        headers: &mut HeaderMap,
        parameters: &Parameters,
    ) -> Result<Option<Bytes>> {
        match self {
            ParameterEncoding::Url(destination) => {
                if parameters.is_empty() {
                    return Ok(None);
                }
                let query = query_string(parameters);
                let in_query = match destination {
                    UrlDestination::QueryString => true,
                    UrlDestination::HttpBody => false,
                    UrlDestination::MethodDependent => {
                        matches!(*method, Method::GET | Method::HEAD | Method::DELETE)
                    }
                };

                if in_query {
                    let merged = match url.query() {
                        Some(existing) if !existing.is_empty() => format!("{existing}&{query}"),
                        _ => query,
                    };
                    url.set_query(Some(&merged));
                    Ok(None)
                } else {
                    if !headers.contains_key(CONTENT_TYPE) {
                        headers.insert(
                            CONTENT_TYPE,
                            HeaderValue::from_static(
                                "application/x-www-form-urlencoded; charset=utf-8",
                            ),
                        );
                    }
                    Ok(Some(Bytes::from(query)))
                }
            }
            ParameterEncoding::Json => {
                let body = serde_json::to_vec(parameters)
                    .map_err(|e| HttpError::Encoding(e.to_string()))?;
                if !headers.contains_key(CONTENT_TYPE) {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                }
                Ok(Some(Bytes::from(body)))
            }
        }
    }
}

/// Percent-encoded `key=value` pairs joined with `&`
///
/// Nested arrays become `key[]=v`, nested objects `key[sub]=v`, booleans
/// `1`/`0`. Keys come out sorted.
pub fn query_string(parameters: &Parameters) -> String {
    let mut components = Vec::new();
    for (key, value) in parameters {
        query_components(key, value, &mut components);
    }
    components
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn query_components(key: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (nested, value) in map {
                query_components(&format!("{key}[{nested}]"), value, out);
            }
        }
        Value::Array(items) => {
            for value in items {
                query_components(&format!("{key}[]"), value, out);
            }
        }
        Value::Bool(flag) => out.push((escape(key), if *flag { "1" } else { "0" }.to_string())),
        Value::Null => out.push((escape(key), String::new())),
        Value::Number(number) => out.push((escape(key), escape(&number.to_string()))),
        Value::String(text) => out.push((escape(key), escape(text))),
    }
}

fn escape(component: &str) -> String {
    urlencoding::encode(component).into_owned()
}

/// A request assembled ahead of time
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// What a request is aimed at
#[derive(Debug, Clone)]
pub enum Target {
    /// A parsed URL
    Url(Url),
    /// A URL string, validated when the request is created
    Raw(String),
    /// A pre-built request; its method wins over [`RequestOptions::method`]
    Descriptor(RequestDescriptor),
}

impl From<Url> for Target {
    fn from(url: Url) -> Self {
        Target::Url(url)
    }
}

impl From<&str> for Target {
    fn from(url: &str) -> Self {
        Target::Raw(url.to_string())
    }
}

impl From<String> for Target {
    fn from(url: String) -> Self {
        Target::Raw(url)
    }
}

impl From<&String> for Target {
    fn from(url: &String) -> Self {
        Target::Raw(url.clone())
    }
}

impl From<RequestDescriptor> for Target {
    fn from(descriptor: RequestDescriptor) -> Self {
        Target::Descriptor(descriptor)
    }
}

/// Per-call request options; every field is optional
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Method,
    pub parameters: Option<Parameters>,
    pub encoding: Option<ParameterEncoding>,
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Default::default()
        }
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_encoding(mut self, encoding: ParameterEncoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Shape of a request body, without the bytes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BodyDescriptor {
    #[default]
    None,
    EncodedParameters { len: u64 },
    Bytes { len: u64 },
    File { path: PathBuf },
    Stream,
    Multipart {
        content_length: u64,
        on_disk: bool,
    },
}

/// Snapshot of a request as created; later client changes do not touch it
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: BodyDescriptor,
    pub timeout: Duration,
}

/// Upload payloads
pub enum UploadPayload {
    /// In-memory bytes
    Bytes(Bytes),
    /// A file read from its path; the caller's file is left untouched
    File(PathBuf),
    /// A stream, consumed by the upload
    Stream(ByteStream),
    /// A staged multipart body
    Multipart(EncodedMultipart),
}

impl fmt::Debug for UploadPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadPayload::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            UploadPayload::File(path) => f.debug_tuple("File").field(path).finish(),
            UploadPayload::Stream(_) => f.write_str("Stream"),
            UploadPayload::Multipart(encoded) => f.debug_tuple("Multipart").field(encoded).finish(),
        }
    }
}

/// Body bytes handed to a driver
pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    File(PathBuf),
    Stream(ByteStream),
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            RequestBody::File(path) => f.debug_tuple("File").field(path).finish(),
            RequestBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Credentials applied on the next round-trip
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic {
        username: String,
        password: Option<String>,
    },
    Bearer(String),
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Basic {
            username: username.into(),
            password: Some(password.into()),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Credentials::Bearer(token.into())
    }

    /// Value of the `Authorization` header
    pub fn header_value(&self) -> String {
        match self {
            Credentials::Basic { username, password } => {
                let pair = format!("{username}:{}", password.as_deref().unwrap_or_default());
                format!("Basic {}", STANDARD.encode(pair))
            }
            Credentials::Bearer(token) => format!("Bearer {token}"),
        }
    }

    /// Set `Authorization` on `headers`
    pub fn apply(&self, headers: &mut HeaderMap) {
        match HeaderValue::from_str(&self.header_value()) {
            Ok(mut value) => {
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
            Err(_) => warn!("Credentials contain characters not allowed in a header; skipped"),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Credentials::Bearer(_) => f.write_str("Bearer(..)"),
        }
    }
}

/// Resolve, merge and encode a request against a config snapshot
///
/// Fails only on programmer errors: a URL that does not parse or is not
/// http(s), or a header that cannot be sent.
pub(crate) fn prepare(
    target: Target,
    options: RequestOptions,
    config: &ClientConfig,
) -> Result<(RequestInfo, RequestBody)> {
    let (method, mut url, target_headers, target_body) = match target {
        Target::Url(url) => (options.method, url, HeaderMap::new(), None),
        Target::Raw(raw) => {
            let url = Url::parse(&raw).map_err(|e| HttpError::InvalidUrl(format!("{raw}: {e}")))?;
            (options.method, url, HeaderMap::new(), None)
        }
        Target::Descriptor(descriptor) => (
            descriptor.method,
            descriptor.url,
            descriptor.headers,
            descriptor.body,
        ),
    };

    if !matches!(url.scheme(), "http" | "https") || !url.has_host() {
        return Err(HttpError::InvalidUrl(format!(
            "{url}: only http and https URLs with a host are supported"
        )));
    }

    let mut headers = HeaderMap::new();
    for (name, value) in &config.default_headers {
        headers.insert(header_name(name)?, header_value(value)?);
    }
    for (name, value) in target_headers.iter() {
        headers.insert(name.clone(), value.clone());
    }
    for (name, value) in &options.headers {
        headers.insert(header_name(name)?, header_value(value)?);
    }

    let mut body = match target_body {
        Some(bytes) => {
            let len = bytes.len() as u64;
            (BodyDescriptor::Bytes { len }, RequestBody::Bytes(bytes))
        }
        None => (BodyDescriptor::None, RequestBody::Empty),
    };

    if let Some(parameters) = &options.parameters {
        let encoding = options.encoding.unwrap_or(config.default_encoding);
        if let Some(encoded) = encoding.encode(&method, &mut url, &mut headers, parameters)? {
            let len = encoded.len() as u64;
            body = (BodyDescriptor::EncodedParameters { len }, RequestBody::Bytes(encoded));
        }
    }

    let info = RequestInfo {
        method,
        url,
        headers,
        body: body.0,
        timeout: options.timeout.unwrap_or(config.timeout),
    };
    Ok((info, body.1))
}

/// Like [`prepare`], with the upload payload as the body
///
/// Parameters always go to the query string so they cannot collide with
/// the payload.
pub(crate) fn prepare_upload(
    payload: UploadPayload,
    target: Target,
    mut options: RequestOptions,
    config: &ClientConfig,
) -> Result<(RequestInfo, RequestBody)> {
    if options.parameters.is_some() {
        options.encoding = Some(ParameterEncoding::Url(UrlDestination::QueryString));
    }
    if let UploadPayload::Multipart(encoded) = &payload {
        options
            .headers
            .push((CONTENT_TYPE.as_str().to_string(), encoded.content_type().to_string()));
    }

    let (mut info, _) = prepare(target, options, config)?;
    let (descriptor, body) = match payload {
        UploadPayload::Bytes(bytes) => (
            BodyDescriptor::Bytes {
                len: bytes.len() as u64,
            },
            RequestBody::Bytes(bytes),
        ),
        UploadPayload::File(path) => (
            BodyDescriptor::File { path: path.clone() },
            RequestBody::File(path),
        ),
        UploadPayload::Stream(stream) => (BodyDescriptor::Stream, RequestBody::Stream(stream)),
        UploadPayload::Multipart(encoded) => {
            let descriptor = BodyDescriptor::Multipart {
                content_length: encoded.content_length(),
                on_disk: encoded.is_on_disk(),
            };
            (descriptor, encoded.into_body())
        }
    };
    info.body = descriptor;
    Ok((info, body))
}

fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| HttpError::InvalidHeader(format!("{name}: {e}")))
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| HttpError::InvalidHeader(format!("{value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Parameters {
        match value {
            Value::Object(map) => map,
            _ => panic!("parameters must be an object"),
        }
    }

    #[test]
    fn test_query_string_nested_and_sorted() {
        let query = query_string(&params(json!({
            "z": "last",
            "a": [1, 2],
            "m": {"k": true, "j": false},
            "s": "hello world&more",
        })));
        assert_eq!(
            query,
            "a%5B%5D=1&a%5B%5D=2&m%5Bj%5D=0&m%5Bk%5D=1&s=hello%20world%26more&z=last"
        );
    }

    #[test]
    fn test_get_parameters_go_to_query() {
        let config = ClientConfig::default();
        let options = RequestOptions::default().with_parameters(params(json!({"q": "rust"})));
        let (info, body) = prepare("https://example.com/search?page=2".into(), options, &config).unwrap();

        assert_eq!(info.url.as_str(), "https://example.com/search?page=2&q=rust");
        assert_eq!(info.body, BodyDescriptor::None);
        assert!(matches!(body, RequestBody::Empty));
    }

    #[test]
    fn test_post_parameters_go_to_body() {
        let config = ClientConfig::default();
        let options = RequestOptions::new(Method::POST).with_parameters(params(json!({"name": "a b"})));
        let (info, body) = prepare("https://example.com/form".into(), options, &config).unwrap();

        assert_eq!(info.url.query(), None);
        assert_eq!(
            info.headers.get(CONTENT_TYPE).unwrap(),
            "application/x-www-form-urlencoded; charset=utf-8"
        );
        match body {
            RequestBody::Bytes(bytes) => assert_eq!(&bytes[..], b"name=a%20b"),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_json_encoding_keeps_explicit_content_type() {
        let config = ClientConfig::default();
        let options = RequestOptions::new(Method::PUT)
            .with_parameters(params(json!({"n": 1})))
            .with_encoding(ParameterEncoding::Json)
            .with_header("Content-Type", "application/vnd.api+json");
        let (info, body) = prepare("https://example.com/items/1".into(), options, &config).unwrap();

        assert_eq!(info.headers.get(CONTENT_TYPE).unwrap(), "application/vnd.api+json");
        assert_eq!(info.body, BodyDescriptor::EncodedParameters { len: 7 });
        match body {
            RequestBody::Bytes(bytes) => assert_eq!(&bytes[..], br#"{"n":1}"#),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_default_headers_are_overridden_per_call() {
        let config = ClientConfig::default()
            .with_default_header("Accept", "text/plain")
            .with_default_header("X-Client", "demo");
        let options = RequestOptions::default().with_header("Accept", "application/json");
        let (info, _) = prepare("https://example.com".into(), options, &config).unwrap();

        assert_eq!(info.headers.get("accept").unwrap(), "application/json");
        assert_eq!(info.headers.get("x-client").unwrap(), "demo");
    }

    #[test]
    fn test_descriptor_method_wins() {
        let config = ClientConfig::default();
        let descriptor = RequestDescriptor::new(Method::PATCH, Url::parse("https://example.com/x").unwrap())
            .with_body("raw");
        let (info, body) = prepare(descriptor.into(), RequestOptions::default(), &config).unwrap();

        assert_eq!(info.method, Method::PATCH);
        assert_eq!(info.body, BodyDescriptor::Bytes { len: 3 });
        assert!(matches!(body, RequestBody::Bytes(_)));
    }

    #[test]
    fn test_malformed_url_fails_synchronously() {
        let config = ClientConfig::default();
        let result = prepare("not a url".into(), RequestOptions::default(), &config);
        assert!(matches!(result, Err(HttpError::InvalidUrl(_))));

        let result = prepare("ftp://example.com/file".into(), RequestOptions::default(), &config);
        assert!(matches!(result, Err(HttpError::InvalidUrl(_))));
    }

    #[test]
    fn test_bad_header_fails_synchronously() {
        let config = ClientConfig::default();
        let options = RequestOptions::default().with_header("Bad Header", "x");
        let result = prepare("https://example.com".into(), options, &config);
        assert!(matches!(result, Err(HttpError::InvalidHeader(_))));
    }

    #[test]
    fn test_timeout_snapshot() {
        let config = ClientConfig::default().with_timeout(Duration::from_secs(3));
        let (info, _) = prepare("https://example.com".into(), RequestOptions::default(), &config).unwrap();
        assert_eq!(info.timeout, Duration::from_secs(3));

        let options = RequestOptions::default().with_timeout(Duration::from_secs(9));
        let (info, _) = prepare("https://example.com".into(), options, &config).unwrap();
        assert_eq!(info.timeout, Duration::from_secs(9));
    }

    #[test]
    fn test_upload_parameters_stay_in_query() {
        let config = ClientConfig::default();
        let options = RequestOptions::new(Method::POST).with_parameters(params(json!({"v": 2})));
        let payload = UploadPayload::Bytes(Bytes::from_static(b"payload"));
        let (info, body) = prepare_upload(payload, "https://example.com/up".into(), options, &config).unwrap();

        assert_eq!(info.url.query(), Some("v=2"));
        assert_eq!(info.body, BodyDescriptor::Bytes { len: 7 });
        assert!(matches!(body, RequestBody::Bytes(_)));
    }

    #[test]
    fn test_credentials_header_values() {
        assert_eq!(
            Credentials::basic("user", "pass").header_value(),
            "Basic dXNlcjpwYXNz"
        );
        assert_eq!(Credentials::bearer("t0k").header_value(), "Bearer t0k");

        let mut headers = HeaderMap::new();
        Credentials::bearer("t0k").apply(&mut headers);
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer t0k");
    }

    #[test]
    fn test_credentials_debug_hides_secrets() {
        let text = format!("{:?}", Credentials::basic("user", "hunter2"));
        assert!(!text.contains("hunter2"));
    }
}
