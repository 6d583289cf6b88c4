//! Terminal responses and body decoding

use std::{fmt, fs, marker::PhantomData, path::PathBuf};

use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, CONTENT_TYPE},
    StatusCode,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::{
    download::ResumeToken,
    error::{HttpError, Result},
    task::{Outcome, Payload, ResponseMeta},
};

/// Turns a finished body into a typed value
///
/// Runs on the observer's delivery queue. Failures are delivered as
/// [`HttpError::Decoding`] results, never raised.
pub trait ResponseSerializer: Send + 'static {
    type Output: Send + 'static;

    fn serialize(&self, meta: Option<&ResponseMeta>, payload: &Payload) -> Result<Self::Output>;
}

/// Why a body could not be decoded
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("body is not valid {0}")]
    Charset(Charset),

    #[error("top-level JSON value must be an object or an array")]
    Fragment,
}

/// Text encodings understood by [`TextSerializer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Charset {
    Utf8,
    Ascii,
    Latin1,
    /// Byte order taken from the BOM, big-endian without one
    Utf16,
    Utf16Le,
    Utf16Be,
}

impl Charset {
    /// Look up an IANA label, ignoring case and quotes
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().trim_matches('"').to_ascii_lowercase();
        match label.as_str() {
            "utf-8" | "utf8" => Some(Charset::Utf8),
            "us-ascii" | "ascii" => Some(Charset::Ascii),
            "iso-8859-1" | "iso8859-1" | "latin1" | "latin-1" => Some(Charset::Latin1),
            "utf-16le" => Some(Charset::Utf16Le),
            "utf-16" => Some(Charset::Utf16),
            "utf-16be" => Some(Charset::Utf16Be),
            _ => None,
        }
    }

    /// Charset declared by a `Content-Type` header
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let content_type = headers.get(CONTENT_TYPE)?.to_str().ok()?;
        content_type
            .split(';')
            .skip(1)
            .filter_map(|param| param.split_once('='))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("charset"))
            .and_then(|(_, value)| Charset::from_label(value))
    }

    pub fn decode(self, bytes: &[u8]) -> std::result::Result<String, BodyError> {
        let invalid = || BodyError::Charset(self);
        match self {
            Charset::Utf8 => {
                let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
                String::from_utf8(bytes.to_vec()).map_err(|_| invalid())
            }
            Charset::Ascii if bytes.is_ascii() => Ok(bytes.iter().map(|&b| b as char).collect()),
            Charset::Ascii => Err(invalid()),
            Charset::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
            Charset::Utf16 => {
                let order = if bytes.starts_with(b"\xFF\xFE") {
                    Charset::Utf16Le
                } else {
                    Charset::Utf16Be
                };
                order.decode(bytes).map_err(|_| invalid())
            }
            Charset::Utf16Le | Charset::Utf16Be => {
                if bytes.len() % 2 != 0 {
                    return Err(invalid());
                }
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| match self {
                        Charset::Utf16Le => u16::from_le_bytes([pair[0], pair[1]]),
                        _ => u16::from_be_bytes([pair[0], pair[1]]),
                    })
                    .collect();
                let text = String::from_utf16(&units).map_err(|_| invalid())?;
                Ok(text.strip_prefix('\u{FEFF}').map(str::to_string).unwrap_or(text))
            }
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Charset::Utf8 => "UTF-8",
            Charset::Ascii => "US-ASCII",
            Charset::Latin1 => "ISO-8859-1",
            Charset::Utf16 => "UTF-16",
            Charset::Utf16Le => "UTF-16LE",
            Charset::Utf16Be => "UTF-16BE",
        })
    }
}

fn body_bytes(payload: &Payload) -> Result<Bytes> {
    match payload {
        Payload::Empty => Ok(Bytes::new()),
        Payload::Bytes(bytes) => Ok(bytes.clone()),
        Payload::File(path) => fs::read(path)
            .map(Bytes::from)
            .map_err(|e| HttpError::io(path, e)),
    }
}

/// 204 and 205 responses carry no body by definition
fn empty_allowed(meta: Option<&ResponseMeta>) -> bool {
    meta.is_some_and(|meta| {
        matches!(
            meta.status,
            StatusCode::NO_CONTENT | StatusCode::RESET_CONTENT
        )
    })
}

/// Raw body bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl ResponseSerializer for BytesSerializer {
    type Output = Bytes;

    fn serialize(&self, _meta: Option<&ResponseMeta>, payload: &Payload) -> Result<Bytes> {
        body_bytes(payload)
    }
}

/// Body decoded as text
///
/// The charset is the explicit one, else the `Content-Type` charset, else
/// Latin-1.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextSerializer {
    pub charset: Option<Charset>,
}

impl TextSerializer {
    pub fn with_charset(charset: Charset) -> Self {
        Self {
            charset: Some(charset),
        }
    }
}

impl ResponseSerializer for TextSerializer {
    type Output = String;

    fn serialize(&self, meta: Option<&ResponseMeta>, payload: &Payload) -> Result<String> {
        let bytes = body_bytes(payload)?;
        let charset = self
            .charset
            .or_else(|| meta.and_then(|meta| Charset::from_headers(&meta.headers)))
            .unwrap_or(Charset::Latin1);
        charset
            .decode(&bytes)
            .map_err(|e| HttpError::decoding(bytes.clone(), e))
    }
}

/// Options for JSON decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonOptions {
    /// Accept scalars (`"text"`, `3`, `null`) as the top-level value
    pub allow_fragments: bool,
}

impl Default for JsonOptions {
    fn default() -> Self {
        Self {
            allow_fragments: true,
        }
    }
}

/// Body parsed as an untyped JSON value
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer {
    pub options: JsonOptions,
}

impl ResponseSerializer for JsonSerializer {
    type Output = Value;

    fn serialize(&self, meta: Option<&ResponseMeta>, payload: &Payload) -> Result<Value> {
        let bytes = body_bytes(payload)?;
        if bytes.is_empty() && empty_allowed(meta) {
            return Ok(Value::Null);
        }
        let value: Value =
            serde_json::from_slice(&bytes).map_err(|e| HttpError::decoding(bytes.clone(), e))?;
        if !self.options.allow_fragments && !(value.is_object() || value.is_array()) {
            return Err(HttpError::decoding(bytes, BodyError::Fragment));
        }
        Ok(value)
    }
}

/// Body deserialized into `T`
pub struct DecodableSerializer<T> {
    target: PhantomData<fn() -> T>,
}

impl<T> DecodableSerializer<T> {
    pub fn new() -> Self {
        Self {
            target: PhantomData,
        }
    }
}

impl<T> Default for DecodableSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for DecodableSerializer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(std::any::type_name::<Self>())
    }
}

impl<T> ResponseSerializer for DecodableSerializer<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Output = T;

    fn serialize(&self, meta: Option<&ResponseMeta>, payload: &Payload) -> Result<T> {
        let bytes = body_bytes(payload)?;
        if bytes.is_empty() && empty_allowed(meta) {
            return serde_json::from_value(Value::Null).map_err(|e| HttpError::decoding(bytes, e));
        }
        serde_json::from_slice(&bytes).map_err(|e| HttpError::decoding(bytes.clone(), e))
    }
}

/// Structured formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StructuredFormat {
    #[default]
    Json,
}

/// Decoding chosen at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodingStrategy {
    Bytes,
    Text {
        charset: Option<Charset>,
    },
    Structured {
        format: StructuredFormat,
        options: JsonOptions,
    },
}

impl DecodingStrategy {
    pub fn text() -> Self {
        DecodingStrategy::Text { charset: None }
    }

    pub fn json() -> Self {
        DecodingStrategy::Structured {
            format: StructuredFormat::Json,
            options: JsonOptions::default(),
        }
    }
}

/// Body produced by a [`DecodingStrategy`]
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Bytes(Bytes),
    Text(String),
    Structured(Value),
}

impl ResponseSerializer for DecodingStrategy {
    type Output = ResponseBody;

    fn serialize(&self, meta: Option<&ResponseMeta>, payload: &Payload) -> Result<ResponseBody> {
        match *self {
            DecodingStrategy::Bytes => BytesSerializer.serialize(meta, payload).map(ResponseBody::Bytes),
            DecodingStrategy::Text { charset } => TextSerializer { charset }
                .serialize(meta, payload)
                .map(ResponseBody::Text),
            DecodingStrategy::Structured {
                format: StructuredFormat::Json,
                options,
            } => JsonSerializer { options }
                .serialize(meta, payload)
                .map(ResponseBody::Structured),
        }
    }
}

/// Terminal result of a request
#[derive(Debug)]
pub struct HttpResponse<T> {
    /// Status line and headers, when a response arrived
    pub meta: Option<ResponseMeta>,
    /// Final location of a downloaded body
    pub file_location: Option<PathBuf>,
    /// Token for continuing a cancelled or interrupted download
    pub resume_token: Option<ResumeToken>,
    pub retry_count: u32,
    pub result: Result<T>,
}

impl<T> HttpResponse<T> {
    pub(crate) fn from_outcome<S>(outcome: &Outcome, serializer: &S, retry_count: u32) -> Self
    where
        S: ResponseSerializer<Output = T>,
    {
        let result = match &outcome.error {
            Some(error) => Err(error.clone()),
            None => serializer.serialize(outcome.meta.as_ref(), &outcome.payload),
        };
        let file_location = match &outcome.payload {
            Payload::File(path) => Some(path.clone()),
            _ => None,
        };
        Self {
            meta: outcome.meta.clone(),
            file_location,
            resume_token: outcome.resume_token.clone(),
            retry_count,
            result,
        }
    }

    /// Response for a request whose lifecycle went away without a result
    pub(crate) fn detached(error: HttpError) -> Self {
        Self {
            meta: None,
            file_location: None,
            resume_token: None,
            retry_count: 0,
            result: Err(error),
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.meta.as_ref().map(|meta| meta.status)
    }

    pub fn headers(&self) -> Option<&HeaderMap> {
        self.meta.as_ref().map(|meta| &meta.headers)
    }

    pub fn url(&self) -> Option<&Url> {
        self.meta.as_ref().map(|meta| &meta.url)
    }

    pub fn value(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&HttpError> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<T> {
        self.result
    }
}
