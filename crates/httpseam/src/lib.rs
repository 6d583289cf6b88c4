//! Testable HTTP facade
//!
//! Application code talks to the [`Client`] trait. [`SessionClient`]
//! forwards to reqwest; [`FakeClient`] answers from scripted stubs. Both
//! run requests through one lifecycle core, so either can stand in for the
//! other.
//!
//! ## Features
//!
//! - **Trait-based design**: `Arc<dyn Client>` or generics over `C: Client`
//! - **Request handles**: resume, suspend, cancel, progress and completion
//!   observers with exactly-once terminal delivery
//! - **Downloads**: file destinations and resume tokens
//! - **Uploads**: bytes, files, streams and multipart forms staged to disk
//!   above a size threshold
//! - **Decoding**: bytes, text with charset detection, JSON, serde types

pub mod client;
pub mod config;
pub mod download;
pub mod error;
pub mod fake;
pub mod multipart;
pub mod queue;
pub mod request;
pub mod response;
pub mod task;
mod transport;

pub use client::{shared_client, Client, ClientExt, SessionClient};
pub use config::{ClientConfig, DeliveryMode};
pub use download::{ConflictPolicy, DestinationPolicy, ResumeToken};
pub use error::{HttpError, Result};
pub use fake::{CallKind, FakeClient, FakeResponse, RecordedCall, Reply};
pub use multipart::{EncodedMultipart, MultipartEncodingResult, MultipartFormData};
pub use queue::{DeliveryQueue, Executor};
pub use request::{
    ByteStream, Credentials, ParameterEncoding, Parameters, RequestDescriptor, RequestInfo,
    RequestOptions, Target, UploadPayload, UrlDestination,
};
pub use response::{
    BytesSerializer, Charset, DecodableSerializer, DecodingStrategy, HttpResponse, JsonOptions,
    JsonSerializer, ResponseBody, ResponseSerializer, StructuredFormat, TextSerializer,
};
pub use task::{
    Authenticating, Cancelable, Completable, DataRequest, DownloadRequest, Progress,
    ProgressReporting, Request, RequestState, Resumable, UploadRequest,
};

/// Re-export commonly used types
pub use reqwest::{header, Method, StatusCode};
