//! Download destinations and resume tokens

use std::{
    fmt,
    fs::{self, OpenOptions},
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use reqwest::{
    header::{
        HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, COOKIE, ETAG, IF_RANGE, LAST_MODIFIED,
        PROXY_AUTHORIZATION, RANGE,
    },
    Method,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    error::{HttpError, Result},
    request::{BodyDescriptor, RequestInfo},
    task::Payload,
};

const RESUME_STATE_VERSION: u32 = 1;

/// What to do when the destination file already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    #[default]
    Fail,
    Overwrite,
    /// Pick a free name by appending ` (n)` to the file stem
    Rename,
}

/// Where a finished download is placed
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DestinationPolicy {
    /// Hand the body back as bytes
    #[default]
    Memory,
    /// Move the body to `path`
    File {
        path: PathBuf,
        conflict: ConflictPolicy,
        create_directories: bool,
    },
}

impl DestinationPolicy {
    /// Write to `path`, failing if it exists
    pub fn file(path: impl Into<PathBuf>) -> Self {
        DestinationPolicy::File {
            path: path.into(),
            conflict: ConflictPolicy::default(),
            create_directories: false,
        }
    }

    /// Set the conflict policy of a file destination
    pub fn with_conflict(mut self, policy: ConflictPolicy) -> Self {
        if let DestinationPolicy::File { conflict, .. } = &mut self {
            *conflict = policy;
        }
        self
    }

    /// Create missing parent directories of a file destination
    pub fn with_create_directories(mut self, create: bool) -> Self {
        if let DestinationPolicy::File {
            create_directories, ..
        } = &mut self
        {
            *create_directories = create;
        }
        self
    }
}

/// Fresh staging path for a download
pub(crate) fn staging_file(staging_dir: &Path) -> PathBuf {
    staging_dir
        .join("downloads")
        .join(format!("{}.partial", Uuid::new_v4().simple()))
}

/// Move a fully received staging file to its destination
///
/// Blocking; the staging file is gone afterwards whether or not this
/// succeeds.
pub(crate) fn finalize_blocking(staged: &Path, policy: &DestinationPolicy) -> Result<Payload> {
    let result = place(staged, policy);
    discard_partial(staged);
    result
}

/// Remove a partial download, logging instead of failing
pub(crate) fn discard_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial download");
        }
    }
}

fn place(staged: &Path, policy: &DestinationPolicy) -> Result<Payload> {
    match policy {
        DestinationPolicy::Memory => fs::read(staged)
            .map(|bytes| Payload::Bytes(bytes.into()))
            .map_err(|e| HttpError::io(staged, e)),
        DestinationPolicy::File {
            path,
            conflict,
            create_directories,
        } => {
            if *create_directories {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent).map_err(|e| HttpError::io(parent, e))?;
                }
            }

            let target = match conflict {
                _ if !path.exists() => path.clone(),
                ConflictPolicy::Fail => {
                    return Err(HttpError::io(
                        path,
                        io::Error::new(io::ErrorKind::AlreadyExists, "destination already exists"),
                    ))
                }
                ConflictPolicy::Overwrite => {
                    fs::remove_file(path).map_err(|e| HttpError::io(path, e))?;
                    path.clone()
                }
                ConflictPolicy::Rename => free_name(path),
            };

            if fs::rename(staged, &target).is_err() {
                fs::copy(staged, &target).map_err(|e| HttpError::io(&target, e))?;
            }
            debug!(path = %target.display(), "Download placed");
            Ok(Payload::File(target))
        }
    }
}

fn free_name(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());

    (1..)
        .map(|n| {
            let name = match &extension {
                Some(ext) => format!("{stem} ({n}).{ext}"),
                None => format!("{stem} ({n})"),
            };
            path.with_file_name(name)
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Opaque token for continuing an interrupted download
///
/// Safe to persist; only this crate interprets its contents.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ResumeToken {
    fn from(token: String) -> Self {
        ResumeToken(token)
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResumeToken({} bytes)", self.0.len())
    }
}

/// What a resume token records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ResumeState {
    version: u32,
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub staging_path: PathBuf,
    pub received: u64,
    pub total: Option<u64>,
    pub validator: Option<String>,
}

/// Headers never written into a token
const EXCLUDED_HEADERS: [HeaderName; 5] = [AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION, RANGE, IF_RANGE];

impl ResumeState {
    /// Snapshot of `info` after `received` bytes landed in `staging_path`
    ///
    /// Sensitive headers are left out; credentials are applied again on
    /// the resumed request.
    pub(crate) fn new(
        info: &RequestInfo,
        staging_path: PathBuf,
        received: u64,
        total: Option<u64>,
        validator: Option<String>,
    ) -> Self {
        let headers = info
            .headers
            .iter()
            .filter(|(name, value)| !value.is_sensitive() && !EXCLUDED_HEADERS.contains(*name))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        Self {
            version: RESUME_STATE_VERSION,
            url: info.url.to_string(),
            method: info.method.to_string(),
            headers,
            staging_path,
            received,
            total,
            validator,
        }
    }

    pub(crate) fn to_token(&self) -> Option<ResumeToken> {
        let json = serde_json::to_vec(self).ok()?;
        Some(ResumeToken(URL_SAFE_NO_PAD.encode(json)))
    }

    pub(crate) fn from_token(token: &ResumeToken) -> Result<Self> {
        let unreadable = |reason: &str| HttpError::ResumeUnsupported(format!("unreadable token: {reason}"));
        let json = URL_SAFE_NO_PAD
            .decode(token.as_str().trim())
            .map_err(|e| unreadable(&e.to_string()))?;
        let state: ResumeState =
            serde_json::from_slice(&json).map_err(|e| unreadable(&e.to_string()))?;
        if state.version != RESUME_STATE_VERSION {
            return Err(unreadable("unknown version"));
        }
        Ok(state)
    }

    /// Check the staging file still holds the received prefix
    ///
    /// The file must be a partial download inside `<staging_dir>/downloads`;
    /// anything else is refused before it is touched. Extra bytes past
    /// `received` are cut off.
    pub(crate) fn verify(&mut self, staging_dir: &Path) -> Result<()> {
        let gone = || HttpError::ResumeUnsupported("partial data is gone".to_string());
        let outside =
            || HttpError::ResumeUnsupported("partial data is outside the staging directory".to_string());

        let root = fs::canonicalize(staging_dir.join("downloads")).map_err(|_| gone())?;
        let path = fs::canonicalize(&self.staging_path).map_err(|_| gone())?;
        let is_partial = path.extension().is_some_and(|ext| ext == "partial");
        if path.parent() != Some(root.as_path()) || !is_partial {
            return Err(outside());
        }

        let metadata = fs::metadata(&path).map_err(|_| gone())?;
        if !metadata.is_file() {
            return Err(outside());
        }
        self.staging_path = path;

        let len = metadata.len();
        if len < self.received {
            return Err(HttpError::ResumeUnsupported(format!(
                "partial data is short: expected {} bytes, found {len}",
                self.received
            )));
        }
        if len > self.received {
            OpenOptions::new()
                .write(true)
                .open(&self.staging_path)
                .and_then(|file| file.set_len(self.received))
                .map_err(|e| HttpError::io(&self.staging_path, e))?;
        }
        Ok(())
    }

    /// Rebuild the request the token was taken from
    pub(crate) fn request_info(&self, timeout: Duration) -> Result<RequestInfo> {
        let unusable = |what: &str| HttpError::ResumeUnsupported(format!("token holds an invalid {what}"));
        let url = Url::parse(&self.url).map_err(|_| unusable("URL"))?;
        let method = Method::from_bytes(self.method.as_bytes()).map_err(|_| unusable("method"))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| unusable("header"))?;
            let value = HeaderValue::from_str(value).map_err(|_| unusable("header"))?;
            headers.append(name, value);
        }

        Ok(RequestInfo {
            method,
            url,
            headers,
            body: BodyDescriptor::None,
            timeout,
        })
    }
}

/// A resume token resolved against the local staging file
pub(crate) struct ResumePlan {
    /// Request to continue, or a placeholder when the token is unreadable
    pub info: RequestInfo,
    pub state: Result<ResumeState>,
}

/// Resolve `token` against the partial downloads kept in `staging_dir`
pub(crate) fn plan_resume(token: &ResumeToken, timeout: Duration, staging_dir: &Path) -> ResumePlan {
    let mut state = match ResumeState::from_token(token) {
        Ok(state) => state,
        Err(e) => {
            return ResumePlan {
                info: placeholder_info(timeout),
                state: Err(e),
            }
        }
    };
    match state.request_info(timeout) {
        Ok(info) => {
            let state = state.verify(staging_dir).map(|()| state);
            ResumePlan { info, state }
        }
        Err(e) => ResumePlan {
            info: placeholder_info(timeout),
            state: Err(e),
        },
    }
}

fn placeholder_info(timeout: Duration) -> RequestInfo {
    RequestInfo {
        method: Method::GET,
        url: blank_url(),
        headers: HeaderMap::new(),
        body: BodyDescriptor::None,
        timeout,
    }
}

fn blank_url() -> Url {
    Url::parse("about:blank").expect("about:blank parses")
}

/// Validator for `If-Range`: a strong ETag, else Last-Modified
pub(crate) fn entity_validator(headers: &HeaderMap) -> Option<String> {
    let etag = headers
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .filter(|tag| !tag.starts_with("W/"));
    etag.or_else(|| headers.get(LAST_MODIFIED).and_then(|v| v.to_str().ok()))
        .map(str::to_string)
}
