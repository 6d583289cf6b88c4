//! Multipart form-data bodies
//!
//! A [`MultipartFormData`] knows its exact encoded length before any bytes
//! are produced, which is what lets an upload choose between encoding in
//! memory and staging the body on disk.

use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::{HttpError, Result},
    request::RequestBody,
    task::{kind::Upload, Request},
};

const CRLF: &str = "\r\n";

/// A multipart/form-data body under construction
#[derive(Debug, Clone)]
pub struct MultipartFormData {
    boundary: String,
    parts: Vec<Part>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct Part {
    headers: String,
    source: Source,
}

#[derive(Debug, Clone)]
enum Source {
    Bytes(Bytes),
    File { path: PathBuf, len: u64 },
}

impl Source {
    fn len(&self) -> u64 {
        match self {
            Source::Bytes(bytes) => bytes.len() as u64,
            Source::File { len, .. } => *len,
        }
    }
}

impl Default for MultipartFormData {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartFormData {
    /// Empty form with a random boundary
    pub fn new() -> Self {
        Self::with_boundary(format!("httpseam.boundary.{}", Uuid::new_v4().simple()))
    }

    /// Empty form with a fixed boundary
    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            parts: Vec::new(),
            error: None,
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Value of the request's `Content-Type` header
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Append a plain text field
    pub fn text(self, name: &str, value: impl Into<String>) -> Self {
        let value: String = value.into();
        self.push(name, None, None, Source::Bytes(Bytes::from(value)))
    }

    /// Append raw bytes, optionally as a named file
    pub fn bytes(
        self,
        name: &str,
        data: impl Into<Bytes>,
        file_name: Option<&str>,
        mime_type: Option<&str>,
    ) -> Self {
        self.push(name, file_name, mime_type, Source::Bytes(data.into()))
    }

    /// Append a file; the file name and MIME type come from the path
    ///
    /// An unreadable path is remembered and reported when the form is
    /// encoded.
    pub fn file(mut self, name: &str, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(file_name) => file_name.to_string(),
            None => {
                self.record_error(format!("{} has no file name", path.display()));
                return self;
            }
        };
        let len = match fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                self.record_error(format!("{} is not a regular file", path.display()));
                return self;
            }
            Err(e) => {
                self.record_error(format!("{} is not reachable: {e}", path.display()));
                return self;
            }
        };
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        self.push(
            name,
            Some(&file_name),
            Some(mime.essence_str()),
            Source::File {
                path: path.to_path_buf(),
                len,
            },
        )
    }

    fn push(
        mut self,
        name: &str,
        file_name: Option<&str>,
        mime_type: Option<&str>,
        source: Source,
    ) -> Self {
        let mut disposition = format!("form-data; name=\"{}\"", quote(name));
        if let Some(file_name) = file_name {
            disposition.push_str(&format!("; filename=\"{}\"", quote(file_name)));
        }
        let mut headers = format!("Content-Disposition: {disposition}{CRLF}");
        if let Some(mime_type) = mime_type {
            headers.push_str(&format!("Content-Type: {mime_type}{CRLF}"));
        }
        headers.push_str(CRLF);
        self.parts.push(Part { headers, source });
        self
    }

    fn record_error(&mut self, message: String) {
        if self.error.is_none() {
            self.error = Some(message);
        }
    }

    fn check(&self) -> Result<()> {
        match &self.error {
            Some(message) => Err(HttpError::Encoding(message.clone())),
            None => Ok(()),
        }
    }

    fn delimiter(&self, index: usize) -> String {
        if index == 0 {
            format!("--{}{CRLF}", self.boundary)
        } else {
            format!("{CRLF}--{}{CRLF}", self.boundary)
        }
    }

    fn closing(&self) -> String {
        if self.parts.is_empty() {
            format!("--{}--{CRLF}", self.boundary)
        } else {
            format!("{CRLF}--{}--{CRLF}", self.boundary)
        }
    }

    /// Exact size of the encoded body
    pub fn content_length(&self) -> Result<u64> {
        self.check()?;
        let parts: u64 = self
            .parts
            .iter()
            .enumerate()
            .map(|(index, part)| {
                self.delimiter(index).len() as u64 + part.headers.len() as u64 + part.source.len()
            })
            .sum();
        Ok(parts + self.closing().len() as u64)
    }

    /// Encode the whole body into memory
    pub fn encode(&self) -> Result<Bytes> {
        let mut out = Vec::with_capacity(self.content_length()? as usize);
        self.write_into(&mut out)
            .map_err(|e| HttpError::Encoding(e.to_string()))?;
        Ok(Bytes::from(out))
    }

    /// Encode the body into a new file at `path`
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        self.check()?;
        if path.exists() {
            return Err(HttpError::Encoding(format!(
                "{} already exists",
                path.display()
            )));
        }
        let file = File::create(path).map_err(|e| HttpError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        let written = self
            .write_into(&mut writer)
            .and_then(|_| writer.flush())
            .map_err(|e| HttpError::Encoding(e.to_string()));
        if written.is_err() {
            discard_staged(path);
        }
        written
    }

    fn write_into<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for (index, part) in self.parts.iter().enumerate() {
            out.write_all(self.delimiter(index).as_bytes())?;
            out.write_all(part.headers.as_bytes())?;
            match &part.source {
                Source::Bytes(bytes) => out.write_all(bytes)?,
                Source::File { path, len } => {
                    let copied = io::copy(&mut File::open(path)?, out)?;
                    if copied != *len {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("{} changed size while encoding", path.display()),
                        ));
                    }
                }
            }
        }
        out.write_all(self.closing().as_bytes())
    }

    /// Encode in memory below `threshold` bytes, otherwise to a file in
    /// `staging_dir`
    pub async fn encode_with_threshold(
        self,
        threshold: u64,
        staging_dir: &Path,
    ) -> Result<EncodedMultipart> {
        let content_length = self.content_length()?;
        let content_type = self.content_type();

        if content_length < threshold {
            let body = tokio::task::spawn_blocking(move || self.encode())
                .await
                .map_err(|e| HttpError::Encoding(e.to_string()))??;
            debug!(content_length, "Encoded multipart body in memory");
            return Ok(EncodedMultipart {
                content_type,
                content_length,
                staged: Staged::Memory(body),
            });
        }

        let dir = staging_dir.join("multipart");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| HttpError::io(&dir, e))?;
        let path = dir.join(Uuid::new_v4().to_string());
        let target = path.clone();
        tokio::task::spawn_blocking(move || self.write_to_file(&target))
            .await
            .map_err(|e| HttpError::Encoding(e.to_string()))??;
        debug!(content_length, path = %path.display(), "Encoded multipart body to disk");

        Ok(EncodedMultipart {
            content_type,
            content_length,
            staged: Staged::Disk(path),
        })
    }
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// A multipart body ready to upload
#[derive(Debug)]
pub struct EncodedMultipart {
    content_type: String,
    content_length: u64,
    staged: Staged,
}

#[derive(Debug)]
enum Staged {
    Memory(Bytes),
    Disk(PathBuf),
}

impl EncodedMultipart {
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn is_on_disk(&self) -> bool {
        matches!(self.staged, Staged::Disk(_))
    }

    pub fn file_location(&self) -> Option<&Path> {
        match &self.staged {
            Staged::Disk(path) => Some(path),
            Staged::Memory(_) => None,
        }
    }

    pub(crate) fn into_body(self) -> RequestBody {
        match self.staged {
            Staged::Memory(bytes) => RequestBody::Bytes(bytes),
            Staged::Disk(path) => RequestBody::File(path),
        }
    }
}

/// Outcome of encoding and handing a multipart body to the client
#[derive(Debug)]
pub struct MultipartEncodingResult {
    pub request: Request<Upload>,
    pub streaming_from_disk: bool,
    pub file_location: Option<PathBuf>,
}

/// Staged body that is removed when dropped
///
/// Owned by the upload's completion observer, so the file goes away once
/// the upload terminates or the request is dropped without ever finishing.
pub(crate) struct StagedBody(PathBuf);

impl StagedBody {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self(path)
    }
}

impl Drop for StagedBody {
    fn drop(&mut self) {
        discard_staged(&self.0);
    }
}

/// Remove a staged body, logging instead of failing
pub(crate) fn discard_staged(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove staged multipart body");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_encoding_layout() {
        let form = MultipartFormData::with_boundary("XyZ")
            .text("name", "ferris")
            .bytes("blob", &b"\x00\x01"[..], Some("b.bin"), Some("application/octet-stream"));
        let body = form.encode().unwrap();

        let expected = concat!(
            "--XyZ\r\n",
            "Content-Disposition: form-data; name=\"name\"\r\n",
            "\r\n",
            "ferris",
            "\r\n--XyZ\r\n",
            "Content-Disposition: form-data; name=\"blob\"; filename=\"b.bin\"\r\n",
            "Content-Type: application/octet-stream\r\n",
            "\r\n",
        );
        let mut expected = expected.as_bytes().to_vec();
        expected.extend_from_slice(b"\x00\x01\r\n--XyZ--\r\n");
        assert_eq!(&body[..], &expected[..]);
    }

    #[test]
    fn test_content_length_matches_encoding() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        fs::write(&file, "some file contents").unwrap();

        let form = MultipartFormData::new()
            .text("a", "1")
            .file("upload", &file)
            .bytes("raw", vec![7u8; 300], None, None);

        let encoded = form.encode().unwrap();
        assert_eq!(form.content_length().unwrap(), encoded.len() as u64);
        let text = String::from_utf8_lossy(&encoded);
        assert!(text.contains("filename=\"notes.txt\""));
        assert!(text.contains("Content-Type: text/plain"));
    }

    #[test]
    fn test_empty_form() {
        let form = MultipartFormData::with_boundary("b");
        assert_eq!(&form.encode().unwrap()[..], b"--b--\r\n");
        assert_eq!(form.content_length().unwrap(), 7);
    }

    #[test]
    fn test_missing_file_is_reported_at_encoding() {
        let form = MultipartFormData::new().file("f", "/definitely/not/here.png");
        assert!(matches!(form.content_length(), Err(HttpError::Encoding(_))));
        assert!(matches!(form.encode(), Err(HttpError::Encoding(_))));
    }

    #[test]
    fn test_directory_is_rejected() {
        let dir = tempdir().unwrap();
        let form = MultipartFormData::new().file("f", dir.path());
        assert!(matches!(form.encode(), Err(HttpError::Encoding(_))));
    }

    #[test]
    fn test_quotes_in_names_are_escaped() {
        let form = MultipartFormData::with_boundary("b").text("a\"b", "v");
        let text = String::from_utf8(form.encode().unwrap().to_vec()).unwrap();
        assert!(text.contains("name=\"a\\\"b\""));
    }

    #[tokio::test]
    async fn test_below_threshold_stays_in_memory() {
        let dir = tempdir().unwrap();
        let form = MultipartFormData::new().bytes("data", vec![1u8; 500], None, None);
        assert!(form.content_length().unwrap() < 1024);

        let encoded = form.encode_with_threshold(1024, dir.path()).await.unwrap();
        assert!(!encoded.is_on_disk());
        assert!(encoded.file_location().is_none());
    }

    #[tokio::test]
    async fn test_at_or_above_threshold_goes_to_disk() {
        let dir = tempdir().unwrap();
        let form = MultipartFormData::new().bytes("data", vec![1u8; 2000], None, None);
        let expected_len = form.content_length().unwrap();

        let encoded = form.encode_with_threshold(1024, dir.path()).await.unwrap();
        assert!(encoded.is_on_disk());
        let path = encoded.file_location().unwrap().to_path_buf();
        assert_eq!(fs::metadata(&path).unwrap().len(), expected_len);
        assert_eq!(encoded.content_length(), expected_len);

        discard_staged(&path);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_threshold_is_inclusive() {
        let dir = tempdir().unwrap();
        let form = MultipartFormData::new().text("k", "v");
        let len = form.content_length().unwrap();
        let encoded = form.encode_with_threshold(len, dir.path()).await.unwrap();
        assert!(encoded.is_on_disk());
        discard_staged(encoded.file_location().unwrap());
    }
}
