//! HTTP client configuration

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{HttpError, Result},
    request::ParameterEncoding,
};

/// Default size at which multipart bodies are staged on disk (10 MB)
pub const DEFAULT_MULTIPART_MEMORY_THRESHOLD: u64 = 10_000_000;

/// Where observers run when a call does not name a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    /// A dedicated FIFO worker thread owned by the client
    #[default]
    Serial,
    /// On whichever thread produced the event
    Inline,
    /// Spawned onto the Tokio runtime the client was built in
    Runtime,
}

/// HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Request timeout
    #[serde(default = "default_timeout")]
    pub timeout: Duration,

    /// Connection timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// HTTP/HTTPS proxy URL
    #[serde(default)]
    pub proxy: Option<String>,

    /// Custom user agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Maximum redirects to follow (0 = no redirects)
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Enable connection pooling
    #[serde(default = "default_pool_enabled")]
    pub pool_enabled: bool,

    /// Pool idle timeout
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout: Duration,

    /// Headers sent with every request unless the call overrides them
    #[serde(default)]
    pub default_headers: BTreeMap<String, String>,

    /// Parameter encoding used when a call does not pick one
    #[serde(default)]
    pub default_encoding: ParameterEncoding,

    /// Resume requests as soon as they are created
    #[serde(default = "default_start_requests_immediately")]
    pub start_requests_immediately: bool,

    /// Multipart bodies at or above this size are encoded to disk first
    #[serde(default = "default_multipart_memory_threshold")]
    pub multipart_memory_threshold: u64,

    /// Default execution context for observers
    #[serde(default)]
    pub delivery: DeliveryMode,

    /// Directory for partial downloads and staged multipart bodies
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            connect_timeout: default_connect_timeout(),
            proxy: None,
            user_agent: default_user_agent(),
            max_redirects: default_max_redirects(),
            pool_enabled: default_pool_enabled(),
            pool_idle_timeout: default_pool_idle_timeout(),
            default_headers: BTreeMap::new(),
            default_encoding: ParameterEncoding::default(),
            start_requests_immediately: default_start_requests_immediately(),
            multipart_memory_threshold: default_multipart_memory_threshold(),
            delivery: DeliveryMode::default(),
            staging_dir: None,
        }
    }
}

impl ClientConfig {
    /// Create a new client config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config for fast operations (5s timeout)
    pub fn fast() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Create config for long transfers (10 minute timeout)
    pub fn long() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(10),
            ..Default::default()
        }
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(document: &str) -> Result<Self> {
        toml::from_str(document).map_err(|e| HttpError::InvalidConfig(e.to_string()))
    }

    /// Directory used for staging files
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("httpseam"))
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set proxy URL
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Set user agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Add a default header
    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Set the default parameter encoding
    pub fn with_default_encoding(mut self, encoding: ParameterEncoding) -> Self {
        self.default_encoding = encoding;
        self
    }

    /// Choose whether new requests start on creation
    pub fn with_start_requests_immediately(mut self, start: bool) -> Self {
        self.start_requests_immediately = start;
        self
    }

    /// Set the multipart in-memory threshold in bytes
    pub fn with_multipart_memory_threshold(mut self, bytes: u64) -> Self {
        self.multipart_memory_threshold = bytes;
        self
    }

    /// Set the default delivery mode
    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    /// Set the staging directory
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }
}

// Default value functions for serde
fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_user_agent() -> String {
    format!("httpseam/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_redirects() -> usize {
    10
}

fn default_pool_enabled() -> bool {
    true
}

fn default_pool_idle_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_start_requests_immediately() -> bool {
    true
}

fn default_multipart_memory_threshold() -> u64 {
    DEFAULT_MULTIPART_MEMORY_THRESHOLD
}
