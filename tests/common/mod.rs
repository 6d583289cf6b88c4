//! Helpers shared by the workspace integration tests

#![allow(dead_code)]

use httpseam::{
    Client, ClientConfig, ClientExt, DecodableSerializer, DeliveryMode, HttpError, Result,
};
use serde::Deserialize;
use tempfile::TempDir;

/// Route client logs to the test harness output
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Fast config with inline delivery and staging inside `dir`
pub fn config(dir: &TempDir) -> ClientConfig {
    ClientConfig::fast()
        .with_delivery(DeliveryMode::Inline)
        .with_staging_dir(dir.path())
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Release {
    pub name: String,
    pub downloads: u64,
}

/// Application code written only against the trait
pub async fn latest_release(client: &dyn Client, base: &str) -> Result<Release> {
    let request = client.get(format!("{base}/releases/latest"))?;
    request.validate();
    request
        .response(DecodableSerializer::<Release>::new())
        .await
        .into_result()
}

/// Like [`latest_release`], mapping a missing release to `None`
pub async fn find_release(client: &dyn Client, base: &str) -> Result<Option<Release>> {
    match latest_release(client, base).await {
        Ok(release) => Ok(Some(release)),
        Err(HttpError::HttpStatus { status, .. }) if status.as_u16() == 404 => Ok(None),
        Err(e) => Err(e),
    }
}
