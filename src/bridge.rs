//! Optional desktop-shell bridge.
//!
//! Inside the desktop shell the host process knows which backend to talk to
//! and can write files to disk. A plain web build has no bridge, and every
//! consumer here takes `Option<&dyn DesktopBridge>` so that case degrades to
//! environment/default configuration.

use tracing::{debug, warn};

use crate::client::ApiClient;
use crate::config::{BACKEND_URL_ENV, DEFAULT_BACKEND_URL};
use crate::error::Result;

/// Host-side services exposed by the desktop shell.
pub trait DesktopBridge: Send + Sync {
    /// Backend URL configured in the shell, if any.
    fn backend_url(&self) -> anyhow::Result<Option<String>>;

    /// Persist downloaded image bytes (the shell chooses the location).
    fn save_image(&self, source_url: &str, bytes: &[u8]) -> anyhow::Result<()>;

    /// Version of the running shell, for update checks.
    fn app_version(&self) -> Option<String> {
        None
    }
}

/// Resolve the backend URL: explicit config, then the bridge, then
/// [`BACKEND_URL_ENV`], then [`DEFAULT_BACKEND_URL`].
///
/// A bridge that errors or returns an empty URL is skipped.
pub fn resolve_backend_url(explicit: Option<&str>, bridge: Option<&dyn DesktopBridge>) -> String {
    if let Some(url) = explicit.filter(|u| !u.trim().is_empty()) {
        return url.to_string();
    }

    if let Some(bridge) = bridge {
        match bridge.backend_url() {
            Ok(Some(url)) if !url.trim().is_empty() => {
                debug!(url = %url, "backend url from desktop bridge");
                return url;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "desktop bridge failed to report backend url"),
        }
    }

    match std::env::var(BACKEND_URL_ENV) {
        Ok(url) if !url.trim().is_empty() => url,
        _ => DEFAULT_BACKEND_URL.to_string(),
    }
}

/// Download a generated image and hand it to the shell for saving.
pub async fn save_remote_image(client: &ApiClient, bridge: &dyn DesktopBridge, url: &str) -> Result<()> {
    let bytes = client.download_image(url).await?;
    bridge.save_image(url, &bytes)?;
    Ok(())
}
