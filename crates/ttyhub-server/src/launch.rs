//! Host-side handling of viewer requests to open links and windows.

use serde_json::Value;
use tracing::info;

/// Opens links and new viewer windows on behalf of a viewer.
pub trait Launcher: Send {
    fn open_link(&mut self, link: &Value);
    fn open_window(&mut self, request: &str, geometry: Option<&str>);
}

/// Launcher that only records requests in the log.
#[derive(Debug, Default)]
pub struct LoggingLauncher;

impl Launcher for LoggingLauncher {
    fn open_link(&mut self, link: &Value) {
        match link_target(link) {
            Some(href) => info!(href, "viewer asked to open link"),
            None => info!(%link, "viewer asked to open link"),
        }
    }

    fn open_window(&mut self, request: &str, geometry: Option<&str>) {
        info!(request, geometry = geometry.unwrap_or("default"), "viewer asked for a new window");
    }
}

/// The `href` of a link request, if it has one.
pub fn link_target(link: &Value) -> Option<&str> {
    link.get("href")?.as_str()
}
