//! Hostname and auto-id helpers shared by the SSE `Event`/`Server` and the
//! Redis Streams consumer-name generator.

use std::time::{SystemTime, UNIX_EPOCH};

/// Resolve the host's name for use in auto-generated event/consumer ids.
///
/// Falls back to `"unknown-host"` if the OS hostname can't be read or isn't
/// valid UTF-8, matching the spec's "default from OS" without ever failing
/// construction over it.
pub fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

/// Generate an id of the form `"<unix-nanos>-<hostname>"`, used when an
/// `Event` is published without an explicit id and when a Redis Streams
/// consumer needs a unique name.
pub fn generate_id(hostname: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{nanos}-{hostname}")
}
