//! Process-wide tracing/logging setup, shared by the server binary and by
//! anything else in the workspace that wants consistent log formatting in
//! its own tests or examples.

/// Initialize process-wide observability (tracing/logging).
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

pub mod tracing;
