//! Shared mechanics used by both the SSE fan-out engine and the job queue:
//! the error taxonomy, id/hostname helpers, the functional-options pattern,
//! and canonical text rendering for payloads.

pub mod error;
pub mod id;
pub mod options;
pub mod text;

pub use error::{Error, Result};
