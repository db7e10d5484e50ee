//! Local storage helpers
//!
//! Provides the atomic write discipline shared by the format generators and
//! the cache sidecar writer.

pub mod atomic;

pub use atomic::{verify_writable, write_atomic, AtomicFile};
