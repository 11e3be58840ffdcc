//! Fetch, cache and apply disk images.
//!
//! An unprivileged caller validates its local image cache against a catalog,
//! then asks a privileged helper to write a verified image onto a disk. The
//! helper streams progress back over a per-session connection.

pub mod config;
pub mod context;
pub mod core;
pub mod logging;
pub mod rpc;
