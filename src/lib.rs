//! Segment-local data transfer agent.
//!
//! On backup, table data arrives through one named pipe per table (each fed
//! by a COPY TO command) and is appended to a single compressed archive
//! whose table of contents records every table's uncompressed byte range.
//! On restore, the archive is read back once, front to back, and each
//! requested table's range is written into its pipe for COPY FROM.

pub mod agent;
pub mod backup;
pub mod compression;
pub mod config;
pub mod error;
pub mod failure;
pub mod fifo;
pub mod logging;
pub mod manifest;
pub mod memory_pipes;
pub mod pipes;
pub mod plugin;
pub mod restore;
pub mod signals;
pub mod toc;

/// Table identifier. Opaque: only ever compared and used as a key.
pub type Oid = u64;

pub use agent::RunSummary;
pub use error::{AgentError, Result};
