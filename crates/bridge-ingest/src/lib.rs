//! RTMP ingestion.
//!
//! This crate accepts a single RTMP publisher, demuxes its FLV audio and
//! video tags into codec packets and writes them to the shared ingest
//! tracks from `bridge-media`.

mod adapter;
mod connection;
mod error;
pub mod flv;
mod server;

pub use adapter::{IngestAdapter, IngestStatistics, PublishId};
pub use connection::PublisherState;
pub use error::IngestError;
pub use server::{IngestConfig, IngestServer};

/// Result type for ingest operations.
pub type IngestResult<T> = Result<T, IngestError>;

/// Default RTMP listen port.
pub const DEFAULT_RTMP_PORT: u16 = 1935;

/// Socket read buffer size for publisher connections.
pub const READ_BUFFER_SIZE: usize = 8192;

/// Seconds allowed for the RTMP handshake to complete.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;
