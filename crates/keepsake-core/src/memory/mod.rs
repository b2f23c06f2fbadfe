//! Memory model - the fundamental unit of storage
//!
//! Each memory is identified by a deterministic SHA-256 content hash that is
//! stable across every backend. Timestamps are kept twice: as UTC
//! seconds-since-epoch floats (the canonical form used for range queries)
//! and as redundant ISO-8601 strings kept in sync for human consumption.

mod model;

pub use model::{
    generate_content_hash, iso_from_timestamp, now_timestamp, timestamp_from_iso, Memory,
    MemoryQueryResult, Metadata, MetadataValue,
};
