//! Named-only external cache interface.
//!
//! On-disk cache persistence (e.g. a SQLite dump/load) is an explicit
//! non-goal of this crate: it is one of the external collaborators whose
//! interface is only named, not implemented. This trait lets a host
//! application plug in its own persisted-cache implementation (SQLite or
//! otherwise) without the core depending on a database crate; the core
//! never assumes one exists.

use crate::event::Event;
use crate::store::EventStore;

/// Identifies one cached parse: input-file signature + checkpoint interval
/// + schema version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheSignature {
    pub file_signature: String,
    pub checkpoint_interval: u64,
    pub schema_version: String,
}

impl CacheSignature {
    pub const SCHEMA_VERSION: &'static str = "v1";
}

/// Opportunistic cache contract: absence or mismatch falls back to a fresh
/// parse; presence bypasses lexing and re-derives indexes from the loaded
/// event table. Cache reading is always attempted by a host; cache writing
/// is expected to be gated behind a host-chosen environment variable
/// rather than being on by default.
pub trait TraceCache {
    fn is_valid(&self, signature: &CacheSignature) -> bool;

    /// Load the `(event_idx, reg, value)` reads/writes table for `signature`
    /// back into a flat event list. The caller rebuilds `EventStore`'s
    /// indexes from this list by re-running `EventStore::from_events`.
    fn load_into(&self, signature: &CacheSignature) -> Option<Vec<Event>>;

    fn write_from(&self, signature: &CacheSignature, store: &EventStore);
}
