//! In-memory snapshot cache for the upstream recent tracks
//!
//! This module provides a single-slot cache that serves the last successful
//! upstream response for a configurable TTL and refreshes it lazily when a
//! caller finds it stale. Concurrent callers that miss at the same time share
//! one upstream request. A failed refresh leaves the previous snapshot in place.

mod snapshot;

pub use snapshot::{CacheLookup, SnapshotCache, DEFAULT_TTL};
