//! In-memory entity cache with a staleness policy.
//!
//! This module keeps the last known collection per entity kind and:
//! - Serves collections younger than the stale time without a remote call
//! - Falls back to the previous collection when a refetch fails
//! - Orders writes with a generation counter so a late fetch never
//!   overwrites newer data

mod layer;
mod result;

pub use layer::EntityCache;
pub use result::{CacheResult, CacheSource};
