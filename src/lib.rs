//! Cascade - Hierarchical Token Bucket Rate Limiting
//!
//! This crate implements a token-bucket rate limiter whose buckets compose
//! into parent/child chains: a child's admission is gated by every
//! ancestor's capacity. Buckets refill discretely per interval or
//! continuously (spread mode), blocking admission enforces a combined
//! maximum-wait ceiling across the whole chain, and accounting state can be
//! persisted to an external key-value store.

pub mod bucket;
pub mod clock;
pub mod config;
pub mod error;
pub mod store;

pub use bucket::Bucket;
pub use clock::{Clock, SystemClock};
pub use config::{BucketConfig, BucketNode, Hierarchy, HierarchyConfig};
pub use error::{CascadeError, Result};
pub use store::{MemoryStore, StateKey, StateStore};
