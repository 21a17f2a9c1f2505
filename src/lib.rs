//! Per-tenant approximate-nearest-neighbour shortlists over a shared embedding table.
//!
//! Every tenant gets its own in-memory HNSW graph built from its rows in a
//! backing [`EmbeddingStore`]. [`IndexRegistry`] checks the store's watermark
//! for the tenant on every query and rebuilds the graph when the store has
//! newer rows, so results never knowingly lag the source of truth.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tenant_ann::{IndexConfig, IndexRegistry, InMemoryStore};
//!
//! let store = Arc::new(InMemoryStore::new());
//! store.upsert("acme", "billing", vec![1.0, 0.0, 0.0]);
//! store.upsert("acme", "support", vec![0.0, 1.0, 0.0]);
//!
//! let registry = IndexRegistry::new(store, &IndexConfig::new().with_dimension(3));
//! registry.warm()?;
//! let hits = registry.top_k("acme", &[0.9, 0.1, 0.0], 1);
//! assert_eq!(hits[0].item_id, "billing");
//! # Ok::<(), tenant_ann::IndexError>(())
//! ```
//!
//! Built without the `hnsw` feature the crate runs degraded: queries return
//! empty shortlists and a single warning is logged.

pub mod ann;
pub mod coerce;
pub mod config;
pub mod error;
pub mod registry;
pub mod store;
pub mod tenant;

pub use ann::{AnnBackend, AnnGraph, Neighbor, default_backend};
pub use coerce::{RawVector, coerce};
pub use config::{ConfigLoadError, DEFAULT_DIMENSION, IndexConfig, PostgrestConfig, StoreConfig};
pub use error::{IndexError, StoreError, ValidationError};
pub use registry::{Freshness, IndexRegistry, TenantStats, WarmReport};
pub use store::{EmbeddingRecord, EmbeddingStore, InMemoryStore};
pub use tenant::{IndexStatus, ScoredItem, TenantIndex};

#[cfg(feature = "hnsw")]
pub use ann::HnswBackend;
#[cfg(feature = "postgrest")]
pub use store::PostgrestStore;
