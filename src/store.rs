use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::coerce::RawVector;
use crate::error::StoreError;

/// One persisted embedding row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub tenant_id: String,
    pub item_id: String,
    pub vector: RawVector,
    pub updated_at: DateTime<Utc>,
}

/// Read-only gateway to the durable embedding table.
///
/// The store is the source of truth; the registry only derives in-memory
/// graphs from it. Implementations own their own timeout and retry policy.
pub trait EmbeddingStore: Send + Sync {
    /// Every row of every tenant.
    fn fetch_all_embeddings(&self) -> Result<Vec<EmbeddingRecord>, StoreError>;
    /// Current rows of one tenant, in a stable order.
    fn fetch_embeddings_for(&self, tenant_id: &str) -> Result<Vec<EmbeddingRecord>, StoreError>;
    /// Most recent modification time for the tenant; `None` when it has no rows.
    fn fetch_latest_watermark(
        &self,
        tenant_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;
}

#[derive(Default)]
struct Tables {
    rows: BTreeMap<String, Vec<EmbeddingRecord>>,
    watermarks: BTreeMap<String, DateTime<Utc>>,
    unavailable: Option<String>,
}

/// Thread-safe in-process store.
///
/// Used for tests and for embedding the registry where rows are pushed in
/// directly. The per-tenant watermark advances strictly on every write,
/// removals included, so staleness checks see deletes as well.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    row_fetches: AtomicUsize,
    watermark_fetches: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `item_id`, stamped with the current time.
    pub fn upsert(&self, tenant_id: &str, item_id: &str, vector: Vec<f32>) {
        self.upsert_raw(tenant_id, item_id, RawVector::Flat(vector));
    }

    /// Like [`upsert`](Self::upsert) but stores the vector as given, unvalidated.
    pub fn upsert_raw(&self, tenant_id: &str, item_id: &str, vector: RawVector) {
        let mut tables = self.write();
        let stamp = next_stamp(tables.watermarks.get(tenant_id).copied());
        Self::put(&mut tables, tenant_id, item_id, vector, stamp);
    }

    /// Insert or replace `item_id` with an explicit `updated_at`.
    pub fn upsert_at(
        &self,
        tenant_id: &str,
        item_id: &str,
        vector: Vec<f32>,
        updated_at: DateTime<Utc>,
    ) {
        let mut tables = self.write();
        Self::put(
            &mut tables,
            tenant_id,
            item_id,
            RawVector::Flat(vector),
            updated_at,
        );
    }

    /// Delete a row. Returns whether it existed.
    pub fn remove(&self, tenant_id: &str, item_id: &str) -> bool {
        let mut tables = self.write();
        let Some(rows) = tables.rows.get_mut(tenant_id) else {
            return false;
        };
        let before = rows.len();
        rows.retain(|r| r.item_id != item_id);
        if rows.len() == before {
            return false;
        }
        if rows.is_empty() {
            tables.rows.remove(tenant_id);
            tables.watermarks.remove(tenant_id);
        } else {
            let stamp = next_stamp(tables.watermarks.get(tenant_id).copied());
            tables.watermarks.insert(tenant_id.to_string(), stamp);
        }
        true
    }

    /// Make every fetch fail with [`StoreError::Unavailable`] until cleared.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.write().unavailable = reason.map(str::to_string);
    }

    /// Row fetches served so far (all-tenant and per-tenant).
    pub fn row_fetches(&self) -> usize {
        self.row_fetches.load(Ordering::Relaxed)
    }

    pub fn watermark_fetches(&self) -> usize {
        self.watermark_fetches.load(Ordering::Relaxed)
    }

    fn put(
        tables: &mut Tables,
        tenant_id: &str,
        item_id: &str,
        vector: RawVector,
        updated_at: DateTime<Utc>,
    ) {
        let record = EmbeddingRecord {
            tenant_id: tenant_id.to_string(),
            item_id: item_id.to_string(),
            vector,
            updated_at,
        };
        let rows = tables.rows.entry(tenant_id.to_string()).or_default();
        match rows.iter_mut().find(|r| r.item_id == item_id) {
            Some(existing) => *existing = record,
            None => rows.push(record),
        }
        let mark = tables
            .watermarks
            .entry(tenant_id.to_string())
            .or_insert(updated_at);
        if updated_at > *mark {
            *mark = updated_at;
        }
    }

    fn check(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(reason) = tables.unavailable.clone() {
            return Err(StoreError::Unavailable(reason));
        }
        Ok(tables)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EmbeddingStore for InMemoryStore {
    fn fetch_all_embeddings(&self) -> Result<Vec<EmbeddingRecord>, StoreError> {
        self.row_fetches.fetch_add(1, Ordering::Relaxed);
        let tables = self.check()?;
        Ok(tables.rows.values().flatten().cloned().collect())
    }

    fn fetch_embeddings_for(&self, tenant_id: &str) -> Result<Vec<EmbeddingRecord>, StoreError> {
        self.row_fetches.fetch_add(1, Ordering::Relaxed);
        let tables = self.check()?;
        Ok(tables.rows.get(tenant_id).cloned().unwrap_or_default())
    }

    fn fetch_latest_watermark(
        &self,
        tenant_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.watermark_fetches.fetch_add(1, Ordering::Relaxed);
        let tables = self.check()?;
        Ok(tables.watermarks.get(tenant_id).copied())
    }
}

/// `now`, nudged past `previous` so consecutive writes always order.
fn next_stamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if now <= prev => prev + TimeDelta::microseconds(1),
        _ => now,
    }
}

#[cfg(feature = "postgrest")]
pub mod postgrest;

#[cfg(feature = "postgrest")]
pub use postgrest::PostgrestStore;
