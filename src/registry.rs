//! Tenant → index registry with watermark-based staleness detection.
//!
//! The registry owns one [`TenantIndex`] per tenant together with the
//! freshness version (store watermark) its served generation was built from.
//! Every query first compares that cached version with the store's current
//! watermark and rebuilds the tenant when the store has moved on, so the
//! staleness window is one round trip rather than a polling interval.
//!
//! Locking:
//! - the coarse `slots` lock is held only to look up or insert a tenant slot,
//!   never across a store fetch or graph construction;
//! - each slot has a refresh gate serializing fetch + rebuild + version update
//!   for that tenant, so the cached version always matches the served graph;
//! - queries never take the refresh gate; they read the current snapshot.
//!
//! Failure policy on the query path: if the staleness check or the refresh
//! fails, the last successfully built generation keeps serving; a tenant
//! that was never built answers with an empty shortlist. A snapshot that
//! failed validation is remembered by its watermark and not fetched again
//! until the store moves past it.
//!
//! A query for a tenant the store has no rows for creates nothing.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{Level, debug, error, info, warn};

use crate::ann::{AnnBackend, default_backend, note_unavailable};
use crate::coerce::RawVector;
use crate::config::IndexConfig;
use crate::error::IndexError;
use crate::store::{EmbeddingRecord, EmbeddingStore, InMemoryStore};
use crate::tenant::{IndexStatus, ScoredItem, TenantIndex};

/// Store watermark; `None` means the tenant had no rows.
type Watermark = Option<DateTime<Utc>>;

/// What [`IndexRegistry::ensure_fresh`] did for a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Cached version matches the store, or the tenant has no rows and no
    /// index; nothing fetched beyond the watermark.
    Fresh,
    /// The tenant was (re)built from a new snapshot.
    Refreshed,
    /// The check or refresh failed; whatever was cached keeps serving.
    Degraded,
}

/// Summary of a [`IndexRegistry::warm`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmReport {
    /// Tenants rebuilt successfully.
    pub tenants: usize,
    /// Vectors indexed across those tenants.
    pub vectors: usize,
    /// Tenants whose snapshot was rejected; they are retried lazily.
    pub failed: Vec<String>,
}

/// Point-in-time view of one tenant's index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantStats {
    pub tenant_id: String,
    pub len: usize,
    pub status: IndexStatus,
    pub generation: u64,
    /// Watermark the served generation was built from.
    pub watermark: Option<DateTime<Utc>>,
    /// False until a refresh has completed for this tenant.
    pub refreshed: bool,
}

struct TenantSlot {
    index: TenantIndex,
    /// `None` until the first successful refresh.
    watermark: RwLock<Option<Watermark>>,
    /// Watermark of the last snapshot that failed to build, if newer than any good one.
    rejected: RwLock<Option<Watermark>>,
    refresh_gate: Mutex<()>,
}

impl TenantSlot {
    fn cached(&self) -> Option<Watermark> {
        *self.watermark.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, watermark: Watermark) {
        *self.watermark.write().unwrap_or_else(PoisonError::into_inner) = Some(watermark);
        *self.rejected.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn rejected(&self) -> Option<Watermark> {
        *self.rejected.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn reject(&self, watermark: Watermark) {
        *self.rejected.write().unwrap_or_else(PoisonError::into_inner) = Some(watermark);
    }
}

/// Process-wide (but explicitly constructed) map of tenant indexes.
///
/// Share it by `Arc`; every method takes `&self` and blocks the caller.
pub struct IndexRegistry {
    store: Arc<dyn EmbeddingStore>,
    backend: Option<Arc<dyn AnnBackend>>,
    dimension: usize,
    slots: RwLock<HashMap<String, Arc<TenantSlot>>>,
}

impl IndexRegistry {
    /// Registry over `store` using the ANN backend compiled into this build.
    pub fn new(store: Arc<dyn EmbeddingStore>, config: &IndexConfig) -> Self {
        Self::with_backend(store, config, default_backend())
    }

    /// Registry with an explicit backend; `None` runs in degraded mode.
    pub fn with_backend(
        store: Arc<dyn EmbeddingStore>,
        config: &IndexConfig,
        backend: Option<Arc<dyn AnnBackend>>,
    ) -> Self {
        Self {
            store,
            backend,
            dimension: config.dimension,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Build the configured store and a registry over it.
    ///
    /// With [`StoreConfig::InMemory`](crate::StoreConfig::InMemory) the store
    /// is private to the registry and stays empty; use
    /// [`IndexRegistry::in_memory`] to keep a handle for writing rows.
    pub fn from_config(config: &IndexConfig) -> Result<Self, IndexError> {
        let store = config.build_store()?;
        Ok(Self::new(store, config))
    }

    /// Registry over a fresh [`InMemoryStore`], returned alongside it.
    ///
    /// `config.store` is ignored.
    pub fn in_memory(config: &IndexConfig) -> (Self, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (Self::new(store.clone(), config), store)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// False in degraded mode.
    pub fn ann_available(&self) -> bool {
        self.backend.is_some()
    }

    /// Load every tenant from one bulk fetch and rebuild them in parallel.
    ///
    /// Meant to run once before serving. A store failure fails the whole
    /// warm; a tenant with invalid rows is reported and left for the lazy
    /// path to retry.
    pub fn warm(&self) -> Result<WarmReport, IndexError> {
        let start = Instant::now();
        let span = tracing::span!(Level::INFO, "registry.warm");
        let _guard = span.enter();

        let rows = self.store.fetch_all_embeddings().map_err(|err| {
            error!(error = %err, "warm_failure");
            IndexError::from(err)
        })?;

        let outcomes: Vec<(String, Result<usize, IndexError>)> = group_by_tenant(rows)
            .into_par_iter()
            .map(|group| {
                let slot = self.slot(&group.tenant_id);
                let _gate = slot
                    .refresh_gate
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let outcome = slot.index.rebuild(&group.items);
                match outcome {
                    Ok(_) => slot.record(group.watermark),
                    Err(_) => slot.reject(group.watermark),
                }
                (group.tenant_id, outcome)
            })
            .collect();

        let mut report = WarmReport::default();
        for (tenant_id, outcome) in outcomes {
            match outcome {
                Ok(n) => {
                    report.tenants += 1;
                    report.vectors += n;
                }
                Err(_) => report.failed.push(tenant_id),
            }
        }
        report.failed.sort();

        info!(
            tenants = report.tenants,
            vectors = report.vectors,
            failed = report.failed.len(),
            elapsed_micros = start.elapsed().as_micros(),
            "warm_complete"
        );
        Ok(report)
    }

    /// Fetch one tenant's current rows and rebuild its index, creating it if absent.
    ///
    /// The watermark is read before the rows, so a write racing the fetch is
    /// caught by the next staleness check. Returns the number of indexed items.
    pub fn refresh_client(&self, tenant_id: &str) -> Result<usize, IndexError> {
        let slot = self.slot(tenant_id);
        self.refresh_slot(&slot, tenant_id, None)
            .map(|n| n.unwrap_or_else(|| slot.index.len()))
    }

    /// True when the tenant was never refreshed or the store's watermark differs
    /// from the cached one.
    pub fn needs_refresh(&self, tenant_id: &str) -> Result<bool, IndexError> {
        let current = self.store.fetch_latest_watermark(tenant_id)?;
        Ok(is_stale(self.cached_watermark(tenant_id), current))
    }

    /// Staleness check plus rebuild on miss. Never fails; see [`Freshness`].
    ///
    /// A tenant with no rows and no index is reported `Fresh` without being
    /// registered. A stale tenant whose current snapshot was already
    /// rejected is reported `Degraded` without fetching rows again.
    pub fn ensure_fresh(&self, tenant_id: &str) -> Freshness {
        let current = match self.store.fetch_latest_watermark(tenant_id) {
            Ok(w) => w,
            Err(err) => {
                warn!(tenant_id, error = %err, "staleness_check_failure");
                return Freshness::Degraded;
            }
        };
        if !is_stale(self.cached_watermark(tenant_id), current) {
            return Freshness::Fresh;
        }

        let slot = match (self.lookup(tenant_id), current) {
            (Some(slot), _) => slot,
            (None, None) => {
                debug!(tenant_id, "tenant_unknown");
                return Freshness::Fresh;
            }
            (None, Some(_)) => self.slot(tenant_id),
        };
        if slot.rejected() == Some(current) {
            debug!(tenant_id, watermark = ?current, "snapshot_already_rejected");
            return Freshness::Degraded;
        }

        debug!(tenant_id, watermark = ?current, "tenant_stale");
        match self.refresh_slot(&slot, tenant_id, Some(current)) {
            Ok(Some(_)) => Freshness::Refreshed,
            Ok(None) => Freshness::Fresh,
            Err(err) => {
                warn!(
                    tenant_id,
                    error = %err,
                    serving_generation = slot.index.generation(),
                    "refresh_failure"
                );
                Freshness::Degraded
            }
        }
    }

    /// The `k` items of `tenant_id` most similar to `query`.
    ///
    /// Refreshes the tenant first when the store has newer data. Unknown
    /// tenants, empty tenants, store failures and bad query vectors all
    /// yield a (possibly empty) list, never an error.
    pub fn top_k(&self, tenant_id: &str, query: &[f32], k: usize) -> Vec<ScoredItem> {
        if self.backend.is_none() {
            note_unavailable();
            return Vec::new();
        }

        let freshness = self.ensure_fresh(tenant_id);
        let Some(slot) = self.lookup(tenant_id) else {
            debug!(tenant_id, ?freshness, "tenant_absent");
            return Vec::new();
        };
        let hits = slot.index.top_k(query, k);
        debug!(
            tenant_id,
            ?freshness,
            k,
            hits = hits.len(),
            generation = slot.index.generation(),
            "tenant_query"
        );
        hits
    }

    pub fn stats(&self, tenant_id: &str) -> Option<TenantStats> {
        self.lookup(tenant_id).map(|slot| {
            let cached = slot.cached();
            TenantStats {
                tenant_id: tenant_id.to_string(),
                len: slot.index.len(),
                status: slot.index.status(),
                generation: slot.index.generation(),
                watermark: cached.flatten(),
                refreshed: cached.is_some(),
            }
        })
    }

    /// Known tenant ids, sorted.
    pub fn tenants(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read_slots().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop a tenant's index and cached version. The next query rebuilds it.
    pub fn evict(&self, tenant_id: &str) -> bool {
        let removed = self.write_slots().remove(tenant_id).is_some();
        if removed {
            info!(tenant_id, "tenant_evicted");
        }
        removed
    }

    fn refresh_slot(
        &self,
        slot: &TenantSlot,
        tenant_id: &str,
        observed: Option<Watermark>,
    ) -> Result<Option<usize>, IndexError> {
        let _gate = slot
            .refresh_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Another caller may have refreshed while we waited on the gate.
        if let Some(observed) = observed {
            if !is_stale(slot.cached(), observed) {
                return Ok(None);
            }
        }

        let watermark = self.store.fetch_latest_watermark(tenant_id)?;
        let rows = self.store.fetch_embeddings_for(tenant_id)?;
        let items: Vec<(String, RawVector)> = rows
            .into_iter()
            .filter(|r| r.tenant_id == tenant_id)
            .map(|r| (r.item_id, r.vector))
            .collect();

        match slot.index.rebuild(&items) {
            Ok(n) => {
                slot.record(watermark);
                Ok(Some(n))
            }
            Err(err) => {
                slot.reject(watermark);
                Err(err)
            }
        }
    }

    fn cached_watermark(&self, tenant_id: &str) -> Option<Watermark> {
        self.lookup(tenant_id).and_then(|slot| slot.cached())
    }

    fn lookup(&self, tenant_id: &str) -> Option<Arc<TenantSlot>> {
        self.read_slots().get(tenant_id).cloned()
    }

    fn slot(&self, tenant_id: &str) -> Arc<TenantSlot> {
        if let Some(slot) = self.lookup(tenant_id) {
            return slot;
        }
        let mut slots = self.write_slots();
        Arc::clone(slots.entry(tenant_id.to_string()).or_insert_with(|| {
            Arc::new(TenantSlot {
                index: TenantIndex::new(tenant_id, self.dimension, self.backend.clone()),
                watermark: RwLock::new(None),
                rejected: RwLock::new(None),
                refresh_gate: Mutex::new(()),
            })
        }))
    }

    fn read_slots(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<TenantSlot>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slots(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<TenantSlot>>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_stale(cached: Option<Watermark>, current: Watermark) -> bool {
    match (cached, current) {
        (None, _) => true,
        (Some(None), None) => false,
        (Some(None), Some(_)) | (Some(Some(_)), None) => true,
        (Some(Some(cached)), Some(current)) => current > cached,
    }
}

struct TenantGroup {
    tenant_id: String,
    items: Vec<(String, RawVector)>,
    watermark: Watermark,
}

/// Group rows by tenant, keeping first-seen tenant order and row order.
fn group_by_tenant(rows: Vec<EmbeddingRecord>) -> Vec<TenantGroup> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<TenantGroup> = Vec::new();
    for row in rows {
        let pos = *positions.entry(row.tenant_id.clone()).or_insert_with(|| {
            groups.push(TenantGroup {
                tenant_id: row.tenant_id.clone(),
                items: Vec::new(),
                watermark: None,
            });
            groups.len() - 1
        });
        let group = &mut groups[pos];
        group.watermark = group.watermark.max(Some(row.updated_at));
        group.items.push((row.item_id, row.vector));
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use chrono::TimeDelta;

    fn row(tenant: &str, item: &str, secs: i64) -> EmbeddingRecord {
        EmbeddingRecord {
            tenant_id: tenant.into(),
            item_id: item.into(),
            vector: RawVector::Flat(vec![1.0, 0.0]),
            updated_at: DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(secs),
        }
    }

    #[test]
    fn staleness_table() {
        let t0 = Utc::now();
        let t1 = t0 + TimeDelta::seconds(1);
        assert!(is_stale(None, None));
        assert!(is_stale(None, Some(t0)));
        assert!(!is_stale(Some(None), None));
        assert!(is_stale(Some(None), Some(t0)));
        assert!(is_stale(Some(Some(t0)), None));
        assert!(!is_stale(Some(Some(t0)), Some(t0)));
        assert!(!is_stale(Some(Some(t1)), Some(t0)));
        assert!(is_stale(Some(Some(t0)), Some(t1)));
    }

    #[test]
    fn grouping_keeps_order_and_max_watermark() {
        let groups = group_by_tenant(vec![
            row("b", "b1", 5),
            row("a", "a1", 9),
            row("b", "b2", 3),
            row("a", "a2", 1),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].tenant_id, "b");
        let b_items: Vec<_> = groups[0].items.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(b_items, ["b1", "b2"]);
        assert_eq!(groups[0].watermark, Some(row("b", "b1", 5).updated_at));
        assert_eq!(groups[1].watermark, Some(row("a", "a1", 9).updated_at));
    }

    #[test]
    fn degraded_registry_never_touches_the_store() {
        let store = Arc::new(InMemoryStore::new());
        store.upsert("t1", "a", vec![1.0, 0.0]);
        let registry =
            IndexRegistry::with_backend(store.clone(), &IndexConfig::new().with_dimension(2), None);

        assert!(!registry.ann_available());
        assert!(registry.top_k("t1", &[1.0, 0.0], 3).is_empty());
        assert_eq!(store.watermark_fetches(), 0);
        assert_eq!(store.row_fetches(), 0);
    }

    #[test]
    fn degraded_refresh_leaves_tenant_unbuilt() {
        let store = Arc::new(InMemoryStore::new());
        store.upsert("t1", "a", vec![1.0, 0.0]);
        let registry =
            IndexRegistry::with_backend(store, &IndexConfig::new().with_dimension(2), None);

        assert_eq!(registry.refresh_client("t1").unwrap(), 0);
        let stats = registry.stats("t1").unwrap();
        assert_eq!(stats.status, IndexStatus::NotBuilt);
        assert_eq!(stats.len, 0);
    }
}
