//! One tenant's ANN graph and its label → item translation.
//!
//! The serving state is an `Arc<Snapshot>` behind a `RwLock`. Queries clone
//! the `Arc` and search without holding any lock; a rebuild constructs a new
//! snapshot off to the side and swaps the reference in one write. A query
//! therefore sees either the old generation or the new one, never a mix.
//! Rebuilds of the same tenant are serialized by a separate mutex so that
//! graph construction never blocks readers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{Level, debug, info, warn};

use crate::ann::{AnnBackend, AnnGraph, note_unavailable};
use crate::coerce::{RawVector, coerce};
use crate::error::IndexError;

/// A shortlist entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredItem {
    pub item_id: String,
    /// `1 - cosine_distance`: 1.0 for identical direction, 0.0 for orthogonal.
    pub similarity: f32,
}

/// Outcome of the most recent rebuild attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    /// No rebuild has succeeded yet (or the ANN backend is unavailable).
    NotBuilt,
    /// The latest rebuild succeeded and is being served.
    Built,
    /// The latest rebuild was rejected; the previous generation, if any, is still served.
    Failed,
}

struct Snapshot {
    graph: Box<dyn AnnGraph>,
    /// Parallel to graph labels: `item_ids[label]`.
    item_ids: Vec<String>,
    generation: u64,
}

struct State {
    serving: Option<Arc<Snapshot>>,
    status: IndexStatus,
}

/// In-memory ANN index for a single tenant.
pub struct TenantIndex {
    tenant_id: String,
    dimension: usize,
    backend: Option<Arc<dyn AnnBackend>>,
    state: RwLock<State>,
    rebuild_lock: Mutex<()>,
    generations: AtomicU64,
}

impl std::fmt::Debug for TenantIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantIndex")
            .field("tenant_id", &self.tenant_id)
            .field("dimension", &self.dimension)
            .field("status", &self.status())
            .field("len", &self.len())
            .finish()
    }
}

impl TenantIndex {
    /// Create an empty, unbuilt index. `backend == None` is degraded mode.
    pub fn new(
        tenant_id: impl Into<String>,
        dimension: usize,
        backend: Option<Arc<dyn AnnBackend>>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            dimension,
            backend,
            state: RwLock::new(State {
                serving: None,
                status: IndexStatus::NotBuilt,
            }),
            rebuild_lock: Mutex::new(()),
            generations: AtomicU64::new(0),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn status(&self) -> IndexStatus {
        self.read_state().status
    }

    /// True only when the latest rebuild succeeded.
    pub fn is_built(&self) -> bool {
        self.status() == IndexStatus::Built
    }

    /// Number of items in the generation currently served.
    pub fn len(&self) -> usize {
        self.serving().map_or(0, |s| s.item_ids.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Generation currently served; 0 before the first successful rebuild.
    pub fn generation(&self) -> u64 {
        self.serving().map_or(0, |s| s.generation)
    }

    /// Replace the graph with one built from `items`, labelled in input order.
    ///
    /// Every vector is validated first. On any failure nothing is swapped:
    /// the previous generation keeps serving and the status becomes
    /// [`IndexStatus::Failed`]. Returns the number of indexed items.
    pub fn rebuild(&self, items: &[(String, RawVector)]) -> Result<usize, IndexError> {
        let Some(backend) = self.backend.as_ref() else {
            note_unavailable();
            return Ok(0);
        };

        let _serial = self
            .rebuild_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let start = Instant::now();
        let span = tracing::span!(
            Level::INFO,
            "tenant.rebuild",
            tenant_id = %self.tenant_id,
            items = items.len()
        );
        let _guard = span.enter();

        match self.build_snapshot(backend.as_ref(), items) {
            Ok(snapshot) => {
                let generation = snapshot.generation;
                let len = snapshot.item_ids.len();
                {
                    let mut state = self.write_state();
                    state.serving = Some(Arc::new(snapshot));
                    state.status = IndexStatus::Built;
                }
                info!(
                    tenant_id = %self.tenant_id,
                    items = len,
                    generation,
                    backend = backend.name(),
                    elapsed_micros = start.elapsed().as_micros(),
                    "tenant_rebuild_success"
                );
                Ok(len)
            }
            Err(err) => {
                let serving_generation = {
                    let mut state = self.write_state();
                    state.status = IndexStatus::Failed;
                    state.serving.as_ref().map(|s| s.generation)
                };
                warn!(
                    tenant_id = %self.tenant_id,
                    error = %err,
                    serving_generation = ?serving_generation,
                    elapsed_micros = start.elapsed().as_micros(),
                    "tenant_rebuild_failure"
                );
                Err(err)
            }
        }
    }

    fn build_snapshot(
        &self,
        backend: &dyn AnnBackend,
        items: &[(String, RawVector)],
    ) -> Result<Snapshot, IndexError> {
        let mut item_ids = Vec::with_capacity(items.len());
        let mut vectors = Vec::with_capacity(items.len());
        for (item_id, raw) in items {
            let vector =
                coerce(raw, self.dimension).map_err(|source| IndexError::InvalidVector {
                    item_id: item_id.clone(),
                    source,
                })?;
            item_ids.push(item_id.clone());
            vectors.push(vector);
        }

        let graph = backend.build(&vectors)?;
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Snapshot {
            graph,
            item_ids,
            generation,
        })
    }

    /// The `k` most similar items, descending by similarity.
    ///
    /// Empty when nothing has been built, the index is empty, `k == 0`, or
    /// the query vector is unusable. Never fails.
    pub fn top_k(&self, query: &[f32], k: usize) -> Vec<ScoredItem> {
        if k == 0 {
            return Vec::new();
        }
        let Some(snapshot) = self.serving() else {
            return Vec::new();
        };
        if snapshot.item_ids.is_empty() {
            return Vec::new();
        }

        let query = match coerce(&RawVector::from(query), self.dimension) {
            Ok(q) => q,
            Err(err) => {
                debug!(tenant_id = %self.tenant_id, error = %err, "query_vector_rejected");
                return Vec::new();
            }
        };

        let mut hits: Vec<ScoredItem> = snapshot
            .graph
            .search(&query, k)
            .into_iter()
            .filter_map(|n| {
                snapshot.item_ids.get(n.label).map(|item_id| ScoredItem {
                    item_id: item_id.clone(),
                    similarity: 1.0 - n.distance,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits.truncate(k);
        hits
    }

    fn serving(&self) -> Option<Arc<Snapshot>> {
        self.read_state().serving.clone()
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(all(test, feature = "hnsw"))]
mod tests {
    use super::*;
    use crate::ann::HnswBackend;
    use crate::error::ValidationError;

    const DIM: usize = 4;

    fn index() -> TenantIndex {
        TenantIndex::new("tenant-a", DIM, Some(Arc::new(HnswBackend)))
    }

    fn axis(hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        v[hot] = 1.0;
        v
    }

    fn items(ids: &[&str]) -> Vec<(String, RawVector)> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| (id.to_string(), RawVector::Flat(axis(i % DIM))))
            .collect()
    }

    #[test]
    fn fresh_index_is_unbuilt_and_empty() {
        let idx = index();
        assert_eq!(idx.status(), IndexStatus::NotBuilt);
        assert_eq!(idx.generation(), 0);
        assert!(idx.top_k(&axis(0), 3).is_empty());
    }

    #[test]
    fn empty_rebuild_is_built_and_answers_empty() {
        let idx = index();
        assert_eq!(idx.rebuild(&[]).unwrap(), 0);
        assert!(idx.is_built());
        assert!(idx.is_empty());
        assert!(idx.top_k(&axis(0), 3).is_empty());
    }

    #[test]
    fn inserted_vector_is_its_own_nearest_neighbor() {
        let idx = index();
        idx.rebuild(&items(&["a", "b", "c"])).unwrap();

        let hits = idx.top_k(&axis(1), 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].item_id, "b");
        assert!((hits[0].similarity - 1.0).abs() < 1e-4);
    }

    #[test]
    fn result_length_is_min_of_k_and_n() {
        let idx = index();
        idx.rebuild(&items(&["a", "b", "c"])).unwrap();
        assert_eq!(idx.top_k(&axis(0), 10).len(), 3);
        assert_eq!(idx.top_k(&axis(0), 2).len(), 2);
        assert!(idx.top_k(&axis(0), 0).is_empty());
    }

    #[test]
    fn results_are_descending() {
        let idx = index();
        let data = vec![
            ("near".to_string(), RawVector::Flat(vec![1.0, 0.1, 0.0, 0.0])),
            ("mid".to_string(), RawVector::Flat(vec![1.0, 1.0, 0.0, 0.0])),
            ("far".to_string(), RawVector::Flat(vec![0.0, 1.0, 0.0, 0.0])),
        ];
        idx.rebuild(&data).unwrap();

        let hits = idx.top_k(&axis(0), 3);
        let ids: Vec<_> = hits.iter().map(|h| h.item_id.as_str()).collect();
        assert_eq!(ids, ["near", "mid", "far"]);
        assert!(hits.windows(2).all(|w| w[0].similarity > w[1].similarity));
    }

    #[test]
    fn malformed_vector_keeps_previous_generation() {
        let idx = index();
        idx.rebuild(&items(&["a", "b", "c"])).unwrap();
        let before = idx.generation();

        let mut bad = items(&["a", "b"]);
        bad.push(("broken".into(), RawVector::Flat(vec![1.0, 2.0])));
        let err = idx.rebuild(&bad).unwrap_err();
        assert!(matches!(
            err,
            IndexError::InvalidVector {
                ref item_id,
                source: ValidationError::DimensionMismatch { expected: 4, got: 2 },
            } if item_id == "broken"
        ));

        assert_eq!(idx.status(), IndexStatus::Failed);
        assert_eq!(idx.generation(), before);
        assert_eq!(idx.len(), 3);
        let hits = idx.top_k(&axis(2), 3);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].item_id, "c");
    }

    #[test]
    fn failed_first_rebuild_serves_nothing() {
        let idx = index();
        let bad = vec![("x".to_string(), RawVector::Flat(vec![0.0; DIM]))];
        assert!(idx.rebuild(&bad).is_err());
        assert_eq!(idx.status(), IndexStatus::Failed);
        assert!(idx.top_k(&axis(0), 1).is_empty());
    }

    #[test]
    fn rebuild_twice_gives_same_ranking() {
        let idx = index();
        let data = items(&["a", "b", "c", "d"]);
        idx.rebuild(&data).unwrap();
        let first = idx.top_k(&[0.9, 0.3, 0.1, 0.0], 4);
        idx.rebuild(&data).unwrap();
        let second = idx.top_k(&[0.9, 0.3, 0.1, 0.0], 4);

        assert_eq!(idx.generation(), 2);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.item_id, b.item_id);
            assert!((a.similarity - b.similarity).abs() < 1e-4);
        }
    }

    #[test]
    fn bad_query_vector_yields_empty() {
        let idx = index();
        idx.rebuild(&items(&["a"])).unwrap();
        assert!(idx.top_k(&[1.0, 0.0], 1).is_empty());
        assert!(idx.top_k(&[0.0; DIM], 1).is_empty());
    }

    #[test]
    fn graph_sized_tenant_round_trips_every_item() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        const WIDTH: usize = 32;
        let mut rng = StdRng::seed_from_u64(42);
        let data: Vec<(String, RawVector)> = (0..120)
            .map(|i| {
                let v: Vec<f32> = (0..WIDTH).map(|_| rng.random_range(-1.0..1.0)).collect();
                (format!("intent-{i}"), RawVector::Flat(v))
            })
            .collect();
        let idx = TenantIndex::new("tenant-a", WIDTH, Some(Arc::new(HnswBackend)));
        assert_eq!(idx.rebuild(&data).unwrap(), 120);

        for (id, raw) in data.iter().step_by(7) {
            let RawVector::Flat(query) = raw else { unreachable!() };
            let hits = idx.top_k(query, 10);
            assert_eq!(hits.len(), 10);
            assert_eq!(&hits[0].item_id, id);
            assert!((hits[0].similarity - 1.0).abs() < 1e-4);
            assert!(hits.windows(2).all(|w| w[0].similarity >= w[1].similarity));
        }

        let RawVector::Flat(query) = &data[0].1 else { unreachable!() };
        assert_eq!(idx.top_k(query, 500).len(), 120);
        assert_eq!(idx.top_k(query, 120).len(), 120);
    }

    #[test]
    fn degraded_index_is_a_noop() {
        let idx = TenantIndex::new("tenant-a", DIM, None);
        assert_eq!(idx.rebuild(&items(&["a", "b"])).unwrap(), 0);
        assert_eq!(idx.status(), IndexStatus::NotBuilt);
        assert!(idx.top_k(&axis(0), 5).is_empty());
    }
}
