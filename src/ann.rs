//! Approximate Nearest Neighbor (ANN) graphs behind a small backend seam.
//!
//! A [`TenantIndex`](crate::TenantIndex) never talks to a graph library
//! directly. It asks an [`AnnBackend`] to build an immutable [`AnnGraph`] from
//! a full snapshot of unit vectors, then swaps that graph in wholesale. Graphs
//! are never mutated after construction, which is what lets queries keep
//! reading an old graph while a rebuild is in flight.
//!
//! The only real backend is HNSW via `hnsw_rs` (feature `hnsw`, on by
//! default). Without it [`default_backend`] returns `None` and the crate runs
//! in degraded mode: every tenant index answers with empty shortlists.
//!
//! ## Build parameters
//!
//! Fixed for tenants of tens to low thousands of vectors; they are not
//! runtime configuration.
//!
//! | constant             | value | role                              |
//! |----------------------|-------|-----------------------------------|
//! | [`MAX_NB_CONNECTION`]| 32    | graph degree (M)                  |
//! | [`EF_CONSTRUCTION`]  | 200   | candidate list width during build |
//! | [`EF_SEARCH`]        | 64    | candidate list width during query |
//! | [`MAX_LAYER`]        | 16    | layer cap                         |
//!
//! Tenants with fewer than [`LINEAR_SCAN_THRESHOLD`] items skip the graph and
//! are answered by an exact scan.

use std::sync::{Arc, Once};

use crate::error::IndexError;

/// Number of neighbors per node.
pub const MAX_NB_CONNECTION: usize = 32;
/// Dynamic candidate list size during construction.
pub const EF_CONSTRUCTION: usize = 200;
/// Dynamic candidate list size during search; raised to `k` when `k` is larger.
pub const EF_SEARCH: usize = 64;
/// Upper bound on HNSW layers.
pub const MAX_LAYER: usize = 16;
/// Snapshots smaller than this are scanned exhaustively instead of graphed.
pub const LINEAR_SCAN_THRESHOLD: usize = 10;

/// One search hit: the dense label assigned at build time and its cosine distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub label: usize,
    /// `1 - cosine_similarity`; lower is closer.
    pub distance: f32,
}

/// An immutable, fully built graph over labels `0..len()`.
pub trait AnnGraph: Send + Sync {
    /// Up to `k` nearest labels, ascending by distance.
    fn search(&self, query: &[f32], k: usize) -> Vec<Neighbor>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds graphs. Implementations must be pure functions of their input.
pub trait AnnBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build a graph where `vectors[i]` gets label `i`.
    fn build(&self, vectors: &[Vec<f32>]) -> Result<Box<dyn AnnGraph>, IndexError>;
}

/// Graph with no vectors. Every backend returns this for an empty snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyGraph;

impl AnnGraph for EmptyGraph {
    fn search(&self, _query: &[f32], _k: usize) -> Vec<Neighbor> {
        Vec::new()
    }

    fn len(&self) -> usize {
        0
    }
}

static UNAVAILABLE_NOTICE: Once = Once::new();

/// The backend compiled into this build, or `None` in degraded mode.
pub fn default_backend() -> Option<Arc<dyn AnnBackend>> {
    #[cfg(feature = "hnsw")]
    {
        Some(Arc::new(hnsw::HnswBackend))
    }
    #[cfg(not(feature = "hnsw"))]
    {
        note_unavailable();
        None
    }
}

/// Log the degraded-mode notice once per process.
pub(crate) fn note_unavailable() {
    UNAVAILABLE_NOTICE.call_once(|| {
        tracing::warn!(
            feature = "hnsw",
            "ann_backend_unavailable: tenant indexes will return empty shortlists"
        );
    });
}

#[cfg(feature = "hnsw")]
pub use hnsw::HnswBackend;

#[cfg(feature = "hnsw")]
mod hnsw {
    use hnsw_rs::prelude::*;

    use super::{
        AnnBackend, AnnGraph, EF_CONSTRUCTION, EF_SEARCH, EmptyGraph, LINEAR_SCAN_THRESHOLD,
        MAX_LAYER, MAX_NB_CONNECTION, Neighbor,
    };
    use crate::error::IndexError;

    /// Cosine-distance HNSW graphs from `hnsw_rs`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct HnswBackend;

    struct HnswGraph {
        hnsw: Hnsw<'static, f32, DistCosine>,
        len: usize,
    }

    impl AnnBackend for HnswBackend {
        fn name(&self) -> &'static str {
            "hnsw"
        }

        fn build(&self, vectors: &[Vec<f32>]) -> Result<Box<dyn AnnGraph>, IndexError> {
            let Some(width) = vectors.first().map(Vec::len) else {
                return Ok(Box::new(EmptyGraph));
            };
            if let Some(label) = vectors.iter().position(|v| v.len() != width) {
                return Err(IndexError::Build(format!(
                    "label {label} has width {}, label 0 has width {width}",
                    vectors[label].len()
                )));
            }
            if vectors.len() < LINEAR_SCAN_THRESHOLD {
                return Ok(Box::new(ExactGraph {
                    vectors: vectors.to_vec(),
                }));
            }
            let nb_elem = vectors.len();
            let hnsw = Hnsw::<f32, DistCosine>::new(
                MAX_NB_CONNECTION,
                nb_elem,
                MAX_LAYER,
                EF_CONSTRUCTION,
                DistCosine {},
            );

            // Labels are dense and follow input order.
            let data_for_insertion: Vec<(&Vec<f32>, usize)> = vectors
                .iter()
                .enumerate()
                .map(|(label, vec)| (vec, label))
                .collect();
            hnsw.parallel_insert(&data_for_insertion);

            Ok(Box::new(HnswGraph { hnsw, len: nb_elem }))
        }
    }

    impl AnnGraph for HnswGraph {
        fn search(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
            if k == 0 {
                return Vec::new();
            }
            let k = k.min(self.len);
            let ef = EF_SEARCH.max(k);
            self.hnsw
                .search(query, k, ef)
                .into_iter()
                .map(|neighbour| Neighbor {
                    label: neighbour.get_origin_id(),
                    distance: neighbour.distance,
                })
                .collect()
        }

        fn len(&self) -> usize {
            self.len
        }
    }

    /// Brute-force cosine scan for tenants too small to be worth a graph.
    struct ExactGraph {
        vectors: Vec<Vec<f32>>,
    }

    impl AnnGraph for ExactGraph {
        fn search(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
            let mut hits: Vec<Neighbor> = self
                .vectors
                .iter()
                .enumerate()
                .map(|(label, v)| Neighbor {
                    label,
                    distance: cosine_distance(query, v),
                })
                .collect();
            hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
            hits.truncate(k);
            hits
        }

        fn len(&self) -> usize {
            self.vectors.len()
        }
    }

    fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
        let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
        for (x, y) in a.iter().zip(b) {
            dot += x * y;
            na += x * x;
            nb += y * y;
        }
        if na == 0.0 || nb == 0.0 {
            return 1.0;
        }
        1.0 - dot / (na.sqrt() * nb.sqrt())
    }
}

#[cfg(all(test, feature = "hnsw"))]
mod tests {
    use super::*;

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn empty_snapshot_builds_empty_graph() {
        let graph = HnswBackend.build(&[]).unwrap();
        assert!(graph.is_empty());
        assert!(graph.search(&[1.0, 0.0], 5).is_empty());
    }

    /// Points on an arc, so label order is also angular order.
    fn arc(n: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| {
                let a = i as f32 * 0.05;
                vec![a.cos(), a.sin(), 0.5, 0.0]
            })
            .collect()
    }

    #[test]
    fn small_snapshot_labels_follow_input_order() {
        let vectors: Vec<Vec<f32>> = (0..4).map(|i| unit(4, i)).collect();
        let graph = HnswBackend.build(&vectors).unwrap();
        assert_eq!(graph.len(), 4);

        for (label, v) in vectors.iter().enumerate() {
            let hits = graph.search(v, 1);
            assert_eq!(hits[0].label, label);
            assert!(hits[0].distance.abs() < 1e-4);
        }
    }

    #[test]
    fn search_caps_k_at_graph_size() {
        let vectors: Vec<Vec<f32>> = (0..3).map(|i| unit(3, i)).collect();
        let graph = HnswBackend.build(&vectors).unwrap();
        assert_eq!(graph.search(&vectors[0], 10).len(), 3);
        assert!(graph.search(&vectors[0], 0).is_empty());

        let vectors = arc(LINEAR_SCAN_THRESHOLD + 2);
        let graph = HnswBackend.build(&vectors).unwrap();
        assert_eq!(graph.search(&vectors[0], 100).len(), vectors.len());
    }

    #[test]
    fn orthogonal_vectors_are_distance_one() {
        let vectors = vec![unit(2, 0), unit(2, 1)];
        let graph = HnswBackend.build(&vectors).unwrap();
        let hits = graph.search(&vectors[0], 2);
        assert_eq!(hits[1].label, 1);
        assert!((hits[1].distance - 1.0).abs() < 1e-4);
    }

    #[test]
    fn graph_finds_every_inserted_vector() {
        let vectors = arc(32);
        let graph = HnswBackend.build(&vectors).unwrap();
        assert_eq!(graph.len(), 32);

        for (label, v) in vectors.iter().enumerate() {
            let hits = graph.search(v, 1);
            assert_eq!(hits[0].label, label);
            assert!(hits[0].distance.abs() < 1e-4);
        }
    }

    #[test]
    fn graph_neighbours_are_ordered_by_distance() {
        let vectors = arc(32);
        let graph = HnswBackend.build(&vectors).unwrap();
        let hits = graph.search(&vectors[0], 5);
        let labels: Vec<usize> = hits.iter().map(|h| h.label).collect();
        assert_eq!(labels, [0, 1, 2, 3, 4]);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn ragged_snapshot_is_a_build_error() {
        let mut vectors = arc(LINEAR_SCAN_THRESHOLD + 2);
        vectors[5].push(1.0);
        let err = HnswBackend.build(&vectors).err().expect("ragged widths rejected");
        assert!(matches!(err, IndexError::Build(ref m) if m.contains("label 5 has width 5")));

        assert!(HnswBackend.build(&[vec![1.0, 0.0], vec![1.0]]).is_err());
    }

    #[test]
    fn default_backend_is_hnsw() {
        let backend = default_backend().expect("hnsw compiled in");
        assert_eq!(backend.name(), "hnsw");
    }
}
