//! Turning raw store/provider vectors into index-ready embeddings.
//!
//! Embedding providers and stores disagree on shape: some return a flat list,
//! some wrap it in a singleton list, and PostgREST serializes `vector` columns
//! as text (`"[0.1,0.2,...]"`). [`coerce`] accepts all three, flattens one
//! level, checks the dimension, and returns a unit-length copy.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A vector as it arrives from a store or caller, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawVector {
    Flat(Vec<f32>),
    /// Nested one level, e.g. `[[0.1, 0.2, ...]]`.
    Nested(Vec<Vec<f32>>),
    /// JSON array text, as pgvector columns come back over PostgREST.
    Text(String),
}

impl From<Vec<f32>> for RawVector {
    fn from(v: Vec<f32>) -> Self {
        RawVector::Flat(v)
    }
}

impl From<&[f32]> for RawVector {
    fn from(v: &[f32]) -> Self {
        RawVector::Flat(v.to_vec())
    }
}

impl From<Vec<Vec<f32>>> for RawVector {
    fn from(v: Vec<Vec<f32>>) -> Self {
        RawVector::Nested(v)
    }
}


/// Validate `raw` against `dimension` and return it flattened and L2-normalized.
pub fn coerce(raw: &RawVector, dimension: usize) -> Result<Vec<f32>, ValidationError> {
    let flat = match raw {
        RawVector::Flat(v) => v.clone(),
        RawVector::Nested(v) => v.concat(),
        RawVector::Text(text) => match serde_json::from_str::<RawVector>(text.trim()) {
            Ok(RawVector::Flat(v)) => v,
            Ok(RawVector::Nested(v)) => v.concat(),
            Ok(RawVector::Text(_)) => {
                return Err(ValidationError::Unparseable("doubly encoded text".into()));
            }
            Err(err) => return Err(ValidationError::Unparseable(err.to_string())),
        },
    };
    normalized(flat, dimension)
}

fn normalized(mut v: Vec<f32>, dimension: usize) -> Result<Vec<f32>, ValidationError> {
    if v.len() != dimension {
        return Err(ValidationError::DimensionMismatch {
            expected: dimension,
            got: v.len(),
        });
    }
    if let Some(position) = v.iter().position(|x| !x.is_finite()) {
        return Err(ValidationError::NonFinite { position });
    }

    // Accumulate in f64 so 1536-wide vectors with tiny components keep precision.
    let norm = v.iter().map(|&x| f64::from(x) * f64::from(x)).sum::<f64>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(ValidationError::ZeroNorm);
    }
    for x in &mut v {
        *x = (f64::from(*x) / norm) as f32;
    }
    Ok(v)
}
