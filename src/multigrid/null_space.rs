//! Sources of near-null-space vectors for the multigrid setup.

use crate::error::{KError, check_len};
use crate::lattice::FieldLayout;
use rand::Rng;
use std::collections::BTreeMap;

/// Externally provided null-space vectors, keyed by level.
pub trait NullSpaceSource {
    /// The first `n_vec` vectors of `level`, each of length `len`.
    fn load(&self, level: usize, n_vec: usize, len: usize) -> Result<Vec<Vec<f64>>, KError>;
}

/// In-memory [`NullSpaceSource`], e.g. vectors kept from an earlier setup.
#[derive(Debug, Clone, Default)]
pub struct MemoryNullSpace {
    levels: BTreeMap<usize, Vec<Vec<f64>>>,
}

impl MemoryNullSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, level: usize, vectors: Vec<Vec<f64>>) {
        self.levels.insert(level, vectors);
    }

    pub fn with_level(mut self, level: usize, vectors: Vec<Vec<f64>>) -> Self {
        self.insert(level, vectors);
        self
    }
}

impl NullSpaceSource for MemoryNullSpace {
    fn load(&self, level: usize, n_vec: usize, len: usize) -> Result<Vec<Vec<f64>>, KError> {
        let stored = self
            .levels
            .get(&level)
            .ok_or_else(|| KError::Setup(format!("no null-space vectors stored for level {level}")))?;
        if stored.len() < n_vec {
            return Err(KError::Setup(format!(
                "level {level} holds {} null-space vectors, {n_vec} requested",
                stored.len()
            )));
        }
        stored[..n_vec]
            .iter()
            .map(|v| {
                check_len(len, v.len())?;
                Ok(v.clone())
            })
            .collect()
    }
}

/// Uniform random vectors in `[-1, 1)`.
pub fn random_vectors<R: Rng>(rng: &mut R, n_vec: usize, len: usize) -> Vec<Vec<f64>> {
    (0..n_vec)
        .map(|_| (0..len).map(|_| 2.0 * rng.r#gen::<f64>() - 1.0).collect())
        .collect()
}

/// Near-null vectors of the free field.
///
/// The first `ncolor` vectors are constant in one colour on every spin and site. When the
/// aggregates hold both parities (`spin_block_size > 0`) the next `ncolor` carry the staggered
/// sign `(−1)^parity`, so that together they span the per-parity constants of every colour.
pub fn free_field_vectors(
    layout: &FieldLayout,
    n_vec: usize,
    spin_block_size: usize,
) -> Result<Vec<Vec<f64>>, KError> {
    let nc = layout.ncolor;
    let available = if spin_block_size == 0 { nc } else { 2 * nc };
    if n_vec > available {
        return Err(KError::Config(format!(
            "free field supplies {available} null-space vectors, {n_vec} requested"
        )));
    }
    let lat = &layout.lattice;
    let ncomp = layout.ncomp();
    Ok((0..n_vec)
        .map(|k| {
            let color = k % nc;
            let staggered = k >= nc;
            let mut v = vec![0.0; layout.len()];
            for cb in 0..lat.volume() {
                let sign = if staggered && lat.parity(cb) == 1 { -1.0 } else { 1.0 };
                for spin in 0..layout.nspin {
                    v[cb * ncomp + spin * nc + color] = sign;
                }
            }
            v
        })
        .collect())
}
