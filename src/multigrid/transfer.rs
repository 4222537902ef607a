//! Aggregation based prolongation `P` and restriction `R = P†`.
//!
//! The fine lattice is cut into geometric blocks; each block, together with a group of fine
//! spins, forms one aggregate. The near-null vectors restricted to an aggregate are
//! orthonormalised there, so `P` has orthonormal columns and `R P = 1` on the coarse space.
//!
//! A coarse site is a geometric block; its internal index is `spin_c * n_vec + k`, with coarse
//! spin `spin / spin_block_size`, or the fine site parity when `spin_block_size` is zero.

use crate::config::{NDIM, Precision};
use crate::error::{KError, check_len};
use crate::lattice::{FieldLayout, Lattice};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

pub struct Transfer {
    fine: FieldLayout,
    coarse: FieldLayout,
    n_vec: usize,
    precision: Precision,
    // aggregate of every fine index
    aggregate: Vec<usize>,
    // fine indices of every aggregate
    members: Vec<Vec<usize>>,
    // orthonormalised vectors, basis[f * n_vec + k]
    basis: Vec<f64>,
    flops: AtomicU64,
}

impl Transfer {
    /// Builds the transfer from `vectors` (full-lattice fields of layout `fine`).
    ///
    /// Fails with `Config` when the block size does not tile the lattice or the spin block
    /// size does not divide the number of spins, and with `Setup` when a vector vanishes on
    /// an aggregate or is dependent on the previous ones there.
    pub fn new(
        fine: &FieldLayout,
        vectors: &[Vec<f64>],
        geo_block: [usize; NDIM],
        spin_block_size: usize,
        precision: Precision,
    ) -> Result<Self, KError> {
        let n_vec = vectors.len();
        if n_vec == 0 {
            return Err(KError::Config("transfer needs at least one null vector".into()));
        }
        for v in vectors {
            check_len(fine.len(), v.len())?;
        }
        let dims = fine.lattice.dims();
        let mut coarse_dims = [0; NDIM];
        for mu in 0..NDIM {
            if geo_block[mu] == 0 || dims[mu] % geo_block[mu] != 0 {
                return Err(KError::Config(format!(
                    "block size {geo_block:?} does not tile lattice {dims:?}"
                )));
            }
            coarse_dims[mu] = dims[mu] / geo_block[mu];
        }
        let nspin_c = match spin_block_size {
            0 => 2,
            s if fine.nspin % s == 0 => fine.nspin / s,
            s => {
                return Err(KError::Config(format!(
                    "spin block size {s} does not divide {} spins",
                    fine.nspin
                )));
            }
        };
        let coarse_lattice = Arc::new(Lattice::new(coarse_dims)?);
        let coarse = FieldLayout::new(coarse_lattice.clone(), nspin_c, n_vec);

        let nc = fine.ncomp();
        let n_agg = coarse_lattice.volume() * nspin_c;
        let mut aggregate = vec![0; fine.len()];
        let mut members = vec![Vec::new(); n_agg];
        for cb in 0..fine.lattice.volume() {
            let x = fine.lattice.coords(cb);
            let mut xc = [0; NDIM];
            for mu in 0..NDIM {
                xc[mu] = x[mu] / geo_block[mu];
            }
            let site_c = coarse_lattice.cb_index(&xc);
            for comp in 0..nc {
                let spin = comp / fine.ncolor;
                let spin_c = if spin_block_size == 0 {
                    fine.lattice.parity(cb)
                } else {
                    spin / spin_block_size
                };
                let a = site_c * nspin_c + spin_c;
                let f = cb * nc + comp;
                aggregate[f] = a;
                members[a].push(f);
            }
        }

        let orthonormalise = |a: usize| block_orthonormalise(&members[a], vectors, a);
        #[cfg(feature = "rayon")]
        let blocks: Vec<Vec<f64>> = (0..n_agg)
            .into_par_iter()
            .map(orthonormalise)
            .collect::<Result<_, _>>()?;
        #[cfg(not(feature = "rayon"))]
        let blocks: Vec<Vec<f64>> = (0..n_agg).map(orthonormalise).collect::<Result<_, _>>()?;

        let mut basis = vec![0.0; fine.len() * n_vec];
        for (a, block) in blocks.iter().enumerate() {
            for (m, &f) in members[a].iter().enumerate() {
                basis[f * n_vec..(f + 1) * n_vec].copy_from_slice(&block[m * n_vec..(m + 1) * n_vec]);
            }
        }
        precision.round_slice(&mut basis);
        debug!(
            fine = ?dims,
            coarse = ?coarse_dims,
            n_vec,
            aggregates = n_agg,
            "transfer built"
        );

        Ok(Self {
            fine: fine.clone(),
            coarse,
            n_vec,
            precision,
            aggregate,
            members,
            basis,
            flops: AtomicU64::new(0),
        })
    }

    pub fn fine_layout(&self) -> &FieldLayout {
        &self.fine
    }

    pub fn coarse_layout(&self) -> &FieldLayout {
        &self.coarse
    }

    pub fn n_vec(&self) -> usize {
        self.n_vec
    }

    /// Precision the basis is stored in.
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// `coarse = R fine`
    pub fn restrict(&self, coarse: &mut [f64], fine: &[f64]) -> Result<(), KError> {
        check_len(self.coarse.len(), coarse.len())?;
        check_len(self.fine.len(), fine.len())?;
        let n = self.n_vec;
        let kernel = |(a, out): (usize, &mut [f64])| {
            out.fill(0.0);
            for &f in &self.members[a] {
                let v = &self.basis[f * n..(f + 1) * n];
                for k in 0..n {
                    out[k] += v[k] * fine[f];
                }
            }
        };
        #[cfg(feature = "rayon")]
        coarse.par_chunks_mut(n).enumerate().for_each(kernel);
        #[cfg(not(feature = "rayon"))]
        coarse.chunks_mut(n).enumerate().for_each(kernel);
        self.flops.fetch_add((2 * fine.len() * n) as u64, Ordering::Relaxed);
        Ok(())
    }

    /// `fine = P coarse`
    pub fn prolong(&self, fine: &mut [f64], coarse: &[f64]) -> Result<(), KError> {
        check_len(self.fine.len(), fine.len())?;
        check_len(self.coarse.len(), coarse.len())?;
        let n = self.n_vec;
        let kernel = |(f, out): (usize, &mut f64)| {
            let a = self.aggregate[f];
            let v = &self.basis[f * n..(f + 1) * n];
            *out = v.iter().zip(&coarse[a * n..(a + 1) * n]).map(|(b, c)| b * c).sum();
        };
        #[cfg(feature = "rayon")]
        fine.par_iter_mut().enumerate().for_each(kernel);
        #[cfg(not(feature = "rayon"))]
        fine.iter_mut().enumerate().for_each(kernel);
        self.flops.fetch_add((2 * fine.len() * n) as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn flops(&self) -> u64 {
        self.flops.load(Ordering::Relaxed)
    }
}

/// Modified Gram-Schmidt of the vectors restricted to one aggregate.
///
/// Returns the orthonormal block row-major, `members.len() × vectors.len()`.
fn block_orthonormalise(members: &[usize], vectors: &[Vec<f64>], a: usize) -> Result<Vec<f64>, KError> {
    let n = vectors.len();
    let m = members.len();
    let mut block = vec![0.0; m * n];
    for k in 0..n {
        let mut before = 0.0;
        for (i, &f) in members.iter().enumerate() {
            block[i * n + k] = vectors[k][f];
            before += vectors[k][f] * vectors[k][f];
        }
        for j in 0..k {
            let c: f64 = (0..m).map(|i| block[i * n + j] * block[i * n + k]).sum();
            for i in 0..m {
                block[i * n + k] -= c * block[i * n + j];
            }
        }
        let nrm = (0..m).map(|i| block[i * n + k].powi(2)).sum::<f64>().sqrt();
        if !(nrm > 1e-12 * before.sqrt()) {
            return Err(KError::Setup(format!(
                "null vector {k} vanishes on aggregate {a} after orthogonalisation"
            )));
        }
        for i in 0..m {
            block[i * n + k] /= nrm;
        }
    }
    Ok(block)
}
