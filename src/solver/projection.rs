//! Dense projection matrix `Uᵀ A U` of an incremental deflation space.
//!
//! Storage is column-major with the leading dimension padded to [`SEARCH_SPACE_TILE`], sized
//! once for the full capacity `nev · deflation_grid`; growth only moves the active dimension.

use crate::config::SEARCH_SPACE_TILE;
use crate::error::KError;
use faer::Mat;

#[derive(Clone, Debug)]
pub struct ProjectionMatrix {
    ld: usize,
    tot_dim: usize,
    curr_dim: usize,
    prev_dim: usize,
    data: Vec<f64>,
}

impl ProjectionMatrix {
    pub fn new(nev: usize, deflation_grid: usize) -> Result<Self, KError> {
        if nev == 0 || deflation_grid == 0 {
            return Err(KError::Config(format!(
                "projection matrix needs nev > 0 and deflation_grid > 0, got {nev} and {deflation_grid}"
            )));
        }
        let tot_dim = nev * deflation_grid;
        let ld = tot_dim.div_ceil(SEARCH_SPACE_TILE) * SEARCH_SPACE_TILE;
        Ok(Self {
            ld,
            tot_dim,
            curr_dim: 0,
            prev_dim: 0,
            data: vec![0.0; ld * ld],
        })
    }

    pub fn ld(&self) -> usize {
        self.ld
    }

    pub fn tot_dim(&self) -> usize {
        self.tot_dim
    }

    pub fn curr_dim(&self) -> usize {
        self.curr_dim
    }

    /// Active dimension before the last extension.
    pub fn prev_dim(&self) -> usize {
        self.prev_dim
    }

    /// Size of the full storage in bytes.
    pub fn bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f64>()
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[j * self.ld + i]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, v: f64) {
        self.data[j * self.ld + i] = v;
    }

    /// Grows the active dimension by `add`.
    pub fn extend(&mut self, add: usize) -> Result<(), KError> {
        if self.curr_dim + add > self.tot_dim {
            return Err(KError::Config(format!(
                "projection matrix extension to {} exceeds capacity {}",
                self.curr_dim + add,
                self.tot_dim
            )));
        }
        self.prev_dim = self.curr_dim;
        self.curr_dim += add;
        Ok(())
    }

    /// Truncates (or re-grows after truncation) the active dimension.
    pub fn reset_curr_dim(&mut self, n: usize) -> Result<(), KError> {
        if n > self.tot_dim {
            return Err(KError::Config(format!(
                "projection dimension {n} exceeds capacity {}",
                self.tot_dim
            )));
        }
        self.prev_dim = n.min(self.prev_dim);
        self.curr_dim = n;
        Ok(())
    }

    /// Copy of the active block.
    pub fn active(&self) -> Mat<f64> {
        Mat::from_fn(self.curr_dim, self.curr_dim, |i, j| self.get(i, j))
    }

    fn check_bytes(&self, count: usize) -> Result<(), KError> {
        if count == 0 || count > self.bytes() || count % std::mem::size_of::<f64>() != 0 {
            return Err(KError::Config(format!(
                "projection matrix transfer of {count} bytes (storage holds {})",
                self.bytes()
            )));
        }
        Ok(())
    }

    /// Overwrites the leading storage with native-endian doubles from `bytes`.
    pub fn load(&mut self, bytes: &[u8]) -> Result<(), KError> {
        self.check_bytes(bytes.len())?;
        for (dst, chunk) in self.data.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *dst = f64::from_ne_bytes(raw);
        }
        Ok(())
    }

    /// The leading `count` bytes of the storage, as native-endian doubles.
    pub fn save(&self, count: usize) -> Result<Vec<u8>, KError> {
        self.check_bytes(count)?;
        Ok(self.data[..count / 8]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_and_padding() {
        let p = ProjectionMatrix::new(4, 5).unwrap();
        assert_eq!(p.tot_dim(), 20);
        assert_eq!(p.ld(), 32);
        assert_eq!(p.bytes(), 32 * 32 * 8);
        assert!(ProjectionMatrix::new(0, 2).is_err());
        assert!(ProjectionMatrix::new(4, 0).is_err());
    }

    #[test]
    fn extension_is_bounded() {
        let mut p = ProjectionMatrix::new(4, 2).unwrap();
        p.extend(4).unwrap();
        p.extend(4).unwrap();
        assert_eq!((p.prev_dim(), p.curr_dim()), (4, 8));
        assert!(p.extend(1).is_err());
        assert!(p.reset_curr_dim(9).is_err());
        p.reset_curr_dim(2).unwrap();
        assert_eq!(p.curr_dim(), 2);
    }

    #[test]
    fn load_and_save_check_byte_counts() {
        let mut p = ProjectionMatrix::new(2, 1).unwrap();
        p.set(1, 0, 3.5);
        let bytes = p.save(p.bytes()).unwrap();
        let mut q = ProjectionMatrix::new(2, 1).unwrap();
        q.load(&bytes).unwrap();
        assert_eq!(q.get(1, 0), 3.5);
        assert!(p.save(0).is_err());
        assert!(p.save(p.bytes() + 8).is_err());
        assert!(q.load(&[]).is_err());
    }
}
