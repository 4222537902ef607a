//! Periodic 4-d lattice geometry with checkerboard site ordering.
//!
//! Sites are numbered even parity first: checkerboard index `cb = parity * volume_cb + k`,
//! where `k` is the lexicographic rank of the site among the sites of its parity. A field
//! stores `ncomp` reals per site, component `spin * ncolor + color`, at `cb * ncomp + comp`.

use crate::config::NDIM;
use crate::error::KError;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct Lattice {
    dims: [usize; NDIM],
    volume: usize,
    volume_cb: usize,
    cb_to_coords: Vec<[usize; NDIM]>,
    lex_to_cb: Vec<usize>,
    // forward neighbours in 0..NDIM, backward in NDIM..2*NDIM
    neighbors: Vec<[usize; 2 * NDIM]>,
}

impl Lattice {
    /// Builds the lattice; at least one extent must be even so both parities hold the same
    /// number of sites.
    pub fn new(dims: [usize; NDIM]) -> Result<Self, KError> {
        if dims.iter().any(|&d| d == 0) {
            return Err(KError::Config(format!("lattice extent zero in {dims:?}")));
        }
        if dims.iter().all(|&d| d % 2 == 1) {
            return Err(KError::Config(format!(
                "lattice {dims:?} needs an even extent for a checkerboard split"
            )));
        }
        let volume: usize = dims.iter().product();
        let volume_cb = volume / 2;

        let mut lex_to_cb = vec![0; volume];
        let mut cb_to_coords = vec![[0; NDIM]; volume];
        let mut count = [0usize; 2];
        for lex in 0..volume {
            let c = lex_coords(lex, &dims);
            let parity = c.iter().sum::<usize>() % 2;
            let cb = parity * volume_cb + count[parity];
            count[parity] += 1;
            lex_to_cb[lex] = cb;
            cb_to_coords[cb] = c;
        }

        let neighbors = cb_to_coords
            .iter()
            .map(|c| {
                let mut nb = [0; 2 * NDIM];
                for mu in 0..NDIM {
                    let mut fwd = *c;
                    fwd[mu] = (c[mu] + 1) % dims[mu];
                    let mut bwd = *c;
                    bwd[mu] = (c[mu] + dims[mu] - 1) % dims[mu];
                    nb[mu] = lex_to_cb[coords_lex(&fwd, &dims)];
                    nb[NDIM + mu] = lex_to_cb[coords_lex(&bwd, &dims)];
                }
                nb
            })
            .collect();

        Ok(Self {
            dims,
            volume,
            volume_cb,
            cb_to_coords,
            lex_to_cb,
            neighbors,
        })
    }

    pub fn dims(&self) -> [usize; NDIM] {
        self.dims
    }

    pub fn volume(&self) -> usize {
        self.volume
    }

    pub fn volume_cb(&self) -> usize {
        self.volume_cb
    }

    pub fn coords(&self, cb: usize) -> [usize; NDIM] {
        self.cb_to_coords[cb]
    }

    pub fn parity(&self, cb: usize) -> usize {
        cb / self.volume_cb
    }

    pub fn cb_index(&self, coords: &[usize; NDIM]) -> usize {
        self.lex_to_cb[coords_lex(coords, &self.dims)]
    }

    /// Neighbour of `cb` one step forward along `mu`.
    pub fn forward(&self, cb: usize, mu: usize) -> usize {
        self.neighbors[cb][mu]
    }

    pub fn backward(&self, cb: usize, mu: usize) -> usize {
        self.neighbors[cb][NDIM + mu]
    }

    pub fn neighbors(&self, cb: usize) -> &[usize; 2 * NDIM] {
        &self.neighbors[cb]
    }

    /// True when every nearest neighbour has the opposite parity, i.e. all extents are even.
    pub fn is_parity_split(&self) -> bool {
        self.dims.iter().all(|&d| d % 2 == 0)
    }
}

fn lex_coords(mut lex: usize, dims: &[usize; NDIM]) -> [usize; NDIM] {
    let mut c = [0; NDIM];
    for mu in 0..NDIM {
        c[mu] = lex % dims[mu];
        lex /= dims[mu];
    }
    c
}

fn coords_lex(c: &[usize; NDIM], dims: &[usize; NDIM]) -> usize {
    (0..NDIM).rev().fold(0, |acc, mu| acc * dims[mu] + c[mu])
}

/// Shape of a field: lattice plus internal degrees of freedom per site.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldLayout {
    pub lattice: Arc<Lattice>,
    pub nspin: usize,
    pub ncolor: usize,
}

impl FieldLayout {
    pub fn new(lattice: Arc<Lattice>, nspin: usize, ncolor: usize) -> Self {
        Self {
            lattice,
            nspin,
            ncolor,
        }
    }

    /// Reals per site.
    pub fn ncomp(&self) -> usize {
        self.nspin * self.ncolor
    }

    /// Length of a full-lattice field.
    pub fn len(&self) -> usize {
        self.lattice.volume() * self.ncomp()
    }

    /// Length of a single-parity field.
    pub fn parity_len(&self) -> usize {
        self.lattice.volume_cb() * self.ncomp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkerboard_puts_even_sites_first() {
        let lat = Lattice::new([4, 2, 2, 2]).unwrap();
        assert_eq!(lat.volume_cb(), 16);
        for cb in 0..lat.volume() {
            let c = lat.coords(cb);
            assert_eq!(c.iter().sum::<usize>() % 2, lat.parity(cb));
            assert_eq!(lat.cb_index(&c), cb);
        }
    }

    #[test]
    fn neighbours_wrap_and_flip_parity() {
        let lat = Lattice::new([4, 4, 2, 2]).unwrap();
        assert!(lat.is_parity_split());
        for cb in 0..lat.volume() {
            for mu in 0..NDIM {
                let f = lat.forward(cb, mu);
                assert_eq!(lat.backward(f, mu), cb);
                assert_ne!(lat.parity(f), lat.parity(cb));
            }
        }
    }

    #[test]
    fn odd_only_lattice_rejected() {
        assert!(Lattice::new([3, 3, 1, 1]).is_err());
        assert!(!Lattice::new([2, 2, 1, 1]).unwrap().is_parity_split());
    }
}
