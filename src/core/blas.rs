//! Vector algebra on lattice fields.
//!
//! Reductions are accumulated over fixed-size chunks and the partial sums are combined in
//! order, so a reduction gives the same bits whatever the number of rayon threads. That keeps
//! convergence decisions reproducible. Results are local to this process; solvers combine them
//! through [`Comm::all_reduce`](crate::parallel::Comm::all_reduce).
//!
//! Parity views follow the checkerboard layout: the even sites are the first half of a full
//! field and the odd sites the second half.

use num_traits::Float;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Chunk length used by the chunked reductions and parallel updates.
const CHUNK: usize = 4096;

fn chunked_sum<T, F>(n: usize, f: F) -> T
where
    T: Float + Send + Sync,
    F: Fn(std::ops::Range<usize>) -> T + Sync + Send,
{
    #[cfg(feature = "rayon")]
    {
        if n > CHUNK {
            let nchunks = n.div_ceil(CHUNK);
            let partial: Vec<T> = (0..nchunks)
                .into_par_iter()
                .map(|c| f(c * CHUNK..((c + 1) * CHUNK).min(n)))
                .collect();
            return partial.into_iter().fold(T::zero(), |acc, v| acc + v);
        }
    }
    let mut acc = T::zero();
    let mut start = 0;
    while start < n {
        let end = (start + CHUNK).min(n);
        acc = acc + f(start..end);
        start = end;
    }
    acc
}

/// Computes `x^T y`.
pub fn dot<T: Float + Send + Sync>(x: &[T], y: &[T]) -> T {
    assert_eq!(x.len(), y.len(), "Vectors must have the same length");
    chunked_sum(x.len(), |r| {
        x[r.clone()]
            .iter()
            .zip(&y[r])
            .fold(T::zero(), |acc, (&a, &b)| acc + a * b)
    })
}

/// Computes `‖x‖²`.
pub fn norm2<T: Float + Send + Sync>(x: &[T]) -> T {
    chunked_sum(x.len(), |r| x[r].iter().fold(T::zero(), |acc, &a| acc + a * a))
}

macro_rules! elementwise {
    ($y:ident, $x:ident, |$yi:ident, $xi:ident| $body:expr) => {{
        assert_eq!($x.len(), $y.len(), "Vectors must have the same length");
        #[cfg(feature = "rayon")]
        {
            if $y.len() > CHUNK {
                $y.par_chunks_mut(CHUNK)
                    .zip($x.par_chunks(CHUNK))
                    .for_each(|(yc, xc)| {
                        yc.iter_mut().zip(xc).for_each(|($yi, &$xi)| $body);
                    });
                return;
            }
        }
        $y.iter_mut().zip($x).for_each(|($yi, &$xi)| $body);
    }};
}

/// `y ← a x + y`
pub fn axpy<T: Float + Send + Sync>(a: T, x: &[T], y: &mut [T]) {
    elementwise!(y, x, |yi, xi| *yi = a * xi + *yi)
}

/// `y ← x + a y`
pub fn xpay<T: Float + Send + Sync>(x: &[T], a: T, y: &mut [T]) {
    elementwise!(y, x, |yi, xi| *yi = xi + a * *yi)
}

/// `y ← a x + b y`
pub fn axpby<T: Float + Send + Sync>(a: T, x: &[T], b: T, y: &mut [T]) {
    elementwise!(y, x, |yi, xi| *yi = a * xi + b * *yi)
}

/// `y ← x + y`
pub fn xpy<T: Float + Send + Sync>(x: &[T], y: &mut [T]) {
    elementwise!(y, x, |yi, xi| *yi = xi + *yi)
}

/// `y ← x − y`
pub fn xmy<T: Float + Send + Sync>(x: &[T], y: &mut [T]) {
    elementwise!(y, x, |yi, xi| *yi = xi - *yi)
}

/// `y ← x − y`, returning `‖y‖²`.
pub fn xmy_norm<T: Float + Send + Sync>(x: &[T], y: &mut [T]) -> T {
    xmy(x, y);
    norm2(y)
}

pub fn scale<T: Float>(a: T, x: &mut [T]) {
    x.iter_mut().for_each(|v| *v = a * *v);
}

pub fn zero<T: Float>(x: &mut [T]) {
    x.iter_mut().for_each(|v| *v = T::zero());
}

pub fn copy<T: Copy>(dst: &mut [T], src: &[T]) {
    dst.copy_from_slice(src);
}

/// Fermilab heavy-quark residual: `sqrt(mean over sites of |r_s|² / |x_s|²)`.
///
/// Sites where the solution vanishes are skipped.
pub fn heavy_quark_residual<T: Float + Send + Sync>(x: &[T], r: &[T], site_len: usize) -> T {
    assert_eq!(x.len(), r.len(), "Vectors must have the same length");
    let nsite = x.len() / site_len.max(1);
    if nsite == 0 {
        return T::zero();
    }
    let mut acc = T::zero();
    for (xs, rs) in x.chunks(site_len).zip(r.chunks(site_len)) {
        let x2 = xs.iter().fold(T::zero(), |a, &v| a + v * v);
        if x2 > T::zero() {
            acc = acc + rs.iter().fold(T::zero(), |a, &v| a + v * v) / x2;
        }
    }
    (acc / T::from(nsite).unwrap_or_else(T::one)).sqrt()
}

/// Even-site half of a full field.
pub fn even<T>(x: &[T]) -> &[T] {
    &x[..x.len() / 2]
}

pub fn odd<T>(x: &[T]) -> &[T] {
    &x[x.len() / 2..]
}

pub fn even_mut<T>(x: &mut [T]) -> &mut [T] {
    let h = x.len() / 2;
    &mut x[..h]
}

pub fn odd_mut<T>(x: &mut [T]) -> &mut [T] {
    let h = x.len() / 2;
    &mut x[h..]
}

/// Splits a full field into its even and odd halves.
pub fn split_parity_mut<T>(x: &mut [T]) -> (&mut [T], &mut [T]) {
    let h = x.len() / 2;
    x.split_at_mut(h)
}

/// Removes from `v` its components along the (orthonormal) `basis`, one vector at a time.
pub fn orthogonalize<T: Float + Send + Sync>(v: &mut [T], basis: &[Vec<T>]) {
    for u in basis {
        let c = dot(u, v);
        axpy(-c, u, v);
    }
}

/// Scales `v` to unit norm, returning its original norm.
pub fn normalize<T: Float + Send + Sync>(v: &mut [T]) -> T {
    let n = norm2(v).sqrt();
    if n > T::zero() {
        scale(T::one() / n, v);
    }
    n
}

/// Modified Gram-Schmidt over a set of vectors, in place.
///
/// Returns the norm each vector had after projecting out its predecessors; a vanishing entry
/// flags a linearly dependent vector, which is left zeroed.
pub fn mgs<T: Float + Send + Sync>(vecs: &mut [Vec<T>]) -> Vec<T> {
    let mut norms = Vec::with_capacity(vecs.len());
    for i in 0..vecs.len() {
        let (done, rest) = vecs.split_at_mut(i);
        let v = &mut rest[0];
        orthogonalize(v, done);
        let n = normalize(v);
        if n <= T::zero() {
            zero(v);
        }
        norms.push(n);
    }
    norms
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn updates_match_definitions() {
        let x = vec![1.0, 2.0, 3.0];
        let mut y = vec![1.0, 1.0, 1.0];
        axpy(2.0, &x, &mut y);
        assert_eq!(y, vec![3.0, 5.0, 7.0]);
        xpay(&x, 0.5, &mut y);
        assert_eq!(y, vec![2.5, 4.5, 6.5]);
        let r2 = xmy_norm(&x, &mut y);
        assert_eq!(y, vec![-1.5, -2.5, -3.5]);
        assert_abs_diff_eq!(r2, 2.25 + 6.25 + 12.25, epsilon = 1e-14);
    }

    #[test]
    fn chunked_reduction_matches_serial_sum() {
        let n = 3 * CHUNK + 17;
        let x: Vec<f64> = (0..n).map(|i| (i as f64 * 0.37).sin()).collect();
        let serial: f64 = x.iter().map(|v| v * v).sum();
        assert_abs_diff_eq!(norm2(&x), serial, epsilon = 1e-9);
        assert_eq!(norm2(&x), norm2(&x));
    }

    #[test]
    fn mgs_flags_dependent_vectors() {
        let mut v = vec![vec![1.0, 0.0, 0.0], vec![2.0, 0.0, 0.0], vec![1.0, 1.0, 0.0]];
        let norms = mgs(&mut v);
        assert_abs_diff_eq!(norms[0], 1.0, epsilon = 1e-14);
        assert_abs_diff_eq!(norms[1], 0.0, epsilon = 1e-14);
        assert_abs_diff_eq!(dot(&v[0], &v[2]), 0.0, epsilon = 1e-14);
        assert_abs_diff_eq!(norm2(&v[2]), 1.0, epsilon = 1e-14);
    }

    #[test]
    fn heavy_quark_skips_empty_sites() {
        let x = vec![1.0, 0.0, 0.0, 0.0];
        let r = vec![0.5, 0.0, 1.0, 0.0];
        // site 0 ratio 0.25, site 1 skipped
        assert_abs_diff_eq!(heavy_quark_residual(&x, &r, 2), (0.25f64 / 2.0).sqrt(), epsilon = 1e-14);
    }
}
