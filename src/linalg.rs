/// Small dense solvers: NNLS on Gram systems and rank-1 non-negative factorization.
/// All internal computations in f64.

use ndarray::{Array2, ArrayView2};

const EPS: f64 = 1e-12;

/// Non-negative least squares in Gram form:
/// minimize ½ xᵀ G x − rhsᵀ x subject to x ≥ 0, by cyclic coordinate descent.
///
/// `gram` is `n × n` row-major, `x` is the warm start and the result.
/// Returns the number of sweeps run.
pub(crate) fn nnls_gram(gram: &[f64], rhs: &[f64], x: &mut [f64], max_sweeps: usize, tol: f64) -> usize {
    let n = rhs.len();
    debug_assert_eq!(gram.len(), n * n);
    debug_assert_eq!(x.len(), n);

    for xi in x.iter_mut() {
        if !xi.is_finite() || *xi < 0.0 {
            *xi = 0.0;
        }
    }

    for sweep in 0..max_sweeps {
        let mut max_delta = 0.0_f64;
        let mut max_x = 0.0_f64;
        for i in 0..n {
            let gii = gram[i * n + i];
            if gii <= EPS {
                x[i] = 0.0;
                continue;
            }
            let row = &gram[i * n..(i + 1) * n];
            let grad: f64 = row.iter().zip(x.iter()).map(|(g, v)| g * v).sum::<f64>() - rhs[i];
            let updated = (x[i] - grad / gii).max(0.0);
            max_delta = max_delta.max((updated - x[i]).abs());
            x[i] = updated;
            max_x = max_x.max(updated);
        }
        if max_delta <= tol * (max_x + EPS) {
            return sweep + 1;
        }
    }
    max_sweeps
}

/// Gather the principal submatrix `gram[idx, idx]` of an `Array2` into a row-major buffer.
pub(crate) fn sub_gram(gram: &Array2<f64>, idx: &[usize]) -> Vec<f64> {
    let n = idx.len();
    let mut out = vec![0.0; n * n];
    for (i, &gi) in idx.iter().enumerate() {
        for (j, &gj) in idx.iter().enumerate() {
            out[i * n + j] = gram[[gi, gj]];
        }
    }
    out
}

/// Rank-1 non-negative factorization `data ≈ a cᵀ` of a `pixels × frames` block.
///
/// `c_init` seeds the trace. Returns `(a, c)` with `‖a‖₂ = 1`, or `None` when
/// the factorization collapses to zero.
pub(crate) fn rank1_nmf(data: ArrayView2<f64>, c_init: &[f64], iterations: usize) -> Option<(Vec<f64>, Vec<f64>)> {
    let (n_pix, n_t) = data.dim();
    if n_pix == 0 || n_t == 0 {
        return None;
    }
    let mut c: Vec<f64> = c_init.iter().map(|v| v.max(0.0)).collect();
    if c.iter().all(|&v| v <= EPS) {
        // Flat start: the pixel-mean trace.
        c = (0..n_t)
            .map(|t| (data.column(t).sum() / n_pix as f64).max(0.0))
            .collect();
    }
    let mut a = vec![0.0; n_pix];

    for _ in 0..iterations.max(1) {
        let cc: f64 = c.iter().map(|v| v * v).sum();
        if cc <= EPS {
            return None;
        }
        for (p, ap) in a.iter_mut().enumerate() {
            let row = data.row(p);
            let dot: f64 = row.iter().zip(c.iter()).map(|(y, v)| y * v).sum();
            *ap = (dot / cc).max(0.0);
        }
        let aa: f64 = a.iter().map(|v| v * v).sum();
        if aa <= EPS {
            return None;
        }
        for (t, ct) in c.iter_mut().enumerate() {
            let col = data.column(t);
            let dot: f64 = col.iter().zip(a.iter()).map(|(y, v)| y * v).sum();
            *ct = (dot / aa).max(0.0);
        }
    }

    let norm = a.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm <= EPS || c.iter().all(|&v| v <= EPS) {
        return None;
    }
    a.iter_mut().for_each(|v| *v /= norm);
    c.iter_mut().for_each(|v| *v *= norm);
    Some((a, c))
}

/// Non-negative HALS for `data ≈ w h` with `w: d × r`, `h: r × T`, updating in place.
pub(crate) fn hals_nmf(data: &Array2<f64>, w: &mut Array2<f64>, h: &mut Array2<f64>, iterations: usize) {
    let rank = w.ncols();
    for _ in 0..iterations {
        // h rows
        let wtw = w.t().dot(&*w);
        let wty = w.t().dot(data);
        for k in 0..rank {
            let wkk = wtw[[k, k]];
            if wkk <= EPS {
                continue;
            }
            let mut update = wty.row(k).to_owned() - wtw.row(k).dot(&*h);
            update /= wkk;
            let mut hk = h.row_mut(k);
            hk += &update;
            hk.mapv_inplace(|v| v.max(0.0));
        }
        // w columns
        let hht = h.dot(&h.t());
        let yht = data.dot(&h.t());
        for k in 0..rank {
            let hkk = hht[[k, k]];
            if hkk <= EPS {
                continue;
            }
            let mut update = yht.column(k).to_owned() - w.dot(&hht.column(k));
            update /= hkk;
            let mut wk = w.column_mut(k);
            wk += &update;
            wk.mapv_inplace(|v| v.max(0.0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_nnls_matches_unconstrained_when_interior() {
        // G = [[2,1],[1,3]], rhs = G * [1, 2]
        let gram = [2.0, 1.0, 1.0, 3.0];
        let rhs = [4.0, 7.0];
        let mut x = [0.0, 0.0];
        nnls_gram(&gram, &rhs, &mut x, 500, 1e-12);
        assert!((x[0] - 1.0).abs() < 1e-6, "x0 = {}", x[0]);
        assert!((x[1] - 2.0).abs() < 1e-6, "x1 = {}", x[1]);
    }

    #[test]
    fn test_nnls_clamps_negative_direction() {
        // unconstrained solution is [2, -1]; constrained optimum has x1 = 0
        let gram = [1.0, 0.0, 0.0, 1.0];
        let rhs = [2.0, -1.0];
        let mut x = [5.0, 5.0];
        nnls_gram(&gram, &rhs, &mut x, 100, 1e-12);
        assert!((x[0] - 2.0).abs() < 1e-9);
        assert_eq!(x[1], 0.0);
    }

    #[test]
    fn test_rank1_recovers_outer_product() {
        let a = [1.0, 2.0, 0.5];
        let c = [0.0, 1.0, 3.0, 2.0];
        let data = Array2::from_shape_fn((3, 4), |(p, t)| a[p] * c[t]);
        let (fa, fc) = rank1_nmf(data.view(), &[1.0; 4], 20).unwrap();
        let norm = (1.0f64 + 4.0 + 0.25).sqrt();
        for p in 0..3 {
            assert!((fa[p] - a[p] / norm).abs() < 1e-9);
        }
        for t in 0..4 {
            assert!((fc[t] - c[t] * norm).abs() < 1e-9);
        }
    }

    #[test]
    fn test_rank1_zero_block_is_none() {
        let data = Array2::<f64>::zeros((4, 5));
        assert!(rank1_nmf(data.view(), &[1.0; 5], 5).is_none());
    }

    #[test]
    fn test_hals_reduces_error() {
        let data = array![[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [0.5, 1.0, 1.5]];
        let mut w = Array2::from_elem((3, 1), 1.0);
        let mut h = Array2::from_elem((1, 3), 1.0);
        let before = (&data - &w.dot(&h)).mapv(|v| v * v).sum();
        hals_nmf(&data, &mut w, &mut h, 20);
        let after = (&data - &w.dot(&h)).mapv(|v| v * v).sum();
        assert!(after < before * 1e-3, "before {} after {}", before, after);
        assert!(w.iter().chain(h.iter()).all(|&v| v >= 0.0));
    }
}
