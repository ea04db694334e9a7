/// Footprint update: per-pixel non-negative least squares against the current
/// traces, restricted to each component's dilated support.

use ndarray::{concatenate, Array2, Axis};
use rayon::prelude::*;
use tracing::debug;

use crate::config::SpatialConfig;
use crate::filter::{dilate, region_containing};
use crate::linalg::{nnls_gram, sub_gram};
use crate::model::Model;
use crate::types::FrameShape;

const NNLS_TOL: f64 = 1e-6;

/// New footprints and background, before they are written into a model.
#[derive(Clone, Debug)]
pub struct SpatialUpdate {
    /// `pixels × K`, unit-norm columns (zero for degenerate components).
    pub a: Array2<f64>,
    /// `pixels × nb`.
    pub b: Array2<f64>,
    /// Norm each footprint had before normalization; traces scale by it.
    pub scales: Vec<f64>,
    /// Components whose support fell below `min_pixels`.
    pub degenerate: Vec<usize>,
}

/// Candidate pixels of every component: its current support dilated by `radius`.
pub(crate) fn candidate_masks(a: &Array2<f64>, shape: FrameShape, radius: usize) -> Vec<Vec<bool>> {
    (0..a.ncols())
        .into_par_iter()
        .map(|k| {
            let support: Vec<bool> = a.column(k).iter().map(|&v| v > 0.0).collect();
            dilate(&support, shape, radius)
        })
        .collect()
}

/// Solve footprints given traces `c` (`K × T`) and background traces `f` (`nb × T`).
pub fn update_footprints(
    movie: &Array2<f64>,
    shape: FrameShape,
    a: &Array2<f64>,
    c: &Array2<f64>,
    b: &Array2<f64>,
    f: &Array2<f64>,
    config: &SpatialConfig,
) -> SpatialUpdate {
    let d = movie.nrows();
    let k_count = a.ncols();
    let nb = b.ncols();

    let cf = concatenate(Axis(0), &[c.view(), f.view()]).unwrap_or_else(|_| c.clone());
    let gram = cf.dot(&cf.t());
    let ycf = movie.dot(&cf.t());
    let masks = candidate_masks(a, shape, config.dilation_radius);

    let rows: Vec<(Vec<usize>, Vec<f64>)> = (0..d)
        .into_par_iter()
        .map(|p| {
            let mut idx: Vec<usize> = (0..k_count).filter(|&k| masks[k][p]).collect();
            idx.extend(k_count..k_count + nb);
            let g = sub_gram(&gram, &idx);
            let rhs: Vec<f64> = idx.iter().map(|&j| ycf[[p, j]]).collect();
            let mut x: Vec<f64> = idx
                .iter()
                .map(|&j| if j < k_count { a[[p, j]] } else { b[[p, j - k_count]] })
                .collect();
            nnls_gram(&g, &rhs, &mut x, config.nnls_iterations, NNLS_TOL);
            (idx, x)
        })
        .collect();

    let mut a_new = Array2::zeros((d, k_count));
    let mut b_new = Array2::zeros((d, nb));
    for (p, (idx, x)) in rows.into_iter().enumerate() {
        for (j, v) in idx.into_iter().zip(x) {
            if j < k_count {
                a_new[[p, j]] = v;
            } else {
                b_new[[p, j - k_count]] = v;
            }
        }
    }

    if config.keep_largest_region {
        for k in 0..k_count {
            let col: Vec<f64> = a_new.column(k).to_vec();
            let peak = col
                .iter()
                .enumerate()
                .max_by(|x, y| x.1.total_cmp(y.1))
                .map(|(p, _)| p);
            if let Some(peak) = peak.filter(|&p| col[p] > 0.0) {
                let region = region_containing(&col, shape, peak);
                for (p, keep) in region.iter().enumerate() {
                    if !keep {
                        a_new[[p, k]] = 0.0;
                    }
                }
            }
        }
    }

    let mut scales = vec![0.0; k_count];
    let mut degenerate = Vec::new();
    for k in 0..k_count {
        let mut col = a_new.column_mut(k);
        let support = col.iter().filter(|&&v| v > 0.0).count();
        let norm = col.iter().map(|v| v * v).sum::<f64>().sqrt();
        if support < config.min_pixels || norm <= 0.0 {
            col.fill(0.0);
            degenerate.push(k);
            continue;
        }
        col.mapv_inplace(|v| v / norm);
        scales[k] = norm;
    }

    SpatialUpdate {
        a: a_new,
        b: b_new,
        scales,
        degenerate,
    }
}

/// Spatial step on a model: new footprints, traces rescaled, degenerate
/// components removed and marked rejected. Returns how many were removed.
pub fn update_spatial(model: &mut Model, movie: &Array2<f64>, config: &SpatialConfig) -> usize {
    let update = update_footprints(movie, model.shape, &model.a, &model.c, &model.b, &model.f, config);
    model.a = update.a;
    model.b = update.b;
    for (k, &scale) in update.scales.iter().enumerate() {
        model.c.row_mut(k).mapv_inplace(|v| v * scale);
        model.s.row_mut(k).mapv_inplace(|v| v * scale);
        model.yra.row_mut(k).mapv_inplace(|v| v * scale);
        let params = &mut model.deconv[k];
        params.sn *= scale;
        params.baseline *= scale;
        params.lambda *= scale;
        params.s_min *= scale;
    }

    if !update.degenerate.is_empty() {
        for &k in &update.degenerate {
            model.registry.reject(model.ids[k]);
        }
        model.remove(&update.degenerate);
        debug!(removed = update.degenerate.len(), "degenerate footprints removed");
    }
    update.degenerate.len()
}
