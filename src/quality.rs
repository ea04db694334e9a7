/// Component quality: trace SNR and spatial consistency with the data.

use ndarray::Array2;
use rayon::prelude::*;
use tracing::debug;

use crate::config::{PreprocessConfig, QualityConfig};
use crate::model::Model;
use crate::preprocess::estimate_noise;
use crate::registry::ComponentId;
use crate::stats::{find_median, pearson};

/// Frames whose denoised value reaches this fraction of the peak count as active.
const ACTIVE_FRACTION: f64 = 0.5;

/// Quality figures of one component.
#[derive(Clone, Debug, PartialEq)]
pub struct ComponentQuality {
    pub id: ComponentId,
    /// Peak of the denoised trace over trace noise.
    pub snr: f64,
    /// Correlation of the footprint with the mean residual over active frames.
    pub spatial_corr: f64,
    pub passed: bool,
}

fn trace_snr(model: &Model, k: usize, preprocess: &PreprocessConfig) -> f64 {
    let c = model.c.row(k);
    let peak = c.iter().fold(0.0f64, |m, &v| m.max(v));
    let mut sn = model.deconv[k].sn;
    if sn <= 0.0 {
        let noisy: Vec<f64> = c.iter().zip(model.yra.row(k)).map(|(a, b)| a + b).collect();
        sn = estimate_noise(&noisy, preprocess);
    }
    if sn <= 0.0 {
        return if peak > 0.0 { f64::INFINITY } else { 0.0 };
    }
    peak / sn
}

fn spatial_correlation(model: &Model, movie: &Array2<f64>, k: usize) -> f64 {
    let support = model.support(k);
    if support.len() < 2 {
        return 0.0;
    }
    let c = model.c.row(k);
    let peak = c.iter().fold(0.0f64, |m, &v| m.max(v));
    if peak <= 0.0 {
        return 0.0;
    }
    let active: Vec<usize> = (0..c.len()).filter(|&t| c[t] >= ACTIVE_FRACTION * peak).collect();

    let mut mean_residual = vec![0.0; support.len()];
    for &t in &active {
        for (i, &p) in support.iter().enumerate() {
            let mut others = model.b.row(p).dot(&model.f.column(t));
            for j in 0..model.components() {
                if j != k {
                    others += model.a[[p, j]] * model.c[[j, t]];
                }
            }
            mean_residual[i] += movie[[p, t]] - others;
        }
    }
    let footprint: Vec<f64> = support.iter().map(|&p| model.a[[p, k]]).collect();
    pearson(&footprint, &mean_residual)
}

/// Evaluate every component in parallel.
pub fn evaluate_components(
    model: &Model,
    movie: &Array2<f64>,
    config: &QualityConfig,
    preprocess: &PreprocessConfig,
) -> Vec<ComponentQuality> {
    (0..model.components())
        .into_par_iter()
        .map(|k| {
            let snr = trace_snr(model, k, preprocess);
            let spatial_corr = spatial_correlation(model, movie, k);
            ComponentQuality {
                id: model.ids[k],
                snr,
                spatial_corr,
                passed: snr >= config.min_snr || spatial_corr >= config.min_spatial_corr,
            }
        })
        .collect()
}

/// Reject components failing both tests and accept the rest.
/// Returns the evaluation of the surviving components and how many were removed.
pub fn apply_quality(
    model: &mut Model,
    movie: &Array2<f64>,
    config: &QualityConfig,
    preprocess: &PreprocessConfig,
) -> (Vec<ComponentQuality>, usize) {
    let evaluation = evaluate_components(model, movie, config, preprocess);
    let failed: Vec<usize> = evaluation
        .iter()
        .enumerate()
        .filter(|(_, q)| !q.passed)
        .map(|(k, _)| k)
        .collect();
    for q in &evaluation {
        if q.passed {
            model.registry.accept(q.id);
        } else {
            model.registry.reject(q.id);
        }
    }
    model.remove(&failed);
    debug!(evaluated = evaluation.len(), rejected = failed.len(), "quality evaluation done");
    let kept = evaluation.into_iter().filter(|q| q.passed).collect();
    (kept, failed.len())
}

/// Median component SNR; 0 without components.
pub fn median_snr(qualities: &[ComponentQuality]) -> f64 {
    let mut snrs: Vec<f64> = qualities.iter().map(|q| q.snr).filter(|v| v.is_finite()).collect();
    find_median(&mut snrs)
}
