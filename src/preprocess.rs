/// Noise and autoregressive statistics of the raw movie.
///
/// Noise is read off the high-frequency band of each pixel's periodogram,
/// where calcium transients carry almost no power. AR coefficients come from
/// a Yule-Walker fit with the noise variance removed from the zero lag.

use std::sync::Arc;

use ndarray::Array2;
use rayon::prelude::*;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tracing::debug;

use crate::config::{ArOrder, NoiseMethod, PreprocessConfig};
use crate::stats::{find_median, mean};

/// Euler-Mascheroni constant: bias of `E[ln X]` for exponential `X`.
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Outcome of preprocessing.
#[derive(Clone, Debug)]
pub struct PreprocessResult {
    /// Per-pixel noise standard deviation.
    pub sn: Vec<f64>,
    /// Autoregressive order used downstream (1 or 2).
    pub ar_order: usize,
    /// Global AR coefficients fitted on the pixel-mean trace.
    pub g: Vec<f64>,
}

/// Periodogram-based noise estimator with a plan reused across traces.
pub(crate) struct NoiseEstimator {
    fft: Arc<dyn Fft<f64>>,
    len: usize,
    range: (f64, f64),
    method: NoiseMethod,
}

impl NoiseEstimator {
    /// Estimator for traces truncated to `min(len, max_frames)` samples.
    pub(crate) fn new(len: usize, config: &PreprocessConfig) -> Self {
        let len = len.min(config.max_frames);
        let mut planner = FftPlanner::new();
        NoiseEstimator {
            fft: planner.plan_fft_forward(len.max(1)),
            len,
            range: config.noise_range,
            method: config.noise_method,
        }
    }

    /// Noise standard deviation of one trace.
    pub(crate) fn estimate(&self, trace: &[f64]) -> f64 {
        let n = self.len.min(trace.len());
        if n < 4 {
            return crate::stats::variance(trace).sqrt();
        }
        let mut buf: Vec<Complex<f64>> = trace[..n].iter().map(|&v| Complex::new(v, 0.0)).collect();
        if n == self.len {
            self.fft.process(&mut buf);
        } else {
            FftPlanner::new().plan_fft_forward(n).process(&mut buf);
        }

        // |X_k|² / N has expectation σ² at every bin for white noise of variance σ².
        let (lo, hi) = self.range;
        let mut band: Vec<f64> = (0..=n / 2)
            .filter(|&k| {
                let f = k as f64 / n as f64;
                f > lo && f <= hi
            })
            .map(|k| buf[k].norm_sqr() / n as f64)
            .collect();
        if band.is_empty() {
            return crate::stats::variance(&trace[..n]).sqrt();
        }

        let power = match self.method {
            NoiseMethod::Mean => mean(&band),
            // median of an exponential is σ² ln 2
            NoiseMethod::Median => find_median(&mut band) / std::f64::consts::LN_2,
            NoiseMethod::LogMeanExp => {
                let log_mean = band.iter().map(|&v| v.max(1e-300).ln()).sum::<f64>() / band.len() as f64;
                (log_mean + EULER_GAMMA).exp()
            }
        };
        power.max(0.0).sqrt()
    }
}

/// Noise standard deviation of a single trace.
pub fn estimate_noise(trace: &[f64], config: &PreprocessConfig) -> f64 {
    NoiseEstimator::new(trace.len(), config).estimate(trace)
}

/// Per-pixel noise of a `pixels × frames` movie, in parallel.
pub(crate) fn pixel_noise(movie: &Array2<f64>, config: &PreprocessConfig) -> Vec<f64> {
    let estimator = NoiseEstimator::new(movie.ncols(), config);
    (0..movie.nrows())
        .into_par_iter()
        .map(|p| {
            let row = movie.row(p);
            match row.as_slice() {
                Some(trace) => estimator.estimate(trace),
                None => estimator.estimate(&row.to_vec()),
            }
        })
        .collect()
}

/// Biased autocovariance for lags `0..=max_lag`.
fn autocovariance(trace: &[f64], max_lag: usize) -> Vec<f64> {
    let n = trace.len();
    let m = mean(trace);
    (0..=max_lag)
        .map(|lag| {
            if lag >= n {
                return 0.0;
            }
            let s: f64 = (0..n - lag).map(|t| (trace[t] - m) * (trace[t + lag] - m)).sum();
            s / n as f64
        })
        .collect()
}

/// Least-squares Yule-Walker coefficients, before root stabilization.
fn yule_walker(trace: &[f64], p: usize, sn: f64, lags: usize) -> Vec<f64> {
    let rows = lags + p;
    let xc = autocovariance(trace, rows + 1);
    let sn2 = sn * sn;
    // A[i][j] = xc[|i-j|] - sn² δij, rhs[i] = xc[i+1]
    let a = |i: usize, j: usize| xc[i.abs_diff(j)] - if i == j { sn2 } else { 0.0 };

    let mut ata = [[0.0f64; 2]; 2];
    let mut atb = [0.0f64; 2];
    for i in 0..rows {
        for j in 0..p {
            atb[j] += a(i, j) * xc[i + 1];
            for k in 0..p {
                ata[j][k] += a(i, j) * a(i, k);
            }
        }
    }

    if p == 1 {
        if ata[0][0] <= f64::EPSILON {
            return vec![0.0];
        }
        return vec![atb[0] / ata[0][0]];
    }
    let det = ata[0][0] * ata[1][1] - ata[0][1] * ata[1][0];
    if det.abs() <= f64::EPSILON * (ata[0][0] * ata[1][1]).abs().max(1e-300) {
        let g1 = if ata[0][0] > f64::EPSILON { atb[0] / ata[0][0] } else { 0.0 };
        return vec![g1, 0.0];
    }
    let g1 = (atb[0] * ata[1][1] - atb[1] * ata[0][1]) / det;
    let g2 = (ata[0][0] * atb[1] - ata[1][0] * atb[0]) / det;
    vec![g1, g2]
}

/// Real parts of the roots of `z^p - g1 z^{p-1} - ... - gp`.
fn ar_roots(g: &[f64]) -> Vec<f64> {
    match g.len() {
        1 => vec![g[0]],
        _ => {
            let disc = g[0] * g[0] + 4.0 * g[1];
            if disc < 0.0 {
                vec![g[0] / 2.0, g[0] / 2.0]
            } else {
                let s = disc.sqrt();
                vec![(g[0] + s) / 2.0, (g[0] - s) / 2.0]
            }
        }
    }
}

/// AR(p) coefficients `g` of a trace with known noise level `sn`.
///
/// Roots above 1 are pulled to 0.95, negative roots to 0.15, then all roots are
/// scaled by `fudge`. `p` must be 1 or 2.
pub fn estimate_ar_coefficients(trace: &[f64], p: usize, sn: f64, lags: usize, fudge: f64) -> Vec<f64> {
    let p = p.clamp(1, 2);
    if trace.len() < p + 2 {
        return vec![0.0; p];
    }
    let raw = yule_walker(trace, p, sn, lags);
    let roots: Vec<f64> = ar_roots(&raw)
        .into_iter()
        .map(|r| {
            if r > 1.0 {
                0.95
            } else if r < 0.0 {
                0.15
            } else {
                r
            }
        })
        .map(|r| r * fudge)
        .collect();
    match roots.as_slice() {
        [r] => vec![*r],
        [r1, r2] => vec![r1 + r2, -r1 * r2],
        _ => vec![0.0; p],
    }
}

/// 2 when the faster root of an AR(2) fit is above 0.2, else 1.
pub fn suggest_ar_order(trace: &[f64], sn: f64, lags: usize) -> usize {
    if trace.len() < 4 {
        return 1;
    }
    let raw = yule_walker(trace, 2, sn, lags);
    let roots = ar_roots(&raw);
    let fastest = roots.iter().copied().fold(f64::INFINITY, f64::min);
    if fastest > 0.2 {
        2
    } else {
        1
    }
}

/// Noise map, AR order and global AR coefficients of a `pixels × frames` movie.
pub fn preprocess(movie: &Array2<f64>, config: &PreprocessConfig) -> PreprocessResult {
    let sn = pixel_noise(movie, config);
    let n_frames = movie.ncols();

    let mean_trace: Vec<f64> = movie
        .axis_iter(ndarray::Axis(1))
        .map(|col| col.mean().unwrap_or(0.0))
        .collect();
    let trace_sn = estimate_noise(&mean_trace, config);

    let ar_order = match config.ar_order {
        ArOrder::Fixed(p) => p,
        ArOrder::Auto => suggest_ar_order(&mean_trace, trace_sn, config.lags),
    };
    let g = estimate_ar_coefficients(&mean_trace, ar_order, trace_sn, config.lags, config.fudge_factor);

    debug!(
        pixels = movie.nrows(),
        frames = n_frames,
        ar_order,
        g = ?g,
        median_sn = find_median(&mut sn.clone()),
        "preprocessing done"
    );
    PreprocessResult { sn, ar_order, g }
}
