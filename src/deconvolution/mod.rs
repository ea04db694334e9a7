/// Spike deconvolution of fluorescence traces.
///
/// `oasis` holds the pool solver. This module wraps it with noise-calibrated
/// penalty selection and baseline estimation; `online` keeps a bounded pool
/// chain per component for streaming use.

pub(crate) mod oasis;
pub(crate) mod online;

use serde::{Deserialize, Serialize};

use crate::config::PreprocessConfig;
use crate::preprocess::{estimate_ar_coefficients, estimate_noise};
use crate::stats::{mean, percentile};

pub(crate) use online::OnlineDeconvolver;

/// Alternations of penalty calibration and baseline re-estimation.
const BASELINE_ROUNDS: usize = 5;
const BISECTION_STEPS: usize = 40;

/// Parameters of one trace's deconvolution, estimated or supplied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeconvParams {
    /// AR coefficients, length 1 or 2.
    pub g: Vec<f64>,
    /// Noise standard deviation.
    pub sn: f64,
    pub baseline: f64,
    /// Sparsity penalty.
    pub lambda: f64,
    /// Minimum event size.
    pub s_min: f64,
}

impl Default for DeconvParams {
    fn default() -> Self {
        DeconvParams {
            g: vec![0.95],
            sn: 0.0,
            baseline: 0.0,
            lambda: 0.0,
            s_min: 0.0,
        }
    }
}

/// Denoised trace, events and the parameters that produced them.
#[derive(Clone, Debug)]
pub struct DeconvResult {
    pub c: Vec<f64>,
    pub s: Vec<f64>,
    pub params: DeconvParams,
}

/// What is fixed and what is estimated for a deconvolution run.
#[derive(Clone, Debug)]
pub struct DeconvOptions {
    /// Order used when `g` must be estimated.
    pub ar_order: usize,
    pub g: Option<Vec<f64>>,
    pub sn: Option<f64>,
    /// Fixed penalty; calibrated against `sn` when `None`.
    pub penalty: Option<f64>,
    pub s_min: f64,
    pub baseline_nonneg: bool,
    pub preprocess: PreprocessConfig,
}

impl Default for DeconvOptions {
    fn default() -> Self {
        DeconvOptions {
            ar_order: 1,
            g: None,
            sn: None,
            penalty: None,
            s_min: 0.0,
            baseline_nonneg: true,
            preprocess: PreprocessConfig::default(),
        }
    }
}

fn rss(y: &[f64], baseline: f64, c: &[f64]) -> f64 {
    y.iter().zip(c).map(|(v, ct)| (v - baseline - ct).powi(2)).sum()
}

/// Smallest penalty whose fit leaves a residual of `sn² T`, by bisection.
fn calibrate_lambda(y: &[f64], baseline: f64, g: &[f64], s_min: f64, sn: f64) -> f64 {
    let shifted: Vec<f64> = y.iter().map(|v| v - baseline).collect();
    let target = sn * sn * y.len() as f64;
    let residual = |lambda: f64| {
        let (c, _) = oasis::oasis(&shifted, g, lambda, s_min);
        rss(y, baseline, &c)
    };

    if residual(0.0) >= target {
        return 0.0;
    }
    let scale = shifted.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    let mut hi = sn.max(1e-3 * scale).max(1e-12);
    let mut found = false;
    for _ in 0..60 {
        if residual(hi) >= target {
            found = true;
            break;
        }
        hi *= 2.0;
    }
    if !found {
        return hi;
    }
    let mut lo = 0.0;
    for _ in 0..BISECTION_STEPS {
        let mid = 0.5 * (lo + hi);
        if residual(mid) >= target {
            hi = mid;
        } else {
            lo = mid;
        }
        if hi - lo <= 1e-6 * hi {
            break;
        }
    }
    hi
}

/// Deconvolve one noisy trace.
///
/// Estimates whatever `options` leaves open: noise from the periodogram, AR
/// coefficients by Yule-Walker, then alternates penalty calibration and
/// baseline estimation.
pub fn deconvolve(y: &[f64], options: &DeconvOptions) -> DeconvResult {
    let n = y.len();
    let sn = options.sn.unwrap_or_else(|| estimate_noise(y, &options.preprocess));
    let g = match &options.g {
        Some(g) => g.clone(),
        None => estimate_ar_coefficients(
            y,
            options.ar_order,
            sn,
            options.preprocess.lags,
            options.preprocess.fudge_factor,
        ),
    };
    if n == 0 {
        return DeconvResult {
            c: Vec::new(),
            s: Vec::new(),
            params: DeconvParams {
                g,
                sn,
                baseline: 0.0,
                lambda: options.penalty.unwrap_or(0.0),
                s_min: options.s_min,
            },
        };
    }

    let clip = |b: f64| if options.baseline_nonneg { b.max(0.0) } else { b };
    let mut baseline = clip(percentile(&mut y.to_vec(), 15.0));
    let mut lambda = options.penalty.unwrap_or(0.0);
    let mut c = Vec::new();
    let mut s = Vec::new();

    for round in 0..BASELINE_ROUNDS {
        if round > 0 {
            let resid: Vec<f64> = y.iter().zip(&c).map(|(v, ct)| v - ct).collect();
            let next = clip(mean(&resid));
            if (next - baseline).abs() <= 1e-6 * (1.0 + baseline.abs()) {
                break;
            }
            baseline = next;
        }
        if options.penalty.is_none() {
            lambda = if sn > 0.0 {
                calibrate_lambda(y, baseline, &g, options.s_min, sn)
            } else {
                0.0
            };
        }
        let shifted: Vec<f64> = y.iter().map(|v| v - baseline).collect();
        let (ct, st) = oasis::oasis(&shifted, &g, lambda, options.s_min);
        c = ct;
        s = st;
    }

    DeconvResult {
        c,
        s,
        params: DeconvParams {
            g,
            sn,
            baseline,
            lambda,
            s_min: options.s_min,
        },
    }
}

/// Re-run OASIS with fixed parameters.
#[cfg(test)]
pub(crate) fn deconvolve_fixed(y: &[f64], params: &DeconvParams) -> (Vec<f64>, Vec<f64>) {
    let shifted: Vec<f64> = y.iter().map(|v| v - params.baseline).collect();
    oasis::oasis(&shifted, &params.g, params.lambda, params.s_min)
}
