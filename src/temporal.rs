/// Trace update: block-coordinate descent over components, each noisy trace
/// denoised by OASIS, followed by the background traces.

use ndarray::Array2;
use rayon::prelude::*;
use tracing::debug;

use crate::config::CnmfConfig;
use crate::deconvolution::{deconvolve, DeconvOptions, DeconvParams};
use crate::model::Model;

/// Partition components so that no two members of a group share a pixel.
/// Members of a group can be updated independently.
pub(crate) fn disjoint_groups(aa: &Array2<f64>) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for k in 0..aa.nrows() {
        let slot = groups
            .iter()
            .position(|g| g.iter().all(|&j| aa[[k, j]] <= 0.0));
        match slot {
            Some(i) => groups[i].push(k),
            None => groups.push(vec![k]),
        }
    }
    groups
}

struct TraceUpdate {
    k: usize,
    c: Vec<f64>,
    s: Vec<f64>,
    yra: Vec<f64>,
    params: Option<DeconvParams>,
}

pub(crate) fn deconv_options(config: &CnmfConfig, global_g: &[f64]) -> DeconvOptions {
    DeconvOptions {
        ar_order: global_g.len().max(1),
        g: if config.temporal.optimize_g {
            None
        } else {
            Some(global_g.to_vec())
        },
        sn: None,
        penalty: config.temporal.penalty,
        s_min: config.temporal.s_min,
        baseline_nonneg: config.temporal.baseline_nonneg,
        preprocess: config.preprocess.clone(),
    }
}

/// Noisy trace of component `k`: `c_k + (AᵀY − AᵀA C)_k / ‖a_k‖²`.
fn noisy_trace(k: usize, ya: &Array2<f64>, aa: &Array2<f64>, c: &Array2<f64>) -> Vec<f64> {
    let akk = aa[[k, k]];
    let coupling = aa.row(k).dot(c);
    c.row(k)
        .iter()
        .zip(ya.row(k))
        .zip(coupling.iter())
        .map(|((&ck, &yk), &mix)| ck + (yk - mix) / akk)
        .collect()
}

/// Temporal step on a model. Components left with an all-zero trace are
/// removed and marked rejected; returns how many.
pub fn update_temporal(model: &mut Model, movie: &Array2<f64>, config: &CnmfConfig) -> usize {
    let k_count = model.components();
    let options = deconv_options(config, &model.g);
    let aa = model.a.t().dot(&model.a);
    let groups = disjoint_groups(&aa);

    for _ in 0..config.temporal.iterations {
        let ya = model.a.t().dot(movie) - model.a.t().dot(&model.b).dot(&model.f);

        for group in &groups {
            let updates: Vec<TraceUpdate> = group
                .par_iter()
                .map(|&k| {
                    if aa[[k, k]] <= 0.0 {
                        let n = model.frames();
                        return TraceUpdate {
                            k,
                            c: vec![0.0; n],
                            s: vec![0.0; n],
                            yra: vec![0.0; n],
                            params: None,
                        };
                    }
                    let y = noisy_trace(k, &ya, &aa, &model.c);
                    if config.temporal.deconvolve {
                        let result = deconvolve(&y, &options);
                        let yra = y.iter().zip(&result.c).map(|(a, b)| a - b).collect();
                        TraceUpdate {
                            k,
                            c: result.c,
                            s: result.s,
                            yra,
                            params: Some(result.params),
                        }
                    } else {
                        let c: Vec<f64> = y.iter().map(|v| v.max(0.0)).collect();
                        let yra = y.iter().zip(&c).map(|(a, b)| a - b).collect();
                        let n = y.len();
                        TraceUpdate {
                            k,
                            c,
                            s: vec![0.0; n],
                            yra,
                            params: None,
                        }
                    }
                })
                .collect();

            for up in updates {
                for (t, v) in up.c.into_iter().enumerate() {
                    model.c[[up.k, t]] = v;
                }
                for (t, v) in up.s.into_iter().enumerate() {
                    model.s[[up.k, t]] = v;
                }
                for (t, v) in up.yra.into_iter().enumerate() {
                    model.yra[[up.k, t]] = v;
                }
                if let Some(params) = up.params {
                    model.deconv[up.k] = params;
                }
            }
        }

        update_background_traces(model, movie);
    }

    let silent: Vec<usize> = (0..k_count)
        .filter(|&k| model.c.row(k).iter().all(|&v| v <= 0.0))
        .collect();
    if !silent.is_empty() {
        for &k in &silent {
            model.registry.reject(model.ids[k]);
        }
        model.remove(&silent);
        debug!(removed = silent.len(), "silent traces removed");
    }
    silent.len()
}

/// Non-negative HALS on the background traces with footprints fixed.
pub(crate) fn update_background_traces(model: &mut Model, movie: &Array2<f64>) {
    let nb = model.background_rank();
    if nb == 0 {
        return;
    }
    let bt = model.b.t();
    let by = bt.dot(movie) - bt.dot(&model.a).dot(&model.c);
    let bb = bt.dot(&model.b);
    for j in 0..nb {
        let bjj = bb[[j, j]];
        if bjj <= 0.0 {
            continue;
        }
        let mix = bb.row(j).dot(&model.f);
        let mut row = model.f.row_mut(j);
        for (t, v) in row.iter_mut().enumerate() {
            *v = (*v + (by[[j, t]] - mix[t]) / bjj).max(0.0);
        }
    }
}
