/// Merge components that overlap in space and co-activate in time.

use ndarray::{s, Array1};
use tracing::{debug, info};

use crate::config::{CnmfConfig, MergeConfig};
use crate::deconvolution::deconvolve;
use crate::error::Result;
use crate::filter::DisjointSets;
use crate::model::Model;
use crate::registry::{ComponentId, ComponentState};
use crate::stats::pearson;
use crate::temporal::deconv_options;

/// One fusion: which components went in, how their traces were weighted, and
/// the id of the component that replaced them.
#[derive(Clone, Debug, PartialEq)]
pub struct MergeEvent {
    pub members: Vec<ComponentId>,
    /// Fused noisy trace is `Σ weights[i] · (c + yra)[members[i]]`.
    pub weights: Vec<f64>,
    pub fused: ComponentId,
}

/// Limits of a merge pass. Online passes only test nearby pairs and only over
/// the recent part of the traces.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MergeScope {
    /// Maximum centroid distance of a pair.
    pub proximity: Option<f64>,
    /// Trailing frames the trace correlation is computed over.
    pub window: Option<usize>,
}

impl MergeScope {
    /// Every pair, whole traces.
    pub fn global() -> Self {
        Self::default()
    }

    pub fn local(proximity: f64, window: usize) -> Self {
        MergeScope {
            proximity: Some(proximity),
            window: Some(window),
        }
    }
}

/// Pixels shared by two sorted supports.
fn shared_pixels(a: &[usize], b: &[usize]) -> usize {
    let (mut i, mut j, mut n) = (0, 0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                n += 1;
                i += 1;
                j += 1;
            }
        }
    }
    n
}

fn distance(a: (f64, f64, f64), b: (f64, f64, f64)) -> f64 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2) + (a.2 - b.2).powi(2)).sqrt()
}

/// Pair test over precomputed supports (sorted pixel indices) and centroids.
/// Traces are only built for pairs that pass the spatial tests.
pub(crate) fn qualifying_groups(
    supports: &[Vec<usize>],
    centroids: &[(f64, f64, f64)],
    trace: impl Fn(usize) -> Vec<f64>,
    config: &MergeConfig,
    proximity: Option<f64>,
) -> Vec<Vec<usize>> {
    let k_count = supports.len();
    if k_count < 2 {
        return Vec::new();
    }
    let mut traces: Vec<Option<Vec<f64>>> = vec![None; k_count];
    let mut sets = DisjointSets::new(k_count);
    for k in 0..k_count {
        for j in k + 1..k_count {
            if proximity.is_some_and(|limit| distance(centroids[k], centroids[j]) > limit) {
                continue;
            }
            let smaller = supports[k].len().min(supports[j].len());
            let overlap = shared_pixels(&supports[k], &supports[j]);
            if overlap == 0 || (overlap as f64) / (smaller as f64) < config.overlap_threshold {
                continue;
            }
            for i in [k, j] {
                if traces[i].is_none() {
                    traces[i] = Some(trace(i));
                }
            }
            if let (Some(a), Some(b)) = (&traces[k], &traces[j]) {
                if pearson(a, b) >= config.correlation_threshold {
                    sets.join(k, j);
                }
            }
        }
    }
    sets.groups()
}

/// Groups of component indices that should be fused, each sorted.
///
/// A pair qualifies when its shared support over the smaller support reaches
/// `overlap_threshold` and its traces correlate at `correlation_threshold` or
/// more, within the limits of `scope`.
pub fn find_merge_groups(model: &Model, config: &CnmfConfig, scope: MergeScope) -> Vec<Vec<usize>> {
    let k_count = model.components();
    if k_count < 2 {
        return Vec::new();
    }
    let supports: Vec<Vec<usize>> = (0..k_count).map(|k| model.support(k)).collect();
    let centroids: Vec<(f64, f64, f64)> = (0..k_count).map(|k| model.centroid(k)).collect();
    let start = scope.window.map_or(0, |w| model.frames().saturating_sub(w));
    qualifying_groups(
        &supports,
        &centroids,
        |k| model.c.slice(s![k, start..]).to_vec(),
        &config.merge,
        scope.proximity,
    )
}

/// Rank-1 fusion of a group. Returns the unit-norm footprint, the fused noisy
/// trace and the member weights that produce it.
pub(crate) fn fuse_group(model: &Model, group: &[usize], iterations: usize) -> (Array1<f64>, Vec<f64>, Vec<f64>) {
    let d = model.pixels();
    let n = model.frames();
    let noisy: Vec<Array1<f64>> = group.iter().map(|&k| &model.c.row(k) + &model.yra.row(k)).collect();

    let mut a = Array1::<f64>::zeros(d);
    for &k in group {
        let norm = model.c.row(k).dot(&model.c.row(k)).sqrt();
        a.scaled_add(norm, &model.a.column(k));
    }

    let mut c_hat = Array1::<f64>::zeros(n);
    let mut weights = vec![0.0; group.len()];
    for _ in 0..iterations.max(1) {
        let aa = a.dot(&a);
        if aa <= 0.0 {
            break;
        }
        c_hat.fill(0.0);
        for (i, &k) in group.iter().enumerate() {
            weights[i] = a.dot(&model.a.column(k)) / aa;
            c_hat.scaled_add(weights[i], &noisy[i]);
        }
        let cc = c_hat.dot(&c_hat);
        if cc <= 0.0 {
            break;
        }
        let mut next = Array1::<f64>::zeros(d);
        for &k in group {
            next.scaled_add(model.c.row(k).dot(&c_hat), &model.a.column(k));
        }
        next.mapv_inplace(|v| (v / cc).max(0.0));
        a = next;
    }

    let norm = a.dot(&a).sqrt();
    if norm > 0.0 {
        a /= norm;
        c_hat *= norm;
        weights.iter_mut().for_each(|w| *w *= norm);
    }
    (a, c_hat.to_vec(), weights)
}

/// Merge to a fixed point, capped at `merge.max_iterations` rounds.
///
/// Fused components are registered `Accepted` at `frame`; their members become
/// `MergedAway`. A model with no qualifying pair is left untouched.
pub fn merge_components(model: &mut Model, config: &CnmfConfig, scope: MergeScope, frame: usize) -> Result<Vec<MergeEvent>> {
    let options = deconv_options(config, &model.g);
    let mut events = Vec::new();

    for round in 0..config.merge.max_iterations {
        let groups = find_merge_groups(model, config, scope);
        if groups.is_empty() {
            break;
        }
        debug!(round, groups = groups.len(), "merging");

        let mut fused = Vec::with_capacity(groups.len());
        for group in &groups {
            let (a, noisy, weights) = fuse_group(model, group, config.merge.fusion_iterations);
            let result = deconvolve(&noisy, &options);
            let yra: Vec<f64> = noisy.iter().zip(&result.c).map(|(y, c)| y - c).collect();
            fused.push((group.clone(), a, result, yra, weights));
        }

        let absorbed: Vec<usize> = groups.iter().flatten().copied().collect();
        for (group, a, result, yra, weights) in fused {
            let members: Vec<ComponentId> = group.iter().map(|&k| model.ids[k]).collect();
            let id = model.registry.register(ComponentState::Accepted, frame);
            model.push(
                id,
                a.view(),
                Array1::from(result.c).view(),
                Array1::from(result.s).view(),
                Array1::from(yra).view(),
                result.params,
            )?;
            for &m in &members {
                model.registry.merge_away(m, id);
            }
            events.push(MergeEvent {
                members,
                weights,
                fused: id,
            });
        }
        model.remove(&absorbed);
    }

    if !events.is_empty() {
        info!(merges = events.len(), components = model.components(), "components merged");
    }
    Ok(events)
}

/// Ids of each group that would be fused, without touching the model.
pub fn merge_candidates(model: &Model, config: &CnmfConfig) -> Vec<Vec<ComponentId>> {
    find_merge_groups(model, config, MergeScope::global())
        .into_iter()
        .map(|g| g.into_iter().map(|k| model.ids[k]).collect())
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::deconvolution::DeconvParams;
    use crate::stats::testutil::Lcg;
    use crate::types::FrameShape;

    pub(crate) fn spiky(t: usize, rng: &mut Lcg) -> Vec<f64> {
        let mut c = 0.0;
        (0..t)
            .map(|_| {
                c = 0.9 * c + if rng.uniform() < 0.05 { 2.0 } else { 0.0 };
                c
            })
            .collect()
    }

    /// Halves of one source as two components, plus an unrelated neighbour.
    fn split_source_model() -> Model {
        let shape = FrameShape::planar(12, 12);
        let t = 300;
        let mut rng = Lcg(31);
        let shared = spiky(t, &mut rng);
        let other = spiky(t, &mut rng);
        let mut model = Model::empty(shape, t, 1);
        model.g = vec![0.9];

        let supports: [(Vec<(usize, usize)>, &Vec<f64>); 3] = [
            ((2..6).flat_map(|y| (2..5).map(move |x| (x, y))).collect(), &shared),
            ((2..6).flat_map(|y| (4..7).map(move |x| (x, y))).collect(), &shared),
            ((3..7).flat_map(|y| (6..9).map(move |x| (x, y))).collect(), &other),
        ];
        for (pixels, trace) in supports.iter() {
            let mut a = Array1::zeros(shape.pixel_count());
            for &(x, y) in pixels {
                a[shape.index(x, y, 0)] = 1.0 / (pixels.len() as f64).sqrt();
            }
            let c: Array1<f64> = trace.iter().map(|v| v + 0.01 * rng.normal().abs()).collect();
            let yra: Array1<f64> = (0..t).map(|_| 0.05 * rng.normal()).collect();
            let id = model.registry.register(ComponentState::Accepted, 0);
            let s = Array1::zeros(t);
            model.push(id, a.view(), c.view(), s.view(), yra.view(), DeconvParams::default()).unwrap();
        }
        model
    }

    #[test]
    fn test_split_source_is_fused() {
        let mut model = split_source_model();
        let ids = model.ids.clone();
        let config = CnmfConfig::default();

        assert_eq!(find_merge_groups(&model, &config, MergeScope::global()), vec![vec![0, 1]]);
        let events = merge_candidates(&model, &config);
        assert_eq!(events, vec![vec![ids[0], ids[1]]]);

        let events = merge_components(&mut model, &config, MergeScope::global(), 0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(model.components(), 2);
        let fused = events[0].fused;
        assert_eq!(model.ids, vec![ids[2], fused]);
        assert_eq!(model.registry.state(ids[0]), Some(ComponentState::MergedAway));
        assert_eq!(model.registry.get(ids[1]).and_then(|r| r.merged_into), Some(fused));
        assert_eq!(model.registry.state(ids[2]), Some(ComponentState::Accepted));

        let k = model.index_of(fused).unwrap();
        let support = model.support(k);
        assert!(support.len() >= 18, "fused support {}", support.len());
        let norm: f64 = model.footprint(k).iter().map(|v| v * v).sum();
        assert!((norm - 1.0).abs() < 1e-9);
        assert!(model.a.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut model = split_source_model();
        let config = CnmfConfig::default();
        merge_components(&mut model, &config, MergeScope::global(), 0).unwrap();
        let (a, c, ids) = (model.a.clone(), model.c.clone(), model.ids.clone());
        let again = merge_components(&mut model, &config, MergeScope::global(), 0).unwrap();
        assert!(again.is_empty());
        assert_eq!(model.a, a);
        assert_eq!(model.c, c);
        assert_eq!(model.ids, ids);
    }

    #[test]
    fn test_proximity_limit_blocks_merge() {
        let mut model = split_source_model();
        let config = CnmfConfig::default();
        assert!(find_merge_groups(&model, &config, MergeScope::local(0.5, 300)).is_empty());
        let before = model.a.clone();
        assert!(merge_components(&mut model, &config, MergeScope::local(0.5, 300), 0).unwrap().is_empty());
        assert_eq!(model.a, before);
    }

    /// Two components on 20-pixel supports sharing 19 pixels.
    pub(crate) fn near_duplicate_model(first: &[f64], second: &[f64]) -> Model {
        let shape = FrameShape::planar(12, 12);
        let t = first.len();
        let block: Vec<usize> = (2..5).flat_map(|y| (2..9).map(move |x| shape.index(x, y, 0))).collect();
        let mut model = Model::empty(shape, t, 1);
        model.g = vec![0.9];
        for (pixels, trace) in [(&block[..20], first), (&block[1..], second)] {
            let mut a = Array1::zeros(shape.pixel_count());
            for &p in pixels {
                a[p] = 1.0 / (20.0f64).sqrt();
            }
            let c = Array1::from(trace.to_vec());
            let z = Array1::zeros(t);
            let id = model.registry.register(ComponentState::Accepted, 0);
            model.push(id, a.view(), c.view(), z.view(), z.view(), DeconvParams::default()).unwrap();
        }
        model
    }

    #[test]
    fn test_heavily_overlapping_correlated_pair_becomes_one() {
        let mut rng = Lcg(47);
        let shared = spiky(300, &mut rng);
        let first: Vec<f64> = shared.iter().map(|v| v + 0.8 * rng.uniform()).collect();
        let second: Vec<f64> = shared.iter().map(|v| v + 0.8 * rng.uniform()).collect();
        let corr = pearson(&first, &second);
        assert!((0.9..0.99).contains(&corr), "trace correlation {}", corr);

        let mut model = near_duplicate_model(&first, &second);
        assert_eq!(model.support(0).len(), 20);
        assert_eq!(shared_pixels(&model.support(0), &model.support(1)), 19);

        let events = merge_components(&mut model, &CnmfConfig::default(), MergeScope::global(), 0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(model.components(), 1);
        assert_eq!(model.support(0).len(), 21);
        let fused = pearson(&model.c.row(0).to_vec(), &shared);
        assert!(fused > 0.9, "fused trace corr {}", fused);
    }

    #[test]
    fn test_window_limits_correlation_to_recent_frames() {
        let mut rng = Lcg(53);
        let early_a = spiky(400, &mut rng);
        let early_b = spiky(400, &mut rng);
        let late = spiky(100, &mut rng);
        // independent for 400 frames, identical for the last 100
        let first: Vec<f64> = early_a.iter().chain(&late).copied().collect();
        let second: Vec<f64> = early_b.iter().chain(&late).copied().collect();
        let model = near_duplicate_model(&first, &second);
        let config = CnmfConfig::default();

        assert!(find_merge_groups(&model, &config, MergeScope::global()).is_empty());
        assert_eq!(find_merge_groups(&model, &config, MergeScope::local(5.0, 100)), vec![vec![0, 1]]);
        // proximity is checked before anything else
        assert!(find_merge_groups(&model, &config, MergeScope::local(0.1, 100)).is_empty());
    }
}
