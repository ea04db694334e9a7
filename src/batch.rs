/// Batch fitting: the `Cnmf` builder and the alternating control loop.

use std::sync::Arc;

use ndarray::{Array1, Array2};
use tracing::{debug, info};

use crate::config::{CnmfConfig, PatchConfig, Pipeline};
use crate::deconvolution::DeconvParams;
use crate::error::{CnmfError, QualityWarning, Result};
use crate::initialization::initialize;
use crate::merging::{merge_components, MergeScope};
use crate::model::Model;
use crate::online::{OnlineSession, SessionCounters};
use crate::patches::{fit_patches, PatchExecutor, PatchFit, PatchJob, PatchReport, RayonExecutor};
use crate::preprocess::{preprocess, PreprocessResult};
use crate::quality::{apply_quality, evaluate_components, median_snr, ComponentQuality};
use crate::registry::ComponentState;
use crate::spatial::update_spatial;
use crate::temporal::update_temporal;
use crate::types::{movie_matrix, FrameShape, FrameSource};

/// Everything a fit produces.
pub struct FitOutcome {
    pub model: Model,
    pub warnings: Vec<QualityWarning>,
    /// Spatial/temporal alternations run by the main loop.
    pub iterations: usize,
    /// One report per patch; empty without patch decomposition.
    pub patches: Vec<PatchReport>,
    /// Quality figures of the surviving components.
    pub quality: Vec<ComponentQuality>,
    /// Session counters of an online run.
    pub counters: Option<SessionCounters>,
}

/// Fit of one field of view without patches or quality control.
pub(crate) struct LocalFit {
    pub model: Model,
    pub iterations: usize,
    pub removed: usize,
    pub warnings: Vec<QualityWarning>,
}

fn model_from_init(movie: &Array2<f64>, shape: FrameShape, pre: &PreprocessResult, config: &CnmfConfig) -> Result<Model> {
    let n_frames = movie.ncols();
    let init = initialize(movie, shape, &pre.sn, &config.init, config.seed);
    let mut model = Model::empty(shape, n_frames, config.init.background_components);
    model.sn = pre.sn.clone();
    model.g = pre.g.clone();
    model.b = init.b;
    model.f = init.f;

    let zeros = Array1::zeros(n_frames);
    for k in 0..init.a.ncols() {
        let id = model.registry.register(ComponentState::Candidate, 0);
        let params = DeconvParams {
            g: pre.g.clone(),
            ..DeconvParams::default()
        };
        model.push(id, init.a.column(k), init.c.row(k), zeros.view(), zeros.view(), params)?;
    }
    Ok(model)
}

/// Run `round` until the relative change of `residual` drops below
/// `tolerance` or `max_iterations` rounds have run.
///
/// When the cap is reached first, the model with the lowest residual seen is
/// put back. Returns the rounds run, the components removed by the kept model
/// and the non-convergence warning, if any.
fn alternate(
    model: &mut Model,
    max_iterations: usize,
    tolerance: f64,
    residual: impl Fn(&Model) -> f64,
    mut round: impl FnMut(&mut Model) -> usize,
) -> (usize, usize, Option<QualityWarning>) {
    let mut previous = residual(model);
    let mut removed = 0;
    let mut best = (previous, model.clone(), removed);
    let mut change = f64::INFINITY;
    let mut iterations = 0;

    while iterations < max_iterations {
        iterations += 1;
        removed += round(model);
        let norm = residual(model);
        change = (previous - norm).abs() / previous.max(f64::MIN_POSITIVE);
        previous = norm;
        debug!(iteration = iterations, residual = norm, change, components = model.components(), "alternation");
        if change < tolerance {
            return (iterations, removed, None);
        }
        if norm < best.0 {
            best = (norm, model.clone(), removed);
        }
    }

    if best.0 < previous {
        debug!(kept = best.0, last = previous, "restoring best model");
        let (_, kept, kept_removed) = best;
        *model = kept;
        removed = kept_removed;
    }
    (iterations, removed, Some(QualityWarning::NotConverged { iterations, change }))
}

/// Alternate spatial and temporal updates until the residual settles.
pub(crate) fn refine(
    model: &mut Model,
    movie: &Array2<f64>,
    config: &CnmfConfig,
    max_iterations: usize,
) -> (usize, usize, Option<QualityWarning>) {
    let removed = update_temporal(model, movie, config);
    let (iterations, more, warning) = alternate(
        model,
        max_iterations,
        config.tolerance,
        |m| m.residual_norm(movie),
        |m| update_spatial(m, movie, &config.spatial) + update_temporal(m, movie, config),
    );
    (iterations, removed + more, warning)
}

/// Initialization, alternating updates, merging and a final pass.
pub(crate) fn fit_local(
    movie: &Array2<f64>,
    shape: FrameShape,
    pre: &PreprocessResult,
    config: &CnmfConfig,
    max_iterations: usize,
) -> Result<LocalFit> {
    let mut model = model_from_init(movie, shape, pre, config)?;
    debug!(components = model.components(), "initialized");

    let (iterations, mut removed, warning) = refine(&mut model, movie, config, max_iterations);
    let merged = merge_components(&mut model, config, MergeScope::global(), movie.ncols())?;
    if !merged.is_empty() {
        removed += update_spatial(&mut model, movie, &config.spatial);
        removed += update_temporal(&mut model, movie, config);
    }

    Ok(LocalFit {
        model,
        iterations,
        removed,
        warnings: warning.into_iter().collect(),
    })
}

/// Tile fit run by a [`PatchExecutor`].
fn fit_patch(job: PatchJob, config: &CnmfConfig, patch_config: &PatchConfig) -> anyhow::Result<PatchFit> {
    let mut local = config.clone();
    local.init.components = patch_config.components_per_patch;
    local.patches = None;
    let fit = fit_local(&job.movie, job.shape, &job.preprocess, &local, local.max_iterations)?;
    if fit.model.c.iter().any(|v| !v.is_finite()) {
        anyhow::bail!("non-finite traces in patch {}", job.patch.index);
    }
    let quality = evaluate_components(&fit.model, &job.movie, &config.quality, &config.preprocess);
    Ok(PatchFit {
        patch: job.patch,
        median_snr: median_snr(&quality),
        model: fit.model,
    })
}

/// Constrained matrix factorization with a builder-style configuration.
///
/// ```no_run
/// use cnmf::{Cnmf, FrameShape, InMemorySource};
///
/// let shape = FrameShape::planar(64, 64);
/// let mut source = InMemorySource::new(shape, Vec::new());
/// let outcome = Cnmf::new().with_components(20).fit(&mut source);
/// ```
pub struct Cnmf {
    config: CnmfConfig,
    executor: Arc<dyn PatchExecutor>,
    thread_pool: Option<Arc<rayon::ThreadPool>>,
}

impl Default for Cnmf {
    fn default() -> Self {
        Self::new()
    }
}

impl Cnmf {
    pub fn new() -> Self {
        Cnmf {
            config: CnmfConfig::default(),
            executor: Arc::new(RayonExecutor::new()),
            thread_pool: None,
        }
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: CnmfConfig) -> Self {
        self.config = config;
        self
    }

    /// Target number of components.
    pub fn with_components(mut self, components: usize) -> Self {
        self.config.init.components = components;
        self
    }

    /// Fit in overlapping patches.
    pub fn with_patches(mut self, patches: PatchConfig) -> Self {
        self.config.patches = Some(patches);
        self
    }

    pub fn with_merge_thresholds(mut self, correlation: f64, overlap: f64) -> Self {
        self.config.merge.correlation_threshold = correlation;
        self.config.merge.overlap_threshold = overlap;
        self
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.config.pipeline = pipeline;
        self
    }

    /// Executor used for patch jobs. Default: [`RayonExecutor`] on the global pool.
    pub fn with_executor<E: PatchExecutor + 'static>(mut self, executor: E) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    /// Use a custom rayon thread pool for all parallel work, patches included.
    pub fn with_thread_pool(mut self, pool: Arc<rayon::ThreadPool>) -> Self {
        self.executor = Arc::new(RayonExecutor::with_pool(pool.clone()));
        self.thread_pool = Some(pool);
        self
    }

    pub fn config(&self) -> &CnmfConfig {
        &self.config
    }

    /// Run the pipeline selected by the configuration.
    pub fn run(&self, source: &mut dyn FrameSource) -> Result<FitOutcome> {
        match self.config.pipeline {
            Pipeline::Batch => self.fit(source),
            Pipeline::Online => {
                let mut session = self.online_session(source.shape())?;
                while let Some(frame) = source.next_frame().map_err(CnmfError::Source)? {
                    session.push_frame(frame)?;
                }
                let outcome = session.finish()?;
                Ok(FitOutcome {
                    model: outcome.model,
                    warnings: outcome.warnings,
                    iterations: 0,
                    patches: Vec::new(),
                    quality: Vec::new(),
                    counters: Some(outcome.counters),
                })
            }
        }
    }

    /// Batch fit over every frame of `source`.
    pub fn fit(&self, source: &mut dyn FrameSource) -> Result<FitOutcome> {
        self.config.validate()?;
        let shape = source.shape();
        let frames = source.all_frames().map_err(CnmfError::Source)?;
        let movie = movie_matrix(&frames, shape)?;
        drop(frames);
        self.fit_movie(&movie, shape)
    }

    /// Batch fit of a `pixels × frames` movie.
    pub fn fit_movie(&self, movie: &Array2<f64>, shape: FrameShape) -> Result<FitOutcome> {
        self.config.validate()?;
        if movie.nrows() != shape.pixel_count() {
            return Err(CnmfError::PixelCount {
                shape,
                expected: shape.pixel_count(),
                actual: movie.nrows(),
            });
        }
        if movie.ncols() < 2 {
            return Err(CnmfError::StreamExhausted {
                frames: movie.ncols(),
                needed: 2,
            });
        }
        match &self.thread_pool {
            Some(pool) => pool.install(|| self.fit_impl(movie, shape)),
            None => self.fit_impl(movie, shape),
        }
    }

    /// Streaming session over frames of `shape`, configured like this builder.
    pub fn online_session(&self, shape: FrameShape) -> Result<OnlineSession> {
        let mut config = self.config.clone();
        config.pipeline = Pipeline::Online;
        OnlineSession::new(shape, config)
    }

    fn fit_impl(&self, movie: &Array2<f64>, shape: FrameShape) -> Result<FitOutcome> {
        let config = &self.config;
        info!(pixels = movie.nrows(), frames = movie.ncols(), shape = %shape, "batch fit started");
        let pre = preprocess(movie, &config.preprocess);

        let mut warnings = Vec::new();
        let mut reports = Vec::new();
        let (mut model, iterations, mut removed) = match &config.patches {
            Some(patch_config) => {
                let fit = |job: PatchJob| fit_patch(job, config, patch_config);
                let stitched = fit_patches(movie, shape, &pre, config, patch_config, self.executor.as_ref(), &fit)?;
                warnings.extend(stitched.warnings);
                reports = stitched.reports;
                let mut model = stitched.model;
                let mut removed = update_temporal(&mut model, movie, config);
                removed += update_spatial(&mut model, movie, &config.spatial);
                removed += update_temporal(&mut model, movie, config);
                (model, 1, removed)
            }
            None => {
                let fit = fit_local(movie, shape, &pre, config, config.max_iterations)?;
                warnings.extend(fit.warnings);
                (fit.model, fit.iterations, fit.removed)
            }
        };

        let quality = if config.quality.enabled {
            let (kept, dropped) = apply_quality(&mut model, movie, &config.quality, &config.preprocess);
            removed += dropped;
            kept
        } else {
            for &id in &model.ids {
                model.registry.accept(id);
            }
            evaluate_components(&model, movie, &config.quality, &config.preprocess)
        };
        if removed > 0 {
            warnings.push(QualityWarning::ComponentsRemoved { count: removed });
        }

        info!(
            components = model.components(),
            iterations,
            removed,
            warnings = warnings.len(),
            "batch fit done"
        );
        Ok(FitOutcome {
            model,
            warnings,
            iterations,
            patches: reports,
            quality,
            counters: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initialization::tests::{blob_movie, render_movie};
    use crate::patches::{PatchStatus, SequentialExecutor};
    use crate::stats::pearson;
    use crate::stats::testutil::Lcg;
    use crate::types::{Frame, InMemorySource};

    fn source_from(movie: &Array2<f64>, shape: FrameShape) -> InMemorySource {
        let frames = (0..movie.ncols())
            .map(|t| Frame::new(shape, movie.column(t).iter().map(|&v| v as f32).collect()))
            .collect::<Result<Vec<_>>>()
            .unwrap();
        InMemorySource::new(shape, frames)
    }

    /// Index of the component whose centroid is nearest to `(cx, cy)`.
    fn nearest(model: &Model, cx: usize, cy: usize) -> (usize, f64) {
        (0..model.components())
            .map(|k| {
                let (x, y, _) = model.centroid(k);
                (k, ((x - cx as f64).powi(2) + (y - cy as f64).powi(2)).sqrt())
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap()
    }

    #[test]
    fn test_three_sources_recovered() {
        let shape = FrameShape::planar(32, 32);
        let truth = [(8, 8), (24, 10), (15, 24)];
        let (movie, traces) = blob_movie(shape, &truth, 300, 0.2, 3);
        let mut source = source_from(&movie, shape);

        let outcome = Cnmf::new().with_components(3).fit(&mut source).unwrap();
        let model = &outcome.model;
        assert_eq!(model.components(), 3);
        assert!(model.a.iter().all(|&v| v >= 0.0));
        assert!(model.c.iter().chain(model.s.iter()).all(|&v| v >= 0.0));
        for (&(cx, cy), tr) in truth.iter().zip(&traces) {
            let (k, dist) = nearest(model, cx, cy);
            assert!(dist < 2.0, "no component near ({}, {})", cx, cy);
            let corr = pearson(&model.c.row(k).to_vec(), tr);
            assert!(corr > 0.9, "trace corr {} at ({}, {})", corr, cx, cy);
        }
        assert_eq!(outcome.quality.len(), 3);
        assert!(model.ids.iter().all(|&id| model.registry.state(id) == Some(ComponentState::Accepted)));
        assert!(outcome.iterations >= 1);
        assert!(outcome.patches.is_empty());
    }

    #[test]
    fn test_fit_is_deterministic() {
        let shape = FrameShape::planar(20, 20);
        let (movie, _) = blob_movie(shape, &[(6, 6), (14, 13)], 200, 0.2, 5);
        let cnmf = Cnmf::new().with_components(2);
        let first = cnmf.fit_movie(&movie, shape).unwrap();
        let second = cnmf.fit_movie(&movie, shape).unwrap();
        assert_eq!(first.model.a, second.model.a);
        assert_eq!(first.model.c, second.model.c);
        assert_eq!(first.model.b, second.model.b);
        assert_eq!(first.model.ids, second.model.ids);
    }

    #[test]
    fn test_invalid_config_fails_before_reading() {
        let shape = FrameShape::planar(8, 8);
        let (movie, _) = blob_movie(shape, &[], 10, 0.1, 1);
        let mut source = source_from(&movie, shape);
        let result = Cnmf::new().with_merge_thresholds(1.5, 0.1).fit(&mut source);
        assert!(matches!(result, Err(CnmfError::InvalidConfig { .. })));
        assert_eq!(source.remaining(), 10);
    }

    #[test]
    fn test_patch_fit_matches_sources_and_executors_agree() {
        let shape = FrameShape::planar(40, 20);
        let truth = [(7, 10), (33, 10), (20, 9)];
        let (movie, traces) = blob_movie(shape, &truth, 300, 0.2, 11);
        let patches = PatchConfig {
            size: 24,
            overlap: 8,
            components_per_patch: 4,
            ..PatchConfig::default()
        };

        let parallel = Cnmf::new().with_patches(patches.clone()).fit_movie(&movie, shape).unwrap();
        assert_eq!(parallel.patches.len(), 2);
        assert!(parallel
            .patches
            .iter()
            .all(|r| matches!(r.status, PatchStatus::Fitted { .. })));

        let model = &parallel.model;
        assert_eq!(model.components(), 3, "duplicates across the overlap were not merged");
        for (&(cx, cy), tr) in truth.iter().zip(&traces) {
            let (k, dist) = nearest(model, cx, cy);
            assert!(dist < 2.5, "no component near ({}, {})", cx, cy);
            assert!(pearson(&model.c.row(k).to_vec(), tr) > 0.85);
        }

        let sequential = Cnmf::new()
            .with_patches(patches)
            .with_executor(SequentialExecutor)
            .fit_movie(&movie, shape)
            .unwrap();
        assert_eq!(parallel.model.a, sequential.model.a);
        assert_eq!(parallel.model.c, sequential.model.c);
    }

    #[test]
    fn test_custom_thread_pool() {
        let pool = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap());
        let shape = FrameShape::planar(16, 16);
        let (movie, _) = blob_movie(shape, &[(8, 8)], 150, 0.2, 2);
        let outcome = Cnmf::new().with_components(1).with_thread_pool(pool).fit_movie(&movie, shape).unwrap();
        assert_eq!(outcome.model.components(), 1);
    }

    /// AR(1) trace with `g = 0.9` and spikes of 2.5 at the given frames.
    fn spike_train(frames: usize, spikes: &[usize]) -> Vec<f64> {
        let mut c = 0.0;
        (0..frames)
            .map(|t| {
                c = 0.9 * c + if spikes.contains(&t) { 2.5 } else { 0.0 };
                c
            })
            .collect()
    }

    #[test]
    fn test_short_recording_recovers_centres_and_spike_times() {
        let shape = FrameShape::planar(32, 32);
        let truth = [(8, 8), (24, 10), (15, 24)];
        let spikes = [
            vec![4, 19, 37, 55, 71, 88],
            vec![9, 27, 44, 60, 79, 93],
            vec![13, 31, 49, 66, 84],
        ];
        let traces: Vec<Vec<f64>> = spikes.iter().map(|s| spike_train(100, s)).collect();
        let movie = render_movie(shape, &truth, &traces, 100, 0.2, &mut Lcg(19));

        let model = Cnmf::new().with_components(3).fit_movie(&movie, shape).unwrap().model;
        assert_eq!(model.components(), 3);
        for (&(cx, cy), true_spikes) in truth.iter().zip(&spikes) {
            let (k, dist) = nearest(&model, cx, cy);
            assert!(dist <= 1.0, "centre ({}, {}) missed by {:.2} px", cx, cy, dist);

            let s = model.s.row(k);
            let peak = s.iter().copied().fold(0.0, f64::max);
            assert!(peak > 0.0);
            // frame 0 absorbs the initial level
            let events: Vec<usize> = (1..100).filter(|&t| s[t] > 0.3 * peak).collect();
            for &t in true_spikes {
                assert!(
                    events.iter().any(|&e| e.abs_diff(t) <= 1),
                    "spike at {} not found near ({}, {}): {:?}",
                    t,
                    cx,
                    cy,
                    events
                );
            }
            for &e in &events {
                assert!(
                    true_spikes.iter().any(|&t| t.abs_diff(e) <= 1),
                    "spurious event at {} near ({}, {})",
                    e,
                    cx,
                    cy
                );
            }
        }
    }

    #[test]
    fn test_iteration_cap_restores_best_model() {
        let shape = FrameShape::planar(4, 4);
        let mut model = Model::empty(shape, 6, 1);
        let id = model.registry.register(ComponentState::Accepted, 0);
        let a = Array1::from_elem(16, 0.25);
        let c = Array1::from_elem(6, 2.0);
        let z = Array1::zeros(6);
        model.push(id, a.view(), c.view(), z.view(), z.view(), DeconvParams::default()).unwrap();
        let movie = model.a.dot(&model.c) + 0.01;
        let original = model.c.clone();

        // every round makes the fit worse and drops a component
        let (iterations, removed, warning) = alternate(
            &mut model,
            3,
            1e-6,
            |m| m.residual_norm(&movie),
            |m| {
                m.c.mapv_inplace(|v| v * 1.5);
                1
            },
        );
        assert_eq!(iterations, 3);
        assert!(matches!(warning, Some(QualityWarning::NotConverged { iterations: 3, .. })));
        assert_eq!(model.c, original);
        assert_eq!(removed, 0);
    }

    #[test]
    fn test_refine_at_cap_keeps_lowest_residual() {
        let shape = FrameShape::planar(20, 20);
        let (movie, _) = blob_movie(shape, &[(6, 6), (14, 13)], 200, 0.2, 5);
        let mut config = CnmfConfig::default();
        config.init.components = 2;
        config.tolerance = 0.0;
        let pre = preprocess(&movie, &config.preprocess);
        let start = model_from_init(&movie, shape, &pre, &config).unwrap();

        let mut first = start.clone();
        update_temporal(&mut first, &movie, &config);
        let mut after_round = first.clone();
        update_spatial(&mut after_round, &movie, &config.spatial);
        update_temporal(&mut after_round, &movie, &config);
        let best_seen = first.residual_norm(&movie).min(after_round.residual_norm(&movie));

        let mut model = start;
        let (iterations, _, warning) = refine(&mut model, &movie, &config, 1);
        assert_eq!(iterations, 1);
        assert!(matches!(warning, Some(QualityWarning::NotConverged { iterations: 1, .. })));
        assert!(model.residual_norm(&movie) <= best_seen + 1e-9);
    }
}
