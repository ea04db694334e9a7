/// Patch-parallel decomposition: split the field of view into overlapping
/// tiles, fit each tile independently, then stitch the results into one model.

use std::ops::Range;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::anyhow;
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::{CnmfConfig, OwnershipPolicy, PatchConfig};
use crate::error::{QualityWarning, Result};
use crate::initialization::initialize_background;
use crate::merging::{merge_components, MergeScope};
use crate::model::Model;
use crate::preprocess::PreprocessResult;
use crate::registry::{ComponentId, ComponentState};
use crate::types::FrameShape;

/// Rectangular tile of the frame over the full depth.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Patch {
    pub index: usize,
    pub x: Range<usize>,
    pub y: Range<usize>,
}

impl Patch {
    pub fn shape(&self, depth: usize) -> FrameShape {
        FrameShape::volumetric(self.x.len(), self.y.len(), depth)
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.x.start + self.x.end) as f64 / 2.0 - 0.5,
            (self.y.start + self.y.end) as f64 / 2.0 - 0.5,
        )
    }

    /// Full-frame indices of the patch pixels, in local row-major order.
    pub fn pixels(&self, full: FrameShape) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.x.len() * self.y.len() * full.depth);
        for z in 0..full.depth {
            for y in self.y.clone() {
                for x in self.x.clone() {
                    out.push(full.index(x, y, z));
                }
            }
        }
        out
    }
}

fn axis_starts(len: usize, size: usize, overlap: usize) -> Vec<usize> {
    if len <= size {
        return vec![0];
    }
    let step = size - overlap;
    let mut starts = Vec::new();
    let mut s = 0;
    while s + size < len {
        starts.push(s);
        s += step;
    }
    // last tile is aligned to the far edge
    starts.push(len - size);
    starts.dedup();
    starts
}

/// Tiles of side `size` overlapping by `overlap`, covering the whole frame.
pub fn partition(shape: FrameShape, config: &PatchConfig) -> Vec<Patch> {
    let xs = axis_starts(shape.width, config.size, config.overlap);
    let ys = axis_starts(shape.height, config.size, config.overlap);
    let mut patches = Vec::with_capacity(xs.len() * ys.len());
    for &y0 in &ys {
        for &x0 in &xs {
            patches.push(Patch {
                index: patches.len(),
                x: x0..(x0 + config.size).min(shape.width),
                y: y0..(y0 + config.size).min(shape.height),
            });
        }
    }
    patches
}

/// Everything one tile fit needs, owned.
pub struct PatchJob {
    pub patch: Patch,
    pub shape: FrameShape,
    /// `patch pixels × frames`
    pub movie: Array2<f64>,
    pub preprocess: PreprocessResult,
}

/// A fitted tile, in tile-local coordinates.
pub struct PatchFit {
    pub patch: Patch,
    pub model: Model,
    /// Median component SNR of the tile.
    pub median_snr: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PatchStatus {
    Fitted { components: usize },
    Empty,
    Failed { reason: String },
}

#[derive(Clone, Debug)]
pub struct PatchReport {
    pub patch: Patch,
    pub status: PatchStatus,
    pub median_snr: f64,
}

/// Runs tile fits. Results must come back in job order.
pub trait PatchExecutor: Send + Sync {
    fn run(
        &self,
        jobs: Vec<PatchJob>,
        fit: &(dyn Fn(PatchJob) -> anyhow::Result<PatchFit> + Sync),
    ) -> Vec<anyhow::Result<PatchFit>>;
}

/// Run one fit, turning a panic into an error.
fn run_isolated(fit: &(dyn Fn(PatchJob) -> anyhow::Result<PatchFit> + Sync), job: PatchJob) -> anyhow::Result<PatchFit> {
    let index = job.patch.index;
    match catch_unwind(AssertUnwindSafe(|| fit(job))) {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow!("patch {} panicked: {}", index, msg))
        }
    }
}

/// Fans tiles out over rayon, optionally on a caller-supplied pool.
#[derive(Clone, Default)]
pub struct RayonExecutor {
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl RayonExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(pool: Arc<rayon::ThreadPool>) -> Self {
        RayonExecutor { pool: Some(pool) }
    }
}

impl PatchExecutor for RayonExecutor {
    fn run(
        &self,
        jobs: Vec<PatchJob>,
        fit: &(dyn Fn(PatchJob) -> anyhow::Result<PatchFit> + Sync),
    ) -> Vec<anyhow::Result<PatchFit>> {
        let work = move || -> Vec<anyhow::Result<PatchFit>> { jobs.into_par_iter().map(|job| run_isolated(fit, job)).collect() };
        match &self.pool {
            Some(pool) => pool.install(work),
            None => work(),
        }
    }
}

/// Fits tiles one after another on the calling thread.
#[derive(Clone, Copy, Default)]
pub struct SequentialExecutor;

impl PatchExecutor for SequentialExecutor {
    fn run(
        &self,
        jobs: Vec<PatchJob>,
        fit: &(dyn Fn(PatchJob) -> anyhow::Result<PatchFit> + Sync),
    ) -> Vec<anyhow::Result<PatchFit>> {
        jobs.into_iter().map(|job| run_isolated(fit, job)).collect()
    }
}

/// Copy each tile's movie slice and noise map into a job.
pub(crate) fn make_jobs(movie: &Array2<f64>, shape: FrameShape, pre: &PreprocessResult, patches: &[Patch]) -> Vec<PatchJob> {
    patches
        .iter()
        .map(|patch| {
            let pixels = patch.pixels(shape);
            PatchJob {
                patch: patch.clone(),
                shape: patch.shape(shape.depth),
                movie: movie.select(Axis(0), &pixels),
                preprocess: PreprocessResult {
                    sn: pixels.iter().map(|&p| pre.sn[p]).collect(),
                    ar_order: pre.ar_order,
                    g: pre.g.clone(),
                },
            }
        })
        .collect()
}

/// Outcome of fitting and stitching all tiles.
pub(crate) struct Stitched {
    pub model: Model,
    pub reports: Vec<PatchReport>,
    pub warnings: Vec<QualityWarning>,
}

/// Fit every tile through `executor` and stitch the results.
pub(crate) fn fit_patches(
    movie: &Array2<f64>,
    shape: FrameShape,
    pre: &PreprocessResult,
    config: &CnmfConfig,
    patch_config: &PatchConfig,
    executor: &dyn PatchExecutor,
    fit: &(dyn Fn(PatchJob) -> anyhow::Result<PatchFit> + Sync),
) -> Result<Stitched> {
    let patches = partition(shape, patch_config);
    info!(patches = patches.len(), size = patch_config.size, overlap = patch_config.overlap, "fitting patches");
    let jobs = make_jobs(movie, shape, pre, &patches);
    let results = executor.run(jobs, fit);

    let mut reports = Vec::with_capacity(patches.len());
    let mut warnings = Vec::new();
    let mut fits = Vec::new();
    for (patch, result) in patches.into_iter().zip(results) {
        match result {
            Ok(fit) if fit.model.components() == 0 => reports.push(PatchReport {
                patch,
                status: PatchStatus::Empty,
                median_snr: 0.0,
            }),
            Ok(fit) => {
                reports.push(PatchReport {
                    patch,
                    status: PatchStatus::Fitted {
                        components: fit.model.components(),
                    },
                    median_snr: fit.median_snr,
                });
                fits.push(fit);
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!(patch = patch.index, %reason, "patch failed");
                warnings.push(QualityWarning::PatchFailed {
                    patch: patch.index,
                    reason: reason.clone(),
                });
                reports.push(PatchReport {
                    patch,
                    status: PatchStatus::Failed { reason },
                    median_snr: 0.0,
                });
            }
        }
    }

    let model = stitch(movie, shape, pre, config, patch_config.ownership, fits)?;
    Ok(Stitched {
        model,
        reports,
        warnings,
    })
}

/// Lift tile models to full-frame coordinates, merge duplicates across tiles,
/// resolve pixels still claimed by several tiles, and refit the background.
pub(crate) fn stitch(
    movie: &Array2<f64>,
    shape: FrameShape,
    pre: &PreprocessResult,
    config: &CnmfConfig,
    policy: OwnershipPolicy,
    fits: Vec<PatchFit>,
) -> Result<Model> {
    let n_frames = movie.ncols();
    let nb = config.init.background_components;
    let mut model = Model::empty(shape, n_frames, nb);
    model.sn = pre.sn.clone();
    model.g = pre.g.clone();

    // origin tile of every lifted component: (patch index, median snr, centre)
    let mut origin: Vec<(ComponentId, usize, f64, (f64, f64))> = Vec::new();
    for fit in &fits {
        let pixels = fit.patch.pixels(shape);
        for k in 0..fit.model.components() {
            let mut a = Array1::zeros(shape.pixel_count());
            for (local, &p) in pixels.iter().enumerate() {
                a[p] = fit.model.a[[local, k]];
            }
            let id = model.registry.register(ComponentState::Candidate, 0);
            model.push(
                id,
                a.view(),
                fit.model.c.row(k),
                fit.model.s.row(k),
                fit.model.yra.row(k),
                fit.model.deconv[k].clone(),
            )?;
            origin.push((id, fit.patch.index, fit.median_snr, fit.patch.center()));
        }
    }
    debug!(components = model.components(), "lifted patch components");

    merge_components(&mut model, config, MergeScope::global(), 0)?;

    // ownership only applies among components that still belong to a single tile
    let owner: Vec<Option<(usize, f64, (f64, f64))>> = model
        .ids
        .iter()
        .map(|id| {
            origin
                .iter()
                .find(|(oid, ..)| oid == id)
                .map(|&(_, patch, snr, center)| (patch, snr, center))
        })
        .collect();

    let mut touched = vec![false; model.components()];
    for p in 0..shape.pixel_count() {
        let claims: Vec<usize> = (0..model.components())
            .filter(|&k| model.a[[p, k]] > 0.0 && owner[k].is_some())
            .collect();
        let mut tiles: Vec<(usize, f64, (f64, f64))> = claims.iter().filter_map(|&k| owner[k]).collect();
        tiles.sort_by_key(|t| t.0);
        tiles.dedup_by_key(|t| t.0);
        if tiles.len() < 2 {
            continue;
        }

        let (px, py, _) = shape.coords(p);
        let dist = |c: (f64, f64)| (c.0 - px as f64).powi(2) + (c.1 - py as f64).powi(2);
        let winner = match policy {
            OwnershipPolicy::NearestCenter => tiles
                .iter()
                .min_by(|a, b| dist(a.2).total_cmp(&dist(b.2)).then(a.0.cmp(&b.0)))
                .map(|t| t.0),
            OwnershipPolicy::HighestQuality => tiles
                .iter()
                .max_by(|a, b| {
                    a.1.total_cmp(&b.1)
                        .then(dist(b.2).total_cmp(&dist(a.2)))
                        .then(b.0.cmp(&a.0))
                })
                .map(|t| t.0),
        };
        for &k in &claims {
            if owner[k].map(|o| o.0) != winner {
                model.a[[p, k]] = 0.0;
                touched[k] = true;
            }
        }
    }

    let emptied: Vec<usize> = (0..model.components())
        .filter(|&k| model.a.column(k).iter().all(|&v| v <= 0.0))
        .collect();
    for k in 0..model.components() {
        if touched[k] && !emptied.contains(&k) {
            let norm = model.a.column(k).dot(&model.a.column(k)).sqrt();
            model.a.column_mut(k).mapv_inplace(|v| v / norm);
            model.c.row_mut(k).mapv_inplace(|v| v * norm);
            model.s.row_mut(k).mapv_inplace(|v| v * norm);
            model.yra.row_mut(k).mapv_inplace(|v| v * norm);
        }
    }
    for &k in &emptied {
        model.registry.reject(model.ids[k]);
    }
    model.remove(&emptied);

    let (b, f) = initialize_background(movie, &model.a, &model.c, nb, config.seed);
    model.b = b;
    model.f = f;
    info!(components = model.components(), dropped = emptied.len(), "patches stitched");
    Ok(model)
}
