/// Streaming factorization.
///
/// A session buffers the first `init_batch` frames and fits them in batch.
/// After that each frame is projected onto the current footprints, every
/// component's trace is extended by a bounded OASIS chain, and sufficient
/// statistics are accumulated for the periodic footprint refresh. New
/// components are picked up from persistent residual activity; nearby
/// duplicates are merged on a longer period.

mod sufficient;
mod trigger;
mod worker;

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView1};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::batch::fit_local;
use crate::config::{BackgroundMode, CnmfConfig, Pipeline};
use crate::deconvolution::{DeconvParams, OnlineDeconvolver};
use crate::error::{CnmfError, QualityWarning, Result};
use crate::filter::{dilate, gaussian_kernel};
use crate::initialization::{extract_component, smoothed_noise_energy, Extracted};
use crate::linalg::nnls_gram;
use crate::merging::{merge_components, qualifying_groups, MergeEvent, MergeScope};
use crate::model::{footprint_centroid, Model};
use crate::preprocess::preprocess;
use crate::registry::{ComponentId, ComponentState, Registry};
use crate::spatial::candidate_masks;
use crate::types::{movie_matrix, Frame, FrameShape};

use sufficient::SufficientStats;
use trigger::{find_candidates, FrameRing};
use worker::{refresh_footprints, RefreshJob, RefreshResult, RefreshWorker};

const PROJECTION_TOL: f64 = 1e-6;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SessionState {
    /// Buffering frames for the initial batch fit.
    Initializing,
    Tracking,
    Shutdown,
    /// A fatal frame error occurred; the session accepts nothing more.
    Failed,
}

/// Work done by a session so far.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionCounters {
    pub frames: usize,
    /// Footprint refreshes applied.
    pub refreshes: usize,
    /// Refresh points that found the background worker busy.
    pub deferred_refreshes: usize,
    pub triggers: usize,
    pub added: usize,
    pub merges: usize,
    pub rejected: usize,
}

/// What happened while processing one frame.
#[derive(Clone, Debug)]
pub struct FrameReport {
    pub frame: usize,
    pub state: SessionState,
    pub components: usize,
    pub added: Vec<ComponentId>,
    pub merges: Vec<MergeEvent>,
    pub rejected: Vec<ComponentId>,
}

/// Final result of a session.
pub struct SessionOutcome {
    pub model: Model,
    pub counters: SessionCounters,
    pub warnings: Vec<QualityWarning>,
}

/// Latest published model, readable from other threads.
#[derive(Clone, Default)]
pub struct SnapshotHandle {
    inner: Arc<RwLock<Option<Arc<Model>>>>,
}

impl SnapshotHandle {
    pub fn latest(&self) -> Option<Arc<Model>> {
        self.inner.read().clone()
    }

    fn publish(&self, model: Arc<Model>) {
        *self.inner.write() = Some(model);
    }
}

/// One component's growing history and causal deconvolution state.
struct Track {
    c: Vec<f64>,
    s: Vec<f64>,
    /// Projected (noisy) values.
    y: Vec<f64>,
    deconv: OnlineDeconvolver,
    /// Consecutive frames below the silence level.
    silent: usize,
}

impl Track {
    fn resumed(params: DeconvParams, capacity: usize, c: Vec<f64>, s: Vec<f64>, y: Vec<f64>) -> Self {
        let deconv = OnlineDeconvolver::resume(params, capacity, &c, &y);
        Track {
            c,
            s,
            y,
            deconv,
            silent: 0,
        }
    }

    fn push(&mut self, value: f64) {
        self.y.push(value);
        self.c.push(0.0);
        self.s.push(0.0);
        self.deconv.push(value);
        debug_assert_eq!(self.deconv.origin() + self.deconv.window_len(), self.deconv.end());
        debug_assert_eq!(self.deconv.end(), self.y.len());
        self.deconv.write_into(&mut self.c, &mut self.s);
    }
}

/// Value of each id after replaying merges: fused ids get `Σ w · member`.
fn fold_merges(ids: &[ComponentId], values: &[f64], events: &[MergeEvent], target: &[ComponentId]) -> Vec<f64> {
    let mut map: BTreeMap<ComponentId, f64> = ids.iter().copied().zip(values.iter().copied()).collect();
    for event in events {
        let fused = event
            .members
            .iter()
            .zip(&event.weights)
            .map(|(m, w)| w * map.remove(m).unwrap_or(0.0))
            .sum();
        map.insert(event.fused, fused);
    }
    target.iter().map(|id| map.get(id).copied().unwrap_or(0.0)).collect()
}

/// Session state once the initial fit is done.
struct Tracker {
    shape: FrameShape,
    a: Array2<f64>,
    b: Array2<f64>,
    ids: Vec<ComponentId>,
    registry: Registry,
    tracks: Vec<Track>,
    /// Background traces, one row per background component.
    f: Vec<Vec<f64>>,
    stats: SufficientStats,
    /// Last projection `[components; background]`, warm start of the next.
    x: Vec<f64>,
    gram: Vec<f64>,
    supports: Vec<Vec<usize>>,
    gram_dirty: bool,
    ring: FrameRing,
    sn: Vec<f64>,
    g: Vec<f64>,
    kernel: Vec<f64>,
    noise_energy: Vec<f64>,
    frames: usize,
}

impl Tracker {
    fn from_model(model: Model, movie: &Array2<f64>, config: &CnmfConfig) -> Self {
        let n = movie.ncols();
        let k_count = model.components();
        let nb = model.background_rank();
        let capacity = config.online.state_capacity;

        let mut x_hist = Array2::zeros((k_count + nb, n));
        let mut tracks = Vec::with_capacity(k_count);
        for k in 0..k_count {
            let c = model.c.row(k).to_vec();
            let y: Vec<f64> = c.iter().zip(model.yra.row(k)).map(|(a, b)| a + b).collect();
            x_hist.row_mut(k).assign(&ArrayView1::from(&y[..]));
            tracks.push(Track::resumed(model.deconv[k].clone(), capacity, c, model.s.row(k).to_vec(), y));
        }
        for j in 0..nb {
            x_hist.row_mut(k_count + j).assign(&model.f.row(j));
        }
        let stats = SufficientStats::from_batch(&x_hist, movie);

        let mut ring = FrameRing::new(config.online.trigger_window);
        let explained = model.a.dot(&x_hist.slice(ndarray::s![..k_count, ..])) + model.b.dot(&model.f);
        for t in n.saturating_sub(config.online.trigger_window)..n {
            let raw = movie.column(t).to_vec();
            let residual = (&movie.column(t) - &explained.column(t)).to_vec();
            ring.push(raw, residual, x_hist.column(t).to_vec());
        }

        let kernel = gaussian_kernel(config.init.gsig);
        let noise_energy = smoothed_noise_energy(model.shape, &kernel, &model.sn);
        let x = if n > 0 {
            x_hist.column(n - 1).to_vec()
        } else {
            vec![0.0; k_count + nb]
        };

        Tracker {
            shape: model.shape,
            a: model.a,
            b: model.b,
            ids: model.ids,
            registry: model.registry,
            tracks,
            f: model.f.outer_iter().map(|row| row.to_vec()).collect(),
            stats,
            x,
            gram: Vec::new(),
            supports: Vec::new(),
            gram_dirty: true,
            ring,
            sn: model.sn,
            g: model.g,
            kernel,
            noise_energy,
            frames: n,
        }
    }

    fn components(&self) -> usize {
        self.ids.len()
    }

    fn background_rank(&self) -> usize {
        self.b.ncols()
    }

    fn refresh_gram(&mut self) {
        let (d, k_count, nb) = (self.a.nrows(), self.components(), self.background_rank());
        let mut ab = Array2::zeros((d, k_count + nb));
        ab.slice_mut(ndarray::s![.., ..k_count]).assign(&self.a);
        ab.slice_mut(ndarray::s![.., k_count..]).assign(&self.b);
        self.gram = ab.t().dot(&ab).iter().copied().collect();
        self.supports = (0..k_count)
            .map(|k| {
                self.a
                    .column(k)
                    .iter()
                    .enumerate()
                    .filter(|(_, &v)| v > 0.0)
                    .map(|(p, _)| p)
                    .collect()
            })
            .collect();
        self.gram_dirty = false;
    }

    /// NNLS projection of one frame onto `[A b]`, warm-started.
    fn project(&mut self, y: &[f64], sweeps: usize) {
        if self.gram_dirty {
            self.refresh_gram();
        }
        let k_count = self.components();
        let mut rhs = vec![0.0; k_count + self.background_rank()];
        for (k, support) in self.supports.iter().enumerate() {
            rhs[k] = support.iter().map(|&p| self.a[[p, k]] * y[p]).sum();
        }
        let y_view = ArrayView1::from(y);
        for (j, col) in self.b.columns().into_iter().enumerate() {
            rhs[k_count + j] = col.dot(&y_view);
        }
        nnls_gram(&self.gram, &rhs, &mut self.x, sweeps, PROJECTION_TOL);
    }

    /// Extend histories and statistics with the current projection.
    fn advance(&mut self, y: Vec<f64>) {
        let k_count = self.components();
        for (track, &v) in self.tracks.iter_mut().zip(&self.x) {
            track.push(v);
        }
        for (row, &v) in self.f.iter_mut().zip(&self.x[k_count..]) {
            row.push(v);
        }
        self.stats.update(&self.x, &y);

        let mut residual = y.clone();
        for (k, support) in self.supports.iter().enumerate() {
            let xk = self.x[k];
            if xk == 0.0 {
                continue;
            }
            for &p in support {
                residual[p] -= self.a[[p, k]] * xk;
            }
        }
        for (j, col) in self.b.columns().into_iter().enumerate() {
            let fj = self.x[k_count + j];
            for (r, &bp) in residual.iter_mut().zip(col.iter()) {
                *r -= bp * fj;
            }
        }
        self.ring.push(y, residual, self.x.clone());
        self.frames += 1;
    }

    /// Components whose denoised value stayed below `amplitude × sn` for `window` frames.
    fn silent_components(&mut self, amplitude: f64, window: usize) -> Vec<usize> {
        let mut silent = Vec::new();
        for (k, track) in self.tracks.iter_mut().enumerate() {
            let level = amplitude * track.deconv.params().sn;
            if track.deconv.last_value() <= level {
                track.silent += 1;
            } else {
                track.silent = 0;
            }
            if track.silent >= window {
                silent.push(k);
            }
        }
        silent
    }

    fn remove_components(&mut self, remove: &[usize]) -> Vec<ComponentId> {
        if remove.is_empty() {
            return Vec::new();
        }
        let k_count = self.components();
        let nb = self.background_rank();
        let keep: Vec<usize> = (0..k_count).filter(|k| !remove.contains(k)).collect();
        let removed: Vec<ComponentId> = remove.iter().map(|&k| self.ids[k]).collect();
        for &id in &removed {
            self.registry.reject(id);
        }

        self.a = self.a.select(ndarray::Axis(1), &keep);
        let mut stat_keep = keep.clone();
        stat_keep.extend(k_count..k_count + nb);
        self.stats.select(&stat_keep);
        self.x = stat_keep.iter().map(|&i| self.x[i]).collect();
        self.ring.remove_projected(remove);

        let mut tracks: Vec<Option<Track>> = mem::take(&mut self.tracks).into_iter().map(Some).collect();
        self.tracks = keep.iter().filter_map(|&k| tracks[k].take()).collect();
        self.ids = keep.iter().map(|&k| self.ids[k]).collect();
        self.gram_dirty = true;
        removed
    }

    fn refresh_job(&self, config: &CnmfConfig) -> RefreshJob {
        RefreshJob {
            ids: self.ids.clone(),
            a: self.a.clone(),
            b: self.b.clone(),
            cc: self.stats.cc.clone(),
            cy: self.stats.cy.clone(),
            masks: candidate_masks(&self.a, self.shape, config.spatial.dilation_radius),
            sweeps: config.online.hals_iterations,
        }
    }

    /// Write refreshed footprints back by id; components added or merged
    /// since the job started keep their current footprint. Returns the ids
    /// of components left with too small a support.
    fn apply_refresh(&mut self, result: RefreshResult, min_pixels: usize) -> Vec<ComponentId> {
        for (j, id) in result.ids.iter().enumerate() {
            if let Some(k) = self.ids.iter().position(|i| i == id) {
                self.a.column_mut(k).assign(&result.a.column(j));
            }
        }
        if result.b.dim() == self.b.dim() {
            self.b = result.b;
        }
        self.gram_dirty = true;

        let degenerate: Vec<usize> = (0..self.components())
            .filter(|&k| self.a.column(k).iter().filter(|&&v| v > 0.0).count() < min_pixels)
            .collect();
        self.remove_components(&degenerate)
    }

    /// Look for persistent unexplained activity and add components for it.
    fn trigger(&mut self, config: &CnmfConfig) -> Result<Vec<ComponentId>> {
        if !self.ring.is_full() {
            return Ok(Vec::new());
        }
        let d = self.shape.pixel_count();
        let radius = config.init.gsig.ceil() as usize;
        let mut excluded = vec![false; d];
        for k in 0..self.components() {
            let support: Vec<bool> = self.a.column(k).iter().map(|&v| v > 0.0).collect();
            for (e, s) in excluded.iter_mut().zip(dilate(&support, self.shape, radius)) {
                *e |= s;
            }
        }

        let (candidates, blurred) = find_candidates(
            &self.ring,
            self.shape,
            &self.kernel,
            &self.noise_energy,
            &excluded,
            &config.online,
            config.init.min_distance,
        );
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let window = self.ring.residual_matrix(d);
        let mut added = Vec::new();
        for cand in candidates {
            let c_init = blurred.row(cand.center).to_vec();
            if let Some(found) = extract_component(&window, self.shape, cand.center, &c_init, &config.init) {
                debug!(center = cand.center, score = cand.score, "new component");
                added.push(self.add_component(found, config)?);
            }
        }
        Ok(added)
    }

    fn add_component(&mut self, found: Extracted, config: &CnmfConfig) -> Result<ComponentId> {
        let k_count = self.components();
        let n = self.frames;
        let window = self.ring.len();
        let start = n - window;
        let values = &found.footprint_trace;

        self.a.push_column(ArrayView1::from(&found.footprint[..]))?;
        let id = self.registry.register(ComponentState::Candidate, n);

        let noise: f64 = found
            .footprint
            .iter()
            .zip(&self.sn)
            .map(|(a, s)| a * a * s * s)
            .sum::<f64>()
            .sqrt();
        let params = DeconvParams {
            g: self.g.clone(),
            sn: noise,
            baseline: 0.0,
            lambda: 0.0,
            s_min: config.temporal.s_min,
        };
        let mut track = Track {
            c: vec![0.0; start],
            s: vec![0.0; start],
            y: vec![0.0; start],
            deconv: OnlineDeconvolver::new(params, config.online.state_capacity, start),
            silent: 0,
        };
        for &v in values {
            track.push(v);
        }

        let frames = self.stats.frames.max(1) as f64;
        let m = self.stats.dim();
        let mut cross = vec![0.0; m];
        let mut diag = 0.0;
        let mut cy_row = Array1::zeros(self.shape.pixel_count());
        for ((&v, x), raw) in values.iter().zip(&self.ring.projected).zip(&self.ring.raw) {
            for (c, &xj) in cross.iter_mut().zip(x) {
                *c += v * xj / frames;
            }
            diag += v * v / frames;
            cy_row.scaled_add(v / frames, &ArrayView1::from(&raw[..]));
        }
        self.stats.insert(k_count, &cross, diag, cy_row.view());
        self.ring.insert_projected(k_count, values);
        for (residual, &v) in self.ring.residual.iter_mut().zip(values) {
            for (r, &a) in residual.iter_mut().zip(&found.footprint) {
                *r -= a * v;
            }
        }
        self.x.insert(k_count, values.last().copied().unwrap_or(0.0));

        self.ids.push(id);
        self.tracks.push(track);
        self.registry.accept(id);
        self.gram_dirty = true;
        Ok(id)
    }

    /// Merge pass restricted to nearby pairs and recent frames.
    ///
    /// Candidate groups are found on the tracker's own state first; the full
    /// model is only built when some pair qualifies.
    fn merge(&mut self, config: &CnmfConfig) -> Result<Vec<MergeEvent>> {
        if self.components() < 2 {
            return Ok(Vec::new());
        }
        if self.gram_dirty {
            self.refresh_gram();
        }
        let on = &config.online;
        let start = self.frames.saturating_sub(on.merge_window);
        let centroids: Vec<_> = (0..self.components())
            .map(|k| footprint_centroid(self.a.column(k), self.shape))
            .collect();
        let groups = qualifying_groups(
            &self.supports,
            &centroids,
            |k| self.tracks[k].c[start..].to_vec(),
            &config.merge,
            Some(on.merge_proximity),
        );
        if groups.is_empty() {
            return Ok(Vec::new());
        }

        let mut snapshot = self.model(false);
        let scope = MergeScope::local(on.merge_proximity, on.merge_window);
        let events = merge_components(&mut snapshot, config, scope, self.frames)?;
        if events.is_empty() {
            return Ok(events);
        }

        // statistics combine linearly with the fusion weights
        let nb = self.background_rank();
        let mut order = self.ids.clone();
        for event in &events {
            let (members, weights): (Vec<usize>, Vec<f64>) = event
                .members
                .iter()
                .zip(&event.weights)
                .filter_map(|(id, &w)| order.iter().position(|o| o == id).map(|i| (i, w)))
                .unzip();
            let (cross, diag, cy_row) = self.stats.combined(&members, &weights);
            let kc = order.len();
            self.stats.insert(kc, &cross, diag, cy_row.view());
            let mut keep: Vec<usize> = (0..=kc).filter(|i| !members.contains(i)).collect();
            keep.extend(kc + 1..kc + 1 + nb);
            self.stats.select(&keep);
            order.push(event.fused);
            order = (0..=kc).filter(|i| !members.contains(i)).map(|i| order[i]).collect();
        }
        let mut perm: Vec<usize> = snapshot
            .ids
            .iter()
            .filter_map(|id| order.iter().position(|o| o == id))
            .collect();
        perm.extend(order.len()..order.len() + nb);
        self.stats.select(&perm);

        let k_old = self.components();
        let x_components = fold_merges(&self.ids, &self.x[..k_old], &events, &snapshot.ids);
        self.x = x_components.into_iter().chain(self.x[k_old..].iter().copied()).collect();
        for x in self.ring.projected.iter_mut() {
            let folded = fold_merges(&self.ids, &x[..k_old], &events, &snapshot.ids);
            *x = folded.into_iter().chain(x[k_old..].iter().copied()).collect();
        }

        let capacity = config.online.state_capacity;
        let mut old: BTreeMap<ComponentId, Track> = self.ids.iter().copied().zip(mem::take(&mut self.tracks)).collect();
        self.tracks = snapshot
            .ids
            .iter()
            .enumerate()
            .map(|(k, id)| match old.remove(id) {
                Some(track) => track,
                None => {
                    let c = snapshot.c.row(k).to_vec();
                    let y = c.iter().zip(snapshot.yra.row(k)).map(|(a, b)| a + b).collect();
                    Track::resumed(snapshot.deconv[k].clone(), capacity, c, snapshot.s.row(k).to_vec(), y)
                }
            })
            .collect();
        self.a = snapshot.a;
        self.ids = snapshot.ids;
        self.registry = snapshot.registry;
        self.gram_dirty = true;
        Ok(events)
    }

    /// Current state as a model; `normalize` scales footprints to unit norm.
    fn model(&self, normalize: bool) -> Model {
        let n = self.frames;
        let k_count = self.components();
        let c = Array2::from_shape_fn((k_count, n), |(k, t)| self.tracks[k].c[t]);
        let s = Array2::from_shape_fn((k_count, n), |(k, t)| self.tracks[k].s[t]);
        let yra = Array2::from_shape_fn((k_count, n), |(k, t)| self.tracks[k].y[t] - self.tracks[k].c[t]);
        let f = Array2::from_shape_fn((self.f.len(), n), |(j, t)| self.f[j][t]);
        let mut model = Model {
            shape: self.shape,
            a: self.a.clone(),
            c,
            s,
            yra,
            b: self.b.clone(),
            f,
            deconv: self.tracks.iter().map(|t| t.deconv.params().clone()).collect(),
            ids: self.ids.clone(),
            registry: self.registry.clone(),
            sn: self.sn.clone(),
            g: self.g.clone(),
        };
        if normalize {
            model.normalize();
        }
        model
    }
}

/// A streaming fit. Frames are pushed one at a time, strictly in order.
pub struct OnlineSession {
    shape: FrameShape,
    config: CnmfConfig,
    state: SessionState,
    buffer: Vec<Frame>,
    tracker: Option<Tracker>,
    worker: RefreshWorker,
    refresh_pending: bool,
    counters: SessionCounters,
    warnings: Vec<QualityWarning>,
    handle: SnapshotHandle,
}

impl OnlineSession {
    pub fn new(shape: FrameShape, mut config: CnmfConfig) -> Result<Self> {
        config.pipeline = Pipeline::Online;
        config.validate()?;
        Ok(OnlineSession {
            shape,
            buffer: Vec::with_capacity(config.online.init_batch),
            config,
            state: SessionState::Initializing,
            tracker: None,
            worker: RefreshWorker::default(),
            refresh_pending: false,
            counters: SessionCounters::default(),
            warnings: Vec::new(),
            handle: SnapshotHandle::default(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    /// Handle receiving a snapshot every `publish_every` frames.
    pub fn snapshot_handle(&self) -> SnapshotHandle {
        self.handle.clone()
    }

    /// Current model with unit-norm footprints; `None` before the initial fit.
    pub fn snapshot(&self) -> Option<Model> {
        self.tracker.as_ref().map(|t| t.model(true))
    }

    pub fn push_frame(&mut self, frame: Frame) -> Result<FrameReport> {
        if matches!(self.state, SessionState::Shutdown | SessionState::Failed) {
            return Err(CnmfError::SessionClosed);
        }
        let index = self.counters.frames;
        if frame.shape() != self.shape {
            self.state = SessionState::Failed;
            warn!(frame = index, expected = %self.shape, actual = %frame.shape(), "malformed frame, session failed");
            return Err(CnmfError::MalformedFrame {
                index,
                expected: self.shape,
                actual: frame.shape(),
            });
        }
        self.counters.frames += 1;

        let mut report = FrameReport {
            frame: index,
            state: self.state,
            components: 0,
            added: Vec::new(),
            merges: Vec::new(),
            rejected: Vec::new(),
        };
        match self.state {
            SessionState::Initializing => {
                self.buffer.push(frame);
                if self.buffer.len() >= self.config.online.init_batch {
                    self.start_tracking()?;
                }
            }
            _ => self.track(frame, &mut report)?,
        }
        report.state = self.state;
        report.components = self.tracker.as_ref().map_or(0, |t| t.components());
        Ok(report)
    }

    fn start_tracking(&mut self) -> Result<()> {
        let frames = mem::take(&mut self.buffer);
        let movie = movie_matrix(&frames, self.shape)?;
        drop(frames);
        info!(frames = movie.ncols(), "online initialization");

        let pre = preprocess(&movie, &self.config.preprocess);
        let mut fit = fit_local(&movie, self.shape, &pre, &self.config, self.config.online.init_iterations)?;
        self.warnings.extend(fit.warnings);
        if fit.removed > 0 {
            self.warnings.push(QualityWarning::ComponentsRemoved { count: fit.removed });
        }
        for id in fit.model.ids.clone() {
            fit.model.registry.accept(id);
        }
        self.tracker = Some(Tracker::from_model(fit.model, &movie, &self.config));
        self.state = SessionState::Tracking;
        info!(components = self.tracker.as_ref().map_or(0, |t| t.components()), "tracking started");
        Ok(())
    }

    fn track(&mut self, frame: Frame, report: &mut FrameReport) -> Result<()> {
        let config = &self.config;
        let Some(tracker) = self.tracker.as_mut() else {
            return Ok(());
        };

        if let Some(result) = self.worker.poll() {
            report.rejected.extend(tracker.apply_refresh(result, config.spatial.min_pixels));
            self.counters.refreshes += 1;
        }

        let y = frame.to_f64();
        tracker.project(&y, config.online.hals_iterations);
        tracker.advance(y);

        let silent = tracker.silent_components(config.online.reject_amplitude, config.online.reject_window);
        report.rejected.extend(tracker.remove_components(&silent));

        let count = tracker.frames;
        let on = &config.online;
        if count % on.refresh_every == 0 {
            match on.background {
                BackgroundMode::Inline => {
                    let result = refresh_footprints(tracker.refresh_job(config));
                    report.rejected.extend(tracker.apply_refresh(result, config.spatial.min_pixels));
                    self.counters.refreshes += 1;
                }
                BackgroundMode::Offload { block_on_overlap } => {
                    if self.worker.busy() && block_on_overlap {
                        if let Some(result) = self.worker.wait() {
                            report.rejected.extend(tracker.apply_refresh(result, config.spatial.min_pixels));
                            self.counters.refreshes += 1;
                        }
                    }
                    if self.worker.busy() {
                        self.refresh_pending = true;
                        self.counters.deferred_refreshes += 1;
                    } else {
                        self.worker.spawn(tracker.refresh_job(config));
                        self.refresh_pending = false;
                    }
                }
            }
        } else if self.refresh_pending && !self.worker.busy() {
            self.worker.spawn(tracker.refresh_job(config));
            self.refresh_pending = false;
        }

        if count % on.trigger_every == 0 {
            self.counters.triggers += 1;
            report.added = tracker.trigger(config)?;
            self.counters.added += report.added.len();
        }

        if count % on.merge_every == 0 {
            report.merges = tracker.merge(config)?;
            self.counters.merges += report.merges.len();
        }

        self.counters.rejected += report.rejected.len();
        if !report.added.is_empty() || !report.merges.is_empty() || !report.rejected.is_empty() {
            debug!(
                frame = report.frame,
                added = report.added.len(),
                merges = report.merges.len(),
                rejected = report.rejected.len(),
                components = tracker.components(),
                "component set changed"
            );
        }

        if on.publish_every > 0 && count % on.publish_every == 0 {
            self.handle.publish(Arc::new(tracker.model(true)));
        }
        Ok(())
    }

    /// Drain background work and return the final model.
    pub fn finish(&mut self) -> Result<SessionOutcome> {
        match self.state {
            SessionState::Shutdown | SessionState::Failed => Err(CnmfError::SessionClosed),
            SessionState::Initializing => {
                self.state = SessionState::Shutdown;
                Err(CnmfError::StreamExhausted {
                    frames: self.buffer.len(),
                    needed: self.config.online.init_batch,
                })
            }
            SessionState::Tracking => {
                self.state = SessionState::Shutdown;
                let Some(tracker) = self.tracker.as_mut() else {
                    return Err(CnmfError::SessionClosed);
                };
                if let Some(result) = self.worker.wait() {
                    let removed = tracker.apply_refresh(result, self.config.spatial.min_pixels);
                    self.counters.rejected += removed.len();
                    self.counters.refreshes += 1;
                }
                for track in tracker.tracks.iter_mut() {
                    track.deconv.write_into(&mut track.c, &mut track.s);
                }

                let model = tracker.model(true);
                self.handle.publish(Arc::new(model.clone()));
                let mut warnings = self.warnings.clone();
                if self.counters.rejected > 0 {
                    warnings.push(QualityWarning::ComponentsRemoved {
                        count: self.counters.rejected,
                    });
                }
                info!(
                    frames = self.counters.frames,
                    components = model.components(),
                    added = self.counters.added,
                    merges = self.counters.merges,
                    rejected = self.counters.rejected,
                    "session finished"
                );
                Ok(SessionOutcome {
                    model,
                    counters: self.counters.clone(),
                    warnings,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Cnmf;
    use crate::initialization::tests::blob_movie;
    use crate::merging::tests::{near_duplicate_model, spiky};
    use crate::stats::testutil::Lcg;
    use crate::stats::{cosine_similarity, pearson};

    fn frame(shape: FrameShape, movie: &Array2<f64>, t: usize) -> Frame {
        Frame::new(shape, movie.column(t).iter().map(|&v| v as f32).collect()).unwrap()
    }

    fn online_config() -> CnmfConfig {
        let mut config = CnmfConfig::default();
        config.pipeline = Pipeline::Online;
        config.init.components = 2;
        config.online.init_batch = 200;
        config
    }

    fn nearest(model: &Model, cx: f64, cy: f64) -> (usize, f64) {
        (0..model.components())
            .map(|k| {
                let (x, y, _) = model.centroid(k);
                (k, ((x - cx).powi(2) + (y - cy).powi(2)).sqrt())
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap()
    }

    /// Two sources active throughout plus one silent until `onset`.
    fn late_source_movie(shape: FrameShape, frames: usize, onset: usize) -> (Array2<f64>, Vec<f64>) {
        let (mut movie, _) = blob_movie(shape, &[(8, 8), (24, 8)], frames, 0.2, 17);
        let mut c = 0.0;
        let late: Vec<f64> = (0..frames)
            .map(|t| {
                let spike = if t >= onset && (t - onset) % 3 == 0 { 2.0 } else { 0.0 };
                c = 0.8 * c + spike;
                c
            })
            .collect();
        for p in 0..shape.pixel_count() {
            let (x, y, _) = shape.coords(p);
            let r2 = (x as f64 - 16.0).powi(2) + (y as f64 - 24.0).powi(2);
            let w = (-r2 / (2.0 * 1.5 * 1.5)).exp();
            if w < 0.05 {
                continue;
            }
            for t in 0..frames {
                movie[[p, t]] += 3.0 * w * late[t];
            }
        }
        (movie, late)
    }

    #[test]
    fn test_new_source_is_detected_shortly_after_onset() {
        let shape = FrameShape::planar(32, 32);
        let (movie, late) = late_source_movie(shape, 400, 300);
        let mut config = online_config();
        config.online.trigger_every = 20;
        config.online.trigger_window = 10;
        let mut session = OnlineSession::new(shape, config).unwrap();

        let mut added_at = Vec::new();
        for t in 0..400 {
            let report = session.push_frame(frame(shape, &movie, t)).unwrap();
            if !report.added.is_empty() {
                added_at.push((t, report.added));
            }
        }
        assert_eq!(added_at.len(), 1, "additions: {:?}", added_at);
        let (t_added, ids) = &added_at[0];
        assert!((300..=340).contains(t_added), "detected at frame {}", t_added);

        let outcome = session.finish().unwrap();
        let model = &outcome.model;
        assert_eq!(model.components(), 3);
        let k = model.index_of(ids[0]).unwrap();
        let (x, y, _) = model.centroid(k);
        assert!((x - 16.0).abs() < 2.0 && (y - 24.0).abs() < 2.0);
        let record = model.registry.get(ids[0]).unwrap();
        assert_eq!(record.state, ComponentState::Accepted);
        assert!((300..=340).contains(&record.born_frame));
        let corr = pearson(&model.c.row(k).to_vec()[330..], &late[330..]);
        assert!(corr > 0.8, "late source trace corr {}", corr);
        assert_eq!(outcome.counters.added, 1);
    }

    #[test]
    fn test_online_tracks_batch_on_stationary_movie() {
        let shape = FrameShape::planar(24, 24);
        let truth = [(7, 7), (16, 16)];
        let (movie, traces) = blob_movie(shape, &truth, 400, 0.2, 21);

        let mut session = OnlineSession::new(shape, online_config()).unwrap();
        for t in 0..400 {
            session.push_frame(frame(shape, &movie, t)).unwrap();
        }
        let online = session.finish().unwrap().model;
        let batch = Cnmf::new().with_components(2).fit_movie(&movie, shape).unwrap().model;

        assert_eq!(online.frames(), 400);
        assert!(online.a.iter().all(|&v| v >= 0.0));
        assert!(online.c.iter().chain(online.s.iter()).all(|&v| v >= 0.0));
        for (&(cx, cy), tr) in truth.iter().zip(&traces) {
            let (ko, d_on) = nearest(&online, cx as f64, cy as f64);
            let (kb, _) = nearest(&batch, cx as f64, cy as f64);
            assert!(d_on < 2.0);
            let tail = 200..400;
            let on_trace = &online.c.row(ko).to_vec()[tail.clone()];
            let truth_corr = pearson(on_trace, &tr[tail.clone()]);
            let batch_corr = pearson(on_trace, &batch.c.row(kb).to_vec()[tail]);
            assert!(truth_corr > 0.85, "online vs truth {}", truth_corr);
            assert!(batch_corr > 0.85, "online vs batch {}", batch_corr);
            let overlap = cosine_similarity(&online.a.column(ko).to_vec(), &batch.a.column(kb).to_vec());
            assert!(overlap > 0.95, "online vs batch footprint {}", overlap);
        }
    }

    #[test]
    fn test_malformed_frame_fails_session_without_mutation() {
        let shape = FrameShape::planar(16, 16);
        let (movie, _) = blob_movie(shape, &[(8, 8)], 60, 0.2, 4);
        let mut config = online_config();
        config.init.components = 1;
        config.online.init_batch = 50;
        let mut session = OnlineSession::new(shape, config).unwrap();
        for t in 0..55 {
            session.push_frame(frame(shape, &movie, t)).unwrap();
        }
        assert_eq!(session.state(), SessionState::Tracking);
        let before = session.snapshot().unwrap();

        let wrong = Frame::new(FrameShape::planar(8, 8), vec![0.0; 64]).unwrap();
        match session.push_frame(wrong) {
            Err(CnmfError::MalformedFrame { index, .. }) => assert_eq!(index, 55),
            other => panic!("expected MalformedFrame, got {:?}", other.map(|r| r.frame)),
        }
        assert_eq!(session.state(), SessionState::Failed);
        assert!(matches!(
            session.push_frame(frame(shape, &movie, 55)),
            Err(CnmfError::SessionClosed)
        ));
        assert!(matches!(session.finish(), Err(CnmfError::SessionClosed)));

        let after = session.snapshot().unwrap();
        assert_eq!(before.a, after.a);
        assert_eq!(before.c, after.c);
        assert_eq!(session.counters().frames, 55);
    }

    #[test]
    fn test_offloaded_refresh() {
        let shape = FrameShape::planar(16, 16);
        let (movie, _) = blob_movie(shape, &[(8, 8)], 160, 0.2, 6);
        for block_on_overlap in [true, false] {
            let mut config = online_config();
            config.init.components = 1;
            config.online.init_batch = 60;
            config.online.refresh_every = 2;
            config.online.publish_every = 25;
            config.online.background = BackgroundMode::Offload { block_on_overlap };
            let mut session = OnlineSession::new(shape, config).unwrap();
            let handle = session.snapshot_handle();
            for t in 0..160 {
                session.push_frame(frame(shape, &movie, t)).unwrap();
            }
            assert!(handle.latest().is_some());
            let outcome = session.finish().unwrap();
            assert!(outcome.counters.refreshes >= 1);
            if block_on_overlap {
                assert_eq!(outcome.counters.deferred_refreshes, 0);
            }
            assert_eq!(session.state(), SessionState::Shutdown);
            assert_eq!(outcome.model.components(), 1);
            assert!(outcome.model.a.iter().all(|&v| v >= 0.0));
            let norm: f64 = outcome.model.a.column(0).iter().map(|v| v * v).sum();
            assert!((norm - 1.0).abs() < 1e-9);
            assert_eq!(handle.latest().map(|m| m.frames()), Some(160));
        }
    }

    #[test]
    fn test_finish_before_initial_fit() {
        let shape = FrameShape::planar(8, 8);
        let mut session = OnlineSession::new(shape, online_config()).unwrap();
        let report = session.push_frame(Frame::new(shape, vec![1.0; 64]).unwrap()).unwrap();
        assert_eq!(report.state, SessionState::Initializing);
        assert!(matches!(
            session.finish(),
            Err(CnmfError::StreamExhausted { frames: 1, needed: 200 })
        ));
    }

    #[test]
    fn test_merge_replay_weights_values() {
        let ids = [ComponentId(0), ComponentId(1), ComponentId(2)];
        let events = vec![MergeEvent {
            members: vec![ids[0], ids[2]],
            weights: vec![0.5, 2.0],
            fused: ComponentId(3),
        }];
        let out = fold_merges(&ids, &[1.0, 4.0, 3.0], &events, &[ids[1], ComponentId(3)]);
        assert_eq!(out, vec![4.0, 6.5]);
    }

    #[test]
    fn test_silent_component_is_rejected() {
        let shape = FrameShape::planar(16, 16);
        let (mut movie, _) = blob_movie(shape, &[(8, 8)], 300, 0.2, 8);
        // source switches off after the initial batch
        let (quiet, _) = blob_movie(shape, &[], 300, 0.2, 9);
        for t in 100..300 {
            movie.column_mut(t).assign(&quiet.column(t));
        }
        let mut config = online_config();
        config.init.components = 1;
        config.online.init_batch = 100;
        config.online.reject_window = 30;
        config.online.reject_amplitude = 3.0;
        let mut session = OnlineSession::new(shape, config).unwrap();
        let mut rejected = Vec::new();
        for t in 0..300 {
            rejected.extend(session.push_frame(frame(shape, &movie, t)).unwrap().rejected);
        }
        assert_eq!(rejected.len(), 1);
        let model = session.finish().unwrap().model;
        assert_eq!(model.components(), 0);
        assert_eq!(model.registry.state(rejected[0]), Some(ComponentState::Rejected));
    }

    #[test]
    fn test_tracker_merge_uses_recent_frames() {
        let mut rng = Lcg(61);
        let early_a = spiky(400, &mut rng);
        let early_b = spiky(400, &mut rng);
        let late = spiky(100, &mut rng);
        let first: Vec<f64> = early_a.iter().chain(&late).copied().collect();
        let second: Vec<f64> = early_b.iter().chain(&late).copied().collect();
        let model = near_duplicate_model(&first, &second);
        let movie = model.a.dot(&model.c) + model.b.dot(&model.f);

        let mut config = online_config();
        config.online.merge_window = 500;
        let mut tracker = Tracker::from_model(model.clone(), &movie, &config);
        assert!(tracker.merge(&config).unwrap().is_empty());
        assert_eq!(tracker.components(), 2);

        config.online.merge_window = 100;
        let mut tracker = Tracker::from_model(model, &movie, &config);
        let events = tracker.merge(&config).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(tracker.components(), 1);
        assert_eq!(tracker.ids, vec![events[0].fused]);
        assert_eq!(tracker.tracks.len(), 1);
        assert_eq!(tracker.tracks[0].c.len(), 500);
    }
}
