/// Footprint refresh from sufficient statistics, run inline or on a rayon worker.

use std::sync::mpsc::{self, Receiver, TryRecvError};

use ndarray::Array2;
use rayon::prelude::*;

use crate::linalg::{nnls_gram, sub_gram};
use crate::registry::ComponentId;

const REFRESH_TOL: f64 = 1e-6;

/// Inputs of one refresh, detached from the session.
pub(crate) struct RefreshJob {
    pub ids: Vec<ComponentId>,
    /// `pixels × K`, warm start.
    pub a: Array2<f64>,
    /// `pixels × nb`, warm start.
    pub b: Array2<f64>,
    pub cc: Array2<f64>,
    pub cy: Array2<f64>,
    /// Candidate pixels of each component.
    pub masks: Vec<Vec<bool>>,
    pub sweeps: usize,
}

pub(crate) struct RefreshResult {
    pub ids: Vec<ComponentId>,
    pub a: Array2<f64>,
    pub b: Array2<f64>,
}

/// Per-pixel NNLS of `[A b]` against the statistics `CC`, `CY`.
pub(crate) fn refresh_footprints(job: RefreshJob) -> RefreshResult {
    let d = job.a.nrows();
    let k_count = job.a.ncols();
    let nb = job.b.ncols();

    let rows: Vec<(Vec<usize>, Vec<f64>)> = (0..d)
        .into_par_iter()
        .map(|p| {
            let mut idx: Vec<usize> = (0..k_count).filter(|&k| job.masks[k][p]).collect();
            idx.extend(k_count..k_count + nb);
            let gram = sub_gram(&job.cc, &idx);
            let rhs: Vec<f64> = idx.iter().map(|&j| job.cy[[j, p]]).collect();
            let mut x: Vec<f64> = idx
                .iter()
                .map(|&j| if j < k_count { job.a[[p, j]] } else { job.b[[p, j - k_count]] })
                .collect();
            nnls_gram(&gram, &rhs, &mut x, job.sweeps, REFRESH_TOL);
            (idx, x)
        })
        .collect();

    let mut a = Array2::zeros((d, k_count));
    let mut b = Array2::zeros((d, nb));
    for (p, (idx, x)) in rows.into_iter().enumerate() {
        for (j, v) in idx.into_iter().zip(x) {
            if j < k_count {
                a[[p, j]] = v;
            } else {
                b[[p, j - k_count]] = v;
            }
        }
    }
    RefreshResult { ids: job.ids, a, b }
}

/// At most one refresh in flight on the rayon pool.
#[derive(Default)]
pub(crate) struct RefreshWorker {
    pending: Option<Receiver<RefreshResult>>,
}

impl RefreshWorker {
    pub(crate) fn busy(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn spawn(&mut self, job: RefreshJob) {
        self.spawn_with(move || refresh_footprints(job));
    }

    pub(crate) fn spawn_with<F>(&mut self, work: F)
    where
        F: FnOnce() -> RefreshResult + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        rayon::spawn(move || {
            // the session may have gone away; nothing to deliver to then
            let _ = tx.send(work());
        });
        self.pending = Some(rx);
    }

    /// Finished result, if any, without blocking.
    pub(crate) fn poll(&mut self) -> Option<RefreshResult> {
        let rx = self.pending.as_ref()?;
        match rx.try_recv() {
            Ok(result) => {
                self.pending = None;
                Some(result)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.pending = None;
                None
            }
        }
    }

    /// Block until the in-flight refresh finishes.
    pub(crate) fn wait(&mut self) -> Option<RefreshResult> {
        let rx = self.pending.take()?;
        rx.recv().ok()
    }
}
