/// Running sufficient statistics of the streaming footprint update.

use ndarray::{Array1, Array2, ArrayView1, Axis};

/// Running means over frames of `x xᵀ` and `x yᵀ`, where `x` stacks the
/// projected component values followed by the background values.
#[derive(Clone, Debug)]
pub(crate) struct SufficientStats {
    /// `(K + nb) × (K + nb)`.
    pub cc: Array2<f64>,
    /// `(K + nb) × pixels`.
    pub cy: Array2<f64>,
    pub frames: usize,
}

impl SufficientStats {
    /// Statistics of a whole batch: `x` is `(K + nb) × T`, `movie` is `pixels × T`.
    pub(crate) fn from_batch(x: &Array2<f64>, movie: &Array2<f64>) -> Self {
        let n = movie.ncols().max(1) as f64;
        SufficientStats {
            cc: x.dot(&x.t()) / n,
            cy: x.dot(&movie.t()) / n,
            frames: movie.ncols(),
        }
    }

    pub(crate) fn dim(&self) -> usize {
        self.cc.nrows()
    }

    /// Fold one frame into the running means.
    pub(crate) fn update(&mut self, x: &[f64], y: &[f64]) {
        self.frames += 1;
        let w = 1.0 / self.frames as f64;
        let keep = 1.0 - w;

        self.cc.mapv_inplace(|v| v * keep);
        for (i, &xi) in x.iter().enumerate() {
            if xi == 0.0 {
                continue;
            }
            for (j, &xj) in x.iter().enumerate() {
                self.cc[[i, j]] += w * xi * xj;
            }
        }

        self.cy.mapv_inplace(|v| v * keep);
        let y = ArrayView1::from(y);
        for (i, &xi) in x.iter().enumerate() {
            if xi != 0.0 {
                self.cy.row_mut(i).scaled_add(w * xi, &y);
            }
        }
    }

    /// Keep rows/columns `keep`, in that order.
    pub(crate) fn select(&mut self, keep: &[usize]) {
        self.cc = self.cc.select(Axis(0), keep).select(Axis(1), keep);
        self.cy = self.cy.select(Axis(0), keep);
    }

    /// Insert a new entry at `at`. `cross` holds its statistics against the
    /// current entries, `diag` against itself.
    pub(crate) fn insert(&mut self, at: usize, cross: &[f64], diag: f64, cy_row: ArrayView1<f64>) {
        let m = self.dim();
        debug_assert_eq!(cross.len(), m);
        let old = |i: usize| -> Option<usize> {
            match i.cmp(&at) {
                std::cmp::Ordering::Less => Some(i),
                std::cmp::Ordering::Equal => None,
                std::cmp::Ordering::Greater => Some(i - 1),
            }
        };

        let mut cc = Array2::zeros((m + 1, m + 1));
        for i in 0..=m {
            for j in 0..=m {
                cc[[i, j]] = match (old(i), old(j)) {
                    (Some(a), Some(b)) => self.cc[[a, b]],
                    (None, Some(b)) => cross[b],
                    (Some(a), None) => cross[a],
                    (None, None) => diag,
                };
            }
        }

        let pixels = self.cy.ncols();
        let mut cy = Array2::zeros((m + 1, pixels));
        for i in 0..=m {
            match old(i) {
                Some(a) => cy.row_mut(i).assign(&self.cy.row(a)),
                None => cy.row_mut(i).assign(&cy_row),
            }
        }
        self.cc = cc;
        self.cy = cy;
    }

    /// Statistics of `Σ weights[i] · x[members[i]]`: its cross terms against
    /// every current entry, its own term and its data row.
    pub(crate) fn combined(&self, members: &[usize], weights: &[f64]) -> (Vec<f64>, f64, Array1<f64>) {
        let m = self.dim();
        let mut cross = vec![0.0; m];
        let mut cy_row = Array1::zeros(self.cy.ncols());
        for (&i, &w) in members.iter().zip(weights) {
            for (j, c) in cross.iter_mut().enumerate() {
                *c += w * self.cc[[i, j]];
            }
            cy_row.scaled_add(w, &self.cy.row(i));
        }
        let diag = members
            .iter()
            .zip(weights)
            .map(|(&i, &wi)| members.iter().zip(weights).map(|(&j, &wj)| wi * wj * self.cc[[i, j]]).sum::<f64>())
            .sum();
        (cross, diag, cy_row)
    }
}
