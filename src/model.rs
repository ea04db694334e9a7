use ndarray::{Array1, Array2, ArrayView1, Axis, ErrorKind, ShapeError};

use crate::deconvolution::DeconvParams;
use crate::error::Result;
use crate::registry::{ComponentId, Registry};
use crate::types::FrameShape;

/// Fitted decomposition `Y ≈ A C + b f`.
///
/// Column `k` of `a` and rows `k` of `c`, `s`, `yra` all belong to `ids[k]`.
#[derive(Clone, Debug)]
pub struct Model {
    pub shape: FrameShape,
    /// Footprints, `pixels × K`, unit-norm columns.
    pub a: Array2<f64>,
    /// Denoised traces, `K × T`.
    pub c: Array2<f64>,
    /// Events, `K × T`.
    pub s: Array2<f64>,
    /// Noisy trace minus denoised trace, `K × T`.
    pub yra: Array2<f64>,
    /// Background footprints, `pixels × nb`.
    pub b: Array2<f64>,
    /// Background traces, `nb × T`.
    pub f: Array2<f64>,
    pub deconv: Vec<DeconvParams>,
    pub ids: Vec<ComponentId>,
    pub registry: Registry,
    /// Per-pixel noise level.
    pub sn: Vec<f64>,
    /// Global AR coefficients.
    pub g: Vec<f64>,
}

impl Model {
    /// Model with no components and a zero background of rank `nb`.
    pub fn empty(shape: FrameShape, frames: usize, nb: usize) -> Self {
        let d = shape.pixel_count();
        Model {
            shape,
            a: Array2::zeros((d, 0)),
            c: Array2::zeros((0, frames)),
            s: Array2::zeros((0, frames)),
            yra: Array2::zeros((0, frames)),
            b: Array2::zeros((d, nb)),
            f: Array2::zeros((nb, frames)),
            deconv: Vec::new(),
            ids: Vec::new(),
            registry: Registry::new(),
            sn: vec![0.0; d],
            g: vec![0.95],
        }
    }

    pub fn components(&self) -> usize {
        self.a.ncols()
    }

    pub fn frames(&self) -> usize {
        self.c.ncols()
    }

    pub fn pixels(&self) -> usize {
        self.a.nrows()
    }

    pub fn background_rank(&self) -> usize {
        self.b.ncols()
    }

    pub fn footprint(&self, k: usize) -> ArrayView1<'_, f64> {
        self.a.column(k)
    }

    pub fn trace(&self, k: usize) -> ArrayView1<'_, f64> {
        self.c.row(k)
    }

    pub fn index_of(&self, id: ComponentId) -> Option<usize> {
        self.ids.iter().position(|&i| i == id)
    }

    /// Pixels where footprint `k` is non-zero.
    pub fn support(&self, k: usize) -> Vec<usize> {
        self.a
            .column(k)
            .iter()
            .enumerate()
            .filter(|(_, &v)| v > 0.0)
            .map(|(p, _)| p)
            .collect()
    }

    /// Footprint-weighted centre of mass `(x, y, z)`.
    pub fn centroid(&self, k: usize) -> (f64, f64, f64) {
        footprint_centroid(self.a.column(k), self.shape)
    }

    /// Keep only components at `keep`, in that order. Registry is untouched.
    pub(crate) fn select(&mut self, keep: &[usize]) {
        self.a = self.a.select(Axis(1), keep);
        self.c = self.c.select(Axis(0), keep);
        self.s = self.s.select(Axis(0), keep);
        self.yra = self.yra.select(Axis(0), keep);
        self.deconv = keep.iter().map(|&k| self.deconv[k].clone()).collect();
        self.ids = keep.iter().map(|&k| self.ids[k]).collect();
    }

    /// Drop the components at `remove` (any order). Registry is untouched.
    pub(crate) fn remove(&mut self, remove: &[usize]) {
        let keep: Vec<usize> = (0..self.components()).filter(|k| !remove.contains(k)).collect();
        self.select(&keep);
    }

    /// Append one component. Lengths are checked before anything is touched,
    /// so a failed push leaves the model as it was.
    pub(crate) fn push(
        &mut self,
        id: ComponentId,
        a: ArrayView1<f64>,
        c: ArrayView1<f64>,
        s: ArrayView1<f64>,
        yra: ArrayView1<f64>,
        params: DeconvParams,
    ) -> Result<()> {
        let n = self.frames();
        if a.len() != self.pixels() || c.len() != n || s.len() != n || yra.len() != n {
            return Err(ShapeError::from_kind(ErrorKind::IncompatibleShape).into());
        }
        self.a.push_column(a)?;
        self.c.push_row(c)?;
        self.s.push_row(s)?;
        self.yra.push_row(yra)?;
        self.deconv.push(params);
        self.ids.push(id);
        Ok(())
    }

    /// `A C + b f` at frame `t`.
    pub fn reconstruct_frame(&self, t: usize) -> Array1<f64> {
        self.a.dot(&self.c.column(t)) + self.b.dot(&self.f.column(t))
    }

    /// Frobenius norm of `Y − A C − b f`.
    pub fn residual_norm(&self, y: &Array2<f64>) -> f64 {
        let resid = y - &self.a.dot(&self.c) - &self.b.dot(&self.f);
        resid.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    /// Scale footprints to unit norm, moving the scale into the traces.
    pub(crate) fn normalize(&mut self) {
        for k in 0..self.components() {
            let norm = self.a.column(k).iter().map(|v| v * v).sum::<f64>().sqrt();
            if norm > 0.0 {
                self.a.column_mut(k).mapv_inplace(|v| v / norm);
                self.c.row_mut(k).mapv_inplace(|v| v * norm);
                self.s.row_mut(k).mapv_inplace(|v| v * norm);
                self.yra.row_mut(k).mapv_inplace(|v| v * norm);
                let params = &mut self.deconv[k];
                params.sn *= norm;
                params.baseline *= norm;
                params.lambda *= norm;
                params.s_min *= norm;
            }
        }
    }
}

/// Footprint-weighted centre of mass in pixel coordinates.
pub(crate) fn footprint_centroid(a: ArrayView1<f64>, shape: FrameShape) -> (f64, f64, f64) {
    let mut sum = 0.0;
    let (mut cx, mut cy, mut cz) = (0.0, 0.0, 0.0);
    for (p, &w) in a.iter().enumerate() {
        if w > 0.0 {
            let (x, y, z) = shape.coords(p);
            cx += w * x as f64;
            cy += w * y as f64;
            cz += w * z as f64;
            sum += w;
        }
    }
    if sum <= 0.0 {
        return (0.0, 0.0, 0.0);
    }
    (cx / sum, cy / sum, cz / sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ComponentState;

    fn two_component_model() -> Model {
        let shape = FrameShape::planar(4, 4);
        let mut model = Model::empty(shape, 5, 1);
        for (k, center) in [(0usize, 5usize), (1, 10)] {
            let id = model.registry.register(ComponentState::Accepted, 0);
            let mut a = Array1::zeros(16);
            a[center] = 2.0;
            a[center + 1] = 2.0;
            let c = Array1::from_elem(5, k as f64 + 1.0);
            let z = Array1::zeros(5);
            model.push(id, a.view(), c.view(), z.view(), z.view(), DeconvParams::default()).unwrap();
        }
        model
    }

    #[test]
    fn test_push_select_remove() {
        let mut model = two_component_model();
        assert_eq!(model.components(), 2);
        assert_eq!(model.support(1), vec![10, 11]);
        let (cx, cy, _) = model.centroid(0);
        assert!((cx - 1.5).abs() < 1e-12 && (cy - 1.0).abs() < 1e-12);

        let second = model.ids[1];
        model.remove(&[0]);
        assert_eq!(model.components(), 1);
        assert_eq!(model.ids, vec![second]);
        assert_eq!(model.c[[0, 0]], 2.0);
    }

    #[test]
    fn test_mismatched_push_leaves_model_intact() {
        let mut model = two_component_model();
        let id = model.registry.register(ComponentState::Candidate, 0);
        let a = Array1::from_elem(16, 1.0);
        let short = Array1::zeros(4);
        let z = Array1::zeros(5);
        let result = model.push(id, a.view(), short.view(), z.view(), z.view(), DeconvParams::default());
        assert!(matches!(result, Err(crate::error::CnmfError::Shape(_))));
        let narrow = Array1::from_elem(15, 1.0);
        let c = Array1::from_elem(5, 1.0);
        assert!(model.push(id, narrow.view(), c.view(), z.view(), z.view(), DeconvParams::default()).is_err());

        assert_eq!(model.components(), 2);
        assert_eq!(model.a.ncols(), 2);
        assert_eq!(model.c.nrows(), 2);
        assert_eq!(model.ids.len(), 2);
        assert_eq!(model.deconv.len(), 2);
    }

    #[test]
    fn test_normalize_preserves_product() {
        let mut model = two_component_model();
        let before = model.a.dot(&model.c);
        model.normalize();
        let after = model.a.dot(&model.c);
        assert!((before - after).iter().all(|v| v.abs() < 1e-12));
        let norm: f64 = model.footprint(0).iter().map(|v| v * v).sum();
        assert!((norm - 1.0).abs() < 1e-12);
    }
}
