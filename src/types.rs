use std::collections::VecDeque;
use std::fmt;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{CnmfError, Result};

/// Dimensions of one frame. Planar recordings have `depth == 1`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct FrameShape {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl FrameShape {
    pub fn planar(width: usize, height: usize) -> Self {
        FrameShape {
            width,
            height,
            depth: 1,
        }
    }

    pub fn volumetric(width: usize, height: usize, depth: usize) -> Self {
        FrameShape {
            width,
            height,
            depth,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height * self.depth
    }

    /// Row-major pixel index: `(z * height + y) * width + x`.
    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        (z * self.height + y) * self.width + x
    }

    /// Inverse of [`FrameShape::index`], returned as `(x, y, z)`.
    #[inline]
    pub fn coords(&self, idx: usize) -> (usize, usize, usize) {
        let plane = self.width * self.height;
        let z = idx / plane;
        let rem = idx % plane;
        (rem % self.width, rem / self.width, z)
    }

    /// Squared Euclidean distance between two pixels.
    pub fn distance_sq(&self, a: usize, b: usize) -> f64 {
        let (ax, ay, az) = self.coords(a);
        let (bx, by, bz) = self.coords(b);
        let dx = ax as f64 - bx as f64;
        let dy = ay as f64 - by as f64;
        let dz = az as f64 - bz as f64;
        dx * dx + dy * dy + dz * dz
    }

    /// All pixel indices inside the axis-aligned box of half-width `radius`
    /// around `center`, clipped to the frame. Depth is boxed with the same radius.
    pub fn window(&self, center: usize, radius: usize) -> Vec<usize> {
        let (cx, cy, cz) = self.coords(center);
        let x0 = cx.saturating_sub(radius);
        let x1 = (cx + radius + 1).min(self.width);
        let y0 = cy.saturating_sub(radius);
        let y1 = (cy + radius + 1).min(self.height);
        let z0 = cz.saturating_sub(radius);
        let z1 = (cz + radius + 1).min(self.depth);
        let mut out = Vec::with_capacity((x1 - x0) * (y1 - y0) * (z1 - z0));
        for z in z0..z1 {
            for y in y0..y1 {
                for x in x0..x1 {
                    out.push(self.index(x, y, z));
                }
            }
        }
        out
    }
}

impl fmt::Display for FrameShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.depth == 1 {
            write!(f, "{}x{}", self.width, self.height)
        } else {
            write!(f, "{}x{}x{}", self.width, self.height, self.depth)
        }
    }
}

/// One frame of pixel intensities.
#[derive(Clone, Debug)]
pub struct Frame {
    shape: FrameShape,
    data: Vec<f32>,
}

impl Frame {
    /// Wraps pixel data, checking that its length matches `shape`.
    pub fn new(shape: FrameShape, data: Vec<f32>) -> Result<Self> {
        let expected = shape.pixel_count();
        if data.len() != expected {
            return Err(CnmfError::PixelCount {
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Frame { shape, data })
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub(crate) fn to_f64(&self) -> Vec<f64> {
        self.data.iter().map(|&v| v as f64).collect()
    }
}

/// Supplier of frames. Storage backing is up to the implementor.
pub trait FrameSource {
    /// Shape every frame of this source is expected to have.
    fn shape(&self) -> FrameShape;

    /// Next frame, or `None` at end of stream.
    fn next_frame(&mut self) -> anyhow::Result<Option<Frame>>;

    /// Drain the source. Used by batch fitting.
    fn all_frames(&mut self) -> anyhow::Result<Vec<Frame>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

/// Frame source over frames already held in memory.
pub struct InMemorySource {
    shape: FrameShape,
    frames: VecDeque<Frame>,
}

impl InMemorySource {
    pub fn new(shape: FrameShape, frames: Vec<Frame>) -> Self {
        InMemorySource {
            shape,
            frames: frames.into(),
        }
    }

    /// Builds frames from raw `f32` buffers, one per frame.
    pub fn from_buffers(shape: FrameShape, buffers: Vec<Vec<f32>>) -> Result<Self> {
        let frames = buffers
            .into_iter()
            .map(|b| Frame::new(shape, b))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(shape, frames))
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for InMemorySource {
    fn shape(&self) -> FrameShape {
        self.shape
    }

    fn next_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        Ok(self.frames.pop_front())
    }
}

/// Stack frames into a `pixels × frames` matrix, rejecting any frame whose
/// shape differs from `shape`.
pub(crate) fn movie_matrix(frames: &[Frame], shape: FrameShape) -> Result<Array2<f64>> {
    let d = shape.pixel_count();
    let mut y = Array2::<f64>::zeros((d, frames.len()));
    for (t, frame) in frames.iter().enumerate() {
        if frame.shape() != shape {
            return Err(CnmfError::MalformedFrame {
                index: t,
                expected: shape,
                actual: frame.shape(),
            });
        }
        for (p, &v) in frame.data().iter().enumerate() {
            y[[p, t]] = v as f64;
        }
    }
    Ok(y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_roundtrip_volumetric() {
        let shape = FrameShape::volumetric(7, 5, 3);
        for idx in [0, 6, 7, 34, 35, 104] {
            let (x, y, z) = shape.coords(idx);
            assert_eq!(shape.index(x, y, z), idx);
        }
        assert_eq!(shape.pixel_count(), 105);
    }

    #[test]
    fn test_window_clipped_at_border() {
        let shape = FrameShape::planar(10, 10);
        let w = shape.window(0, 2);
        assert_eq!(w.len(), 9);
        let w = shape.window(shape.index(5, 5, 0), 2);
        assert_eq!(w.len(), 25);
    }

    #[test]
    fn test_frame_rejects_wrong_length() {
        let err = Frame::new(FrameShape::planar(4, 4), vec![0.0; 15]).unwrap_err();
        assert!(matches!(err, CnmfError::PixelCount { expected: 16, actual: 15, .. }));
    }

    #[test]
    fn test_movie_matrix_rejects_shape_mismatch() {
        let good = Frame::new(FrameShape::planar(4, 3), vec![1.0; 12]).unwrap();
        let bad = Frame::new(FrameShape::planar(3, 4), vec![1.0; 12]).unwrap();
        let err = movie_matrix(&[good, bad], FrameShape::planar(4, 3)).unwrap_err();
        assert!(matches!(err, CnmfError::MalformedFrame { index: 1, .. }));
    }
}
