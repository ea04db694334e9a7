/// New-component detection on a short window of residual frames.

use std::collections::VecDeque;

use ndarray::Array2;

use crate::config::OnlineConfig;
use crate::filter::gaussian_blur;
use crate::initialization::suppress_disk;
use crate::types::FrameShape;

/// The last few frames seen by the session: raw data, residual and the
/// projected values `[components; background]`.
pub(crate) struct FrameRing {
    capacity: usize,
    pub raw: VecDeque<Vec<f64>>,
    pub residual: VecDeque<Vec<f64>>,
    pub projected: VecDeque<Vec<f64>>,
}

impl FrameRing {
    pub(crate) fn new(capacity: usize) -> Self {
        FrameRing {
            capacity,
            raw: VecDeque::with_capacity(capacity),
            residual: VecDeque::with_capacity(capacity),
            projected: VecDeque::with_capacity(capacity),
        }
    }

    pub(crate) fn push(&mut self, raw: Vec<f64>, residual: Vec<f64>, projected: Vec<f64>) {
        if self.raw.len() == self.capacity {
            self.raw.pop_front();
            self.residual.pop_front();
            self.projected.pop_front();
        }
        self.raw.push_back(raw);
        self.residual.push_back(residual);
        self.projected.push_back(projected);
    }

    pub(crate) fn len(&self) -> usize {
        self.raw.len()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.raw.len() == self.capacity
    }

    /// Residual window as `pixels × frames`.
    pub(crate) fn residual_matrix(&self, pixels: usize) -> Array2<f64> {
        let mut out = Array2::zeros((pixels, self.residual.len()));
        for (t, frame) in self.residual.iter().enumerate() {
            for (p, &v) in frame.iter().enumerate() {
                out[[p, t]] = v;
            }
        }
        out
    }

    /// Drop projected entries at `remove` from every stored frame.
    pub(crate) fn remove_projected(&mut self, remove: &[usize]) {
        for x in self.projected.iter_mut() {
            let kept: Vec<f64> = x
                .iter()
                .enumerate()
                .filter(|(i, _)| !remove.contains(i))
                .map(|(_, &v)| v)
                .collect();
            *x = kept;
        }
    }

    /// Insert a projected entry at `at` in every stored frame.
    pub(crate) fn insert_projected(&mut self, at: usize, values: &[f64]) {
        for (x, &v) in self.projected.iter_mut().zip(values) {
            x.insert(at, v);
        }
    }
}

/// A pixel where unexplained activity persists.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Candidate {
    pub center: usize,
    /// Mean z-score over the window.
    pub score: f64,
}

/// Blur each residual frame and return candidates by decreasing score, at
/// most `limit`, at least `min_distance` apart, outside `excluded`.
///
/// `noise_energy` is the expected variance of blurred noise at each pixel.
/// Also returns the blurred window (`pixels × frames`).
pub(crate) fn find_candidates(
    ring: &FrameRing,
    shape: FrameShape,
    kernel: &[f64],
    noise_energy: &[f64],
    excluded: &[bool],
    config: &OnlineConfig,
    min_distance: f64,
) -> (Vec<Candidate>, Array2<f64>) {
    let d = shape.pixel_count();
    let window = ring.len();
    let mut blurred = Array2::zeros((d, window));
    if window == 0 {
        return (Vec::new(), blurred);
    }
    let mut z_sum = vec![0.0; d];
    let mut above = vec![0usize; d];
    for (t, frame) in ring.residual.iter().enumerate() {
        let smooth = gaussian_blur(frame, shape, kernel);
        for (p, &v) in smooth.iter().enumerate() {
            blurred[[p, t]] = v;
            let z = v / noise_energy[p].sqrt();
            z_sum[p] += z;
            if z > config.trigger_threshold {
                above[p] += 1;
            }
        }
    }

    let needed = (config.sustain_fraction * window as f64).ceil() as usize;
    let mut scored: Vec<Candidate> = (0..d)
        .filter(|&p| !excluded[p])
        .map(|p| Candidate {
            center: p,
            score: z_sum[p] / window as f64,
        })
        .filter(|c| c.score > config.trigger_threshold && above[c.center] >= needed)
        .collect();
    scored.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.center.cmp(&b.center)));

    let mut taken = excluded.to_vec();
    let mut picked = Vec::new();
    for cand in scored {
        if picked.len() >= config.max_new_per_trigger {
            break;
        }
        if taken[cand.center] {
            continue;
        }
        suppress_disk(&mut taken, shape, cand.center, min_distance);
        picked.push(cand);
    }
    (picked, blurred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::gaussian_kernel;
    use crate::initialization::smoothed_noise_energy;
    use crate::stats::testutil::Lcg;

    fn ring_with_blob(shape: FrameShape, frames: usize, active: usize, amplitude: f64, seed: u64) -> FrameRing {
        let mut rng = Lcg(seed);
        let mut ring = FrameRing::new(frames);
        for t in 0..frames {
            let mut r: Vec<f64> = (0..shape.pixel_count()).map(|_| 0.2 * rng.normal()).collect();
            if t < active {
                for y in 9..12 {
                    for x in 4..7 {
                        r[shape.index(x, y, 0)] += amplitude;
                    }
                }
            }
            ring.push(vec![0.0; shape.pixel_count()], r, Vec::new());
        }
        ring
    }

    fn run(ring: &FrameRing, shape: FrameShape, excluded: &[bool]) -> Vec<Candidate> {
        let kernel = gaussian_kernel(2.0);
        let sn = vec![0.2; shape.pixel_count()];
        let energy = smoothed_noise_energy(shape, &kernel, &sn);
        let config = OnlineConfig::default();
        find_candidates(ring, shape, &kernel, &energy, excluded, &config, 3.0).0
    }

    #[test]
    fn test_sustained_blob_triggers_once() {
        let shape = FrameShape::planar(20, 20);
        let ring = ring_with_blob(shape, 10, 10, 2.0, 1);
        let found = run(&ring, shape, &vec![false; 400]);
        assert!(!found.is_empty());
        let (x, y, _) = shape.coords(found[0].center);
        assert!((4..7).contains(&x) && (9..12).contains(&y));
        // the second pick, if any, must respect the minimum distance
        for c in &found[1..] {
            assert!(shape.distance_sq(c.center, found[0].center) > 9.0);
        }
    }

    #[test]
    fn test_brief_or_excluded_activity_is_ignored() {
        let shape = FrameShape::planar(20, 20);
        let noise_only = ring_with_blob(shape, 10, 0, 0.0, 2);
        assert!(run(&noise_only, shape, &vec![false; 400]).is_empty());

        // strong but only in 3 of 10 frames
        let brief = ring_with_blob(shape, 10, 3, 20.0, 3);
        assert!(run(&brief, shape, &vec![false; 400]).is_empty());

        let sustained = ring_with_blob(shape, 10, 10, 2.0, 4);
        assert!(run(&sustained, shape, &vec![true; 400]).is_empty());
    }

    #[test]
    fn test_ring_is_bounded() {
        let mut ring = FrameRing::new(3);
        for t in 0..5 {
            ring.push(vec![t as f64], vec![t as f64], vec![t as f64, 1.0]);
        }
        assert!(ring.is_full());
        assert_eq!(ring.raw.front(), Some(&vec![2.0]));
        ring.insert_projected(1, &[7.0, 8.0, 9.0]);
        assert_eq!(ring.projected[2], vec![4.0, 9.0, 1.0]);
        ring.remove_projected(&[0]);
        assert_eq!(ring.projected[0], vec![7.0, 1.0]);
    }
}
