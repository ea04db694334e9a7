/// Spatial helpers: separable Gaussian smoothing, mask dilation and
/// union-find connected-region labeling over 2-D/3-D frames.

use crate::types::FrameShape;

/// Normalized 1-D Gaussian kernel truncated at `ceil(3σ)`.
pub(crate) fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (3.0 * sigma).ceil().max(1.0) as usize;
    let inv_2s2 = 1.0 / (2.0 * sigma * sigma);
    let mut kernel: Vec<f64> = (0..=2 * radius)
        .map(|i| {
            let d = i as f64 - radius as f64;
            (-inv_2s2 * d * d).exp()
        })
        .collect();
    let sum: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|v| *v /= sum);
    kernel
}

/// Separable Gaussian blur with clamped borders. Depth is smoothed only for volumes.
pub(crate) fn gaussian_blur(image: &[f64], shape: FrameShape, kernel: &[f64]) -> Vec<f64> {
    let radius = kernel.len() / 2;
    let (w, h, d) = (shape.width, shape.height, shape.depth);
    let mut tmp = vec![0.0; image.len()];
    let mut out = vec![0.0; image.len()];

    // x pass
    for z in 0..d {
        for y in 0..h {
            let row = shape.index(0, y, z);
            for x in 0..w {
                let mut sum = 0.0;
                for (k, &kv) in kernel.iter().enumerate() {
                    let sx = (x + k).saturating_sub(radius).min(w - 1);
                    sum += image[row + sx] * kv;
                }
                tmp[row + x] = sum;
            }
        }
    }

    // y pass
    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                let mut sum = 0.0;
                for (k, &kv) in kernel.iter().enumerate() {
                    let sy = (y + k).saturating_sub(radius).min(h - 1);
                    sum += tmp[shape.index(x, sy, z)] * kv;
                }
                out[shape.index(x, y, z)] = sum;
            }
        }
    }

    if d == 1 {
        return out;
    }

    // z pass
    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                let mut sum = 0.0;
                for (k, &kv) in kernel.iter().enumerate() {
                    let sz = (z + k).saturating_sub(radius).min(d - 1);
                    sum += out[shape.index(x, y, sz)] * kv;
                }
                tmp[shape.index(x, y, z)] = sum;
            }
        }
    }
    tmp
}

/// Dilate a mask by a Euclidean ball of `radius` pixels.
pub(crate) fn dilate(mask: &[bool], shape: FrameShape, radius: usize) -> Vec<bool> {
    if radius == 0 {
        return mask.to_vec();
    }
    let r_sq = (radius * radius) as f64;
    let mut out = vec![false; mask.len()];
    for (p, _) in mask.iter().enumerate().filter(|(_, &m)| m) {
        for q in shape.window(p, radius) {
            if !out[q] && shape.distance_sq(p, q) <= r_sq {
                out[q] = true;
            }
        }
    }
    out
}

/// Two-pass union-find labeling with face connectivity. Label 0 is background.
pub(crate) fn label_regions(mask: &[bool], shape: FrameShape) -> Vec<u32> {
    let (w, h, d) = (shape.width, shape.height, shape.depth);
    let mut labels = vec![0u32; mask.len()];
    let mut parent = vec![0u32; 1];
    let mut next_label = 1u32;

    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                let idx = shape.index(x, y, z);
                if !mask[idx] {
                    continue;
                }
                let mut neighbors = [0u32; 3];
                if x > 0 {
                    neighbors[0] = labels[idx - 1];
                }
                if y > 0 {
                    neighbors[1] = labels[idx - w];
                }
                if z > 0 {
                    neighbors[2] = labels[idx - w * h];
                }

                let mut root = 0u32;
                for &n in neighbors.iter().filter(|&&n| n > 0) {
                    let rn = find(&mut parent, n);
                    if root == 0 {
                        root = rn;
                    } else if rn != root {
                        union(&mut parent, root, rn);
                        root = root.min(rn);
                    }
                }
                if root == 0 {
                    labels[idx] = next_label;
                    parent.push(next_label);
                    next_label += 1;
                } else {
                    labels[idx] = root;
                }
            }
        }
    }

    for l in labels.iter_mut() {
        if *l > 0 {
            *l = find(&mut parent, *l);
        }
    }
    labels
}

/// Mask of the connected region of `values > 0` that contains `seed`.
/// Empty when `seed` itself is zero.
pub(crate) fn region_containing(values: &[f64], shape: FrameShape, seed: usize) -> Vec<bool> {
    let mask: Vec<bool> = values.iter().map(|&v| v > 0.0).collect();
    if !mask[seed] {
        return vec![false; values.len()];
    }
    let labels = label_regions(&mask, shape);
    let target = labels[seed];
    labels.iter().map(|&l| l == target).collect()
}

// ── Union-Find ──────────────────────────────────────────────────────────────

fn find(parent: &mut [u32], mut x: u32) -> u32 {
    while parent[x as usize] != x {
        parent[x as usize] = parent[parent[x as usize] as usize]; // path halving
        x = parent[x as usize];
    }
    x
}

fn union(parent: &mut [u32], a: u32, b: u32) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra != rb {
        parent[ra.max(rb) as usize] = ra.min(rb);
    }
}

/// Union-find over arbitrary `usize` items, used for grouping merge candidates.
pub(crate) struct DisjointSets {
    parent: Vec<u32>,
}

impl DisjointSets {
    pub(crate) fn new(n: usize) -> Self {
        DisjointSets {
            parent: (0..n as u32).collect(),
        }
    }

    pub(crate) fn join(&mut self, a: usize, b: usize) {
        union(&mut self.parent, a as u32, b as u32);
    }

    /// Groups of two or more members, each sorted, ordered by smallest member.
    pub(crate) fn groups(&mut self) -> Vec<Vec<usize>> {
        let n = self.parent.len();
        let mut by_root: Vec<Vec<usize>> = vec![Vec::new(); n];
        for i in 0..n {
            let r = find(&mut self.parent, i as u32) as usize;
            by_root[r].push(i);
        }
        let mut groups: Vec<Vec<usize>> = by_root.into_iter().filter(|g| g.len() > 1).collect();
        groups.sort_by_key(|g| g[0]);
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blur_preserves_constant_and_mass() {
        let shape = FrameShape::planar(12, 9);
        let kernel = gaussian_kernel(1.5);
        let flat = vec![3.0; shape.pixel_count()];
        let out = gaussian_blur(&flat, shape, &kernel);
        assert!(out.iter().all(|&v| (v - 3.0).abs() < 1e-12));

        let mut impulse = vec![0.0; shape.pixel_count()];
        impulse[shape.index(6, 4, 0)] = 1.0;
        let out = gaussian_blur(&impulse, shape, &kernel);
        let total: f64 = out.iter().sum();
        assert!((total - 1.0).abs() < 1e-9, "interior impulse mass {}", total);
        let peak = out
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, shape.index(6, 4, 0));
    }

    #[test]
    fn test_labels_two_blobs() {
        let shape = FrameShape::planar(8, 4);
        let mut mask = vec![false; 32];
        for &(x, y) in &[(0, 0), (1, 0), (1, 1), (5, 2), (6, 2), (6, 3)] {
            mask[shape.index(x, y, 0)] = true;
        }
        let labels = label_regions(&mask, shape);
        let a = labels[shape.index(0, 0, 0)];
        let b = labels[shape.index(6, 3, 0)];
        assert!(a > 0 && b > 0 && a != b);
        assert_eq!(labels[shape.index(1, 1, 0)], a);
        assert_eq!(labels[shape.index(5, 2, 0)], b);
    }

    #[test]
    fn test_u_shape_merges_labels() {
        // Two arms joined at the bottom row must resolve to one label.
        let shape = FrameShape::planar(3, 3);
        let mut mask = vec![false; 9];
        for &(x, y) in &[(0, 0), (2, 0), (0, 1), (2, 1), (0, 2), (1, 2), (2, 2)] {
            mask[shape.index(x, y, 0)] = true;
        }
        let labels = label_regions(&mask, shape);
        let l = labels[shape.index(0, 0, 0)];
        assert_eq!(labels[shape.index(2, 0, 0)], l);
    }

    #[test]
    fn test_dilate_disk() {
        let shape = FrameShape::planar(9, 9);
        let mut mask = vec![false; 81];
        mask[shape.index(4, 4, 0)] = true;
        let out = dilate(&mask, shape, 2);
        assert_eq!(out.iter().filter(|&&m| m).count(), 13);
        assert!(!out[shape.index(6, 6, 0)]);
        assert!(out[shape.index(6, 4, 0)]);
    }

    #[test]
    fn test_disjoint_sets_groups() {
        let mut sets = DisjointSets::new(6);
        sets.join(4, 1);
        sets.join(1, 3);
        sets.join(0, 5);
        assert_eq!(sets.groups(), vec![vec![0, 5], vec![1, 3, 4]]);
    }
}
