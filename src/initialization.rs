/// Greedy component initialization and background initialization.
///
/// Centres are picked one at a time at the pixel whose smoothed residual has
/// the largest temporal energy. A rank-1 non-negative factorization over the
/// surrounding window gives the component, which is then subtracted before the
/// next pick.

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::debug;

use crate::config::InitConfig;
use crate::filter::{gaussian_blur, gaussian_kernel, region_containing};
use crate::linalg::{hals_nmf, rank1_nmf};
use crate::stats::{find_median, pearson};
use crate::types::FrameShape;

/// Sweeps of the background factorization.
const BACKGROUND_ITERATIONS: usize = 20;

/// Components found by the greedy search, before any refinement.
#[derive(Clone, Debug)]
pub struct InitResult {
    /// `pixels × K`, unit-norm columns.
    pub a: Array2<f64>,
    /// `K × T`.
    pub c: Array2<f64>,
    /// Pixel index of each component's centre.
    pub centers: Vec<usize>,
    /// `pixels × nb`.
    pub b: Array2<f64>,
    /// `nb × T`.
    pub f: Array2<f64>,
}

/// One locally extracted component.
#[derive(Clone, Debug)]
pub(crate) struct Extracted {
    pub center: usize,
    /// Window pixels and the unpruned rank-1 loading on each.
    pub window: Vec<usize>,
    pub loading: Vec<f64>,
    /// Trace paired with `loading`.
    pub trace: Vec<f64>,
    /// Full-frame pruned footprint, unit norm.
    pub footprint: Vec<f64>,
    /// Trace paired with `footprint`.
    pub footprint_trace: Vec<f64>,
}

/// Rank-1 extraction of a component around `center` from a `pixels × frames`
/// residual. Returns `None` when the window holds no non-negative structure.
pub(crate) fn extract_component(
    residual: &Array2<f64>,
    shape: FrameShape,
    center: usize,
    c_init: &[f64],
    config: &InitConfig,
) -> Option<Extracted> {
    let window = shape.window(center, config.window_radius);
    let block = residual.select(Axis(0), &window);
    let (loading, trace) = rank1_nmf(block.view(), c_init, config.nmf_iterations)?;

    let mut footprint = vec![0.0; shape.pixel_count()];
    for (i, &p) in window.iter().enumerate() {
        if loading[i] <= 0.0 {
            continue;
        }
        let row = block.row(i);
        let corr = match row.as_slice() {
            Some(r) => pearson(r, &trace),
            None => pearson(&row.to_vec(), &trace),
        };
        if corr >= config.min_corr {
            footprint[p] = loading[i];
        }
    }

    let seed = if footprint[center] > 0.0 {
        center
    } else {
        footprint
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .filter(|(_, &v)| v > 0.0)
            .map(|(p, _)| p)?
    };
    let region = region_containing(&footprint, shape, seed);
    for (v, keep) in footprint.iter_mut().zip(&region) {
        if !keep {
            *v = 0.0;
        }
    }

    let norm = footprint.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm <= 0.0 {
        return None;
    }
    footprint.iter_mut().for_each(|v| *v /= norm);
    let footprint_trace = trace.iter().map(|v| v * norm).collect();

    Some(Extracted {
        center,
        window,
        loading,
        trace,
        footprint,
        footprint_trace,
    })
}

/// Mark every pixel within `radius` of `center` (and `center` itself).
pub(crate) fn suppress_disk(mask: &mut [bool], shape: FrameShape, center: usize, radius: f64) {
    mask[center] = true;
    let r_sq = radius * radius;
    for q in shape.window(center, radius.ceil() as usize) {
        if shape.distance_sq(center, q) <= r_sq {
            mask[q] = true;
        }
    }
}

/// Σ w² of the clamped 1-D kernel at every position along an axis of `len`.
fn axis_energy(len: usize, kernel: &[f64]) -> Vec<f64> {
    let radius = kernel.len() / 2;
    (0..len)
        .map(|x| {
            let mut weights = vec![0.0; len];
            for (k, &kv) in kernel.iter().enumerate() {
                let j = (x + k).saturating_sub(radius).min(len - 1);
                weights[j] += kv;
            }
            weights.iter().map(|w| w * w).sum()
        })
        .collect()
}

/// Expected energy of smoothed white noise at every pixel, borders included.
pub(crate) fn smoothed_noise_energy(shape: FrameShape, kernel: &[f64], sn: &[f64]) -> Vec<f64> {
    let ex = axis_energy(shape.width, kernel);
    let ey = axis_energy(shape.height, kernel);
    let ez = if shape.depth > 1 {
        axis_energy(shape.depth, kernel)
    } else {
        vec![1.0]
    };
    let floor = 1e-12 * (1.0 + sn.iter().fold(0.0f64, |m, v| m.max(v * v)));
    (0..shape.pixel_count())
        .map(|p| {
            let (x, y, z) = shape.coords(p);
            (sn[p] * sn[p] * ex[x] * ey[y] * ez[z]).max(floor)
        })
        .collect()
}

/// Blur every frame of a `pixels × frames` matrix.
pub(crate) fn smooth_frames(data: &Array2<f64>, shape: FrameShape, kernel: &[f64]) -> Array2<f64> {
    let columns: Vec<Vec<f64>> = (0..data.ncols())
        .into_par_iter()
        .map(|t| gaussian_blur(&data.column(t).to_vec(), shape, kernel))
        .collect();
    let mut out = Array2::zeros(data.dim());
    for (t, col) in columns.into_iter().enumerate() {
        for (p, v) in col.into_iter().enumerate() {
            out[[p, t]] = v;
        }
    }
    out
}

/// Per-pixel temporal median.
pub(crate) fn pixel_medians(movie: &Array2<f64>) -> Vec<f64> {
    (0..movie.nrows())
        .into_par_iter()
        .map(|p| find_median(&mut movie.row(p).to_vec()))
        .collect()
}

/// Greedy search for up to `config.components` components.
pub fn greedy_roi(movie: &Array2<f64>, shape: FrameShape, sn: &[f64], config: &InitConfig) -> InitResult {
    let (d, n_frames) = movie.dim();
    let medians = pixel_medians(movie);
    let mut residual = movie.clone();
    for (mut row, &m) in residual.outer_iter_mut().zip(&medians) {
        row.mapv_inplace(|v| v - m);
    }

    let kernel = gaussian_kernel(config.gsig);
    let mut smoothed = smooth_frames(&residual, shape, &kernel);
    let mut energy: Vec<f64> = smoothed
        .outer_iter()
        .map(|row| row.iter().map(|v| v * v).sum::<f64>() / n_frames.max(1) as f64)
        .collect();

    let noise_energy = smoothed_noise_energy(shape, &kernel, sn);

    let mut exhausted = vec![false; d];
    let mut footprints: Vec<Vec<f64>> = Vec::new();
    let mut traces: Vec<Vec<f64>> = Vec::new();
    let mut centers = Vec::new();

    while footprints.len() < config.components {
        let Some((center, peak_snr)) = energy
            .iter()
            .zip(&noise_energy)
            .enumerate()
            .filter(|(p, _)| !exhausted[*p])
            .map(|(p, (e, n))| (p, (e / n).sqrt()))
            .max_by(|a, b| a.1.total_cmp(&b.1))
        else {
            break;
        };
        if peak_snr <= config.min_peak_snr || energy[center] <= 0.0 {
            debug!(peak_snr, found = footprints.len(), "greedy search stopped on noise floor");
            break;
        }

        let c_init = smoothed.row(center).to_vec();
        let Some(found) = extract_component(&residual, shape, center, &c_init, config) else {
            suppress_disk(&mut exhausted, shape, center, config.min_distance);
            continue;
        };

        // subtract the unpruned rank-1 estimate and refresh the smoothed energy around it
        let mut lifted = vec![0.0; d];
        for (&p, &v) in found.window.iter().zip(&found.loading) {
            lifted[p] = v;
            let mut row = residual.row_mut(p);
            for (r, c) in row.iter_mut().zip(&found.trace) {
                *r -= v * c;
            }
        }
        let blurred = gaussian_blur(&lifted, shape, &kernel);
        for (p, &w) in blurred.iter().enumerate() {
            if w.abs() <= 1e-15 {
                continue;
            }
            let mut row = smoothed.row_mut(p);
            for (s, c) in row.iter_mut().zip(&found.trace) {
                *s -= w * c;
            }
            energy[p] = row.iter().map(|v| v * v).sum::<f64>() / n_frames.max(1) as f64;
        }

        suppress_disk(&mut exhausted, shape, center, config.min_distance);
        centers.push(center);
        footprints.push(found.footprint);
        traces.push(found.footprint_trace);
    }

    let k = footprints.len();
    let mut a = Array2::zeros((d, k));
    let mut c = Array2::zeros((k, n_frames));
    for (j, (fp, tr)) in footprints.iter().zip(&traces).enumerate() {
        for (p, &v) in fp.iter().enumerate() {
            a[[p, j]] = v;
        }
        for (t, &v) in tr.iter().enumerate() {
            c[[j, t]] = v;
        }
    }
    debug!(components = k, "greedy initialization done");

    InitResult {
        a,
        c,
        centers,
        b: Array2::zeros((d, 0)),
        f: Array2::zeros((0, n_frames)),
    }
}

/// Rank-`nb` non-negative background of `movie − A C`.
///
/// Starts from the per-pixel median with a flat trace; extra components are
/// seeded from `seed`.
pub fn initialize_background(
    movie: &Array2<f64>,
    a: &Array2<f64>,
    c: &Array2<f64>,
    nb: usize,
    seed: u64,
) -> (Array2<f64>, Array2<f64>) {
    let (d, n_frames) = movie.dim();
    let mut positive = movie - &a.dot(c);
    positive.mapv_inplace(|v| v.max(0.0));

    let medians = pixel_medians(&positive);
    let scale = medians.iter().sum::<f64>() / d.max(1) as f64;
    let mut rng = StdRng::seed_from_u64(seed);

    let mut b = Array2::zeros((d, nb));
    let mut f = Array2::zeros((nb, n_frames));
    for (p, &m) in medians.iter().enumerate() {
        b[[p, 0]] = m;
    }
    f.row_mut(0).fill(1.0);
    for j in 1..nb {
        for p in 0..d {
            b[[p, j]] = scale * rng.random::<f64>();
        }
        for t in 0..n_frames {
            f[[j, t]] = rng.random::<f64>();
        }
    }

    hals_nmf(&positive, &mut b, &mut f, BACKGROUND_ITERATIONS);
    (b, f)
}

/// Greedy components plus background.
pub fn initialize(movie: &Array2<f64>, shape: FrameShape, sn: &[f64], config: &InitConfig, seed: u64) -> InitResult {
    let mut result = greedy_roi(movie, shape, sn, config);
    let (b, f) = initialize_background(movie, &result.a, &result.c, config.background_components, seed);
    result.b = b;
    result.f = f;
    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::stats::testutil::Lcg;

    /// Gaussian blobs with sparse AR(1) activity on a flat background plus noise.
    pub(crate) fn blob_movie(
        shape: FrameShape,
        centers: &[(usize, usize)],
        frames: usize,
        sigma: f64,
        seed: u64,
    ) -> (Array2<f64>, Vec<Vec<f64>>) {
        let mut rng = Lcg(seed);
        let mut traces = Vec::new();
        for _ in centers {
            let mut c = 0.0;
            let tr: Vec<f64> = (0..frames)
                .map(|_| {
                    c = 0.9 * c + if rng.uniform() < 0.05 { 2.0 + rng.uniform() } else { 0.0 };
                    c
                })
                .collect();
            traces.push(tr);
        }
        let movie = render_movie(shape, centers, &traces, frames, sigma, &mut rng);
        (movie, traces)
    }

    /// Gaussian blobs (σ = 1.5 px, peak gain 3) driven by `traces`, on a unit
    /// background, plus white noise of std `sigma`.
    pub(crate) fn render_movie(
        shape: FrameShape,
        centers: &[(usize, usize)],
        traces: &[Vec<f64>],
        frames: usize,
        sigma: f64,
        rng: &mut Lcg,
    ) -> Array2<f64> {
        let d = shape.pixel_count();
        let mut movie = Array2::from_elem((d, frames), 1.0);
        for (&(cx, cy), tr) in centers.iter().zip(traces) {
            for p in 0..d {
                let (x, y, _) = shape.coords(p);
                let r2 = (x as f64 - cx as f64).powi(2) + (y as f64 - cy as f64).powi(2);
                let w = (-r2 / (2.0 * 1.5 * 1.5)).exp();
                if w < 0.05 {
                    continue;
                }
                for t in 0..frames {
                    movie[[p, t]] += 3.0 * w * tr[t];
                }
            }
        }
        movie.mapv_inplace(|v| v + sigma * rng.normal());
        movie
    }

    #[test]
    fn test_finds_separated_sources() {
        let shape = FrameShape::planar(32, 32);
        let truth = [(8, 8), (24, 10), (15, 24)];
        let (movie, traces) = blob_movie(shape, &truth, 300, 0.2, 3);
        let sn = vec![0.2; shape.pixel_count()];
        let config = InitConfig {
            components: 3,
            ..InitConfig::default()
        };
        let result = initialize(&movie, shape, &sn, &config, 0);
        assert_eq!(result.a.ncols(), 3);
        assert!(result.a.iter().all(|&v| v >= 0.0));

        for (&(cx, cy), tr) in truth.iter().zip(&traces) {
            let hit = result.centers.iter().position(|&p| {
                let (x, y, _) = shape.coords(p);
                (x as f64 - cx as f64).abs() <= 2.0 && (y as f64 - cy as f64).abs() <= 2.0
            });
            let k = hit.unwrap_or_else(|| panic!("no centre near ({}, {})", cx, cy));
            let corr = pearson(&result.c.row(k).to_vec(), tr);
            assert!(corr > 0.9, "trace corr {} at ({}, {})", corr, cx, cy);
        }

        assert_eq!(result.b.dim(), (shape.pixel_count(), 1));
        let mean_b = result.b.column(0).mean().unwrap() * result.f.row(0).mean().unwrap();
        assert!((mean_b - 1.0).abs() < 0.2, "background level {}", mean_b);
    }

    #[test]
    fn test_pure_noise_stops_early() {
        let shape = FrameShape::planar(16, 16);
        let (movie, _) = blob_movie(shape, &[], 200, 0.5, 9);
        let sn = vec![0.5; shape.pixel_count()];
        let result = greedy_roi(&movie, shape, &sn, &InitConfig::default());
        assert!(result.a.ncols() < 2, "found {} components in noise", result.a.ncols());
    }

    #[test]
    fn test_background_rank_two_is_seeded() {
        let shape = FrameShape::planar(6, 6);
        let (movie, _) = blob_movie(shape, &[], 50, 0.1, 1);
        let a = Array2::zeros((36, 0));
        let c = Array2::zeros((0, 50));
        let (b1, f1) = initialize_background(&movie, &a, &c, 2, 7);
        let (b2, f2) = initialize_background(&movie, &a, &c, 2, 7);
        assert_eq!(b1, b2);
        assert_eq!(f1, f2);
        assert!(b1.iter().chain(f1.iter()).all(|&v| v >= 0.0));
    }
}
