/// Robust order statistics and correlations shared by every stage.

/// k-th smallest element. Reorders the slice in place.
pub(crate) fn select_kth(data: &mut [f64], k: usize) -> f64 {
    let (_, kth, _) = data.select_nth_unstable_by(k, |a, b| a.total_cmp(b));
    *kth
}

/// Median by selection (upper median for even lengths). Reorders the slice.
pub(crate) fn find_median(data: &mut [f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let k = data.len() / 2;
    select_kth(data, k)
}

/// Percentile in [0, 100] by nearest rank. Reorders the slice.
pub(crate) fn percentile(data: &mut [f64], pct: f64) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let rank = (pct.clamp(0.0, 100.0) / 100.0 * (data.len() - 1) as f64).round() as usize;
    select_kth(data, rank)
}

pub(crate) fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

pub(crate) fn variance(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let m = mean(data);
    data.iter().map(|&v| (v - m) * (v - m)).sum::<f64>() / data.len() as f64
}

/// Pearson correlation. Zero when either input is constant.
pub(crate) fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let ma = mean(&a[..n]);
    let mb = mean(&b[..n]);
    let mut sab = 0.0;
    let mut saa = 0.0;
    let mut sbb = 0.0;
    for i in 0..n {
        let da = a[i] - ma;
        let db = b[i] - mb;
        sab += da * db;
        saa += da * da;
        sbb += db * db;
    }
    if saa <= f64::EPSILON || sbb <= f64::EPSILON {
        return 0.0;
    }
    sab / (saa * sbb).sqrt()
}

/// Cosine similarity of two non-negative vectors.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na <= f64::EPSILON || nb <= f64::EPSILON {
        return 0.0;
    }
    dot / (na * nb)
}
