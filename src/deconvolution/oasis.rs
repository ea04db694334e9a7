/// Pool-adjacent-violators solver for AR(1)/AR(2) spike deconvolution.
///
/// A pool is a maximal run of samples with a single event at its start:
/// `c[start + k] = v h[k] + g2 c[start - 1] h[k - 1]`, where `h` is the AR
/// impulse response. Pools are pushed one sample at a time and merged backward
/// while the event at a pool start is smaller than `s_min`.
///
/// AR(1) merges are O(1) through running sums. AR(2) merges re-solve the
/// merged pool over its samples (greedy; exact for AR(1) only).

use std::collections::VecDeque;

#[derive(Clone, Debug)]
struct Pool {
    /// Absolute sample index of the pool's first sample.
    start: usize,
    len: usize,
    value: f64,
    /// `c[start - 1]` and `c[start - 2]`, fixed when the pool was opened.
    before1: f64,
    before2: f64,
    /// Σ (y_k − g2 before1 h_{k−1}) h_k and Σ h_k²
    sum_yh: f64,
    sum_hh: f64,
}

/// Chain of pools over a window of observations starting at `origin`.
///
/// With a capacity, the oldest pools are committed once the window grows past
/// it; committed values are frozen and only the two most recent ones are kept
/// as context for the first live pool.
#[derive(Clone, Debug)]
pub(crate) struct PoolChain {
    g1: f64,
    g2: f64,
    s_min: f64,
    h: Vec<f64>,
    pools: VecDeque<Pool>,
    y: VecDeque<f64>,
    origin: usize,
    /// `c[origin - 1]`, `c[origin - 2]`
    frozen: (f64, f64),
    capacity: Option<usize>,
}

impl PoolChain {
    pub(crate) fn new(g: &[f64], s_min: f64, capacity: Option<usize>) -> Self {
        let g1 = g.first().copied().unwrap_or(0.0);
        let g2 = g.get(1).copied().unwrap_or(0.0);
        PoolChain {
            g1,
            g2,
            s_min,
            h: vec![1.0],
            pools: VecDeque::new(),
            y: VecDeque::new(),
            origin: 0,
            frozen: (0.0, 0.0),
            capacity,
        }
    }

    /// Chain whose first sample sits at `origin`, after committed values
    /// `c[origin - 1] = before1` and `c[origin - 2] = before2`.
    pub(crate) fn resume(
        g: &[f64],
        s_min: f64,
        capacity: Option<usize>,
        origin: usize,
        before1: f64,
        before2: f64,
    ) -> Self {
        let mut chain = Self::new(g, s_min, capacity);
        chain.origin = origin;
        chain.frozen = (before1.max(0.0), before2.max(0.0));
        chain
    }

    pub(crate) fn origin(&self) -> usize {
        self.origin
    }

    /// Absolute index one past the last observation.
    pub(crate) fn end(&self) -> usize {
        self.origin + self.y.len()
    }

    /// Observations currently held.
    pub(crate) fn window_len(&self) -> usize {
        self.y.len()
    }

    fn ensure_h(&mut self, n: usize) {
        while self.h.len() < n {
            let k = self.h.len();
            let prev2 = if k >= 2 { self.h[k - 2] } else { 0.0 };
            let next = self.g1 * self.h[k - 1] + self.g2 * prev2;
            self.h.push(next);
        }
    }

    #[inline]
    fn h_at(&self, k: isize) -> f64 {
        if k < 0 {
            0.0
        } else {
            self.h.get(k as usize).copied().unwrap_or(0.0)
        }
    }

    #[inline]
    fn pool_value_at(&self, pool: &Pool, k: usize) -> f64 {
        pool.value * self.h_at(k as isize) + self.g2 * pool.before1 * self.h_at(k as isize - 1)
    }

    /// Last two denoised values `(c[end - 1], c[end - 2])`.
    fn tail_values(&self) -> (f64, f64) {
        match self.pools.back() {
            None => self.frozen,
            Some(last) => {
                let v1 = self.pool_value_at(last, last.len - 1);
                let v2 = if last.len >= 2 {
                    self.pool_value_at(last, last.len - 2)
                } else {
                    last.before1
                };
                (v1, v2)
            }
        }
    }

    fn spike(&self, pool: &Pool) -> f64 {
        pool.value - self.g1 * pool.before1 - self.g2 * pool.before2
    }

    /// Append one (already shifted) observation and restore feasibility.
    pub(crate) fn push(&mut self, y: f64) {
        let start = self.end();
        let (before1, before2) = self.tail_values();
        self.y.push_back(y);
        self.pools.push_back(Pool {
            start,
            len: 1,
            value: y,
            before1,
            before2,
            sum_yh: y,
            sum_hh: 1.0,
        });
        self.resolve();
        if let Some(cap) = self.capacity {
            while self.y.len() > cap {
                self.commit_oldest(cap);
            }
        }
    }

    fn resolve(&mut self) {
        while self.pools.len() >= 2 {
            let last = &self.pools[self.pools.len() - 1];
            if self.spike(last) >= self.s_min {
                break;
            }
            self.merge_last_two();
        }
        if self.pools.len() == 1 {
            let lower = self.g1 * self.frozen.0 + self.g2 * self.frozen.1;
            let first = &mut self.pools[0];
            if first.value < lower {
                first.value = lower;
            }
        }
    }

    fn merge_last_two(&mut self) {
        let Some(tail) = self.pools.pop_back() else {
            return;
        };
        let n = self.pools.len();
        let head_len = self.pools[n - 1].len;
        let merged_len = head_len + tail.len;
        self.ensure_h(merged_len + 1);

        if self.g2 == 0.0 {
            let hl = self.h[head_len];
            let head = &mut self.pools[n - 1];
            head.sum_yh += hl * tail.sum_yh;
            head.sum_hh += hl * hl * tail.sum_hh;
            head.len = merged_len;
            head.value = head.sum_yh / head.sum_hh;
        } else {
            let (start, before1) = {
                let head = &self.pools[n - 1];
                (head.start, head.before1)
            };
            let offset = start - self.origin;
            let mut sum_yh = 0.0;
            let mut sum_hh = 0.0;
            for k in 0..merged_len {
                let hk = self.h[k];
                let carry = self.g2 * before1 * self.h_at(k as isize - 1);
                sum_yh += (self.y[offset + k] - carry) * hk;
                sum_hh += hk * hk;
            }
            let head = &mut self.pools[n - 1];
            head.len = merged_len;
            head.sum_yh = sum_yh;
            head.sum_hh = sum_hh;
            head.value = sum_yh / sum_hh;
        }
    }

    /// Drop the oldest pool (or the oldest part of a single long pool) so that
    /// the window fits `cap`, freezing its last two values as context.
    fn commit_oldest(&mut self, cap: usize) {
        let excess = self.y.len() - cap;
        let Some(first) = self.pools.front().cloned() else {
            return;
        };
        let cut = if self.pools.len() >= 2 {
            first.len
        } else {
            // single pool: keep the most recent half of the window live
            (first.len - cap / 2).max(excess)
        };

        let c_last = self.pool_value_at(&first, cut - 1);
        let c_prev = if cut >= 2 {
            self.pool_value_at(&first, cut - 2)
        } else {
            first.before1
        };

        if cut == first.len {
            self.pools.pop_front();
        } else {
            let remaining = first.len - cut;
            let start = first.start + cut;
            let value = self.pool_value_at(&first, cut);
            self.ensure_h(remaining + 1);
            let offset = start - self.origin;
            let mut sum_yh = 0.0;
            let mut sum_hh = 0.0;
            for k in 0..remaining {
                let hk = self.h[k];
                let carry = self.g2 * c_last * self.h_at(k as isize - 1);
                sum_yh += (self.y[offset + k] - carry) * hk;
                sum_hh += hk * hk;
            }
            let head = &mut self.pools[0];
            head.start = start;
            head.len = remaining;
            head.before1 = c_last;
            head.before2 = c_prev;
            head.sum_yh = sum_yh;
            head.sum_hh = sum_hh;
            head.value = value;
        }
        self.y.drain(..cut);
        self.origin += cut;
        self.frozen = (c_last.max(0.0), c_prev.max(0.0));
    }

    /// Write denoised values and events for `[origin, end)` into absolute-indexed slices.
    pub(crate) fn write_into(&mut self, c: &mut [f64], s: &mut [f64]) {
        let longest = self.pools.iter().map(|p| p.len).max().unwrap_or(0);
        self.ensure_h(longest + 1);
        for pool in &self.pools {
            for k in 0..pool.len {
                let t = pool.start + k;
                c[t] = self.pool_value_at(pool, k).max(0.0);
                s[t] = 0.0;
            }
            s[pool.start] = self.spike(pool).max(0.0);
        }
    }

    /// Denoised value of the most recent sample.
    pub(crate) fn last_value(&self) -> f64 {
        self.tail_values().0.max(0.0)
    }
}

/// Batch OASIS on `y` with penalty `lambda`: returns `(c, s)`.
///
/// The penalty enters as a per-sample shift `λ(1 − Σ_i g_i [t ≤ T−1−i])`.
pub(crate) fn oasis(y: &[f64], g: &[f64], lambda: f64, s_min: f64) -> (Vec<f64>, Vec<f64>) {
    let n = y.len();
    let mut chain = PoolChain::new(g, s_min, None);
    for (t, &v) in y.iter().enumerate() {
        chain.push(v - penalty_shift(g, lambda, t, n));
    }
    let mut c = vec![0.0; n];
    let mut s = vec![0.0; n];
    chain.write_into(&mut c, &mut s);
    (c, s)
}

pub(crate) fn penalty_shift(g: &[f64], lambda: f64, t: usize, n: usize) -> f64 {
    let carried: f64 = g
        .iter()
        .enumerate()
        .filter(|(i, _)| t + 1 + i < n)
        .map(|(_, gi)| gi)
        .sum();
    lambda * (1.0 - carried)
}
