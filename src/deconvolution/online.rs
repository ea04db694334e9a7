/// Streaming deconvolution with bounded memory per component.

use super::oasis::PoolChain;
use super::DeconvParams;

/// One component's causal deconvolution state.
///
/// Holds at most `capacity` recent observations; older pools are committed
/// and only their last two values are kept as context.
#[derive(Clone, Debug)]
pub(crate) struct OnlineDeconvolver {
    params: DeconvParams,
    chain: PoolChain,
}

impl OnlineDeconvolver {
    /// Fresh state whose first observation lands at absolute frame `origin`.
    pub(crate) fn new(params: DeconvParams, capacity: usize, origin: usize) -> Self {
        let chain = PoolChain::resume(&params.g, params.s_min, Some(capacity), origin, 0.0, 0.0);
        OnlineDeconvolver { params, chain }
    }

    /// State continuing a history that was deconvolved in batch.
    ///
    /// The last `capacity / 2` raw observations are replayed into a live
    /// chain; everything before is taken as committed from `c_history`.
    pub(crate) fn resume(params: DeconvParams, capacity: usize, c_history: &[f64], y_history: &[f64]) -> Self {
        let total = y_history.len();
        let tail = (capacity / 2).min(total);
        let origin = total - tail;
        let before = |k: usize| {
            if origin >= k {
                c_history.get(origin - k).copied().unwrap_or(0.0)
            } else {
                0.0
            }
        };
        let chain = PoolChain::resume(&params.g, params.s_min, Some(capacity), origin, before(1), before(2));
        let mut state = OnlineDeconvolver { params, chain };
        for &y in &y_history[origin..] {
            state.push(y);
        }
        state
    }

    fn shift(&self) -> f64 {
        let carried: f64 = self.params.g.iter().sum();
        self.params.baseline + self.params.lambda * (1.0 - carried)
    }

    /// Feed the next raw observation.
    pub(crate) fn push(&mut self, y: f64) {
        let shifted = y - self.shift();
        self.chain.push(shifted);
    }

    /// Rewrite the live segment `[origin, end)` of a full-length trace.
    pub(crate) fn write_into(&mut self, c: &mut [f64], s: &mut [f64]) {
        self.chain.write_into(c, s);
    }

    /// First frame still open to revision.
    pub(crate) fn origin(&self) -> usize {
        self.chain.origin()
    }

    pub(crate) fn end(&self) -> usize {
        self.chain.end()
    }

    pub(crate) fn window_len(&self) -> usize {
        self.chain.window_len()
    }

    pub(crate) fn last_value(&self) -> f64 {
        self.chain.last_value()
    }

    pub(crate) fn params(&self) -> &DeconvParams {
        &self.params
    }
}
