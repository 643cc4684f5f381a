//! Load-aware signer selection
//!
//! Signer `i` is drawn with weight `e^(-pending_i)`, so an idle signer is
//! exponentially more likely to get the next request than a busy one.

use rand::Rng;

#[derive(Debug, Default, Clone, Copy)]
pub struct SignerSelector;

impl SignerSelector {
    pub fn new() -> Self {
        Self
    }

    /// Pick a signer index for the given pending counts
    pub fn sample(&self, pending: &[u64]) -> Option<usize> {
        self.sample_with(&mut rand::thread_rng(), pending)
    }

    /// Same as [`sample`](Self::sample) with an explicit source of randomness
    pub fn sample_with<R: Rng + ?Sized>(&self, rng: &mut R, pending: &[u64]) -> Option<usize> {
        let last = pending.len().checked_sub(1)?;

        let cumulative: Vec<f64> = pending
            .iter()
            .scan(0.0, |sum, &count| {
                *sum += weight(count);
                Some(*sum)
            })
            .collect();

        let total = cumulative[last];
        let draw = rng.gen::<f64>() * total;

        Some(
            cumulative
                .iter()
                .position(|&c| c >= draw)
                .unwrap_or(last),
        )
    }
}

fn weight(pending: u64) -> f64 {
    (-(pending as f64)).exp()
}
