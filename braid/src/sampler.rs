//! Sampling: the up-front decision of whether a trace is recorded at all.

use crate::error::ConfigError;
use rand::seq::SliceRandom;
use std::fmt;
use std::sync::Mutex;

/// Decides whether a span belonging to `trace_id` should be recorded.
///
/// Implementations see only the lower 64 bits of the trace ID. A sampler that
/// derives its answer purely from the ID is consistent across every process
/// that agrees on the algorithm; the built-in [`CountingSampler`] trades that
/// property for exactness at low volumes and says so in its docs.
pub trait Sampler: Send + Sync + fmt::Debug {
    fn is_sampled(&self, trace_id: u64) -> bool;
}

/// Records every trace. The default.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysSample;

impl Sampler for AlwaysSample {
    fn is_sampled(&self, _trace_id: u64) -> bool {
        true
    }
}

/// Records no traces.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverSample;

impl Sampler for NeverSample {
    fn is_sampled(&self, _trace_id: u64) -> bool {
        false
    }
}

/// Percentage sampler that is exact over every window of 100 decisions.
///
/// A reservoir of 100 pre-shuffled booleans is consumed round-robin, so a
/// rate of 0.1 samples exactly 10 of every 100 traces. This is the right
/// tool for low request volumes where probabilistic samplers are too noisy.
/// The decision ignores the trace ID, so unlike boundary-style samplers it is
/// not consistent across processes.
pub struct CountingSampler {
    decisions: Mutex<Reservoir>,
}

struct Reservoir {
    decisions: Vec<bool>,
    next: usize,
}

impl CountingSampler {
    /// Builds a sampler for `rate`, where 0.01 is 1% of traces. Rates of
    /// exactly 0.0 and 1.0 behave as [`NeverSample`] and [`AlwaysSample`];
    /// anything outside `0.0..=1.0` is a configuration error.
    pub fn new(rate: f32) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&rate) || rate.is_nan() {
            return Err(ConfigError::InvalidSamplingRate(rate));
        }
        let take = (rate * 100.0).round() as usize;
        let mut decisions = vec![false; 100];
        decisions[..take].fill(true);
        decisions.shuffle(&mut rand::rng());
        Ok(CountingSampler {
            decisions: Mutex::new(Reservoir { decisions, next: 0 }),
        })
    }
}

impl Sampler for CountingSampler {
    fn is_sampled(&self, _trace_id: u64) -> bool {
        let mut reservoir = self.decisions.lock().unwrap();
        let decision = reservoir.decisions[reservoir.next];
        reservoir.next = (reservoir.next + 1) % reservoir.decisions.len();
        decision
    }
}

impl fmt::Debug for CountingSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sampled = self
            .decisions
            .lock()
            .map(|r| r.decisions.iter().filter(|&&d| d).count())
            .unwrap_or(0);
        f.debug_struct("CountingSampler")
            .field("rate", &(sampled as f32 / 100.0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_and_never() {
        assert!(AlwaysSample.is_sampled(1));
        assert!(!NeverSample.is_sampled(1));
    }

    #[test]
    fn counting_sampler_is_exact_over_a_window() {
        let sampler = CountingSampler::new(0.3).unwrap();
        let sampled = (0..100).filter(|&id| sampler.is_sampled(id)).count();
        assert_eq!(sampled, 30);

        // next window repeats the reservoir
        let sampled = (0..100).filter(|&id| sampler.is_sampled(id)).count();
        assert_eq!(sampled, 30);
    }

    #[test]
    fn counting_sampler_bounds() {
        assert!(!CountingSampler::new(0.0).unwrap().is_sampled(1));
        assert!(CountingSampler::new(1.0).unwrap().is_sampled(1));
        assert!(matches!(
            CountingSampler::new(1.1),
            Err(ConfigError::InvalidSamplingRate(_))
        ));
        assert!(CountingSampler::new(-0.1).is_err());
    }
}
