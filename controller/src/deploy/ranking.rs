//! Candidate ranking for instance creation

use cloud_api::InstanceConfig;

/// Lower is better: cheap spot price first, wide intranet bandwidth as a bonus
pub fn weight(config: &InstanceConfig) -> f64 {
    config.price.unit_price_discount * 1000.0 - config.instance_bandwidth * 20.0
}

/// Candidates ordered so that the most preferred one is consumed first
///
/// A candidate taken from the queue is gone for good, so a configuration that
/// failed to launch is never retried within the same attempt.
#[derive(Debug, Clone)]
pub struct CandidateQueue {
    // sorted by descending weight, the best candidate sits at the end
    ranked: Vec<InstanceConfig>,
}

impl CandidateQueue {
    pub fn new(mut configs: Vec<InstanceConfig>) -> Self {
        configs.sort_by(|a, b| weight(b).total_cmp(&weight(a)));
        Self { ranked: configs }
    }

    pub fn next_best(&mut self) -> Option<InstanceConfig> {
        self.ranked.pop()
    }

    pub fn len(&self) -> usize {
        self.ranked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }
}
