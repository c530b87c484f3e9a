//! Cost model interface and the random cold-start baseline.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use zorya_dag::State;

use crate::config::SearchTask;
use crate::measure::{MeasureInput, MeasureResult};

/// Predicts relative performance of candidate states.
///
/// `predict` must be total: unseen states still get a finite score. Higher
/// scores are better.
pub trait CostModel {
    /// Retrain on observed (program, measured latency) pairs.
    fn update(&mut self, inputs: &[MeasureInput], results: &[MeasureResult]);

    /// Score each state; higher is better.
    fn predict(&mut self, task: &SearchTask, states: &[State]) -> Vec<f32>;

    /// Whether the model's scores carry information. The policy skips the
    /// evolutionary phase when they do not.
    fn is_informative(&self) -> bool {
        true
    }
}

/// Cold-start baseline: uniform random scores, no-op updates.
///
/// Its presence tells the policy the model is uninformative, so candidate
/// selection degrades to uniform sampling.
#[derive(Debug)]
pub struct RandomModel {
    rng: StdRng,
}

impl RandomModel {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }
}

impl CostModel for RandomModel {
    fn update(&mut self, _inputs: &[MeasureInput], _results: &[MeasureResult]) {}

    fn predict(&mut self, _task: &SearchTask, states: &[State]) -> Vec<f32> {
        states.iter().map(|_| self.rng.gen_range(0.0..1.0)).collect()
    }

    fn is_informative(&self) -> bool {
        false
    }
}
