//! Measurement interface.
//!
//! The policy treats building and running candidates as an external
//! collaborator: it hands a batch of [`MeasureInput`]s to a [`Measurer`] and
//! gets per-candidate [`MeasureResult`]s back, in input order. Builder or
//! runner failures are encoded in the result's costs (a large sentinel) so
//! the cost model learns to avoid them; only cancellation or infrastructure
//! collapse surface as an error return, which ends the search gracefully.

use zorya_dag::State;

use crate::config::SearchTask;
use crate::error::Result;

/// Sentinel cost recorded for candidates that failed to build or run.
pub const FAILURE_COST: f64 = 1e10;

/// One candidate handed to the measurer.
#[derive(Debug, Clone)]
pub struct MeasureInput {
    pub workload_key: String,
    pub state: State,
}

impl MeasureInput {
    pub fn new(task: &SearchTask, state: State) -> Self {
        Self { workload_key: task.workload_key.clone(), state }
    }
}

/// Outcome of measuring one candidate.
#[derive(Debug, Clone)]
pub struct MeasureResult {
    /// Wall-clock costs of the benchmark repeats, in seconds.
    pub costs: Vec<f64>,
    /// Builder/runner diagnostic when the candidate failed.
    pub error_msg: Option<String>,
}

impl MeasureResult {
    pub fn ok(costs: impl Into<Vec<f64>>) -> Self {
        Self { costs: costs.into(), error_msg: None }
    }

    pub fn failed(error_msg: impl Into<String>) -> Self {
        Self { costs: vec![FAILURE_COST], error_msg: Some(error_msg.into()) }
    }

    pub fn is_failure(&self) -> bool {
        self.error_msg.is_some()
    }

    /// Mean cost over repeats; the sentinel for failed candidates.
    pub fn mean_cost(&self) -> f64 {
        if self.costs.is_empty() {
            return FAILURE_COST;
        }
        self.costs.iter().sum::<f64>() / self.costs.len() as f64
    }
}

/// Builds and runs candidate programs.
///
/// `measure` is synchronous from the policy's perspective and must return
/// results in input order; internal parallelism is the implementation's
/// business. An `Err` return means cancellation: the policy stops searching
/// and returns its current best state.
pub trait Measurer {
    fn measure(&mut self, task: &SearchTask, inputs: &[MeasureInput]) -> Result<Vec<MeasureResult>>;
}
