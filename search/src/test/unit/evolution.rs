//! Evolutionary refinement tests with informative cost models.

use zorya_dag::State;

use crate::config::{SearchParams, SearchTask};
use crate::cost_model::CostModel;
use crate::measure::{MeasureInput, MeasureResult};
use crate::policy::SketchSearchPolicy;
use crate::test::helpers::*;

/// Deterministic "informative" model: prefers schedules with fewer steps.
struct StepCountModel;

impl CostModel for StepCountModel {
    fn update(&mut self, _inputs: &[MeasureInput], _results: &[MeasureResult]) {}

    fn predict(&mut self, _task: &SearchTask, states: &[State]) -> Vec<f32> {
        states.iter().map(|s| -(s.transform_steps().len() as f32)).collect()
    }
}

/// Model that always returns NaN; the policy must degrade gracefully.
struct NanModel;

impl CostModel for NanModel {
    fn update(&mut self, _inputs: &[MeasureInput], _results: &[MeasureResult]) {}

    fn predict(&mut self, _task: &SearchTask, states: &[State]) -> Vec<f32> {
        states.iter().map(|_| f32::NAN).collect()
    }
}

fn small_params() -> SearchParams {
    SearchParams::builder()
        .sample_init_min_population(10)
        .evolution_population(16)
        .evolution_num_iters(2)
        .build()
}

#[test]
fn test_informative_model_takes_evolutionary_path() {
    let mut measurer = MockMeasurer::new();
    let mut policy =
        SketchSearchPolicy::new(matmul_task(256, 256, 256), Box::new(StepCountModel), small_params(), 0);
    let best = policy.search(8, -1, 4, &mut measurer).unwrap();
    assert!(measurer.calls >= 1);
    assert!(!best.transform_steps().is_empty());
}

#[test]
fn test_nan_scores_degrade_to_insertion_order() {
    let mut measurer = MockMeasurer::new();
    let mut policy = SketchSearchPolicy::new(matmul_task(256, 256, 256), Box::new(NanModel), small_params(), 0);
    let best = policy.search(8, -1, 4, &mut measurer).unwrap();
    assert!(measurer.calls >= 1);
    assert!(!best.transform_steps().is_empty());
}

#[test]
fn test_evolution_with_measured_seed_states() {
    // After a first search the measured states feed the next round's
    // population without breaking anything.
    let mut measurer = MockMeasurer::new();
    let mut policy =
        SketchSearchPolicy::new(matmul_task(256, 256, 256), Box::new(StepCountModel), small_params(), 0);
    policy.search(4, -1, 2, &mut measurer).unwrap();
    let measured_before = policy.measured_states().len();
    assert!(measured_before > 0);

    policy.search(4, -1, 2, &mut measurer).unwrap();
    assert!(policy.measured_states().len() >= measured_before);
}

#[test]
fn test_evolutionary_candidates_are_valid_states() {
    let mut measurer = MockMeasurer::new();
    let mut policy =
        SketchSearchPolicy::new(reduce_task(512, 512), Box::new(StepCountModel), small_params(), 0);
    let best = policy.search(6, -1, 3, &mut measurer).unwrap();

    // Whatever evolution produced still replays cleanly.
    let replayed = State::replay(best.dag(), best.transform_steps()).unwrap();
    assert_eq!(replayed.transform_steps(), best.transform_steps());
    assert!(best.attach_map().is_consistent());
}
