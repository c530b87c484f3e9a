//! ComputeDAG construction, replay and bound inference tests.

use crate::dag::ComputeDAG;
use crate::error::Error;
use crate::expr::Expr;
use crate::op::{Axis, Operation};
use crate::test::helpers::*;

#[test]
fn test_rejects_unknown_producer() {
    let c = Operation::compute(
        "C",
        vec![Axis::new("i", 4)],
        Vec::new(),
        Expr::read("missing", [Expr::var("i")]),
    );
    assert!(matches!(ComputeDAG::new(vec![c]), Err(Error::UnknownProducer { .. })));
}

#[test]
fn test_rejects_reversed_topological_order() {
    let a = Operation::placeholder("A", [4]);
    let c = Operation::compute("C", vec![Axis::new("i", 4)], Vec::new(), Expr::read("A", [Expr::var("i")]));
    // Consumer before producer.
    assert!(matches!(ComputeDAG::new(vec![c, a]), Err(Error::UnknownProducer { .. })));
}

#[test]
fn test_rejects_duplicate_names() {
    let a = Operation::placeholder("A", [4]);
    let b = Operation::placeholder("A", [8]);
    assert!(matches!(ComputeDAG::new(vec![a, b]), Err(Error::DuplicateOperation { .. })));
}

#[test]
fn test_rejects_zero_extent() {
    let a = Operation::placeholder("A", [0]);
    assert!(matches!(ComputeDAG::new(vec![a]), Err(Error::ZeroExtent { .. })));
}

#[test]
fn test_flop_count_matmul() {
    let dag = matmul_dag(64, 32, 16);
    // One multiply per (i, j, k) point.
    assert_eq!(dag.flop_ct(), (64 * 32 * 16) as f64);
}

#[test]
fn test_workload_key_is_stable_and_distinguishes_dags() {
    let a = matmul_dag(64, 64, 64);
    let b = matmul_dag(64, 64, 64);
    let c = matmul_dag(128, 64, 64);
    assert_eq!(a.workload_key(), b.workload_key());
    assert_ne!(a.workload_key(), c.workload_key());
}

#[test]
fn test_replay_and_get_dag_materializes_cache_stage() {
    let dag = matmul_dag(64, 64, 64);
    let mut state = dag.init_state();
    state.cache_write(2, "local").unwrap();

    let replayed = dag.replay_and_get_dag(state.transform_steps()).unwrap();
    assert_eq!(replayed.num_ops(), 4);
    assert!(replayed.op_id("C.local").is_some());

    // Without DAG-mutating steps the original is returned as-is.
    let mut plain = dag.init_state();
    plain.split(2, 0, &[Some(8)], true).unwrap();
    let same = dag.replay_and_get_dag(plain.transform_steps()).unwrap();
    assert!(std::sync::Arc::ptr_eq(&same, &dag));
}

#[test]
fn test_infer_bound_restores_full_extents_at_root() {
    let dag = elementwise_chain_dag(64);
    let mut state = dag.init_state();
    state.split(2, 0, &[Some(8)], true).unwrap();
    state.compute_root(2).unwrap();
    assert!(state.stages()[2].iters.iter().all(|it| it.extent.is_none()));

    let inferred = dag.infer_bound(&state).unwrap();
    let extents: Vec<Option<u64>> = inferred.stages()[2].iters.iter().map(|it| it.extent).collect();
    assert_eq!(extents, vec![Some(8), Some(8)]);
}

#[test]
fn test_infer_bound_resolves_attached_extents() {
    let dag = elementwise_chain_dag(64);
    let mut state = dag.init_state();
    // relu split into 8 x 8; add attached under the outer loop.
    state.split(2, 0, &[Some(8)], true).unwrap();
    state.compute_at(1, 2, 0).unwrap();

    let inferred = dag.infer_bound(&state).unwrap();
    // The outer loop of extent 8 fixes the coarse position; each iteration
    // computes the remaining 64 / 8 elements of add.
    assert_eq!(inferred.stages()[1].iters[0].extent, Some(8));
}

#[test]
fn test_infer_bound_attached_tile_levels() {
    let dag = elementwise_chain_2d_dag(64, 64);
    let mut state = dag.init_state();
    let add = 1;
    let relu = 2;
    // Tile add 2-level on both axes, tile relu 1-level, attach add under
    // relu's first-level j loop.
    state.split(add, 0, &[Some(4)], true).unwrap(); // i -> i.0(16) i.1(4)
    state.split(add, 2, &[Some(4)], true).unwrap(); // j -> j.0(16) j.1(4)
    state.reorder(add, &[0, 2, 1, 3]).unwrap(); // i.0 j.0 i.1 j.1
    state.split(relu, 0, &[Some(4)], true).unwrap();
    state.split(relu, 2, &[Some(4)], true).unwrap();
    state.reorder(relu, &[0, 2, 1, 3]).unwrap();
    state.compute_at(add, relu, 1).unwrap(); // under relu's j.0

    let inferred = dag.infer_bound(&state).unwrap();
    let extents: Vec<Option<u64>> = inferred.stages()[add].iters.iter().map(|it| it.extent).collect();
    // Outside the attach point relu fixes 16 of i and 16 of j; the
    // remaining 4 x 4 tile lands on add's inner parts.
    assert_eq!(extents, vec![Some(1), Some(1), Some(4), Some(4)]);
}

#[test]
fn test_infer_bound_is_idempotent() {
    let dag = matmul_dag(64, 64, 64);
    let mut state = dag.init_state();
    state.split(2, 0, &[Some(4), Some(4)], true).unwrap();
    state.split(2, 4, &[Some(16)], true).unwrap();
    state.set_concrete(true);

    let once = dag.infer_bound(&state).unwrap();
    let twice = dag.infer_bound(&once).unwrap();
    assert_eq!(once, twice);
    assert!(once.stages().iter().all(|s| s.iters.iter().all(|it| it.extent.is_some())));
}
