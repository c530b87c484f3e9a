//! Loop-state mutator and replay tests.

use test_case::test_case;

use crate::error::Error;
use crate::state::{ComputeAt, IterAnnotation, IterKind, State, extract_original_iterators};
use crate::steps::TransformStep;
use crate::test::helpers::*;

#[test]
fn test_init_state_mirrors_ops() {
    let dag = matmul_dag(64, 64, 64);
    let state = dag.init_state();
    assert_eq!(state.stages().len(), 3);
    assert!(state.stages()[0].is_placeholder());
    assert!(state.stages()[1].is_placeholder());

    let c = &state.stages()[2];
    assert_eq!(c.iters.len(), 3);
    assert_eq!(c.iters[0].name, "i");
    assert_eq!(c.iters[2].kind, IterKind::Reduction);
    assert_eq!(c.iters[2].extent, Some(64));
}

#[test]
fn test_split_known_lengths() {
    let dag = matmul_dag(64, 64, 64);
    let mut state = dag.init_state();
    let range = state.split(2, 0, &[Some(4), Some(8)], true).unwrap();
    assert_eq!(range, 0..3);

    let iters = &state.stages()[2].iters;
    assert_eq!(iters[0].name, "i.0");
    assert_eq!(iters[1].name, "i.1");
    assert_eq!(iters[2].name, "i.2");
    // 64 / (4 * 8) = 2 outer iterations.
    assert_eq!(iters[0].extent, Some(2));
    assert_eq!(iters[1].extent, Some(4));
    assert_eq!(iters[2].extent, Some(8));
    // j and k shifted right.
    assert_eq!(iters[3].name, "j");
    assert_eq!(iters[4].name, "k");
}

#[test_case(10, &[3], true, &[4, 3]; "outer absorbs rounding")]
#[test_case(10, &[3], false, &[3, 4]; "inner absorbs rounding")]
fn test_split_rounding(extent: u64, lengths: &[u64], inner_to_outer: bool, expected: &[u64]) {
    let dag = reduce_dag(extent, 4);
    let mut state = dag.init_state();
    let lengths: Vec<Option<u64>> = lengths.iter().map(|&l| Some(l)).collect();
    state.split(1, 0, &lengths, inner_to_outer).unwrap();
    let extents: Vec<u64> = state.stages()[1].iters[..expected.len()]
        .iter()
        .map(|it| it.extent.unwrap())
        .collect();
    assert_eq!(extents, expected);
}

#[test]
fn test_split_unknown_lengths() {
    let dag = matmul_dag(64, 64, 64);
    let mut state = dag.init_state();
    state.split(2, 0, &[None, Some(8)], true).unwrap();

    let iters = &state.stages()[2].iters;
    assert_eq!(iters[0].extent, None, "derived part is unknown");
    assert_eq!(iters[1].extent, None);
    assert_eq!(iters[2].extent, Some(8));

    // The step records the pre-split extent for the tile filler.
    let TransformStep::Split { extent, .. } = &state.transform_steps()[0] else {
        panic!("expected a split step");
    };
    assert_eq!(*extent, Some(64));
}

#[test]
fn test_split_out_of_range_is_fatal() {
    let dag = matmul_dag(64, 64, 64);
    let mut state = dag.init_state();
    let err = state.split(2, 9, &[Some(4)], true).unwrap_err();
    assert!(matches!(err, Error::IterOutOfRange { .. }));
}

#[test]
fn test_fuse_contiguous() {
    let dag = matmul_dag(64, 32, 16);
    let mut state = dag.init_state();
    let pos = state.fuse(2, &[0, 1]).unwrap();
    assert_eq!(pos, 0);

    let iters = &state.stages()[2].iters;
    assert_eq!(iters.len(), 2);
    assert_eq!(iters[0].name, "i@j");
    assert_eq!(iters[0].extent, Some(64 * 32));
    assert_eq!(iters[0].kind, IterKind::Spatial);
}

#[test]
fn test_fuse_mixed_kind_is_reduction() {
    let dag = reduce_dag(8, 8);
    let mut state = dag.init_state();
    state.fuse(1, &[0, 1]).unwrap();
    assert_eq!(state.stages()[1].iters[0].kind, IterKind::Reduction);
}

#[test]
fn test_fuse_non_contiguous_is_fatal() {
    let dag = matmul_dag(64, 64, 64);
    let mut state = dag.init_state();
    let err = state.fuse(2, &[0, 2]).unwrap_err();
    assert!(matches!(err, Error::NonContiguousFuse { .. }));
}

#[test]
fn test_reorder() {
    let dag = matmul_dag(64, 64, 64);
    let mut state = dag.init_state();
    state.reorder(2, &[2, 0, 1]).unwrap();
    let names: Vec<&str> = state.stages()[2].iters.iter().map(|it| it.name.as_str()).collect();
    assert_eq!(names, ["k", "i", "j"]);
}

#[test]
fn test_reorder_rejects_non_permutation() {
    let dag = matmul_dag(64, 64, 64);
    let mut state = dag.init_state();
    assert!(matches!(state.reorder(2, &[0, 0, 1]), Err(Error::InvalidReorder { .. })));
    assert!(matches!(state.reorder(2, &[0, 1]), Err(Error::InvalidReorder { .. })));
}

#[test]
fn test_compute_at_updates_attach_map_and_bounds() {
    let dag = elementwise_chain_dag(64);
    let mut state = dag.init_state();
    state.split(2, 0, &[Some(8)], true).unwrap();
    state.compute_at(1, 2, 0).unwrap();

    assert_eq!(state.stages()[1].compute_at, ComputeAt::Iter);
    assert_eq!(state.attach_map().attach_target(1), Some((2, 0)));
    assert_eq!(state.attach_map().attached_stages(2, 0), &[1]);
    assert!(state.attach_map().is_consistent());
    // Extents are conditional on the target nest until bound inference.
    assert!(state.stages()[1].iters.iter().all(|it| it.extent.is_none()));
}

#[test]
fn test_compute_root_detaches() {
    let dag = elementwise_chain_dag(64);
    let mut state = dag.init_state();
    state.split(2, 0, &[Some(8)], true).unwrap();
    state.compute_at(1, 2, 0).unwrap();
    state.compute_root(1).unwrap();

    assert_eq!(state.stages()[1].compute_at, ComputeAt::Root);
    assert!(state.attach_map().is_empty());
    assert!(state.attach_map().is_consistent());
}

#[test]
fn test_compute_inline() {
    let dag = elementwise_chain_dag(64);
    let mut state = dag.init_state();
    state.compute_inline(1).unwrap();
    assert_eq!(state.stages()[1].compute_at, ComputeAt::Inlined);
}

#[test]
fn test_compute_inline_rejects_reduction() {
    let dag = reduce_dag(64, 64);
    let mut state = dag.init_state();
    assert!(matches!(state.compute_inline(1), Err(Error::NotInlinable { .. })));
}

#[test]
fn test_compute_inline_rejects_output() {
    let dag = elementwise_chain_dag(64);
    let mut state = dag.init_state();
    assert!(matches!(state.compute_inline(2), Err(Error::NotInlinable { .. })));
}

#[test]
fn test_cache_write_inserts_stage() {
    let dag = matmul_dag(64, 64, 64);
    let mut state = dag.init_state();
    let cache_id = state.cache_write(2, "local").unwrap();
    assert_eq!(cache_id, 2);
    assert_eq!(state.stages().len(), 4);
    assert_eq!(state.stages()[2].op.name, "C.local");
    assert_eq!(state.stages()[3].op.name, "C");

    // The cache stage carries the reduction; the original became a copy.
    assert!(state.stages()[2].has_reduce_iter());
    assert!(!state.stages()[3].has_reduce_iter());

    // The replayed DAG sees the copy as elementwise consumer of the cache.
    let dag2 = state.resolved_dag();
    assert!(dag2.access().elementwise_match(dag2.ops(), 2, 3));
    assert!(dag2.access().needs_multi_level_tiling(2));
    assert!(dag2.access().is_output(3));
}

#[test]
fn test_cache_read_inserts_stage_after_producer() {
    let dag = matmul_dag(64, 64, 64);
    let mut state = dag.init_state();
    let cache_id = state.cache_read(0, "shared", &[2]).unwrap();
    assert_eq!(cache_id, 1);
    assert_eq!(state.stages().len(), 4);
    assert_eq!(state.stages()[1].op.name, "A.shared");

    // The reader now reads the cache, not the placeholder.
    let dag2 = state.resolved_dag();
    let consumers = dag2.access().consumers(&state, 1);
    assert!(consumers.contains(&3), "C (now stage 3) reads A.shared");
    assert!(dag2.access().consumers(&state, 0).contains(&1));
}

#[test]
fn test_rfactor_inserts_intermediate_stage() {
    let dag = reduce_dag(64, 64);
    let mut state = dag.init_state();
    state.split(1, 1, &[Some(8)], true).unwrap();
    let rf_id = state.rfactor(1, 1, 1).unwrap();
    assert_eq!(rf_id, 1);
    assert_eq!(state.stages().len(), 3);
    assert_eq!(state.stages()[1].op.name, "C.rf");
    assert_eq!(state.stages()[2].op.name, "C");

    // rf stage: spatial [i, k.0], reduction [k.1].
    let rf = &state.stages()[1];
    assert_eq!(rf.iters.len(), 3);
    assert_eq!(rf.iters[1].name, "k.0");
    assert_eq!(rf.iters[1].kind, IterKind::Spatial);
    // final stage reduces over the factored axis.
    assert!(state.stages()[2].has_reduce_iter());
}

#[test]
fn test_rfactor_rejects_spatial_iter() {
    let dag = reduce_dag(64, 64);
    let mut state = dag.init_state();
    assert!(matches!(state.rfactor(1, 0, 0), Err(Error::RfactorNeedsReduction { .. })));
}

#[test]
fn test_annotations() {
    let dag = elementwise_chain_dag(64);
    let mut state = dag.init_state();
    state.parallel(2, 0).unwrap();
    assert_eq!(state.stages()[2].iters[0].annotation, IterAnnotation::Parallel);

    let mut state = dag.init_state();
    state.vectorize(2, 0).unwrap();
    assert_eq!(state.stages()[2].iters[0].annotation, IterAnnotation::Vectorize);

    let mut state = dag.init_state();
    state.unroll(2, 0).unwrap();
    assert_eq!(state.stages()[2].iters[0].annotation, IterAnnotation::Unroll);

    let mut state = dag.init_state();
    state.tensorize(2, 0, "gemm8x8").unwrap();
    assert_eq!(state.stages()[2].iters[0].annotation, IterAnnotation::Tensorize);
}

#[test]
fn test_pragma_sets_stage_attrs() {
    let dag = matmul_dag(64, 64, 64);
    let mut state = dag.init_state();
    state.pragma(2, 0, "auto_unroll_max_step$64").unwrap();
    assert_eq!(state.stages()[2].attrs.auto_unroll_max_step, Some(64));
}

#[test]
fn test_replay_reproduces_state() {
    let dag = matmul_dag(64, 64, 64);
    let mut state = dag.init_state();
    state.cache_write(2, "local").unwrap();
    // C.local iters: [i, j, k] -> [i.0, i.1, i.2, j, k.0, k.1].
    state.split(2, 0, &[Some(4), Some(4)], true).unwrap();
    state.split(2, 4, &[Some(16)], true).unwrap();
    state.reorder(2, &[0, 3, 1, 4, 2, 5]).unwrap();
    state.split(3, 0, &[Some(8)], true).unwrap();
    state.compute_at(2, 3, 0).unwrap();
    state.parallel(3, 0).unwrap();
    state.pragma(2, 0, "auto_unroll_max_step$16").unwrap();

    let replayed = State::replay(&dag, state.transform_steps()).unwrap();
    assert_eq!(replayed, state);
    assert!(replayed.attach_map().is_consistent());
}

#[test]
fn test_clone_shares_until_mutation() {
    let dag = matmul_dag(64, 64, 64);
    let mut state = dag.init_state();
    let snapshot = state.clone();
    state.split(2, 0, &[Some(8)], true).unwrap();
    // The clone is unaffected by the parent's mutation.
    assert_eq!(snapshot.stages()[2].iters.len(), 3);
    assert_eq!(state.stages()[2].iters.len(), 4);
}

#[test]
fn test_display_prints_nested_loops() {
    let dag = elementwise_chain_dag(64);
    let mut state = dag.init_state();
    state.split(2, 0, &[Some(8)], true).unwrap();
    state.compute_at(1, 2, 0).unwrap();
    state.parallel(2, 0).unwrap();
    let state = dag.infer_bound(&state).unwrap();

    let printed = state.to_string();
    assert!(printed.contains("for i.0 (8) parallel"));
    // The attached stage prints under its attach point, indented.
    assert!(printed.contains("  for i (8)"));
    assert!(printed.contains("relu = ..."));
}

#[test]
fn test_extract_original_iterators() {
    let set = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<std::collections::BTreeSet<_>>();
    assert_eq!(extract_original_iterators("i"), set(&["i"]));
    assert_eq!(extract_original_iterators("i.0"), set(&["i"]));
    assert_eq!(extract_original_iterators("i.2@j.2"), set(&["i", "j"]));
    assert_eq!(extract_original_iterators("k0@k1"), set(&["k0", "k1"]));
    assert_eq!(extract_original_iterators("i.0.1"), set(&["i"]));
}
