//! Rule predicate helper tests.

use zorya_dag::IterKind;

use crate::rules::util::{cum_extent, has_cache_write_stage, needs_rfactor, single_elementwise_matched_consumer};
use crate::test::helpers::*;

#[test]
fn test_has_cache_write_stage_tracks_inserted_ids() {
    let task = matmul_task(64, 64, 64);
    let mut state = task.dag.init_state();
    assert!(!has_cache_write_stage(&state, 2));

    state.cache_write(2, "local").unwrap();
    // Stage 2 is now the cache stage; the copy moved to 3.
    assert!(has_cache_write_stage(&state, 2));
    assert!(!has_cache_write_stage(&state, 3));
    assert!(!has_cache_write_stage(&state, 0));

    // Splits after the cache step do not disturb the normalization.
    state.split(2, 0, &[Some(8)], true).unwrap();
    assert!(has_cache_write_stage(&state, 2));
}

#[test]
fn test_cum_extent() {
    let task = matmul_task(16, 8, 4);
    let state = task.dag.init_state();
    assert_eq!(cum_extent(&state, 2, IterKind::Spatial), 16 * 8);
    assert_eq!(cum_extent(&state, 2, IterKind::Reduction), 4);
}

#[test]
fn test_needs_rfactor_conditions() {
    // Reduction-dominated output: fires.
    let reduce = reduce_task(64, 1024);
    assert!(needs_rfactor(&reduce, &reduce.dag.init_state(), 1));

    // Multi-level-tilable stage: the cache-write path owns it instead.
    let matmul = matmul_task(64, 64, 64);
    assert!(!needs_rfactor(&matmul, &matmul.dag.init_state(), 2));

    // No reduction at all: nothing to factor.
    let chain = chain_task(64);
    assert!(!needs_rfactor(&chain, &chain.dag.init_state(), 2));
}

#[test]
fn test_single_elementwise_matched_consumer() {
    let conv = conv2d_bias_task(1, 4, 8, 8, 4, 3, 3);
    let state = conv.dag.init_state();
    let conv_id = conv.dag.op_id("conv").unwrap();
    let bias_id = conv.dag.op_id("bias_add").unwrap();
    assert_eq!(single_elementwise_matched_consumer(&state, conv_id), Some(bias_id));
    // The output has no consumer at all.
    assert_eq!(single_elementwise_matched_consumer(&state, bias_id), None);
}
