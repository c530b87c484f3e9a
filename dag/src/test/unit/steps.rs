//! Canonical text form tests.

use test_case::test_case;

use crate::state::State;
use crate::steps::TransformStep;
use crate::test::helpers::*;

#[test_case("(split,2,0,1024,[16,8,4],1)"; "split full")]
#[test_case("(split,2,0,?,[?,?],1)"; "split unknown")]
#[test_case("(split,1,3,64,[],0)"; "split empty lengths")]
#[test_case("(fuse,2,[0,1,2])"; "fuse")]
#[test_case("(reorder,2,[0,3,1,4,2,5])"; "reorder")]
#[test_case("(compute_at,1,2,3)"; "compute at")]
#[test_case("(compute_root,1)"; "compute root")]
#[test_case("(compute_inline,1)"; "compute inline")]
#[test_case("(cache_read,0,shared,[2])"; "cache read")]
#[test_case("(cache_write,2,local)"; "cache write")]
#[test_case("(rfactor,1,2,1)"; "rfactor")]
#[test_case("(parallel,2,0)"; "parallel")]
#[test_case("(vectorize,2,5)"; "vectorize")]
#[test_case("(unroll,2,4)"; "unroll")]
#[test_case("(pragma,2,0,auto_unroll_max_step$512)"; "pragma")]
#[test_case("(tensorize,2,3,gemm8x8)"; "tensorize")]
fn test_record_round_trip(record: &str) {
    let step = TransformStep::parse_record(record).unwrap();
    assert_eq!(step.to_string(), record);
}

#[test]
fn test_malformed_records_rejected() {
    for record in ["", "split,1,2", "(warp,1,2)", "(split,1)", "(fuse,1,[0,x])"] {
        assert!(TransformStep::parse_record(record).is_err(), "{record:?} must not parse");
    }
}

#[test]
fn test_state_canonical_round_trip() {
    let dag = matmul_dag(64, 64, 64);
    let mut state = dag.init_state();
    state.cache_write(2, "local").unwrap();
    state.split(2, 0, &[Some(4), Some(4)], true).unwrap();
    state.split(2, 4, &[Some(16)], true).unwrap();
    state.split(3, 0, &[Some(8)], true).unwrap();
    state.compute_at(2, 3, 0).unwrap();
    state.parallel(3, 0).unwrap();
    state.vectorize(2, 5).unwrap();
    state.pragma(2, 0, "auto_unroll_max_step$0").unwrap();

    let text = state.to_canonical_string();
    let parsed = State::parse_canonical(&dag, &text).unwrap();
    assert_eq!(parsed.to_canonical_string(), text);
    assert_eq!(parsed, state);
}

#[test]
fn test_canonical_string_starts_with_workload_key() {
    let dag = reduce_dag(64, 64);
    let state = dag.init_state();
    assert!(state.to_canonical_string().starts_with(dag.workload_key()));
}

#[test]
fn test_canonical_distinguishes_tile_sizes() {
    let dag = matmul_dag(64, 64, 64);
    let mut a = dag.init_state();
    a.split(2, 0, &[Some(4)], true).unwrap();
    let mut b = dag.init_state();
    b.split(2, 0, &[Some(8)], true).unwrap();
    assert_ne!(a.to_canonical_string(), b.to_canonical_string());
}
