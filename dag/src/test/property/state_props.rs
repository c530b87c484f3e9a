//! Property tests for loop-state transforms.

use proptest::prelude::*;

use crate::state::State;
use crate::test::helpers::*;

/// Split lengths drawn from small factors, 1 to 3 levels deep.
fn arb_lengths() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..=9, 1..=3)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// The split parts multiply back to at least the original extent, with
    /// the derived part taking the ceiling.
    #[test]
    fn split_extents_cover_original(extent in 1u64..=512, lengths in arb_lengths(), inner_to_outer: bool) {
        let dag = reduce_dag(extent, 4);
        let mut state = dag.init_state();
        let known: Vec<Option<u64>> = lengths.iter().map(|&l| Some(l)).collect();
        let range = state.split(1, 0, &known, inner_to_outer).unwrap();

        let parts: Vec<u64> = state.stages()[1].iters[range.clone()]
            .iter()
            .map(|it| it.extent.unwrap())
            .collect();
        let product: u64 = parts.iter().product();
        let inner_product: u64 = lengths.iter().product();

        prop_assert!(product >= extent);
        // Removing the derived part leaves exactly the requested lengths.
        let derived = if inner_to_outer { parts[0] } else { *parts.last().unwrap() };
        prop_assert_eq!(derived, extent.div_ceil(inner_product));
    }

    /// Replaying a recorded history reproduces the state exactly.
    #[test]
    fn replay_reproduces_random_schedules(
        i_lengths in arb_lengths(),
        k_lengths in arb_lengths(),
        fuse_outer: bool,
    ) {
        let dag = matmul_dag(64, 64, 64);
        let mut state = dag.init_state();
        let i_known: Vec<Option<u64>> = i_lengths.iter().map(|&l| Some(l)).collect();
        let k_known: Vec<Option<u64>> = k_lengths.iter().map(|&l| Some(l)).collect();

        let i_range = state.split(2, 0, &i_known, true).unwrap();
        let j_pos = i_range.end;
        state.split(2, j_pos + 1, &k_known, true).unwrap();
        if fuse_outer {
            state.fuse(2, &[0, 1]).unwrap();
        }

        let replayed = State::replay(&dag, state.transform_steps()).unwrap();
        prop_assert_eq!(&replayed, &state);
        prop_assert!(replayed.attach_map().is_consistent());
    }

    /// Canonical text is lossless for states built from arbitrary splits.
    #[test]
    fn canonical_round_trip(lengths in arb_lengths(), unknown_mask in prop::collection::vec(any::<bool>(), 1..=3)) {
        let dag = matmul_dag(64, 64, 64);
        let mut state = dag.init_state();
        let mixed: Vec<Option<u64>> = lengths
            .iter()
            .zip(unknown_mask.iter().chain(std::iter::repeat(&false)))
            .map(|(&l, &hide)| if hide { None } else { Some(l) })
            .collect();
        state.split(2, 0, &mixed, true).unwrap();

        let text = state.to_canonical_string();
        let parsed = State::parse_canonical(&dag, &text).unwrap();
        prop_assert_eq!(parsed.to_canonical_string(), text);
    }
}
