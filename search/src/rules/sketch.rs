//! Sketch generation rules.
//!
//! Six stateless strategies evaluated against a `(state, stage_id)` pair as
//! the enumerator walks stages from the last down to the first. A rule that
//! fires expands the pair into successor `(state, next_stage)` pairs;
//! `ApplyAndSkipRest` additionally stops rule iteration for the pair.

use zorya_dag::State;

use crate::config::{SearchParams, SearchTask};
use crate::error::Result;
use crate::rules::util::{
    do_multi_level_tiling, follow_tiling, fuse_all_reduction_iterators, has_cache_write_stage,
    needs_multi_level_tiling, needs_rfactor, single_elementwise_matched_consumer,
};

/// Outcome of a rule's condition check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    /// Rule does not fire for this pair.
    Pass,
    /// Rule fires; later rules still run.
    Apply,
    /// Rule fires and later rules are skipped for this pair.
    ApplyAndSkipRest,
}

/// Read-only context handed to sketch rules.
pub struct SketchContext<'a> {
    pub task: &'a SearchTask,
    pub params: &'a SearchParams,
}

/// The stage cursor after processing `stage_id`; `None` terminates.
fn prev(stage_id: usize) -> Option<usize> {
    stage_id.checked_sub(1)
}

/// A sketch generation rule.
pub trait SketchRule {
    fn name(&self) -> &'static str;

    fn meet_condition(&self, ctx: &SketchContext<'_>, state: &State, stage_id: usize) -> ConditionKind;

    /// Expand the pair; only called when `meet_condition` did not pass.
    fn apply(
        &self,
        ctx: &SketchContext<'_>,
        state: &State,
        stage_id: usize,
    ) -> Result<Vec<(State, Option<usize>)>>;
}

/// The default CPU rule set, in evaluation order. Order matters: rules that
/// skip the rest must come before the rules they shadow.
pub fn default_sketch_rules() -> Vec<Box<dyn SketchRule>> {
    vec![
        Box::new(RuleAlwaysInline),
        Box::new(RuleAddRfactor),
        Box::new(RuleAddCacheWrite),
        Box::new(RuleMultiLevelTilingWithFusion),
        Box::new(RuleMultiLevelTiling),
        Box::new(RuleSkipStage),
    ]
}

fn should_always_be_inlined(state: &State, stage_id: usize) -> bool {
    let stage = &state.stages()[stage_id];
    if stage.is_placeholder() {
        return false;
    }
    let dag = state.resolved_dag();
    if dag.access().is_output(stage_id) || stage.has_reduce_iter() {
        return false;
    }
    stage.op.attrs.always_compute_inline || dag.access().is_strict_inlinable(stage_id)
}

/// Inline simple elementwise stages.
pub struct RuleAlwaysInline;

impl SketchRule for RuleAlwaysInline {
    fn name(&self) -> &'static str {
        "always_inline"
    }

    fn meet_condition(&self, _ctx: &SketchContext<'_>, state: &State, stage_id: usize) -> ConditionKind {
        if should_always_be_inlined(state, stage_id) {
            ConditionKind::ApplyAndSkipRest
        } else {
            ConditionKind::Pass
        }
    }

    fn apply(
        &self,
        _ctx: &SketchContext<'_>,
        state: &State,
        stage_id: usize,
    ) -> Result<Vec<(State, Option<usize>)>> {
        let mut next = state.clone();
        next.compute_inline(stage_id)?;
        Ok(vec![(next, prev(stage_id))])
    }
}

/// Factor a dominant reduction so its inner part parallelizes.
///
/// Emits two variants: one keeps the factored axis where rfactor put it,
/// one reorders it innermost for vectorization; the search decides which
/// pays off.
pub struct RuleAddRfactor;

impl SketchRule for RuleAddRfactor {
    fn name(&self) -> &'static str {
        "add_rfactor"
    }

    fn meet_condition(&self, ctx: &SketchContext<'_>, state: &State, stage_id: usize) -> ConditionKind {
        if needs_rfactor(ctx.task, state, stage_id) && !has_cache_write_stage(state, stage_id) {
            ConditionKind::Apply
        } else {
            ConditionKind::Pass
        }
    }

    fn apply(
        &self,
        _ctx: &SketchContext<'_>,
        state: &State,
        stage_id: usize,
    ) -> Result<Vec<(State, Option<usize>)>> {
        let mut base = state.clone();
        let (fused_pos, n_space) = fuse_all_reduction_iterators(&mut base, stage_id)?;
        // Placeholder factor of 1; the sketch post-pass resets it to unknown
        // so the init rules sample it.
        let split_range = base.split(stage_id, fused_pos, &[Some(1)], true)?;

        let mut out = Vec::with_capacity(2);
        for (variant, factored_pos) in [split_range.start, split_range.start + 1].into_iter().enumerate() {
            let mut next = base.clone();
            let rf_id = next.rfactor(stage_id, factored_pos, n_space)?;
            if variant == 1 {
                // Move the factored spatial axis innermost for vectorization.
                let n_iters = next.stages()[rf_id].iters.len();
                let mut order: Vec<usize> = (0..n_iters).filter(|&i| i != n_space).collect();
                order.push(n_space);
                next.reorder(rf_id, &order)?;
            }
            out.push((next, prev(rf_id)));
        }
        Ok(out)
    }
}

/// Give a multi-level-tilable stage a local write cache when no elementwise
/// consumer can serve as its fusion target.
pub struct RuleAddCacheWrite;

impl SketchRule for RuleAddCacheWrite {
    fn name(&self) -> &'static str {
        "add_cache_write"
    }

    fn meet_condition(&self, _ctx: &SketchContext<'_>, state: &State, stage_id: usize) -> ConditionKind {
        if state.stages()[stage_id].op.attrs.no_cache_write {
            return ConditionKind::Pass;
        }
        if needs_multi_level_tiling(state, stage_id)
            && single_elementwise_matched_consumer(state, stage_id).is_none()
        {
            ConditionKind::Apply
        } else {
            ConditionKind::Pass
        }
    }

    fn apply(
        &self,
        _ctx: &SketchContext<'_>,
        state: &State,
        stage_id: usize,
    ) -> Result<Vec<(State, Option<usize>)>> {
        let mut next = state.clone();
        next.cache_write(stage_id, "local")?;
        // Revisit the same id: it now addresses the cache stage, which has
        // an elementwise-matched consumer and takes the fusion path.
        Ok(vec![(next, Some(stage_id))])
    }
}

/// Multi-level tile a stage and fuse its elementwise consumer by attaching
/// the tiled nest inside the consumer at a spatial tile level.
pub struct RuleMultiLevelTilingWithFusion;

impl SketchRule for RuleMultiLevelTilingWithFusion {
    fn name(&self) -> &'static str {
        "multi_level_tiling_with_fusion"
    }

    fn meet_condition(&self, _ctx: &SketchContext<'_>, state: &State, stage_id: usize) -> ConditionKind {
        if needs_multi_level_tiling(state, stage_id)
            && single_elementwise_matched_consumer(state, stage_id).is_some()
        {
            ConditionKind::ApplyAndSkipRest
        } else {
            ConditionKind::Pass
        }
    }

    fn apply(
        &self,
        ctx: &SketchContext<'_>,
        state: &State,
        stage_id: usize,
    ) -> Result<Vec<(State, Option<usize>)>> {
        let target_id = single_elementwise_matched_consumer(state, stage_id)
            .expect("condition checked by the enumerator");
        let mut base = state.clone();
        do_multi_level_tiling(&mut base, stage_id, &ctx.params.cpu_structure)?;

        let structure = ctx.params.cpu_structure.as_bytes();
        let mut out = Vec::with_capacity(2);
        for level in [1usize, 2] {
            if structure.get(level - 1).map(u8::to_ascii_uppercase) != Some(b'S') {
                continue;
            }
            let mut next = base.clone();
            let attach_pos = follow_tiling(&mut next, target_id, level)?;
            next.compute_at(stage_id, target_id, attach_pos)?;
            out.push((next, prev(stage_id)));
        }
        Ok(out)
    }
}

/// Multi-level tile a stage with reuse but no fusable consumer.
pub struct RuleMultiLevelTiling;

impl SketchRule for RuleMultiLevelTiling {
    fn name(&self) -> &'static str {
        "multi_level_tiling"
    }

    fn meet_condition(&self, _ctx: &SketchContext<'_>, state: &State, stage_id: usize) -> ConditionKind {
        if needs_multi_level_tiling(state, stage_id) {
            // An untiled sketch of a reuse-heavy stage is never worth
            // emitting, so the skip rule must not see this pair.
            ConditionKind::ApplyAndSkipRest
        } else {
            ConditionKind::Pass
        }
    }

    fn apply(
        &self,
        ctx: &SketchContext<'_>,
        state: &State,
        stage_id: usize,
    ) -> Result<Vec<(State, Option<usize>)>> {
        let mut next = state.clone();
        do_multi_level_tiling(&mut next, stage_id, &ctx.params.cpu_structure)?;
        Ok(vec![(next, prev(stage_id))])
    }
}

/// Leave the stage untouched and move on.
pub struct RuleSkipStage;

impl SketchRule for RuleSkipStage {
    fn name(&self) -> &'static str {
        "skip_stage"
    }

    fn meet_condition(&self, _ctx: &SketchContext<'_>, _state: &State, _stage_id: usize) -> ConditionKind {
        ConditionKind::Apply
    }

    fn apply(
        &self,
        _ctx: &SketchContext<'_>,
        state: &State,
        stage_id: usize,
    ) -> Result<Vec<(State, Option<usize>)>> {
        Ok(vec![(state.clone(), prev(stage_id))])
    }
}
