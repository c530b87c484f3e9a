//! The compute DAG: an immutable operation graph with embedded analysis.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use snafu::ensure;

use crate::analysis::{AccessAnalyzer, OpId};
use crate::error::{DuplicateOperationSnafu, Result, UnknownProducerSnafu, ZeroExtentSnafu};
use crate::op::Operation;
use crate::state::{IterKind, State, extract_original_iterators};
use crate::steps::TransformStep;

/// An ordered operation graph, its FLOP estimate and its access analysis.
///
/// Immutable after construction. Steps that logically mutate the DAG
/// (cache read/write, rfactor) produce a new `ComputeDAG` via replay; see
/// [`State`](crate::state::State).
#[derive(Debug)]
pub struct ComputeDAG {
    ops: Vec<Arc<Operation>>,
    op_ids: HashMap<String, OpId>,
    flop_ct: f64,
    access: AccessAnalyzer,
    workload_key: String,
}

impl ComputeDAG {
    /// Build a DAG from operations in topological order (producers first).
    pub fn new(ops: Vec<Operation>) -> Result<Self> {
        let ops: Vec<Arc<Operation>> = ops.into_iter().map(Arc::new).collect();
        let mut op_ids = HashMap::with_capacity(ops.len());

        for (id, op) in ops.iter().enumerate() {
            ensure!(
                !op_ids.contains_key(&op.name),
                DuplicateOperationSnafu { op: op.name.clone() }
            );
            for axis in op.axes().iter().chain(op.reduce_axes()) {
                ensure!(axis.extent > 0, ZeroExtentSnafu { op: op.name.clone(), axis: axis.name.clone() });
            }
            if let crate::op::OpKind::Placeholder { shape } = &op.kind {
                for (pos, &extent) in shape.iter().enumerate() {
                    ensure!(
                        extent > 0,
                        ZeroExtentSnafu { op: op.name.clone(), axis: format!("d{pos}") }
                    );
                }
            }
            if let Some(body) = op.body() {
                for (producer, _) in body.collect_reads() {
                    ensure!(
                        op_ids.contains_key(producer),
                        UnknownProducerSnafu { op: op.name.clone(), producer: producer.to_owned() }
                    );
                }
            }
            op_ids.insert(op.name.clone(), id);
        }

        let access = AccessAnalyzer::new(&ops, &op_ids);
        let flop_ct = estimate_flops(&ops);
        let workload_key = compute_workload_key(&ops);
        tracing::debug!(num_ops = ops.len(), flop_ct, %workload_key, "analyzed compute dag");
        Ok(Self { ops, op_ids, flop_ct, access, workload_key })
    }

    pub fn ops(&self) -> &[Arc<Operation>] {
        &self.ops
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn op_id(&self, name: &str) -> Option<OpId> {
        self.op_ids.get(name).copied()
    }

    pub fn access(&self) -> &AccessAnalyzer {
        &self.access
    }

    /// Estimated floating-point operation count of one evaluation.
    pub fn flop_ct(&self) -> f64 {
        self.flop_ct
    }

    /// Stable content key identifying this DAG for caching and dedup.
    pub fn workload_key(&self) -> &str {
        &self.workload_key
    }

    /// The schedule state with no transform steps applied.
    pub fn init_state(self: &Arc<Self>) -> State {
        State::new(self)
    }

    /// Materialize the DAG a step history describes (cache/rfactor stages
    /// included). Returns `self` when no step mutates the DAG.
    pub fn replay_and_get_dag(self: &Arc<Self>, steps: &[TransformStep]) -> Result<Arc<ComputeDAG>> {
        if !steps.iter().any(TransformStep::mutates_dag) {
            return Ok(self.clone());
        }
        let state = State::replay(self, steps)?;
        Ok(state.resolved_dag().clone())
    }

    /// Re-derive every iterator extent of `state`.
    ///
    /// Replays the history with current split lengths, then resolves the
    /// extents of attached stages against their attach points: loops outside
    /// the attach point fix a portion of each spatial axis, the remainder is
    /// distributed over the stage's inner tile parts, innermost first.
    ///
    /// Idempotent on states whose bounds are already known.
    pub fn infer_bound(self: &Arc<Self>, state: &State) -> Result<State> {
        let mut out = State::replay_keep_bounds(self, state.transform_steps())?;
        out.set_concrete(state.concrete());
        resolve_attach_extents(&mut out)?;
        Ok(out)
    }

    /// Infer bounds for a batch of states.
    pub fn infer_bound_batch(self: &Arc<Self>, states: &[State]) -> Result<Vec<State>> {
        states.iter().map(|s| self.infer_bound(s)).collect()
    }
}

/// FLOP estimate: body arithmetic ops times the iteration domain size.
fn estimate_flops(ops: &[Arc<Operation>]) -> f64 {
    ops.iter()
        .filter_map(|op| {
            let body = op.body()?;
            let spatial: f64 = op.axes().iter().map(|a| a.extent as f64).product();
            let reduce: f64 = op.reduce_axes().iter().map(|a| a.extent as f64).product();
            Some(body.flop_count() as f64 * spatial * reduce.max(1.0))
        })
        .sum()
}

fn compute_workload_key(ops: &[Arc<Operation>]) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for op in ops {
        op.to_string().hash(&mut hasher);
    }
    format!("wl-{:016x}", hasher.finish())
}

/// Resolve attach-conditional extents, outermost attachments first.
fn resolve_attach_extents(state: &mut State) -> Result<()> {
    let num_stages = state.stages().len();

    // Attachment depth orders resolution so a target's extents are final
    // before its attached stages read them.
    let depth_of = |stage_id: usize| {
        let mut depth = 0usize;
        let mut cursor = stage_id;
        while let Some((target, _)) = state.attach_map().attach_target(cursor) {
            depth += 1;
            cursor = target;
            if depth > num_stages {
                break;
            }
        }
        depth
    };
    let mut attached: Vec<usize> =
        (0..num_stages).filter(|&s| state.attach_map().attach_target(s).is_some()).collect();
    attached.sort_by_key(|&s| depth_of(s));

    for stage_id in attached {
        let (target_id, target_pos) = state.attach_map().attach_target(stage_id).expect("filtered");

        // Product of extents fixed by the loops outside the attach point,
        // per original spatial axis of the target.
        let mut fixed: HashMap<String, u64> = HashMap::new();
        {
            let target = &state.stages()[target_id];
            let target_spatial: std::collections::BTreeSet<String> =
                target.op.axes().iter().map(|a| a.name.clone()).collect();
            for it in target.iters.iter().take(target_pos + 1) {
                let origins = extract_original_iterators(&it.name);
                if origins.len() == 1 {
                    let origin = origins.into_iter().next().expect("len checked");
                    if target_spatial.contains(&origin) {
                        *fixed.entry(origin).or_insert(1) *= it.extent.unwrap_or(1).max(1);
                    }
                }
            }
        }

        let target_axes: Vec<String> =
            state.stages()[target_id].op.axes().iter().map(|a| a.name.clone()).collect();
        let stage_axes: Vec<(String, u64)> =
            state.stages()[stage_id].op.axes().iter().map(|a| (a.name.clone(), a.extent)).collect();

        let mut new_extents: Vec<Option<u64>> =
            state.stages()[stage_id].iters.iter().map(|it| it.extent).collect();

        for (axis_pos, (axis_name, full_extent)) in stage_axes.iter().enumerate() {
            // Spatial axes correspond positionally to the target's axes.
            let outer_fixed = target_axes
                .get(axis_pos)
                .and_then(|target_axis| fixed.get(target_axis))
                .copied()
                .unwrap_or(1)
                .max(1);
            let needed = full_extent.div_ceil(outer_fixed);

            // Positions of this axis' parts, outermost first.
            let parts: Vec<usize> = state.stages()[stage_id]
                .iters
                .iter()
                .enumerate()
                .filter(|(_, it)| {
                    it.kind == IterKind::Spatial && {
                        let origins = extract_original_iterators(&it.name);
                        origins.len() == 1 && origins.contains(axis_name)
                    }
                })
                .map(|(pos, _)| pos)
                .collect();

            let mut remaining = needed;
            for (rank, &pos) in parts.iter().enumerate().rev() {
                let assigned = if rank == 0 {
                    // Outermost part absorbs the residue.
                    remaining
                } else {
                    new_extents[pos].map_or(remaining, |full| full.min(remaining)).max(1)
                };
                new_extents[pos] = Some(assigned);
                remaining = remaining.div_ceil(assigned.max(1));
            }
        }

        state.overwrite_iter_extents(stage_id, &new_extents);
    }
    Ok(())
}
