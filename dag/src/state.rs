//! Loop state: an immutable snapshot of a schedule under construction.
//!
//! A [`State`] is the compute DAG plus an append-only transform history and
//! the bookkeeping derived from it: per-stage iterators and the bidirectional
//! compute-at attachment map. Mutators append a step and update the derived
//! data; replaying the history from the DAG's initial state reproduces the
//! snapshot exactly.
//!
//! Stages are held behind `Arc` so cloning a state is cheap and a mutation
//! copies only the touched stage (`Arc::make_mut`). Successor states produced
//! by the search share everything they did not change with their parent.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use snafu::ensure;

use crate::dag::ComputeDAG;
use crate::error::{
    InvalidReorderSnafu, IterOutOfRangeSnafu, MalformedRecordSnafu, NonContiguousFuseSnafu, NotInlinableSnafu,
    PlaceholderStageSnafu, Result, RfactorNeedsReductionSnafu, StageOutOfRangeSnafu,
};
use crate::expr::Expr;
use crate::op::{Axis, Operation};
use crate::steps::{SplitLengths, TransformStep};

/// Whether an iterator walks an output dimension or a reduction dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IterKind {
    Spatial,
    Reduction,
}

/// Scheduling decoration attached to an iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IterAnnotation {
    #[default]
    None,
    Parallel,
    Vectorize,
    Unroll,
    Tensorize,
}

impl fmt::Display for IterAnnotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            IterAnnotation::None => "none",
            IterAnnotation::Parallel => "parallel",
            IterAnnotation::Vectorize => "vectorize",
            IterAnnotation::Unroll => "unroll",
            IterAnnotation::Tensorize => "tensorize",
        };
        f.write_str(text)
    }
}

/// One loop of a stage's loop nest.
///
/// Provenance is carried in the name: the k-th part of a split of `i` is
/// `i.k`, fused iterators join their part names with `@`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Iterator {
    pub name: String,
    /// `None` until tile sizes are filled or bounds are inferred.
    pub extent: Option<u64>,
    pub kind: IterKind,
    pub annotation: IterAnnotation,
}

impl Iterator {
    fn new(name: impl Into<String>, extent: Option<u64>, kind: IterKind) -> Self {
        Self { name: name.into(), extent, kind, annotation: IterAnnotation::None }
    }
}

/// Names of the original iterators an iterator descends from.
///
/// `i.0` came from `i`; `i.2@j.2` came from `i` and `j`. Purely numeric
/// segments are split/level suffixes, not origins.
pub fn extract_original_iterators(name: &str) -> BTreeSet<String> {
    name.split(['@', '.'])
        .filter(|seg| !seg.is_empty() && !seg.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_owned)
        .collect()
}

/// Where a stage's computation currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputeAt {
    /// Own loop nest at root scope.
    #[default]
    Root,
    /// Substituted into consumers; no loop nest of its own.
    Inlined,
    /// Attached under an iterator of another stage; see the attach map.
    Iter,
}

/// Kind of the stage's operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Placeholder,
    Compute,
}

/// Per-stage scheduling attributes set by pragma steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageAttrs {
    pub auto_unroll_max_step: Option<u64>,
}

/// Per-operation scheduling record within a [`State`].
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub op: Arc<Operation>,
    pub kind: StageKind,
    pub iters: Vec<Iterator>,
    pub compute_at: ComputeAt,
    pub attrs: StageAttrs,
}

impl Stage {
    pub(crate) fn from_op(op: &Arc<Operation>) -> Self {
        let kind = if op.is_placeholder() { StageKind::Placeholder } else { StageKind::Compute };
        let mut iters = Vec::with_capacity(op.axes().len() + op.reduce_axes().len());
        for axis in op.axes() {
            iters.push(Iterator::new(axis.name.clone(), Some(axis.extent), IterKind::Spatial));
        }
        for axis in op.reduce_axes() {
            iters.push(Iterator::new(axis.name.clone(), Some(axis.extent), IterKind::Reduction));
        }
        Self { op: op.clone(), kind, iters, compute_at: ComputeAt::Root, attrs: StageAttrs::default() }
    }

    pub fn is_placeholder(&self) -> bool {
        self.kind == StageKind::Placeholder
    }

    pub fn has_reduce_iter(&self) -> bool {
        self.iters.iter().any(|it| it.kind == IterKind::Reduction)
    }

    pub fn has_annotation(&self, annotation: IterAnnotation) -> bool {
        self.iters.iter().any(|it| it.annotation == annotation)
    }

    /// A stage is tiled once its iterator count diverges from the
    /// operation's axis count.
    pub fn is_tiled(&self) -> bool {
        self.iters.len() != self.op.axes().len() + self.op.reduce_axes().len()
    }
}

/// Bidirectional compute-at attachment map.
///
/// Both directions are maintained explicitly; they are mutual inverses at
/// all times.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachMap {
    stage_to_attach_iter: std::collections::HashMap<usize, (usize, usize)>,
    iter_to_attached_stages: std::collections::HashMap<(usize, usize), Vec<usize>>,
}

impl AttachMap {
    pub fn attach(&mut self, stage_id: usize, target_stage_id: usize, target_iter_id: usize) {
        self.detach(stage_id);
        self.stage_to_attach_iter.insert(stage_id, (target_stage_id, target_iter_id));
        self.iter_to_attached_stages.entry((target_stage_id, target_iter_id)).or_default().push(stage_id);
    }

    pub fn detach(&mut self, stage_id: usize) {
        if let Some(key) = self.stage_to_attach_iter.remove(&stage_id) {
            let attached = self.iter_to_attached_stages.get_mut(&key).expect("attach map out of sync");
            attached.retain(|&s| s != stage_id);
            if attached.is_empty() {
                self.iter_to_attached_stages.remove(&key);
            }
        }
    }

    pub fn attach_target(&self, stage_id: usize) -> Option<(usize, usize)> {
        self.stage_to_attach_iter.get(&stage_id).copied()
    }

    pub fn attached_stages(&self, target_stage_id: usize, target_iter_id: usize) -> &[usize] {
        self.iter_to_attached_stages.get(&(target_stage_id, target_iter_id)).map_or(&[], Vec::as_slice)
    }

    pub fn has_attached(&self, target_stage_id: usize, target_iter_id: usize) -> bool {
        !self.attached_stages(target_stage_id, target_iter_id).is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.stage_to_attach_iter.is_empty()
    }

    /// Check that the two halves are mutual inverses.
    pub fn is_consistent(&self) -> bool {
        let forward_ok = self.stage_to_attach_iter.iter().all(|(stage, key)| {
            self.iter_to_attached_stages.get(key).is_some_and(|v| v.contains(stage))
        });
        let backward_ok = self.iter_to_attached_stages.iter().all(|(key, stages)| {
            !stages.is_empty()
                && stages.iter().all(|s| self.stage_to_attach_iter.get(s) == Some(key))
        });
        forward_ok && backward_ok
    }

    /// A new stage was inserted at `pos`: renumber every id `>= pos`.
    fn shift_stage_inserted(&mut self, pos: usize) {
        let bump = |id: usize| if id >= pos { id + 1 } else { id };
        self.stage_to_attach_iter = self
            .stage_to_attach_iter
            .drain()
            .map(|(stage, (target, iter))| (bump(stage), (bump(target), iter)))
            .collect();
        self.iter_to_attached_stages = self
            .iter_to_attached_stages
            .drain()
            .map(|((target, iter), stages)| {
                ((bump(target), iter), stages.into_iter().map(bump).collect())
            })
            .collect();
    }

    /// Iterators of `stage_id` at positions `>= from_iter` moved by `delta`.
    fn shift_iters(&mut self, stage_id: usize, from_iter: usize, delta: isize) {
        let move_iter = |iter: usize| {
            if iter >= from_iter { (iter as isize + delta) as usize } else { iter }
        };
        for target in self.stage_to_attach_iter.values_mut() {
            if target.0 == stage_id {
                target.1 = move_iter(target.1);
            }
        }
        self.iter_to_attached_stages = self
            .iter_to_attached_stages
            .drain()
            .map(|((target, iter), stages)| {
                let iter = if target == stage_id { move_iter(iter) } else { iter };
                ((target, iter), stages)
            })
            .collect();
    }

    /// Iterators of `stage_id` permuted: `new_pos[old]` is the new position.
    fn remap_iters(&mut self, stage_id: usize, new_pos: &[usize]) {
        for target in self.stage_to_attach_iter.values_mut() {
            if target.0 == stage_id {
                target.1 = new_pos[target.1];
            }
        }
        self.iter_to_attached_stages = self
            .iter_to_attached_stages
            .drain()
            .map(|((target, iter), stages)| {
                let iter = if target == stage_id { new_pos[iter] } else { iter };
                ((target, iter), stages)
            })
            .collect();
    }

    /// Iterators of `stage_id` in `range` collapsed onto `range.start`.
    fn collapse_iters(&mut self, stage_id: usize, range: std::ops::Range<usize>) {
        let clamp = |iter: usize| if range.contains(&iter) { range.start } else { iter };
        for target in self.stage_to_attach_iter.values_mut() {
            if target.0 == stage_id {
                target.1 = clamp(target.1);
            }
        }
        let mut rebuilt: std::collections::HashMap<(usize, usize), Vec<usize>> = std::collections::HashMap::new();
        for ((target, iter), stages) in self.iter_to_attached_stages.drain() {
            let iter = if target == stage_id { clamp(iter) } else { iter };
            rebuilt.entry((target, iter)).or_default().extend(stages);
        }
        self.iter_to_attached_stages = rebuilt;
    }
}

/// Immutable schedule snapshot.
#[derive(Debug, Clone)]
pub struct State {
    dag: Arc<ComputeDAG>,
    /// Replayed DAG snapshot once a cache/rfactor step has run.
    current_dag: Option<Arc<ComputeDAG>>,
    stages: Vec<Arc<Stage>>,
    transform_steps: Vec<TransformStep>,
    attach_map: AttachMap,
    concrete: bool,
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.transform_steps == other.transform_steps
            && self.attach_map == other.attach_map
            && self.concrete == other.concrete
            && self.stages.len() == other.stages.len()
            && self.stages.iter().zip(&other.stages).all(|(a, b)| **a == **b)
    }
}

impl State {
    /// The initial state of a DAG: one untransformed stage per operation.
    pub fn new(dag: &Arc<ComputeDAG>) -> Self {
        let stages = dag.ops().iter().map(|op| Arc::new(Stage::from_op(op))).collect();
        Self {
            dag: dag.clone(),
            current_dag: None,
            stages,
            transform_steps: Vec::new(),
            attach_map: AttachMap::default(),
            concrete: false,
        }
    }

    /// Replay a step history from a DAG's initial state.
    pub fn replay(dag: &Arc<ComputeDAG>, steps: &[TransformStep]) -> Result<Self> {
        Self::replay_inner(dag, steps, false)
    }

    /// Replay keeping iterator bounds across compute-at steps; used by bound
    /// inference, which resolves attach-conditional extents afterwards.
    pub(crate) fn replay_keep_bounds(dag: &Arc<ComputeDAG>, steps: &[TransformStep]) -> Result<Self> {
        Self::replay_inner(dag, steps, true)
    }

    fn replay_inner(dag: &Arc<ComputeDAG>, steps: &[TransformStep], keep_bounds: bool) -> Result<Self> {
        let mut state = Self::new(dag);
        for step in steps {
            state.apply(step, keep_bounds)?;
            state.transform_steps.push(step.clone());
        }
        Ok(state)
    }

    /// Re-derive stages and attach map from this state's own history.
    pub fn rederive(&self) -> Result<Self> {
        let mut replayed = Self::replay(&self.dag, &self.transform_steps)?;
        replayed.concrete = self.concrete;
        Ok(replayed)
    }

    pub fn stages(&self) -> &[Arc<Stage>] {
        &self.stages
    }

    pub fn transform_steps(&self) -> &[TransformStep] {
        &self.transform_steps
    }

    pub fn attach_map(&self) -> &AttachMap {
        &self.attach_map
    }

    pub fn dag(&self) -> &Arc<ComputeDAG> {
        &self.dag
    }

    /// The DAG this state's stages actually mirror: the replayed snapshot
    /// after a cache/rfactor step, the original DAG otherwise.
    pub fn resolved_dag(&self) -> &Arc<ComputeDAG> {
        self.current_dag.as_ref().unwrap_or(&self.dag)
    }

    pub fn concrete(&self) -> bool {
        self.concrete
    }

    pub fn set_concrete(&mut self, concrete: bool) {
        self.concrete = concrete;
    }

    /// Overwrite a history step in place without re-deriving stages.
    ///
    /// Only meaningful for payload rewrites that keep the step's shape (the
    /// tile-filling pass replacing unknown split lengths); callers that
    /// change structure must `rederive` afterwards.
    pub fn replace_step(&mut self, step_id: usize, step: TransformStep) {
        self.transform_steps[step_id] = step;
    }

    // ------------------------------------------------------------------
    // Mutators. Each appends one step and updates the derived data.
    // ------------------------------------------------------------------

    /// Split an iterator into `lengths.len() + 1` nested parts. Returns the
    /// positions of the new iterators, outermost first.
    pub fn split(
        &mut self,
        stage_id: usize,
        iter_id: usize,
        lengths: &[Option<u64>],
        inner_to_outer: bool,
    ) -> Result<std::ops::Range<usize>> {
        self.check_iter(stage_id, iter_id)?;
        let step = TransformStep::Split {
            stage_id,
            iter_id,
            extent: self.stages[stage_id].iters[iter_id].extent,
            lengths: SplitLengths::from_slice(lengths),
            inner_to_outer,
        };
        let range = self.apply_split(&step, false)?;
        self.transform_steps.push(step);
        Ok(range)
    }

    /// Fuse contiguous iterators into one. Returns the fused position.
    pub fn fuse(&mut self, stage_id: usize, iter_ids: &[usize]) -> Result<usize> {
        let step = TransformStep::Fuse { stage_id, iter_ids: iter_ids.iter().copied().collect() };
        let pos = self.apply_fuse(&step)?;
        self.transform_steps.push(step);
        Ok(pos)
    }

    /// Reorder a stage's iterators to the given permutation.
    pub fn reorder(&mut self, stage_id: usize, after_ids: &[usize]) -> Result<()> {
        let step = TransformStep::Reorder { stage_id, after_ids: after_ids.to_vec() };
        self.apply_reorder(&step)?;
        self.transform_steps.push(step);
        Ok(())
    }

    /// Attach a stage under an iterator of another stage. The stage's
    /// iterator extents become conditional on the target loop nest and are
    /// unknown until the next bound inference.
    pub fn compute_at(&mut self, stage_id: usize, target_stage_id: usize, target_iter_id: usize) -> Result<()> {
        let step = TransformStep::ComputeAt { stage_id, target_stage_id, target_iter_id };
        self.apply_compute_at(&step, false)?;
        self.transform_steps.push(step);
        Ok(())
    }

    /// Move a stage back to root scope.
    pub fn compute_root(&mut self, stage_id: usize) -> Result<()> {
        let step = TransformStep::ComputeRoot { stage_id };
        self.apply_compute_root(&step, false)?;
        self.transform_steps.push(step);
        Ok(())
    }

    /// Inline a strictly-inlinable stage into its consumers.
    pub fn compute_inline(&mut self, stage_id: usize) -> Result<()> {
        let step = TransformStep::ComputeInline { stage_id };
        self.apply_compute_inline(&step)?;
        self.transform_steps.push(step);
        Ok(())
    }

    /// Insert a read cache of a stage for the given readers. Returns the new
    /// stage's id.
    pub fn cache_read(&mut self, stage_id: usize, scope: &str, reader_stage_ids: &[usize]) -> Result<usize> {
        let step = TransformStep::CacheRead {
            stage_id,
            scope: scope.to_owned(),
            reader_stage_ids: reader_stage_ids.to_vec(),
        };
        let new_id = self.apply_cache_read(&step)?;
        self.transform_steps.push(step);
        Ok(new_id)
    }

    /// Insert a write cache: computation moves to `{op}.{scope}` and the
    /// original stage becomes an elementwise copy. Returns the cache stage's
    /// id (the original moves one slot down).
    pub fn cache_write(&mut self, stage_id: usize, scope: &str) -> Result<usize> {
        let step = TransformStep::CacheWrite { stage_id, scope: scope.to_owned() };
        let new_id = self.apply_cache_write(&step)?;
        self.transform_steps.push(step);
        Ok(new_id)
    }

    /// Factor a reduction iterator into a new spatial axis of an
    /// intermediate `.rf` stage. Returns the rf stage's id.
    pub fn rfactor(&mut self, stage_id: usize, iter_id: usize, factor_axis: usize) -> Result<usize> {
        let step = TransformStep::Rfactor { stage_id, iter_id, factor_axis };
        let new_id = self.apply_rfactor(&step)?;
        self.transform_steps.push(step);
        Ok(new_id)
    }

    pub fn parallel(&mut self, stage_id: usize, iter_id: usize) -> Result<()> {
        self.annotate(TransformStep::Parallel { stage_id, iter_id }, IterAnnotation::Parallel)
    }

    pub fn vectorize(&mut self, stage_id: usize, iter_id: usize) -> Result<()> {
        self.annotate(TransformStep::Vectorize { stage_id, iter_id }, IterAnnotation::Vectorize)
    }

    pub fn unroll(&mut self, stage_id: usize, iter_id: usize) -> Result<()> {
        self.annotate(TransformStep::Unroll { stage_id, iter_id }, IterAnnotation::Unroll)
    }

    pub fn tensorize(&mut self, stage_id: usize, iter_id: usize, intrinsic: &str) -> Result<()> {
        let step = TransformStep::Tensorize { stage_id, iter_id, intrinsic: intrinsic.to_owned() };
        self.apply_tensorize(&step)?;
        self.transform_steps.push(step);
        Ok(())
    }

    /// Attach a pragma to an iterator. `auto_unroll_max_step$K` is parsed
    /// onto the stage's attributes.
    pub fn pragma(&mut self, stage_id: usize, iter_id: usize, pragma: &str) -> Result<()> {
        let step = TransformStep::Pragma { stage_id, iter_id, pragma: pragma.to_owned() };
        self.apply_pragma(&step)?;
        self.transform_steps.push(step);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Step application (shared by mutators and replay).
    // ------------------------------------------------------------------

    pub(crate) fn apply(&mut self, step: &TransformStep, keep_bounds: bool) -> Result<()> {
        match step {
            TransformStep::Split { .. } => self.apply_split(step, keep_bounds).map(drop),
            TransformStep::Fuse { .. } => self.apply_fuse(step).map(drop),
            TransformStep::Reorder { .. } => self.apply_reorder(step),
            TransformStep::ComputeAt { .. } => self.apply_compute_at(step, keep_bounds),
            TransformStep::ComputeRoot { .. } => self.apply_compute_root(step, keep_bounds),
            TransformStep::ComputeInline { .. } => self.apply_compute_inline(step),
            TransformStep::CacheRead { .. } => self.apply_cache_read(step).map(drop),
            TransformStep::CacheWrite { .. } => self.apply_cache_write(step).map(drop),
            TransformStep::Rfactor { .. } => self.apply_rfactor(step).map(drop),
            TransformStep::Parallel { stage_id, iter_id } => {
                self.apply_annotation(*stage_id, *iter_id, IterAnnotation::Parallel)
            }
            TransformStep::Vectorize { stage_id, iter_id } => {
                self.apply_annotation(*stage_id, *iter_id, IterAnnotation::Vectorize)
            }
            TransformStep::Unroll { stage_id, iter_id } => {
                self.apply_annotation(*stage_id, *iter_id, IterAnnotation::Unroll)
            }
            TransformStep::Pragma { .. } => self.apply_pragma(step),
            TransformStep::Tensorize { .. } => self.apply_tensorize(step),
        }
    }

    fn annotate(&mut self, step: TransformStep, annotation: IterAnnotation) -> Result<()> {
        let (stage_id, iter_id) = match &step {
            TransformStep::Parallel { stage_id, iter_id }
            | TransformStep::Vectorize { stage_id, iter_id }
            | TransformStep::Unroll { stage_id, iter_id } => (*stage_id, *iter_id),
            _ => unreachable!("annotate called with a non-annotation step"),
        };
        self.apply_annotation(stage_id, iter_id, annotation)?;
        self.transform_steps.push(step);
        Ok(())
    }

    fn apply_split(&mut self, step: &TransformStep, _keep_bounds: bool) -> Result<std::ops::Range<usize>> {
        let TransformStep::Split { stage_id, iter_id, lengths, inner_to_outer, .. } = step else {
            unreachable!()
        };
        let (stage_id, iter_id) = (*stage_id, *iter_id);
        self.check_iter(stage_id, iter_id)?;
        ensure!(
            !self.stages[stage_id].is_placeholder(),
            PlaceholderStageSnafu { transform: "split", stage_id }
        );

        let it = &self.stages[stage_id].iters[iter_id];
        let extent = it.extent;
        let base_name = it.name.clone();
        let kind = it.kind;

        let known_product =
            lengths.iter().try_fold(1u64, |acc, l| l.map(|v| acc.saturating_mul(v)));
        let derived_extent = match (extent, known_product) {
            (Some(e), Some(p)) if p > 0 => Some(e.div_ceil(p)),
            _ => None,
        };

        let mut parts: Vec<Iterator> = Vec::with_capacity(lengths.len() + 1);
        if *inner_to_outer {
            parts.push(Iterator::new(format!("{base_name}.0"), derived_extent, kind));
            for (i, len) in lengths.iter().enumerate() {
                parts.push(Iterator::new(format!("{base_name}.{}", i + 1), *len, kind));
            }
        } else {
            for (i, len) in lengths.iter().enumerate() {
                parts.push(Iterator::new(format!("{base_name}.{i}"), *len, kind));
            }
            parts.push(Iterator::new(format!("{base_name}.{}", lengths.len()), derived_extent, kind));
        }

        let n_new = parts.len();
        let stage = Arc::make_mut(&mut self.stages[stage_id]);
        stage.iters.splice(iter_id..=iter_id, parts);
        self.attach_map.shift_iters(stage_id, iter_id + 1, n_new as isize - 1);
        Ok(iter_id..iter_id + n_new)
    }

    fn apply_fuse(&mut self, step: &TransformStep) -> Result<usize> {
        let TransformStep::Fuse { stage_id, iter_ids } = step else { unreachable!() };
        let stage_id = *stage_id;
        self.check_stage(stage_id)?;
        ensure!(
            !iter_ids.is_empty() && iter_ids.windows(2).all(|w| w[1] == w[0] + 1),
            NonContiguousFuseSnafu { stage_id, iter_ids: iter_ids.to_vec() }
        );
        let last = *iter_ids.last().expect("non-empty");
        self.check_iter(stage_id, last)?;

        let first = iter_ids[0];
        let stage = Arc::make_mut(&mut self.stages[stage_id]);
        let fused_src = &stage.iters[first..=last];
        let name = fused_src.iter().map(|it| it.name.as_str()).collect::<Vec<_>>().join("@");
        let extent = fused_src.iter().try_fold(1u64, |acc, it| it.extent.map(|e| acc.saturating_mul(e)));
        let kind = if fused_src.iter().any(|it| it.kind == IterKind::Reduction) {
            IterKind::Reduction
        } else {
            IterKind::Spatial
        };
        stage.iters.splice(first..=last, [Iterator::new(name, extent, kind)]);

        self.attach_map.collapse_iters(stage_id, first..last + 1);
        self.attach_map.shift_iters(stage_id, last + 1, -((last - first) as isize));
        Ok(first)
    }

    fn apply_reorder(&mut self, step: &TransformStep) -> Result<()> {
        let TransformStep::Reorder { stage_id, after_ids } = step else { unreachable!() };
        let stage_id = *stage_id;
        self.check_stage(stage_id)?;
        let n = self.stages[stage_id].iters.len();
        let mut seen = vec![false; n];
        ensure!(after_ids.len() == n, InvalidReorderSnafu { stage_id });
        for &id in after_ids {
            ensure!(id < n && !seen[id], InvalidReorderSnafu { stage_id });
            seen[id] = true;
        }

        let stage = Arc::make_mut(&mut self.stages[stage_id]);
        stage.iters = after_ids.iter().map(|&old| stage.iters[old].clone()).collect();

        // new_pos[old] = new position of the iterator formerly at `old`.
        let mut new_pos = vec![0usize; n];
        for (new, &old) in after_ids.iter().enumerate() {
            new_pos[old] = new;
        }
        self.attach_map.remap_iters(stage_id, &new_pos);
        Ok(())
    }

    fn apply_compute_at(&mut self, step: &TransformStep, keep_bounds: bool) -> Result<()> {
        let TransformStep::ComputeAt { stage_id, target_stage_id, target_iter_id } = step else {
            unreachable!()
        };
        let (stage_id, target_stage_id, target_iter_id) = (*stage_id, *target_stage_id, *target_iter_id);
        self.check_iter(target_stage_id, target_iter_id)?;
        self.check_stage(stage_id)?;
        ensure!(
            !self.stages[stage_id].is_placeholder(),
            PlaceholderStageSnafu { transform: "compute_at", stage_id }
        );

        let stage = Arc::make_mut(&mut self.stages[stage_id]);
        stage.compute_at = ComputeAt::Iter;
        if !keep_bounds {
            for it in &mut stage.iters {
                it.extent = None;
            }
        }
        self.attach_map.attach(stage_id, target_stage_id, target_iter_id);
        Ok(())
    }

    fn apply_compute_root(&mut self, step: &TransformStep, keep_bounds: bool) -> Result<()> {
        let TransformStep::ComputeRoot { stage_id } = step else { unreachable!() };
        let stage_id = *stage_id;
        self.check_stage(stage_id)?;
        let stage = Arc::make_mut(&mut self.stages[stage_id]);
        stage.compute_at = ComputeAt::Root;
        if !keep_bounds {
            for it in &mut stage.iters {
                it.extent = None;
            }
        }
        self.attach_map.detach(stage_id);
        Ok(())
    }

    fn apply_compute_inline(&mut self, step: &TransformStep) -> Result<()> {
        let TransformStep::ComputeInline { stage_id } = step else { unreachable!() };
        let stage_id = *stage_id;
        self.check_stage(stage_id)?;
        let dag = self.resolved_dag().clone();
        let stage = &self.stages[stage_id];
        let inlinable = stage.op.attrs.always_compute_inline || dag.access().is_strict_inlinable(stage_id);
        ensure!(
            inlinable && !dag.access().is_output(stage_id) && !stage.has_reduce_iter(),
            NotInlinableSnafu { stage_id, op: stage.op.name.clone() }
        );
        let stage = Arc::make_mut(&mut self.stages[stage_id]);
        stage.compute_at = ComputeAt::Inlined;
        self.attach_map.detach(stage_id);
        Ok(())
    }

    fn apply_cache_read(&mut self, step: &TransformStep) -> Result<usize> {
        let TransformStep::CacheRead { stage_id, scope, reader_stage_ids } = step else { unreachable!() };
        let stage_id = *stage_id;
        self.check_stage(stage_id)?;
        for &reader in reader_stage_ids {
            self.check_stage(reader)?;
        }

        let base = self.resolved_dag().clone();
        let producer = &base.ops()[stage_id];
        let cache_name = format!("{}.{scope}", producer.name);
        let axes: Vec<Axis> = producer
            .output_shape()
            .iter()
            .enumerate()
            .map(|(i, &extent)| Axis::new(format!("ax{i}"), extent))
            .collect();
        let body = Expr::read(&producer.name, axes.iter().map(|a| Expr::var(&a.name)));
        let cache_op = Operation::compute(cache_name.clone(), axes, Vec::new(), body);

        let mut ops: Vec<Operation> = base.ops().iter().map(|op| (**op).clone()).collect();
        for &reader in reader_stage_ids {
            if let Some(body) = ops[reader].body_mut() {
                body.retarget_reads(&producer.name, &cache_name);
            }
        }
        ops.insert(stage_id + 1, cache_op);

        let new_dag = Arc::new(ComputeDAG::new(ops)?);
        self.stages.insert(stage_id + 1, Arc::new(Stage::from_op(&new_dag.ops()[stage_id + 1])));
        self.attach_map.shift_stage_inserted(stage_id + 1);
        self.current_dag = Some(new_dag);
        Ok(stage_id + 1)
    }

    fn apply_cache_write(&mut self, step: &TransformStep) -> Result<usize> {
        let TransformStep::CacheWrite { stage_id, scope } = step else { unreachable!() };
        let stage_id = *stage_id;
        self.check_stage(stage_id)?;
        ensure!(
            !self.stages[stage_id].is_placeholder(),
            PlaceholderStageSnafu { transform: "cache_write", stage_id }
        );

        let base = self.resolved_dag().clone();
        let op = &base.ops()[stage_id];
        let body = op.body().expect("compute op has a body").clone();
        let local_name = format!("{}.{scope}", op.name);
        let local_op = Operation::compute(local_name.clone(), op.axes().to_vec(), op.reduce_axes().to_vec(), body)
            .with_attrs(op.attrs.clone());
        let copy_body = Expr::read(&local_name, op.axes().iter().map(|a| Expr::var(&a.name)));
        let copy_op = Operation::compute(op.name.clone(), op.axes().to_vec(), Vec::new(), copy_body)
            .with_attrs(op.attrs.clone());

        let mut ops: Vec<Operation> = base.ops().iter().map(|o| (**o).clone()).collect();
        ops[stage_id] = local_op;
        ops.insert(stage_id + 1, copy_op);

        let new_dag = Arc::new(ComputeDAG::new(ops)?);
        // References to the original stage follow it one slot down; the
        // fresh cache stage takes its old id.
        self.attach_map.shift_stage_inserted(stage_id);
        self.stages[stage_id] = Arc::new(Stage::from_op(&new_dag.ops()[stage_id]));
        self.stages.insert(stage_id + 1, Arc::new(Stage::from_op(&new_dag.ops()[stage_id + 1])));
        self.current_dag = Some(new_dag);
        Ok(stage_id)
    }

    fn apply_rfactor(&mut self, step: &TransformStep) -> Result<usize> {
        let TransformStep::Rfactor { stage_id, iter_id, factor_axis } = step else { unreachable!() };
        let (stage_id, iter_id, factor_axis) = (*stage_id, *iter_id, *factor_axis);
        self.check_iter(stage_id, iter_id)?;
        let stage = &self.stages[stage_id];
        ensure!(
            stage.iters[iter_id].kind == IterKind::Reduction,
            RfactorNeedsReductionSnafu { stage_id, iter_id }
        );

        let base = self.resolved_dag().clone();
        let op = &base.ops()[stage_id];
        let body = op.body().expect("compute op has a body").clone();
        let factored = &stage.iters[iter_id];
        // Extents may be unknown while tile sizes are unset; the synthesized
        // DAG is re-derived with real values at the next bound inference.
        let factored_extent = factored.extent.unwrap_or(1);

        let rf_name = format!("{}.rf", op.name);
        let mut rf_axes = op.axes().to_vec();
        let factor_axis = factor_axis.min(rf_axes.len());
        rf_axes.insert(factor_axis, Axis::new(factored.name.clone(), factored_extent));
        let rf_reduce: Vec<Axis> = stage
            .iters
            .iter()
            .enumerate()
            .filter(|(pos, it)| *pos != iter_id && it.kind == IterKind::Reduction)
            .map(|(_, it)| Axis::new(it.name.clone(), it.extent.unwrap_or(1)))
            .collect();
        let rf_op = Operation::compute(rf_name.clone(), rf_axes.clone(), rf_reduce, body).with_attrs(op.attrs.clone());

        let red_name = format!("{}.v", factored.name);
        let indices: Vec<Expr> = rf_axes
            .iter()
            .enumerate()
            .map(|(pos, axis)| {
                if pos == factor_axis { Expr::var(&red_name) } else { Expr::var(&axis.name) }
            })
            .collect();
        let final_op = Operation::compute(
            op.name.clone(),
            op.axes().to_vec(),
            vec![Axis::new(red_name, factored_extent)],
            Expr::Read { producer: rf_name, indices },
        )
        .with_attrs(op.attrs.clone());

        let mut ops: Vec<Operation> = base.ops().iter().map(|o| (**o).clone()).collect();
        ops[stage_id] = rf_op;
        ops.insert(stage_id + 1, final_op);

        let new_dag = Arc::new(ComputeDAG::new(ops)?);
        self.attach_map.shift_stage_inserted(stage_id);
        self.stages[stage_id] = Arc::new(Stage::from_op(&new_dag.ops()[stage_id]));
        self.stages.insert(stage_id + 1, Arc::new(Stage::from_op(&new_dag.ops()[stage_id + 1])));
        self.current_dag = Some(new_dag);
        Ok(stage_id)
    }

    fn apply_annotation(&mut self, stage_id: usize, iter_id: usize, annotation: IterAnnotation) -> Result<()> {
        self.check_iter(stage_id, iter_id)?;
        let stage = Arc::make_mut(&mut self.stages[stage_id]);
        stage.iters[iter_id].annotation = annotation;
        Ok(())
    }

    fn apply_pragma(&mut self, step: &TransformStep) -> Result<()> {
        let TransformStep::Pragma { stage_id, iter_id, pragma } = step else { unreachable!() };
        let (stage_id, iter_id) = (*stage_id, *iter_id);
        self.check_iter(stage_id, iter_id)?;
        if let Some(value) = pragma.strip_prefix("auto_unroll_max_step$") {
            let parsed = value
                .parse()
                .ok()
                .ok_or_else(|| MalformedRecordSnafu { record: pragma.clone() }.build())?;
            let stage = Arc::make_mut(&mut self.stages[stage_id]);
            stage.attrs.auto_unroll_max_step = Some(parsed);
        }
        Ok(())
    }

    fn apply_tensorize(&mut self, step: &TransformStep) -> Result<()> {
        let TransformStep::Tensorize { stage_id, iter_id, .. } = step else { unreachable!() };
        self.apply_annotation(*stage_id, *iter_id, IterAnnotation::Tensorize)
    }

    /// Bulk-overwrite a stage's iterator extents; used by bound inference.
    pub(crate) fn overwrite_iter_extents(&mut self, stage_id: usize, extents: &[Option<u64>]) {
        let stage = Arc::make_mut(&mut self.stages[stage_id]);
        for (it, extent) in stage.iters.iter_mut().zip(extents) {
            it.extent = *extent;
        }
    }

    fn check_stage(&self, stage_id: usize) -> Result<()> {
        ensure!(
            stage_id < self.stages.len(),
            StageOutOfRangeSnafu { stage_id, num_stages: self.stages.len() }
        );
        Ok(())
    }

    fn check_iter(&self, stage_id: usize, iter_id: usize) -> Result<()> {
        self.check_stage(stage_id)?;
        let num_iters = self.stages[stage_id].iters.len();
        ensure!(iter_id < num_iters, IterOutOfRangeSnafu { stage_id, iter_id, num_iters });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Canonical form.
    // ------------------------------------------------------------------

    /// Canonical textual form: workload key followed by the transform steps
    /// in application order. Two states are equal iff their canonical
    /// strings match after bound inference.
    pub fn to_canonical_string(&self) -> String {
        let mut out = String::with_capacity(64 + self.transform_steps.len() * 32);
        out.push_str(&self.dag.workload_key());
        out.push('\n');
        for step in &self.transform_steps {
            out.push_str(&step.to_string());
            out.push('\n');
        }
        out
    }

    /// Parse a canonical form back into a state by replaying its steps on
    /// `dag`. Inverse of [`State::to_canonical_string`].
    pub fn parse_canonical(dag: &Arc<ComputeDAG>, text: &str) -> Result<Self> {
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        // Leading workload key line; the caller supplies the DAG it names.
        let _key = lines.next();
        let steps: Vec<TransformStep> =
            lines.map(TransformStep::parse_record).collect::<Result<_>>()?;
        Self::replay(dag, &steps)
    }
}

impl fmt::Display for State {
    /// Human-readable loop nest, attached stages printed under their attach
    /// point.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (stage_id, stage) in self.stages.iter().enumerate() {
            if stage.is_placeholder() || stage.compute_at != ComputeAt::Root {
                continue;
            }
            self.fmt_stage(f, stage_id, 0)?;
        }
        Ok(())
    }
}

impl State {
    fn fmt_stage(&self, f: &mut fmt::Formatter<'_>, stage_id: usize, indent: usize) -> fmt::Result {
        let stage = &self.stages[stage_id];
        for (iter_id, it) in stage.iters.iter().enumerate() {
            for _ in 0..indent + iter_id {
                f.write_str("  ")?;
            }
            let extent = it.extent.map_or_else(|| "?".to_owned(), |e| e.to_string());
            match it.annotation {
                IterAnnotation::None => writeln!(f, "for {} ({extent})", it.name)?,
                ann => writeln!(f, "for {} ({extent}) {ann}", it.name)?,
            }
            for &attached in self.attach_map.attached_stages(stage_id, iter_id) {
                self.fmt_stage(f, attached, indent + iter_id + 1)?;
            }
        }
        for _ in 0..indent + stage.iters.len() {
            f.write_str("  ")?;
        }
        writeln!(f, "{} = ...", stage.op.name)
    }
}
