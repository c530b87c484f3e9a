//! Init population rules.
//!
//! Five randomized annotators run in order on each sampled sketch. They
//! turn a sketch (structure fixed, decorations unfilled) into a concrete
//! candidate: tile sizes, compute locations, parallel/vectorize/unroll
//! annotations. A rule may reject the sample as `Invalid`, in which case the
//! policy discards it and draws another sketch.

use rand::Rng;
use rand::rngs::StdRng;
use zorya_dag::{ComputeAt, IterAnnotation, IterKind, State, TransformStep, extract_original_iterators};

use crate::config::{SearchParams, SearchTask};
use crate::error::Result;
use crate::rules::util::{get_single_consumer_id, needs_multi_level_tiling};
use crate::split_memo::SplitFactorizationMemo;

/// Outcome of one init rule on one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitResultKind {
    Valid,
    Invalid,
}

/// Mutable context shared by the init rules of one sample.
pub struct InitContext<'a> {
    pub task: &'a SearchTask,
    pub params: &'a SearchParams,
    pub rng: &'a mut StdRng,
    pub split_memo: &'a mut SplitFactorizationMemo,
}

/// A randomized sketch annotator.
pub trait InitRule {
    fn name(&self) -> &'static str;

    fn apply(&self, ctx: &mut InitContext<'_>, state: &mut State) -> Result<InitResultKind>;
}

/// The default CPU init rule set, in application order.
pub fn default_init_rules() -> Vec<Box<dyn InitRule>> {
    vec![
        Box::new(InitFillTileSize),
        Box::new(InitChangeComputeLocation),
        Box::new(InitParallel),
        Box::new(InitVectorization),
        Box::new(InitUnroll),
    ]
}

/// Fill every unknown split length with a randomly drawn factorization.
pub struct InitFillTileSize;

impl InitRule for InitFillTileSize {
    fn name(&self) -> &'static str {
        "fill_tile_size"
    }

    fn apply(&self, ctx: &mut InitContext<'_>, state: &mut State) -> Result<InitResultKind> {
        let mut filled = false;
        for step_id in 0..state.transform_steps().len() {
            let TransformStep::Split { stage_id, iter_id, extent, lengths, inner_to_outer } =
                state.transform_steps()[step_id].clone()
            else {
                continue;
            };
            if lengths.is_empty() || lengths.iter().all(Option::is_some) {
                continue;
            }
            let Some(extent) = extent else {
                // A split of an unknown extent cannot be sampled.
                return Ok(InitResultKind::Invalid);
            };

            let schemes = ctx.split_memo.get_factorization_schemes(
                extent,
                lengths.len(),
                ctx.params.max_innermost_split_factor,
            );
            if schemes.is_empty() {
                return Ok(InitResultKind::Invalid);
            }
            let scheme = &schemes[ctx.rng.gen_range(0..schemes.len())];
            state.replace_step(
                step_id,
                TransformStep::Split {
                    stage_id,
                    iter_id,
                    extent: Some(extent),
                    lengths: scheme.iter().map(|&l| Some(l)).collect(),
                    inner_to_outer,
                },
            );
            filled = true;
        }

        if filled {
            // Re-derive stages so the now-known extents are visible to the
            // remaining rules.
            *state = state.rederive()?;
        }
        state.set_concrete(true);
        Ok(InitResultKind::Valid)
    }
}

/// Randomly move small stages to legal compute locations inside their
/// consumer.
pub struct InitChangeComputeLocation;

impl InitRule for InitChangeComputeLocation {
    fn name(&self) -> &'static str {
        "change_compute_location"
    }

    fn apply(&self, ctx: &mut InitContext<'_>, state: &mut State) -> Result<InitResultKind> {
        if ctx.params.disable_change_compute_location {
            return Ok(InitResultKind::Valid);
        }

        for stage_id in (0..state.stages().len()).rev() {
            {
                let stage = &state.stages()[stage_id];
                if stage.is_placeholder() || stage.compute_at == ComputeAt::Inlined {
                    continue;
                }
                if stage.is_tiled() || needs_multi_level_tiling(state, stage_id) {
                    continue;
                }
            }
            let Some(target_id) = get_single_consumer_id(state, stage_id) else { continue };

            let candidates = enumerate_attach_candidates(state, target_id);

            let choice = ctx.rng.gen_range(0..candidates.len() + 2);
            if choice == 0 {
                let stage = &state.stages()[stage_id];
                let inlinable = stage.op.attrs.always_compute_inline
                    || state.resolved_dag().access().is_strict_inlinable(stage_id);
                if !stage.has_reduce_iter()
                    && state.attach_map().attach_target(stage_id).is_some()
                    && inlinable
                {
                    state.compute_inline(stage_id)?;
                }
            } else if choice == 1 {
                state.compute_root(stage_id)?;
            } else {
                let (target, iter) = candidates[choice - 2];
                state.compute_at(stage_id, target, iter)?;
            }
        }

        *state = ctx.task.dag.infer_bound(state)?;
        Ok(InitResultKind::Valid)
    }
}

/// Legal compute-at points inside `target_id` (and, when the target is
/// itself attached, inside its attach target).
pub(crate) fn enumerate_attach_candidates(state: &State, target_id: usize) -> Vec<(usize, usize)> {
    let mut candidates = Vec::new();

    let target = &state.stages()[target_id];
    let to_unroll = &target.op.attrs.always_unroll;
    let target_attached = target.compute_at == ComputeAt::Iter;
    let target_is_tiled = target.is_tiled();

    let mut visited_reduce = false;
    for (iter_id, it) in target.iters.iter().enumerate() {
        match it.kind {
            IterKind::Reduction => {
                visited_reduce = true;
                if !target_is_tiled {
                    // Do not go inside an untiled reduction.
                    break;
                }
            }
            IterKind::Spatial => {
                if visited_reduce {
                    // Do not go into the inner tile.
                    break;
                }
            }
        }
        if to_unroll.contains(&it.name) {
            // Do not go into an always-unroll region.
            break;
        }
        if it.extent == Some(1) {
            continue;
        }
        if target_attached && it.kind == IterKind::Spatial && it.name.ends_with(".0") {
            // First-level iterators of an attached stage always have
            // extent one after bound inference.
            continue;
        }
        candidates.push((target_id, iter_id));

        if state.attach_map().has_attached(target_id, iter_id) {
            break;
        }
    }

    // The target may itself be attached to a stage X; points inside X are
    // legal for us as well.
    if target_attached {
        let (outer_id, _) = state.attach_map().attach_target(target_id).expect("attached stage has a target");
        let outer = &state.stages()[outer_id];
        let to_unroll = &outer.op.attrs.always_unroll;
        for (iter_id, it) in outer.iters.iter().enumerate() {
            if it.kind == IterKind::Reduction || state.attach_map().has_attached(outer_id, iter_id) {
                break;
            }
            if to_unroll.contains(&it.name) {
                break;
            }
            if it.extent == Some(1) {
                continue;
            }
            candidates.push((outer_id, iter_id));
        }
    }

    candidates
}

/// Fuse and parallelize the outermost spatial loops of every root stage.
pub struct InitParallel;

impl InitRule for InitParallel {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn apply(&self, ctx: &mut InitContext<'_>, state: &mut State) -> Result<InitResultKind> {
        for stage_id in 0..state.stages().len() {
            let stage = &state.stages()[stage_id];
            if stage.compute_at != ComputeAt::Root || stage.is_placeholder() {
                continue;
            }
            annotate_parallel(ctx, state, stage_id, 0)?;
        }
        Ok(InitResultKind::Valid)
    }
}

/// Fuse outermost spatial iterators until a reduction, an annotation, an
/// attach point or enough parallel degree, then mark the result parallel.
/// When the prefix is degenerate (extent one), descend into the stages
/// attached there instead.
fn annotate_parallel(ctx: &mut InitContext<'_>, state: &mut State, stage_id: usize, iter_offset: usize) -> Result<()> {
    let max_degree = (ctx.task.hardware.num_cores as u64) * 16;

    let mut to_fuse = Vec::new();
    let mut parallel_degree = 1u64;
    let mut iter_id = iter_offset;
    let num_iters = state.stages()[stage_id].iters.len();
    while iter_id < num_iters {
        let it = &state.stages()[stage_id].iters[iter_id];
        if it.kind == IterKind::Reduction || it.annotation != IterAnnotation::None {
            break;
        }
        to_fuse.push(iter_id);
        parallel_degree = parallel_degree.saturating_mul(it.extent.unwrap_or(1));
        if parallel_degree > max_degree {
            break;
        }
        if state.attach_map().has_attached(stage_id, iter_id) {
            break;
        }
        iter_id += 1;
    }

    if parallel_degree == 1 {
        let attached: Vec<usize> = state.attach_map().attached_stages(stage_id, iter_id).to_vec();
        if !attached.is_empty() {
            for child in attached {
                annotate_parallel(ctx, state, child, 0)?;
            }
            annotate_parallel(ctx, state, stage_id, iter_id + 1)?;
        }
    }

    if !to_fuse.is_empty() {
        let pos = if to_fuse.len() == 1 { to_fuse[0] } else { state.fuse(stage_id, &to_fuse)? };
        state.parallel(stage_id, pos)?;
    }
    Ok(())
}

/// Fuse and vectorize the innermost spatial iterators of each stage.
pub struct InitVectorization;

impl InitRule for InitVectorization {
    fn name(&self) -> &'static str {
        "vectorization"
    }

    fn apply(&self, ctx: &mut InitContext<'_>, state: &mut State) -> Result<InitResultKind> {
        for stage_id in 0..state.stages().len() {
            let (num_iters, is_tiled, to_unroll) = {
                let stage = &state.stages()[stage_id];
                if stage.compute_at == ComputeAt::Inlined || stage.is_placeholder() {
                    continue;
                }
                if stage.has_annotation(IterAnnotation::Tensorize) {
                    continue;
                }
                (stage.iters.len(), stage.is_tiled(), stage.op.attrs.always_unroll.clone())
            };

            // Walk inward-out, fusing while the cumulative extent stays
            // vectorizable.
            let mut cum_length = 1u64;
            let mut num_fusible = 0usize;
            while num_fusible < num_iters {
                let iter_id = num_iters - 1 - num_fusible;
                if state.attach_map().has_attached(stage_id, iter_id) {
                    break;
                }
                let it = &state.stages()[stage_id].iters[iter_id];
                if it.kind == IterKind::Reduction
                    || it.annotation != IterAnnotation::None
                    || to_unroll.contains(&it.name)
                {
                    break;
                }
                // For a tiled stage only the innermost iterator is known to
                // be contiguous in memory.
                if is_tiled && num_fusible != 0 {
                    break;
                }
                cum_length = cum_length.saturating_mul(it.extent.unwrap_or(1));
                if cum_length > ctx.params.max_vectorize_size {
                    break;
                }
                num_fusible += 1;
            }

            if num_fusible > 1 {
                num_fusible = 1 + ctx.rng.gen_range(0..num_fusible - 1);
            }
            if num_fusible == 1 {
                state.vectorize(stage_id, num_iters - 1)?;
            } else if num_fusible > 1 {
                let ids: Vec<usize> = (num_iters - num_fusible..num_iters).collect();
                let pos = state.fuse(stage_id, &ids)?;
                state.vectorize(stage_id, pos)?;
            }
        }
        Ok(InitResultKind::Valid)
    }
}

/// Unroll annotations: honor the per-op unroll attributes, then attach an
/// `auto_unroll_max_step` pragma to every stage with a reduction.
pub struct InitUnroll;

const AUTO_UNROLL_CONFIGS: [u64; 4] = [0, 16, 64, 512];

impl InitRule for InitUnroll {
    fn name(&self) -> &'static str {
        "unroll"
    }

    fn apply(&self, ctx: &mut InitContext<'_>, state: &mut State) -> Result<InitResultKind> {
        for stage_id in 0..state.stages().len() {
            let (iters, attrs, has_reduce) = {
                let stage = &state.stages()[stage_id];
                if stage.compute_at == ComputeAt::Inlined || stage.is_placeholder() {
                    continue;
                }
                let iters: Vec<(String, IterAnnotation)> =
                    stage.iters.iter().map(|it| (it.name.clone(), it.annotation)).collect();
                (iters, stage.op.attrs.clone(), stage.has_reduce_iter())
            };

            if !attrs.always_unroll_inner.is_empty() {
                // Unroll the listed iterators inside the innermost tile. Two
                // parts of the same original iterator mean we have left the
                // innermost tile.
                let mut visited = std::collections::BTreeSet::new();
                for (iter_id, (name, annotation)) in iters.iter().enumerate().rev() {
                    let origins = extract_original_iterators(name);
                    let before = visited.len();
                    visited.extend(origins.iter().cloned());
                    if visited.len() == before {
                        break;
                    }
                    if origins.len() == 1
                        && attrs.always_unroll_inner.contains(origins.iter().next().expect("len is 1"))
                        && *annotation == IterAnnotation::None
                    {
                        state.unroll(stage_id, iter_id)?;
                    }
                }
            }

            if !attrs.always_unroll.is_empty() {
                for (iter_id, (name, _)) in iters.iter().enumerate().rev() {
                    if attrs.always_unroll.contains(name) {
                        state.unroll(stage_id, iter_id)?;
                    }
                }
            }

            if has_reduce {
                // Let the backend unroll the innermost tile body.
                let max_step = AUTO_UNROLL_CONFIGS[ctx.rng.gen_range(0..AUTO_UNROLL_CONFIGS.len())];
                state.pragma(stage_id, 0, &format!("auto_unroll_max_step${max_step}"))?;
            }
        }
        Ok(InitResultKind::Valid)
    }
}
