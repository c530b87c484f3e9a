//! Shared predicates and tiling helpers consulted by the search rules.

use zorya_dag::{IterKind, State, TransformStep};

use crate::config::SearchTask;
use crate::error::Result;

/// Product of the known extents of a stage's iterators of `kind`.
pub fn cum_extent(state: &State, stage_id: usize, kind: IterKind) -> u64 {
    state.stages()[stage_id]
        .iters
        .iter()
        .filter(|it| it.kind == kind)
        .map(|it| it.extent.unwrap_or(1))
        .product::<u64>()
        .max(1)
}

pub fn needs_multi_level_tiling(state: &State, stage_id: usize) -> bool {
    state.resolved_dag().access().needs_multi_level_tiling(stage_id)
}

/// Rfactor pays off when a reduction dominates and spatial iterators alone
/// cannot saturate the cores.
pub fn needs_rfactor(task: &SearchTask, state: &State, stage_id: usize) -> bool {
    let stage = &state.stages()[stage_id];
    if stage.is_placeholder() || !stage.has_reduce_iter() || needs_multi_level_tiling(state, stage_id) {
        return false;
    }
    let cum_space = cum_extent(state, stage_id, IterKind::Spatial);
    let cum_reduce = cum_extent(state, stage_id, IterKind::Reduction);
    cum_space <= cum_reduce || cum_space <= (task.hardware.num_cores as u64) * 16
}

/// The single consumer of a stage under `state`, if unique.
pub fn get_single_consumer_id(state: &State, stage_id: usize) -> Option<usize> {
    let consumers = state.resolved_dag().access().consumers(state, stage_id);
    if consumers.len() == 1 { consumers.into_iter().next() } else { None }
}

/// The single consumer of a stage when it also matches elementwise.
pub fn single_elementwise_matched_consumer(state: &State, stage_id: usize) -> Option<usize> {
    let dag = state.resolved_dag();
    let consumer = get_single_consumer_id(state, stage_id)?;
    dag.access().elementwise_match(dag.ops(), stage_id, consumer).then_some(consumer)
}

/// Whether `stage_id` is a cache-write stage, judged from the history.
///
/// Stage ids drift as cache/rfactor steps insert stages, so the id is
/// normalized backwards through the history frame by frame.
pub fn has_cache_write_stage(state: &State, stage_id: usize) -> bool {
    let mut sid = stage_id;
    for step in state.transform_steps().iter().rev() {
        match step {
            TransformStep::CacheWrite { stage_id: ps, .. } => {
                if sid == *ps {
                    return true;
                }
                if sid > *ps {
                    sid -= 1;
                }
            }
            TransformStep::CacheRead { stage_id: ps, .. } | TransformStep::Rfactor { stage_id: ps, .. } => {
                if sid > *ps {
                    sid -= 1;
                }
            }
            _ => {}
        }
    }
    false
}

/// Multi-level tile a stage following a structure string over `{S, R}`
/// (outermost level first, e.g. `SSRSRS`). Every spatial iterator is split
/// into as many parts as there are `S` levels, every reduction iterator into
/// as many parts as there are `R` levels, all lengths unknown; the iterators
/// are then reordered level by level.
///
/// Returns the history indices of the spatial split steps, in axis order.
pub fn do_multi_level_tiling(state: &mut State, stage_id: usize, structure: &str) -> Result<Vec<usize>> {
    let n_space = structure.chars().filter(|c| c.eq_ignore_ascii_case(&'s')).count();
    let n_reduce = structure.chars().filter(|c| c.eq_ignore_ascii_case(&'r')).count();

    let n_orig = state.stages()[stage_id].iters.len();
    let mut spatial_split_step_ids = Vec::new();
    // Position ranges of each original iterator's parts after splitting.
    let mut chunks: Vec<(IterKind, std::ops::Range<usize>)> = Vec::with_capacity(n_orig);

    let mut pos = 0;
    for _ in 0..n_orig {
        let kind = state.stages()[stage_id].iters[pos].kind;
        let n_parts = match kind {
            IterKind::Spatial => n_space,
            IterKind::Reduction => n_reduce,
        };
        if n_parts > 1 {
            let range = state.split(stage_id, pos, &vec![None; n_parts - 1], true)?;
            if kind == IterKind::Spatial {
                spatial_split_step_ids.push(state.transform_steps().len() - 1);
            }
            pos = range.end;
            chunks.push((kind, range));
        } else {
            chunks.push((kind, pos..pos + 1));
            pos += 1;
        }
    }

    // Interleave levels per the structure string.
    let mut order = Vec::with_capacity(pos);
    let (mut s_level, mut r_level) = (0, 0);
    for ch in structure.chars() {
        let (kind, level) = if ch.eq_ignore_ascii_case(&'s') {
            s_level += 1;
            (IterKind::Spatial, s_level - 1)
        } else {
            r_level += 1;
            (IterKind::Reduction, r_level - 1)
        };
        for (chunk_kind, range) in &chunks {
            if *chunk_kind == kind && range.start + level < range.end {
                order.push(range.start + level);
            }
        }
    }
    state.reorder(stage_id, &order)?;
    Ok(spatial_split_step_ids)
}

/// Tile a consumer's spatial iterators into `level + 1` parts each (lengths
/// unknown) and reorder them level-major, mirroring the outer levels of a
/// multi-level-tiled producer so the producer can be attached at `level`.
///
/// Returns the iterator position delimiting tile level `level`.
pub fn follow_tiling(state: &mut State, stage_id: usize, level: usize) -> Result<usize> {
    let n_orig = state.stages()[stage_id].iters.len();
    let mut chunks: Vec<std::ops::Range<usize>> = Vec::new();

    let mut pos = 0;
    for _ in 0..n_orig {
        let kind = state.stages()[stage_id].iters[pos].kind;
        if kind == IterKind::Spatial {
            let range = state.split(stage_id, pos, &vec![None; level], true)?;
            pos = range.end;
            chunks.push(range);
        } else {
            pos += 1;
        }
    }

    let n_chunks = chunks.len();
    let mut order = Vec::with_capacity(pos);
    for part in 0..=level {
        for range in &chunks {
            order.push(range.start + part);
        }
    }
    // Reduction iterators (if any) keep their positions after the tiles.
    for i in 0..pos {
        if !order.contains(&i) {
            order.push(i);
        }
    }
    state.reorder(stage_id, &order)?;
    Ok(level * n_chunks - 1)
}

/// Fuse all reduction iterators of a stage into one.
///
/// Returns the fused iterator's position and the number of spatial
/// iterators (the factor-axis position an rfactor of the fused iterator
/// should use).
pub fn fuse_all_reduction_iterators(state: &mut State, stage_id: usize) -> Result<(usize, usize)> {
    let stage = &state.stages()[stage_id];
    let n_space = stage.iters.iter().filter(|it| it.kind == IterKind::Spatial).count();
    let reduce_ids: Vec<usize> = stage
        .iters
        .iter()
        .enumerate()
        .filter(|(_, it)| it.kind == IterKind::Reduction)
        .map(|(pos, _)| pos)
        .collect();
    debug_assert!(!reduce_ids.is_empty(), "caller guarantees a reduction iterator");

    let fused_pos = if reduce_ids.len() > 1 { state.fuse(stage_id, &reduce_ids)? } else { reduce_ids[0] };
    Ok((fused_pos, n_space))
}
