//! Static read/write access analysis over a compute DAG.
//!
//! Built once per DAG. The search policy consults these predicates and
//! relations on every rule evaluation, so everything is precomputed here and
//! the per-query work is a map lookup.

use std::collections::{BTreeSet, HashMap};

use crate::expr::Expr;
use crate::op::Operation;
use crate::state::{ComputeAt, State};

/// Index of an operation inside its DAG's topological order.
pub type OpId = usize;

/// Precomputed access predicates and pairwise relations.
///
/// Invariant: `read_from[a]` contains `b` iff `read_by[b]` contains `a`,
/// with identical index-tuple lists.
#[derive(Debug, Clone, Default)]
pub struct AccessAnalyzer {
    /// consumer -> producer -> list of multi-dimensional read index tuples.
    read_from: Vec<HashMap<OpId, Vec<Vec<Expr>>>>,
    /// producer -> consumer -> list of multi-dimensional read index tuples.
    read_by: Vec<HashMap<OpId, Vec<Vec<Expr>>>>,
    /// Longest common outer iterator prefix for related pairs.
    num_common_outer: HashMap<(OpId, OpId), usize>,
    is_simple_access: Vec<bool>,
    is_strict_inlinable: Vec<bool>,
    needs_multi_level_tiling: Vec<bool>,
    is_output: Vec<bool>,
}

impl AccessAnalyzer {
    /// Analyze `ops`, which must already be in topological order with all
    /// read targets resolvable through `op_ids`.
    pub fn new(ops: &[std::sync::Arc<Operation>], op_ids: &HashMap<String, OpId>) -> Self {
        let n = ops.len();
        let mut read_from: Vec<HashMap<OpId, Vec<Vec<Expr>>>> = vec![HashMap::new(); n];
        let mut read_by: Vec<HashMap<OpId, Vec<Vec<Expr>>>> = vec![HashMap::new(); n];

        for (consumer_id, op) in ops.iter().enumerate() {
            let Some(body) = op.body() else { continue };
            for (producer, indices) in body.collect_reads() {
                let producer_id = op_ids[producer];
                let tuple: Vec<Expr> = indices.to_vec();
                read_from[consumer_id].entry(producer_id).or_default().push(tuple.clone());
                read_by[producer_id].entry(consumer_id).or_default().push(tuple);
            }
        }

        let mut analyzer = Self {
            read_from,
            read_by,
            num_common_outer: HashMap::new(),
            is_simple_access: vec![false; n],
            is_strict_inlinable: vec![false; n],
            needs_multi_level_tiling: vec![false; n],
            is_output: vec![false; n],
        };

        for (id, op) in ops.iter().enumerate() {
            analyzer.is_output[id] = analyzer.read_by[id].is_empty();
            if op.is_placeholder() {
                continue;
            }

            let spatial = op.spatial_axis_names();
            let body = op.body().expect("compute op has a body");

            // Simple access: every read index is affine in spatial iterators
            // only. Reduction iterators in an index disqualify the op.
            let simple = body
                .collect_reads()
                .iter()
                .all(|(_, indices)| indices.iter().all(|idx| idx.is_affine_in(&spatial)));
            analyzer.is_simple_access[id] = simple;
            analyzer.is_strict_inlinable[id] = simple && !body.has_branch() && !body.has_expensive_call();

            // Multi-level tiling pays off when some input is reused across a
            // spatial dimension it does not index (matmul/conv signature).
            if op.has_reduce() {
                let num_spatial = op.axes().len();
                analyzer.needs_multi_level_tiling[id] = body.collect_reads().iter().any(|(_, indices)| {
                    let referenced: BTreeSet<String> = indices
                        .iter()
                        .flat_map(|idx| idx.referenced_vars())
                        .filter(|v| spatial.contains(v))
                        .collect();
                    referenced.len() < num_spatial
                });
            }
        }

        // Common outer iterator prefix per related pair.
        for (producer_id, consumers) in analyzer.read_by.iter().enumerate() {
            for (&consumer_id, tuples) in consumers {
                let count = common_outer_count(&ops[producer_id], &ops[consumer_id], tuples);
                analyzer.num_common_outer.insert((producer_id, consumer_id), count);
            }
        }

        analyzer
    }

    pub fn is_simple_access(&self, op: OpId) -> bool {
        self.is_simple_access[op]
    }

    pub fn is_strict_inlinable(&self, op: OpId) -> bool {
        self.is_strict_inlinable[op]
    }

    pub fn needs_multi_level_tiling(&self, op: OpId) -> bool {
        self.needs_multi_level_tiling[op]
    }

    pub fn is_output(&self, op: OpId) -> bool {
        self.is_output[op]
    }

    /// Read index tuples of `producer` as seen by `consumer`.
    pub fn read_tuples(&self, producer: OpId, consumer: OpId) -> Option<&Vec<Vec<Expr>>> {
        self.read_by[producer].get(&consumer)
    }

    /// Number of common outer iterators between a related producer/consumer
    /// pair; zero for unrelated pairs.
    pub fn num_common_outer_iterators(&self, a: OpId, b: OpId) -> usize {
        self.num_common_outer.get(&(a, b)).or_else(|| self.num_common_outer.get(&(b, a))).copied().unwrap_or(0)
    }

    /// Consumers of `op` under `state`: stages currently marked inlined are
    /// transparently skipped, their consumers taken instead.
    pub fn consumers(&self, state: &State, op: OpId) -> BTreeSet<OpId> {
        let mut out = BTreeSet::new();
        self.collect_consumers(state, op, &mut out);
        out
    }

    fn collect_consumers(&self, state: &State, op: OpId, out: &mut BTreeSet<OpId>) {
        for &consumer in self.read_by[op].keys() {
            if state.stages()[consumer].compute_at == ComputeAt::Inlined {
                self.collect_consumers(state, consumer, out);
            } else {
                out.insert(consumer);
            }
        }
    }

    /// Producers of `op` under `state`, skipping inlined stages.
    pub fn producers(&self, state: &State, op: OpId) -> BTreeSet<OpId> {
        let mut out = BTreeSet::new();
        self.collect_producers(state, op, &mut out);
        out
    }

    fn collect_producers(&self, state: &State, op: OpId, out: &mut BTreeSet<OpId>) {
        for &producer in self.read_from[op].keys() {
            if state.stages()[producer].compute_at == ComputeAt::Inlined {
                self.collect_producers(state, producer, out);
            } else {
                out.insert(producer);
            }
        }
    }

    /// Whether `target` consumes `op` elementwise: equal output shapes and
    /// every read of `op` indexed exactly by `target`'s own spatial axes.
    /// The relation propagates through chains of elementwise ops.
    pub fn elementwise_match(&self, ops: &[std::sync::Arc<Operation>], op: OpId, target: OpId) -> bool {
        if self.direct_elementwise_match(ops, op, target) {
            return true;
        }
        self.read_by[op].keys().any(|&mid| {
            self.direct_elementwise_match(ops, op, mid) && self.elementwise_match(ops, mid, target)
        })
    }

    fn direct_elementwise_match(&self, ops: &[std::sync::Arc<Operation>], op: OpId, target: OpId) -> bool {
        let Some(tuples) = self.read_by[op].get(&target) else { return false };
        if ops[op].output_shape() != ops[target].output_shape() {
            return false;
        }
        let target_axes = ops[target].axes();
        tuples.iter().all(|tuple| {
            tuple.len() == target_axes.len()
                && tuple
                    .iter()
                    .zip(target_axes)
                    .all(|(idx, axis)| matches!(idx, Expr::Var(name) if *name == axis.name))
        })
    }
}

/// Longest prefix of the producer's and consumer's spatial axes that line up
/// identically (same extent) in every access relating the two ops.
fn common_outer_count(producer: &Operation, consumer: &Operation, tuples: &[Vec<Expr>]) -> usize {
    let producer_shape = producer.output_shape();
    let consumer_axes = consumer.axes();
    let mut count = 0;
    'outer: for (pos, axis) in consumer_axes.iter().enumerate() {
        if pos >= producer_shape.len() || producer_shape[pos] != axis.extent {
            break;
        }
        for tuple in tuples {
            match tuple.get(pos) {
                Some(Expr::Var(name)) if *name == axis.name => {}
                _ => break 'outer,
            }
        }
        count += 1;
    }
    count
}
