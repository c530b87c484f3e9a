//! Compute DAG and loop-state model for the zorya auto-scheduler.
//!
//! This crate carries the data the search policy operates on:
//!
//! - [`expr`] / [`op`] - a small tensor-expression layer: operations with
//!   spatial and reduction axes reading each other at multi-dimensional
//!   indices.
//! - [`dag`] - the immutable [`ComputeDAG`]: operations in topological
//!   order, a FLOP estimate, a stable workload key and bound inference.
//! - [`analysis`] - the [`AccessAnalyzer`]: per-operation predicates
//!   (strict-inlinable, needs-multi-level-tiling, is-output) and pairwise
//!   relations (read-from/read-by, elementwise match, common outer
//!   iterators) consulted by the search rules.
//! - [`state`] / [`steps`] - the loop state: schedule snapshots as an
//!   append-only [`TransformStep`] history with derived per-stage iterators
//!   and the bidirectional compute-at attachment map.
//!
//! States are value types. Cloning shares stage data until a mutation
//! touches it; replaying a state's history from `ComputeDAG::init_state`
//! reproduces the state exactly.

pub mod analysis;
pub mod dag;
pub mod error;
pub mod expr;
pub mod op;
pub mod state;
pub mod steps;

#[cfg(test)]
pub mod test;

pub use analysis::{AccessAnalyzer, OpId};
pub use dag::ComputeDAG;
pub use error::{Error, Result};
pub use expr::Expr;
pub use op::{Axis, OpAttrs, OpKind, Operation};
pub use state::{
    AttachMap, ComputeAt, IterAnnotation, IterKind, Iterator, Stage, StageAttrs, StageKind, State,
    extract_original_iterators,
};
pub use steps::{SplitLengths, TransformStep};
