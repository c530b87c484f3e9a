//! Error types for DAG construction and loop-state transforms.

use snafu::Snafu;

/// Result type for DAG and loop-state operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by DAG construction and transform-step application.
///
/// Transform precondition violations indicate a bug in the caller (usually a
/// search rule); they are not recoverable and callers are expected to
/// propagate them.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// An operation reads a tensor that is not defined earlier in the DAG.
    #[snafu(display("operation '{op}' reads unknown producer '{producer}'"))]
    UnknownProducer { op: String, producer: String },

    /// A tensor axis has extent zero.
    #[snafu(display("axis '{axis}' of operation '{op}' has zero extent"))]
    ZeroExtent { op: String, axis: String },

    /// Two operations share a name.
    #[snafu(display("duplicate operation name '{op}'"))]
    DuplicateOperation { op: String },

    /// A stage index is out of range.
    #[snafu(display("stage id {stage_id} out of range (have {num_stages} stages)"))]
    StageOutOfRange { stage_id: usize, num_stages: usize },

    /// An iterator index is out of range for its stage.
    #[snafu(display("iterator id {iter_id} out of range in stage {stage_id} (have {num_iters})"))]
    IterOutOfRange { stage_id: usize, iter_id: usize, num_iters: usize },

    /// A transform was applied to a stage kind that does not support it.
    #[snafu(display("cannot apply {transform} to placeholder stage {stage_id}"))]
    PlaceholderStage { transform: &'static str, stage_id: usize },

    /// Fuse was asked to merge non-adjacent iterators.
    #[snafu(display("fuse requires contiguous iterators in stage {stage_id}, got {iter_ids:?}"))]
    NonContiguousFuse { stage_id: usize, iter_ids: Vec<usize> },

    /// Reorder was given something that is not a permutation of the iterators.
    #[snafu(display("reorder order is not a permutation of stage {stage_id} iterators"))]
    InvalidReorder { stage_id: usize },

    /// Compute-inline was applied to a stage that is not strictly inlinable.
    #[snafu(display("stage {stage_id} ('{op}') is not strictly inlinable"))]
    NotInlinable { stage_id: usize, op: String },

    /// Rfactor was applied to a spatial iterator.
    #[snafu(display("rfactor target iterator {iter_id} in stage {stage_id} is not a reduction"))]
    RfactorNeedsReduction { stage_id: usize, iter_id: usize },

    /// A step preceding an rfactor was expected to be a split.
    #[snafu(display("rfactor step {step_id} is not preceded by a split step"))]
    RfactorWithoutSplit { step_id: usize },

    /// Canonical-form text could not be parsed.
    #[snafu(display("malformed canonical step record: {record}"))]
    MalformedRecord { record: String },
}
