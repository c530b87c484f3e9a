//! Error types for the search policy.

use snafu::Snafu;

/// Result type for search operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the search policy.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A transform-step precondition was violated; indicates a rule bug.
    #[snafu(display("transform failed: {source}"))]
    Transform { source: zorya_dag::Error },

    /// Sketch generation produced no states.
    #[snafu(display("sketch generation produced no states"))]
    NoSketches,

    /// The measurer reported a cancellation or infrastructure failure.
    #[snafu(display("measurement aborted: {reason}"))]
    MeasureAborted { reason: String },
}

impl From<zorya_dag::Error> for Error {
    fn from(source: zorya_dag::Error) -> Self {
        Error::Transform { source }
    }
}
