//! Sketch-based schedule search for the zorya auto-scheduler.
//!
//! Given a [`SearchTask`] (a compute DAG plus hardware parameters), the
//! [`SketchSearchPolicy`] explores the space of legal loop-nest schedules
//! and returns the best state it can find:
//!
//! 1. **Sketch generation** ([`rules::sketch`]) - rule-directed enumeration
//!    derives a small set of structural sketches (tiling shape, fusion,
//!    caching, reduction factorization).
//! 2. **Population sampling** ([`rules::init`]) - randomized annotators turn
//!    sketches into concrete candidates: tile sizes, compute locations,
//!    parallel/vectorize/unroll decorations.
//! 3. **Outer loop** ([`policy`]) - cost-model guided selection with
//!    epsilon-greedy exploration, on-hardware measurement through a
//!    [`Measurer`], and cost-model retraining.
//!
//! The cost model ([`cost_model`]) and the measurer ([`measure`]) are
//! pluggable; [`RandomModel`] is the cold-start baseline whose presence
//! makes the policy skip the evolutionary phase.

pub mod config;
pub mod cost_model;
pub mod error;
pub mod measure;
pub mod policy;
pub mod rules;
pub mod split_memo;

#[cfg(test)]
pub mod test;

pub use config::{EvolutionParams, HardwareParams, SearchParams, SearchTask};
pub use cost_model::{CostModel, RandomModel};
pub use error::{Error, Result};
pub use measure::{FAILURE_COST, MeasureInput, MeasureResult, Measurer};
pub use policy::{SearchCallback, SketchSearchPolicy};
pub use rules::{ConditionKind, InitResultKind, default_init_rules, default_sketch_rules};
pub use split_memo::SplitFactorizationMemo;
