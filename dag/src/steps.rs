//! Transform steps: the append-only history a schedule is made of.
//!
//! Each step is pure data. Applying a step to a [`State`](crate::state::State)
//! derives new stages deterministically, so replaying a step list from the
//! DAG's initial state reproduces the schedule exactly. Steps also have a
//! canonical text form used for state hashing and log records.

use std::fmt;

use smallvec::SmallVec;

use crate::error::{Error, MalformedRecordSnafu, Result};

/// Split lengths; entries may be unknown until the tile-filling pass runs.
pub type SplitLengths = SmallVec<[Option<u64>; 4]>;

/// A single schedule transform.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformStep {
    /// Replace one iterator with `lengths.len() + 1` nested iterators.
    ///
    /// `extent` records the split iterator's extent at application time;
    /// the tile-filling pass samples factorizations of it. With
    /// `inner_to_outer`, `lengths` are the inner part extents and the
    /// outermost part absorbs rounding; otherwise the roles flip.
    Split { stage_id: usize, iter_id: usize, extent: Option<u64>, lengths: SplitLengths, inner_to_outer: bool },
    /// Merge contiguous iterators into one.
    Fuse { stage_id: usize, iter_ids: SmallVec<[usize; 4]> },
    /// Permute a stage's iterators.
    Reorder { stage_id: usize, after_ids: Vec<usize> },
    /// Attach a stage's computation under an iterator of another stage.
    ComputeAt { stage_id: usize, target_stage_id: usize, target_iter_id: usize },
    /// Detach a stage back to root scope.
    ComputeRoot { stage_id: usize },
    /// Inline a stage into its consumers.
    ComputeInline { stage_id: usize },
    /// Insert a read cache of a stage, redirecting the given readers.
    CacheRead { stage_id: usize, scope: String, reader_stage_ids: Vec<usize> },
    /// Insert a write cache: the computation moves to a new `{op}.{scope}`
    /// stage and the original becomes an elementwise copy of it.
    CacheWrite { stage_id: usize, scope: String },
    /// Factor a reduction iterator out into a new spatial axis of an
    /// intermediate stage.
    Rfactor { stage_id: usize, iter_id: usize, factor_axis: usize },
    Parallel { stage_id: usize, iter_id: usize },
    Vectorize { stage_id: usize, iter_id: usize },
    Unroll { stage_id: usize, iter_id: usize },
    /// Attach a pragma string to an iterator (e.g. `auto_unroll_max_step$64`).
    Pragma { stage_id: usize, iter_id: usize, pragma: String },
    /// Map an iterator onto a hardware intrinsic.
    Tensorize { stage_id: usize, iter_id: usize, intrinsic: String },
}

impl TransformStep {
    /// Whether applying this step changes the underlying DAG.
    pub fn mutates_dag(&self) -> bool {
        matches!(
            self,
            TransformStep::CacheRead { .. } | TransformStep::CacheWrite { .. } | TransformStep::Rfactor { .. }
        )
    }

    /// Parse one canonical record, the inverse of `Display`.
    pub fn parse_record(record: &str) -> Result<Self> {
        let inner = record
            .trim()
            .strip_prefix('(')
            .and_then(|r| r.strip_suffix(')'))
            .ok_or_else(|| malformed(record))?;
        let fields = split_fields(inner);
        let kind = *fields.first().ok_or_else(|| malformed(record))?;
        let field = |i: usize| fields.get(i).copied().ok_or_else(|| malformed(record));
        let num = |i: usize| -> Result<usize> { field(i)?.parse().map_err(|_| malformed(record)) };

        let step = match kind {
            "split" => TransformStep::Split {
                stage_id: num(1)?,
                iter_id: num(2)?,
                extent: parse_opt(field(3)?).map_err(|_| malformed(record))?,
                lengths: parse_opt_list(field(4)?).map_err(|_| malformed(record))?,
                inner_to_outer: field(5)? == "1",
            },
            "fuse" => TransformStep::Fuse {
                stage_id: num(1)?,
                iter_ids: parse_list(field(2)?).map_err(|_| malformed(record))?,
            },
            "reorder" => TransformStep::Reorder {
                stage_id: num(1)?,
                after_ids: parse_list(field(2)?).map_err(|_| malformed(record))?,
            },
            "compute_at" => {
                TransformStep::ComputeAt { stage_id: num(1)?, target_stage_id: num(2)?, target_iter_id: num(3)? }
            }
            "compute_root" => TransformStep::ComputeRoot { stage_id: num(1)? },
            "compute_inline" => TransformStep::ComputeInline { stage_id: num(1)? },
            "cache_read" => TransformStep::CacheRead {
                stage_id: num(1)?,
                scope: field(2)?.to_owned(),
                reader_stage_ids: parse_list(field(3)?).map_err(|_| malformed(record))?,
            },
            "cache_write" => TransformStep::CacheWrite { stage_id: num(1)?, scope: field(2)?.to_owned() },
            "rfactor" => TransformStep::Rfactor { stage_id: num(1)?, iter_id: num(2)?, factor_axis: num(3)? },
            "parallel" => TransformStep::Parallel { stage_id: num(1)?, iter_id: num(2)? },
            "vectorize" => TransformStep::Vectorize { stage_id: num(1)?, iter_id: num(2)? },
            "unroll" => TransformStep::Unroll { stage_id: num(1)?, iter_id: num(2)? },
            "pragma" => {
                TransformStep::Pragma { stage_id: num(1)?, iter_id: num(2)?, pragma: field(3)?.to_owned() }
            }
            "tensorize" => {
                TransformStep::Tensorize { stage_id: num(1)?, iter_id: num(2)?, intrinsic: field(3)?.to_owned() }
            }
            _ => return Err(malformed(record)),
        };
        Ok(step)
    }
}

impl fmt::Display for TransformStep {
    /// Canonical record format, the inverse of [`TransformStep::parse_record`].
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformStep::Split { stage_id, iter_id, extent, lengths, inner_to_outer } => {
                let lengths: Vec<String> = lengths.iter().map(|l| fmt_opt(*l)).collect();
                write!(
                    f,
                    "(split,{stage_id},{iter_id},{},[{}],{})",
                    fmt_opt(*extent),
                    lengths.join(","),
                    u8::from(*inner_to_outer)
                )
            }
            TransformStep::Fuse { stage_id, iter_ids } => {
                write!(f, "(fuse,{stage_id},{})", fmt_list(iter_ids.iter()))
            }
            TransformStep::Reorder { stage_id, after_ids } => {
                write!(f, "(reorder,{stage_id},{})", fmt_list(after_ids.iter()))
            }
            TransformStep::ComputeAt { stage_id, target_stage_id, target_iter_id } => {
                write!(f, "(compute_at,{stage_id},{target_stage_id},{target_iter_id})")
            }
            TransformStep::ComputeRoot { stage_id } => write!(f, "(compute_root,{stage_id})"),
            TransformStep::ComputeInline { stage_id } => write!(f, "(compute_inline,{stage_id})"),
            TransformStep::CacheRead { stage_id, scope, reader_stage_ids } => {
                write!(f, "(cache_read,{stage_id},{scope},{})", fmt_list(reader_stage_ids.iter()))
            }
            TransformStep::CacheWrite { stage_id, scope } => write!(f, "(cache_write,{stage_id},{scope})"),
            TransformStep::Rfactor { stage_id, iter_id, factor_axis } => {
                write!(f, "(rfactor,{stage_id},{iter_id},{factor_axis})")
            }
            TransformStep::Parallel { stage_id, iter_id } => write!(f, "(parallel,{stage_id},{iter_id})"),
            TransformStep::Vectorize { stage_id, iter_id } => write!(f, "(vectorize,{stage_id},{iter_id})"),
            TransformStep::Unroll { stage_id, iter_id } => write!(f, "(unroll,{stage_id},{iter_id})"),
            TransformStep::Pragma { stage_id, iter_id, pragma } => {
                write!(f, "(pragma,{stage_id},{iter_id},{pragma})")
            }
            TransformStep::Tensorize { stage_id, iter_id, intrinsic } => {
                write!(f, "(tensorize,{stage_id},{iter_id},{intrinsic})")
            }
        }
    }
}

fn fmt_list<'a>(ids: impl Iterator<Item = &'a usize>) -> String {
    let items: Vec<String> = ids.map(|id| id.to_string()).collect();
    format!("[{}]", items.join(","))
}

fn malformed(record: &str) -> Error {
    MalformedRecordSnafu { record: record.to_owned() }.build()
}

/// Split a record body on top-level commas (commas inside `[...]` are kept).
fn split_fields(inner: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (pos, ch) in inner.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                fields.push(inner[start..pos].trim());
                start = pos + 1;
            }
            _ => {}
        }
    }
    fields.push(inner[start..].trim());
    fields
}

fn parse_opt(text: &str) -> std::result::Result<Option<u64>, ()> {
    if text == "?" { Ok(None) } else { text.parse().map(Some).map_err(|_| ()) }
}

fn parse_opt_list(text: &str) -> std::result::Result<SplitLengths, ()> {
    let inner = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')).ok_or(())?;
    if inner.trim().is_empty() {
        return Ok(SplitLengths::new());
    }
    inner.split(',').map(|part| parse_opt(part.trim())).collect()
}

fn parse_list<C: FromIterator<usize>>(text: &str) -> std::result::Result<C, ()> {
    let inner = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')).ok_or(())?;
    if inner.trim().is_empty() {
        return Ok(std::iter::empty().collect());
    }
    inner.split(',').map(|part| part.trim().parse().map_err(|_| ())).collect()
}

fn fmt_opt(value: Option<u64>) -> String {
    value.map_or_else(|| "?".to_owned(), |v| v.to_string())
}
