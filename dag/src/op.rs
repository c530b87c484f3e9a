//! Tensor operations: the nodes of a compute DAG.

use std::collections::BTreeSet;
use std::fmt;

use crate::expr::Expr;

/// A named loop axis with a static extent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Axis {
    pub name: String,
    pub extent: u64,
}

impl Axis {
    pub fn new(name: impl Into<String>, extent: u64) -> Self {
        Self { name: name.into(), extent }
    }
}

/// Scheduling hints attached to an operation by its author.
///
/// The search policy reads these but never writes them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpAttrs {
    /// The stage must always be inlined, bypassing the inlinability analysis.
    pub always_compute_inline: bool,
    /// Never add a cache-write stage for this operation.
    pub no_cache_write: bool,
    /// Iterator names that must be unrolled.
    pub always_unroll: BTreeSet<String>,
    /// Iterator names whose innermost tile parts must be unrolled.
    pub always_unroll_inner: BTreeSet<String>,
}

impl OpAttrs {
    pub fn is_empty(&self) -> bool {
        !self.always_compute_inline
            && !self.no_cache_write
            && self.always_unroll.is_empty()
            && self.always_unroll_inner.is_empty()
    }
}

/// The payload distinguishing placeholder inputs from computed tensors.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// An input tensor; carries only its shape.
    Placeholder { shape: Vec<u64> },
    /// A computed tensor: spatial output axes, optional reduction axes and a
    /// body expression reading other operations.
    Compute { axes: Vec<Axis>, reduce_axes: Vec<Axis>, body: Expr },
}

/// A node in the compute DAG.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub name: String,
    pub kind: OpKind,
    pub attrs: OpAttrs,
}

impl Operation {
    pub fn placeholder(name: impl Into<String>, shape: impl Into<Vec<u64>>) -> Self {
        Self { name: name.into(), kind: OpKind::Placeholder { shape: shape.into() }, attrs: OpAttrs::default() }
    }

    pub fn compute(
        name: impl Into<String>,
        axes: impl Into<Vec<Axis>>,
        reduce_axes: impl Into<Vec<Axis>>,
        body: Expr,
    ) -> Self {
        Self {
            name: name.into(),
            kind: OpKind::Compute { axes: axes.into(), reduce_axes: reduce_axes.into(), body },
            attrs: OpAttrs::default(),
        }
    }

    pub fn with_attrs(mut self, attrs: OpAttrs) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.kind, OpKind::Placeholder { .. })
    }

    /// Spatial output axes; empty for placeholders.
    pub fn axes(&self) -> &[Axis] {
        match &self.kind {
            OpKind::Placeholder { .. } => &[],
            OpKind::Compute { axes, .. } => axes,
        }
    }

    /// Reduction axes; empty for placeholders.
    pub fn reduce_axes(&self) -> &[Axis] {
        match &self.kind {
            OpKind::Placeholder { .. } => &[],
            OpKind::Compute { reduce_axes, .. } => reduce_axes,
        }
    }

    pub fn has_reduce(&self) -> bool {
        !self.reduce_axes().is_empty()
    }

    pub fn body(&self) -> Option<&Expr> {
        match &self.kind {
            OpKind::Placeholder { .. } => None,
            OpKind::Compute { body, .. } => Some(body),
        }
    }

    pub fn body_mut(&mut self) -> Option<&mut Expr> {
        match &mut self.kind {
            OpKind::Placeholder { .. } => None,
            OpKind::Compute { body, .. } => Some(body),
        }
    }

    /// Output tensor shape.
    pub fn output_shape(&self) -> Vec<u64> {
        match &self.kind {
            OpKind::Placeholder { shape } => shape.clone(),
            OpKind::Compute { axes, .. } => axes.iter().map(|a| a.extent).collect(),
        }
    }

    /// Names of the spatial axes, in order.
    pub fn spatial_axis_names(&self) -> BTreeSet<String> {
        self.axes().iter().map(|a| a.name.clone()).collect()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            OpKind::Placeholder { shape } => write!(f, "{} = placeholder({shape:?})", self.name),
            OpKind::Compute { axes, reduce_axes, body } => {
                write!(f, "{}[", self.name)?;
                for (i, a) in axes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}:{}", a.name, a.extent)?;
                }
                write!(f, "]")?;
                if !reduce_axes.is_empty() {
                    write!(f, " reduce[")?;
                    for (i, a) in reduce_axes.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}:{}", a.name, a.extent)?;
                    }
                    write!(f, "]")?;
                }
                write!(f, " = {body}")
            }
        }
    }
}
