//! Body and index expressions for compute operations.
//!
//! This is a deliberately small expression tree: it carries exactly the
//! structure the access analyzer needs (which tensors are read at which
//! multi-dimensional indices, whether an index is affine in the spatial
//! iterators, and whether a body contains branches or expensive calls).
//! Lowering to target code is out of scope for this crate.

use std::fmt;

/// A scalar expression appearing in a compute body or a read index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    /// Integer constant.
    Const(i64),
    /// Reference to an iterator variable, named after its axis.
    Var(String),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    FloorDiv(Box<Expr>, Box<Expr>),
    /// Read of another operation's output at multi-dimensional indices.
    Read { producer: String, indices: Vec<Expr> },
    /// Conditional select; counts as control flow for inlining analysis.
    Select { cond: Box<Expr>, then_value: Box<Expr>, else_value: Box<Expr> },
    /// Intrinsic call. `expensive` marks intrinsics (exp, log, ...) that
    /// disqualify a body from strict inlining.
    Call { name: String, args: Vec<Expr>, expensive: bool },
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    pub fn read(producer: impl Into<String>, indices: impl IntoIterator<Item = Expr>) -> Self {
        Expr::Read { producer: producer.into(), indices: indices.into_iter().collect() }
    }

    pub fn add(self, rhs: Expr) -> Self {
        Expr::Add(Box::new(self), Box::new(rhs))
    }

    pub fn sub(self, rhs: Expr) -> Self {
        Expr::Sub(Box::new(self), Box::new(rhs))
    }

    pub fn mul(self, rhs: Expr) -> Self {
        Expr::Mul(Box::new(self), Box::new(rhs))
    }

    pub fn call(name: impl Into<String>, args: impl IntoIterator<Item = Expr>, expensive: bool) -> Self {
        Expr::Call { name: name.into(), args: args.into_iter().collect(), expensive }
    }

    /// Visit every subexpression, including `self`.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Const(_) | Expr::Var(_) => {}
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::FloorDiv(a, b) => {
                a.walk(f);
                b.walk(f);
            }
            Expr::Read { indices, .. } => {
                for idx in indices {
                    idx.walk(f);
                }
            }
            Expr::Select { cond, then_value, else_value } => {
                cond.walk(f);
                then_value.walk(f);
                else_value.walk(f);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.walk(f);
                }
            }
        }
    }

    /// Collect every `(producer, indices)` read in this expression.
    pub fn collect_reads(&self) -> Vec<(&str, &[Expr])> {
        let mut reads = Vec::new();
        self.walk(&mut |e| {
            if let Expr::Read { producer, indices } = e {
                reads.push((producer.as_str(), indices.as_slice()));
            }
        });
        reads
    }

    /// Collect the names of all iterator variables referenced.
    pub fn referenced_vars(&self) -> std::collections::BTreeSet<String> {
        let mut vars = std::collections::BTreeSet::new();
        self.walk(&mut |e| {
            if let Expr::Var(name) = e {
                vars.insert(name.clone());
            }
        });
        vars
    }

    /// Whether the expression contains a conditional.
    pub fn has_branch(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| found |= matches!(e, Expr::Select { .. }));
        found
    }

    /// Whether the expression contains an expensive intrinsic call.
    pub fn has_expensive_call(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| found |= matches!(e, Expr::Call { expensive: true, .. }));
        found
    }

    /// Whether this expression is affine (degree at most one) in iterator
    /// variables, with every referenced variable drawn from `allowed`.
    ///
    /// Reads, selects and calls are never affine indices.
    pub fn is_affine_in(&self, allowed: &std::collections::BTreeSet<String>) -> bool {
        self.degree_in(allowed).is_some_and(|d| d <= 1)
    }

    /// Polynomial degree in iterator variables, or `None` if non-polynomial
    /// or if a variable outside `allowed` appears.
    fn degree_in(&self, allowed: &std::collections::BTreeSet<String>) -> Option<u32> {
        match self {
            Expr::Const(_) => Some(0),
            Expr::Var(name) => allowed.contains(name).then_some(1),
            Expr::Add(a, b) | Expr::Sub(a, b) => Some(a.degree_in(allowed)?.max(b.degree_in(allowed)?)),
            Expr::Mul(a, b) => Some(a.degree_in(allowed)? + b.degree_in(allowed)?),
            Expr::FloorDiv(a, b) => {
                // Division by a constant keeps the numerator's degree.
                let db = b.degree_in(allowed)?;
                if db == 0 { a.degree_in(allowed) } else { None }
            }
            Expr::Read { .. } | Expr::Select { .. } | Expr::Call { .. } => None,
        }
    }

    /// Redirect every read of `from` to `to`; used when cache stages are
    /// spliced into a replayed DAG.
    pub fn retarget_reads(&mut self, from: &str, to: &str) {
        match self {
            Expr::Const(_) | Expr::Var(_) => {}
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::FloorDiv(a, b) => {
                a.retarget_reads(from, to);
                b.retarget_reads(from, to);
            }
            Expr::Read { producer, indices } => {
                if producer == from {
                    *producer = to.to_owned();
                }
                for idx in indices {
                    idx.retarget_reads(from, to);
                }
            }
            Expr::Select { cond, then_value, else_value } => {
                cond.retarget_reads(from, to);
                then_value.retarget_reads(from, to);
                else_value.retarget_reads(from, to);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.retarget_reads(from, to);
                }
            }
        }
    }

    /// Number of arithmetic operations, used for FLOP estimation.
    pub fn flop_count(&self) -> u64 {
        let mut count = 0u64;
        self.walk(&mut |e| {
            count += match e {
                Expr::Add(..) | Expr::Sub(..) | Expr::Mul(..) | Expr::FloorDiv(..) | Expr::Call { .. } => 1,
                Expr::Select { .. } => 1,
                _ => 0,
            }
        });
        count
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(v) => write!(f, "{v}"),
            Expr::Var(name) => write!(f, "{name}"),
            Expr::Add(a, b) => write!(f, "({a} + {b})"),
            Expr::Sub(a, b) => write!(f, "({a} - {b})"),
            Expr::Mul(a, b) => write!(f, "({a}*{b})"),
            Expr::FloorDiv(a, b) => write!(f, "({a}//{b})"),
            Expr::Read { producer, indices } => {
                write!(f, "{producer}[")?;
                for (i, idx) in indices.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{idx}")?;
                }
                write!(f, "]")
            }
            Expr::Select { cond, then_value, else_value } => {
                write!(f, "select({cond}, {then_value}, {else_value})")
            }
            Expr::Call { name, args, .. } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}
