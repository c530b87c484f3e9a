//! Memoized enumeration of tile-size factorization schemes.

use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;

/// One way to split an extent: the lengths of the inner parts, outermost
/// first. The derived outer part is `extent / product(lengths)`.
pub type FactorScheme = SmallVec<[u64; 4]>;

/// Cache of factorization schemes keyed by `(extent, n_lengths, max_innermost)`.
///
/// A scheme is an exact factorization of `extent` into `n_lengths + 1`
/// positive integers with the innermost factor bounded by `max_innermost`;
/// enumeration is exponential in `n_lengths`, so results are shared.
#[derive(Debug, Default)]
pub struct SplitFactorizationMemo {
    memo: HashMap<(u64, usize, u64), Arc<Vec<FactorScheme>>>,
}

impl SplitFactorizationMemo {
    pub fn new() -> Self {
        Self::default()
    }

    /// All factorization schemes for splitting `extent` into `n_lengths + 1`
    /// parts with the innermost part at most `max_innermost`.
    pub fn get_factorization_schemes(
        &mut self,
        extent: u64,
        n_lengths: usize,
        max_innermost: u64,
    ) -> Arc<Vec<FactorScheme>> {
        self.memo
            .entry((extent, n_lengths, max_innermost))
            .or_insert_with(|| {
                let mut schemes = Vec::new();
                let mut current = FactorScheme::new();
                enumerate(extent, n_lengths, max_innermost, &mut current, &mut schemes);
                Arc::new(schemes)
            })
            .clone()
    }
}

/// Depth-first enumeration of ordered divisor tuples.
fn enumerate(
    remaining: u64,
    n_lengths: usize,
    max_innermost: u64,
    current: &mut FactorScheme,
    out: &mut Vec<FactorScheme>,
) {
    if n_lengths == 0 {
        // The derived outer part takes whatever is left; only the innermost
        // explicit length is bounded.
        if current.last().is_none_or(|&l| l <= max_innermost) {
            out.push(current.clone());
        }
        return;
    }
    let mut factor = 1;
    while factor * factor <= remaining {
        if remaining % factor == 0 {
            let paired = remaining / factor;
            let candidates: &[u64] = if paired == factor { &[factor] } else { &[factor, paired] };
            for &f in candidates {
                current.push(f);
                enumerate(remaining / f, n_lengths - 1, max_innermost, current, out);
                current.pop();
            }
        }
        factor += 1;
    }
}
