//! Heap-ref partitioning: the single chokepoint every region access passes
//! through. A possibly-symbolic reference is split into guarded concrete
//! cases plus symbolic residuals, so each case can be routed to the cheap
//! allocated partition or the input partition.

use common::log_debug;

use crate::abs::RawAddress;
use crate::config::PartitioningConfig;
use crate::expr::{Expr, ExprContext, ExprRef};

#[derive(Debug, Clone)]
pub(crate) struct GuardedExpr<T> {
    pub expr: T,
    pub guard: ExprRef,
}

/// Case split of one reference. The union of all guards, under the
/// assumption that the reference is not null, is a tautology; null leaves
/// are excluded (their guard slice is unsatisfiable for a valid key).
#[derive(Debug, Clone)]
pub(crate) struct SplitHeapRefs {
    pub concrete: Vec<GuardedExpr<RawAddress>>,
    pub symbolic: Vec<GuardedExpr<ExprRef>>,
}

impl SplitHeapRefs {
    pub(crate) fn is_definitely_null(&self) -> bool {
        self.concrete.is_empty() && self.symbolic.is_empty()
    }
}

/// Splits [`reference`] by walking its ite tree. Guards accumulate the
/// branch conditions from the root to each leaf. When the number of
/// concrete candidates exceeds the configured cutoff, the whole reference
/// is demoted to a single symbolic residual: precision is traded for
/// termination, and the degradation is counted.
pub(crate) fn split_heap_ref(
    ctx: &ExprContext,
    config: &PartitioningConfig,
    reference: &ExprRef,
    initial_guard: &ExprRef,
) -> SplitHeapRefs {
    let mut split = SplitHeapRefs { concrete: Vec::new(), symbolic: Vec::new() };
    walk(ctx, reference, initial_guard.clone(), &mut split);

    if split.concrete.len() > config.max_concrete_candidates {
        ctx.stats().bump_partition();
        log_debug!(
            "Too many concrete candidates ({}), treating reference symbolically",
            split.concrete.len()
        );
        return SplitHeapRefs {
            concrete: Vec::new(),
            symbolic: vec![GuardedExpr { expr: reference.clone(), guard: initial_guard.clone() }],
        };
    }

    split
}

fn walk(ctx: &ExprContext, expr: &ExprRef, guard: ExprRef, out: &mut SplitHeapRefs) {
    if guard.is_false() {
        return;
    }
    match &**expr {
        Expr::ConcreteRef(addr) => out.concrete.push(GuardedExpr { expr: *addr, guard }),
        Expr::NullRef => {}
        Expr::Ite { cond, then, otherwise } => {
            walk(ctx, then, ctx.mk_and(guard.clone(), cond.clone()), out);
            walk(ctx, otherwise, ctx.mk_and(guard, ctx.mk_not(cond.clone())), out);
        }
        // Symbols, base reads of address sort, anything else opaque.
        _ => out.symbolic.push(GuardedExpr { expr: expr.clone(), guard }),
    }
}
