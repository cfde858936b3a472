//! Collection keys and the per-key-sort equality policies.
//!
//! The policies carry the soundness burden of aliasing: `eq_concrete` must
//! under-approximate (it may only say "equal" when every model agrees) and
//! `may_be_equal` must over-approximate (it may only say "distinct" when no
//! model can equate the keys). Getting either direction wrong is a
//! soundness bug, not a performance bug.

use std::fmt::Debug;
use std::hash::Hash;

use crate::expr::{Expr, ExprContext, ExprRef};

use super::ranges::{AddrSet, IntervalSet, KeyRange, ProductRange};

/// Result of the over-approximating aliasing query.
#[derive(Debug, Clone)]
pub(crate) enum MayEqual {
    No,
    Yes,
    /// Residual condition to be resolved by the solver.
    Maybe(ExprRef),
}

/// Key remapping for ranged (bulk) updates: either an index-shifted slice
/// copy between two array-like objects, or a whole-collection merge.
#[derive(Debug, Clone)]
pub(crate) enum KeyAdapter {
    Offset {
        src_obj: ExprRef,
        dst_obj: ExprRef,
        src_from: ExprRef,
        dst_from: ExprRef,
        dst_to: ExprRef,
    },
    Merge {
        src_obj: ExprRef,
        dst_obj: ExprRef,
    },
}

/// Per-key-sort policy: equality in both approximation directions, range
/// abstraction for the update tree, and adapter application.
pub(crate) trait KeyInfo: 'static {
    type Key: Clone + Eq + Hash + Debug;
    type Range: KeyRange;

    /// True only if every model equates the keys.
    fn eq_concrete(a: &Self::Key, b: &Self::Key) -> bool;

    /// The symbolic key-equality condition.
    fn eq_symbolic(ctx: &ExprContext, a: &Self::Key, b: &Self::Key) -> ExprRef;

    /// False only if no model equates the keys.
    fn may_be_equal(ctx: &ExprContext, a: &Self::Key, b: &Self::Key) -> MayEqual {
        let eq = Self::eq_symbolic(ctx, a, b);
        match &*eq {
            Expr::True => MayEqual::Yes,
            Expr::False => MayEqual::No,
            _ => MayEqual::Maybe(eq),
        }
    }

    fn key_range(key: &Self::Key) -> Self::Range;

    /// The key's component expressions, in base-read order.
    fn key_exprs(key: &Self::Key) -> Vec<ExprRef>;

    /// Converts a destination key of a ranged update into the source key it
    /// reads from.
    fn adapt(ctx: &ExprContext, adapter: &KeyAdapter, key: &Self::Key) -> Self::Key;

    /// Condition under which a ranged update covers [`key`], excluding the
    /// update's own guard.
    fn adapter_includes(ctx: &ExprContext, adapter: &KeyAdapter, key: &Self::Key) -> ExprRef;

    fn adapter_range(adapter: &KeyAdapter) -> Self::Range;
}

/// Key of ref-addressed regions: fields, lengths.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RefKey(pub ExprRef);

/// Key of object-plus-index regions: array elements, map entries, set
/// membership.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct IndexedKey {
    pub obj: ExprRef,
    pub index: ExprRef,
}

pub(crate) fn ref_range(expr: &ExprRef) -> AddrSet {
    match &**expr {
        Expr::ConcreteRef(addr) => AddrSet::point(*addr),
        Expr::NullRef => AddrSet::empty(),
        Expr::Ite { then, otherwise, .. } => ref_range(then).union(&ref_range(otherwise)),
        _ => AddrSet::universe(),
    }
}

pub(crate) fn index_range(expr: &ExprRef) -> IntervalSet {
    match &**expr {
        Expr::BitVec { bits, .. } => IntervalSet::point(*bits),
        Expr::Ite { then, otherwise, .. } => index_range(then).union(&index_range(otherwise)),
        _ => IntervalSet::universe(),
    }
}

#[derive(Debug)]
pub(crate) struct RefKeyInfo;

impl KeyInfo for RefKeyInfo {
    type Key = RefKey;
    type Range = AddrSet;

    fn eq_concrete(a: &RefKey, b: &RefKey) -> bool {
        a.0 == b.0
    }

    fn eq_symbolic(ctx: &ExprContext, a: &RefKey, b: &RefKey) -> ExprRef {
        ctx.mk_eq(a.0.clone(), b.0.clone())
    }

    fn key_range(key: &RefKey) -> AddrSet {
        ref_range(&key.0)
    }

    fn key_exprs(key: &RefKey) -> Vec<ExprRef> {
        vec![key.0.clone()]
    }

    fn adapt(_ctx: &ExprContext, _adapter: &KeyAdapter, _key: &RefKey) -> RefKey {
        unreachable!("ranged updates are not recorded for ref-keyed collections")
    }

    fn adapter_includes(_ctx: &ExprContext, _adapter: &KeyAdapter, _key: &RefKey) -> ExprRef {
        unreachable!("ranged updates are not recorded for ref-keyed collections")
    }

    fn adapter_range(_adapter: &KeyAdapter) -> AddrSet {
        unreachable!("ranged updates are not recorded for ref-keyed collections")
    }
}

#[derive(Debug)]
pub(crate) struct IndexedKeyInfo;

impl KeyInfo for IndexedKeyInfo {
    type Key = IndexedKey;
    type Range = ProductRange<AddrSet, IntervalSet>;

    fn eq_concrete(a: &IndexedKey, b: &IndexedKey) -> bool {
        a.obj == b.obj && a.index == b.index
    }

    fn eq_symbolic(ctx: &ExprContext, a: &IndexedKey, b: &IndexedKey) -> ExprRef {
        ctx.mk_and(
            ctx.mk_eq(a.obj.clone(), b.obj.clone()),
            ctx.mk_eq(a.index.clone(), b.index.clone()),
        )
    }

    fn key_range(key: &IndexedKey) -> Self::Range {
        ProductRange::rect(ref_range(&key.obj), index_range(&key.index))
    }

    fn key_exprs(key: &IndexedKey) -> Vec<ExprRef> {
        vec![key.obj.clone(), key.index.clone()]
    }

    fn adapt(ctx: &ExprContext, adapter: &KeyAdapter, key: &IndexedKey) -> IndexedKey {
        match adapter {
            KeyAdapter::Offset { src_obj, src_from, dst_from, .. } => IndexedKey {
                obj: src_obj.clone(),
                // Reading destination index k consults source index
                // k - dst_from + src_from.
                index: ctx.mk_add(
                    ctx.mk_sub(key.index.clone(), dst_from.clone()),
                    src_from.clone(),
                ),
            },
            KeyAdapter::Merge { src_obj, .. } => IndexedKey {
                obj: src_obj.clone(),
                index: key.index.clone(),
            },
        }
    }

    fn adapter_includes(ctx: &ExprContext, adapter: &KeyAdapter, key: &IndexedKey) -> ExprRef {
        match adapter {
            KeyAdapter::Offset { dst_obj, dst_from, dst_to, .. } => ctx.mk_and(
                ctx.mk_eq(key.obj.clone(), dst_obj.clone()),
                ctx.mk_and(
                    ctx.mk_ule(dst_from.clone(), key.index.clone()),
                    ctx.mk_ule(key.index.clone(), dst_to.clone()),
                ),
            ),
            KeyAdapter::Merge { dst_obj, .. } => ctx.mk_eq(key.obj.clone(), dst_obj.clone()),
        }
    }

    fn adapter_range(adapter: &KeyAdapter) -> Self::Range {
        match adapter {
            KeyAdapter::Offset { dst_obj, dst_from, dst_to, .. } => {
                let indices = match (dst_from.as_bits(), dst_to.as_bits()) {
                    (Some(lo), Some(hi)) => IntervalSet::span(lo, hi),
                    _ => IntervalSet::universe(),
                };
                ProductRange::rect(ref_range(dst_obj), indices)
            }
            KeyAdapter::Merge { dst_obj, .. } => {
                ProductRange::rect(ref_range(dst_obj), IntervalSet::universe())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abs::Sort;
    use crate::mem::ranges::RangeRelation;

    #[test]
    fn concrete_refs_decide_equality() {
        let ctx = ExprContext::new();
        let a = RefKey(ctx.mk_concrete_ref(1));
        let b = RefKey(ctx.mk_concrete_ref(2));

        assert!(RefKeyInfo::eq_concrete(&a, &a.clone()));
        assert!(!RefKeyInfo::eq_concrete(&a, &b));
        assert!(matches!(RefKeyInfo::may_be_equal(&ctx, &a, &b), MayEqual::No));
    }

    #[test]
    fn distinct_symbolic_refs_stay_undecided() {
        let ctx = ExprContext::new();
        let s = RefKey(ctx.fresh_symbol(Sort::Address));
        let t = RefKey(ctx.fresh_symbol(Sort::Address));

        match RefKeyInfo::may_be_equal(&ctx, &s, &t) {
            MayEqual::Maybe(cond) => assert!(matches!(&*cond, Expr::Eq(..))),
            other => panic!("expected residual condition, got {:?}", other),
        }
        // Structurally identical symbols must be equal in every model.
        assert!(RefKeyInfo::eq_concrete(&s, &s.clone()));

        // Allocation freshness decides the symbolic-vs-allocated case.
        let a = RefKey(ctx.mk_concrete_ref(1));
        assert!(matches!(RefKeyInfo::may_be_equal(&ctx, &s, &a), MayEqual::No));
    }

    #[test]
    fn indexed_key_ranges() {
        let ctx = ExprContext::new();
        let concrete = IndexedKey { obj: ctx.mk_concrete_ref(3), index: ctx.mk_size(4) };
        let symbolic = IndexedKey {
            obj: ctx.fresh_symbol(Sort::Address),
            index: ctx.fresh_symbol(Sort::size()),
        };

        let c = IndexedKeyInfo::key_range(&concrete);
        let s = IndexedKeyInfo::key_range(&symbolic);
        assert_eq!(s.compare(&c), RangeRelation::Includes);

        let other = IndexedKey { obj: ctx.mk_concrete_ref(5), index: ctx.mk_size(4) };
        assert_eq!(
            c.compare(&IndexedKeyInfo::key_range(&other)),
            RangeRelation::Disjoint
        );
    }

    #[test]
    fn offset_adapter_remaps_indices() {
        let ctx = ExprContext::new();
        let adapter = KeyAdapter::Offset {
            src_obj: ctx.mk_concrete_ref(1),
            dst_obj: ctx.mk_concrete_ref(2),
            src_from: ctx.mk_size(10),
            dst_from: ctx.mk_size(0),
            dst_to: ctx.mk_size(4),
        };
        let key = IndexedKey { obj: ctx.mk_concrete_ref(2), index: ctx.mk_size(3) };

        let src_key = IndexedKeyInfo::adapt(&ctx, &adapter, &key);
        assert_eq!(src_key.index.as_bits(), Some(13));
        assert_eq!(src_key.obj.as_concrete_ref(), Some(1));

        assert!(IndexedKeyInfo::adapter_includes(&ctx, &adapter, &key).is_true());
        let outside = IndexedKey { obj: ctx.mk_concrete_ref(2), index: ctx.mk_size(7) };
        assert!(IndexedKeyInfo::adapter_includes(&ctx, &adapter, &outside).is_false());
    }
}
