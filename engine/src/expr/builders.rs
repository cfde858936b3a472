use std::cell::Cell;
use std::rc::Rc;

use crate::abs::{CollectionId, PrecisionStats, RawAddress, Sort, SymVarId, SIZE_BITS};

use super::{Expr, ExprRef};

/// The ambient handle every expression and region constructor receives:
/// interned constants, fresh-name counters and diagnostic counters.
///
/// Contexts are plain values passed explicitly, so independent analysis runs
/// can coexist in one process without cross-talk.
#[derive(Debug)]
pub struct ExprContext {
    true_expr: ExprRef,
    false_expr: ExprRef,
    null_ref: ExprRef,
    next_symbol: Cell<SymVarId>,
    next_address: Cell<RawAddress>,
    stats: PrecisionStats,
}

impl Default for ExprContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExprContext {
    pub fn new() -> Self {
        ExprContext {
            true_expr: Rc::new(Expr::True),
            false_expr: Rc::new(Expr::False),
            null_ref: Rc::new(Expr::NullRef),
            next_symbol: Cell::new(0),
            next_address: Cell::new(1),
            stats: PrecisionStats::default(),
        }
    }

    pub fn stats(&self) -> &PrecisionStats {
        &self.stats
    }

    pub fn mk_true(&self) -> ExprRef {
        self.true_expr.clone()
    }

    pub fn mk_false(&self) -> ExprRef {
        self.false_expr.clone()
    }

    pub fn mk_bool(&self, value: bool) -> ExprRef {
        if value { self.mk_true() } else { self.mk_false() }
    }

    pub fn null_ref(&self) -> ExprRef {
        self.null_ref.clone()
    }

    pub fn mk_bv(&self, bits: u64, size: u32) -> ExprRef {
        let masked = if size >= 64 { bits } else { bits & ((1u64 << size) - 1) };
        Rc::new(Expr::BitVec { bits: masked, size })
    }

    /// A concrete size/length/index value.
    pub fn mk_size(&self, value: u64) -> ExprRef {
        self.mk_bv(value, SIZE_BITS)
    }

    pub fn mk_concrete_ref(&self, address: RawAddress) -> ExprRef {
        debug_assert_ne!(address, 0, "address zero is the null reference");
        Rc::new(Expr::ConcreteRef(address))
    }

    /// Allocates a fresh concrete address, as a front end does when the
    /// program under analysis creates an object.
    pub fn fresh_address(&self) -> RawAddress {
        let address = self.next_address.get();
        self.next_address.set(address + 1);
        address
    }

    pub fn fresh_symbol(&self, sort: Sort) -> ExprRef {
        let id = self.next_symbol.get();
        self.next_symbol.set(id + 1);
        Rc::new(Expr::Symbol { id, sort })
    }

    pub fn mk_not(&self, operand: ExprRef) -> ExprRef {
        match &*operand {
            Expr::True => self.mk_false(),
            Expr::False => self.mk_true(),
            Expr::Not(inner) => inner.clone(),
            _ => Rc::new(Expr::Not(operand)),
        }
    }

    pub fn mk_and(&self, lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        match (&*lhs, &*rhs) {
            (Expr::False, _) | (_, Expr::False) => self.mk_false(),
            (Expr::True, _) => rhs,
            (_, Expr::True) => lhs,
            _ if lhs == rhs => lhs,
            _ => Rc::new(Expr::And(lhs, rhs)),
        }
    }

    pub fn mk_or(&self, lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        match (&*lhs, &*rhs) {
            (Expr::True, _) | (_, Expr::True) => self.mk_true(),
            (Expr::False, _) => rhs,
            (_, Expr::False) => lhs,
            _ if lhs == rhs => lhs,
            _ => Rc::new(Expr::Or(lhs, rhs)),
        }
    }

    pub fn mk_eq(&self, lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        if lhs == rhs {
            return self.mk_true();
        }
        // Two distinct literals of the same sort can never be equated.
        if lhs.is_literal() && rhs.is_literal() {
            return self.mk_false();
        }
        // Allocation freshness: an input reference entered the analysis
        // before any object of this path was allocated, so it can never
        // denote one of them.
        if (is_input_ref(&lhs) && rhs.as_concrete_ref().is_some())
            || (is_input_ref(&rhs) && lhs.as_concrete_ref().is_some())
        {
            return self.mk_false();
        }
        Rc::new(Expr::Eq(lhs, rhs))
    }

    pub fn mk_ule(&self, lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        match (lhs.as_bits(), rhs.as_bits()) {
            (Some(l), Some(r)) => self.mk_bool(l <= r),
            _ if lhs == rhs => self.mk_true(),
            _ => Rc::new(Expr::ULe(lhs, rhs)),
        }
    }

    pub fn mk_add(&self, lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        let size = match lhs.sort() {
            Sort::BitVec(size) => size,
            _ => SIZE_BITS,
        };
        match (lhs.as_bits(), rhs.as_bits()) {
            (Some(l), Some(r)) => self.mk_bv(l.wrapping_add(r), size),
            (_, Some(0)) => lhs,
            (Some(0), _) => rhs,
            _ => Rc::new(Expr::Add(lhs, rhs)),
        }
    }

    pub fn mk_sub(&self, lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        let size = match lhs.sort() {
            Sort::BitVec(size) => size,
            _ => SIZE_BITS,
        };
        match (lhs.as_bits(), rhs.as_bits()) {
            (Some(l), Some(r)) => self.mk_bv(l.wrapping_sub(r), size),
            (_, Some(0)) => lhs,
            _ if lhs == rhs => self.mk_bv(0, size),
            _ => Rc::new(Expr::Sub(lhs, rhs)),
        }
    }

    pub fn mk_ite(&self, cond: ExprRef, then: ExprRef, otherwise: ExprRef) -> ExprRef {
        match &*cond {
            Expr::True => then,
            Expr::False => otherwise,
            _ if then == otherwise => then,
            _ => Rc::new(Expr::Ite { cond, then, otherwise }),
        }
    }

    pub fn mk_base_read(&self, collection: CollectionId, key: Vec<ExprRef>) -> ExprRef {
        Rc::new(Expr::BaseRead { collection, key })
    }
}

/// Whether the expression denotes an input (pre-existing, symbolic)
/// reference as opposed to a path-allocated one.
fn is_input_ref(expr: &ExprRef) -> bool {
    match &**expr {
        Expr::Symbol { sort, .. } => *sort == Sort::Address,
        Expr::BaseRead { collection, .. } => collection.region.elem_sort == Sort::Address,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boolean_folding() {
        let ctx = ExprContext::new();
        let x = ctx.fresh_symbol(Sort::Bool);

        assert!(ctx.mk_and(ctx.mk_true(), x.clone()).eq(&x));
        assert!(ctx.mk_and(ctx.mk_false(), x.clone()).is_false());
        assert!(ctx.mk_or(x.clone(), ctx.mk_true()).is_true());
        assert!(ctx.mk_not(ctx.mk_not(x.clone())).eq(&x));
    }

    #[test]
    fn equality_of_literals_decides() {
        let ctx = ExprContext::new();
        let a = ctx.mk_concrete_ref(1);
        let b = ctx.mk_concrete_ref(2);

        assert!(ctx.mk_eq(a.clone(), a.clone()).is_true());
        assert!(ctx.mk_eq(a, b).is_false());
        assert!(ctx.mk_eq(ctx.mk_size(3), ctx.mk_size(3)).is_true());
    }

    #[test]
    fn equality_of_symbols_stays_symbolic() {
        let ctx = ExprContext::new();
        let s = ctx.fresh_symbol(Sort::Address);
        let t = ctx.fresh_symbol(Sort::Address);

        let eq = ctx.mk_eq(s.clone(), t);
        assert!(matches!(&*eq, Expr::Eq(..)));
        // Input references may be null.
        assert!(matches!(&*ctx.mk_eq(s, ctx.null_ref()), Expr::Eq(..)));
    }

    #[test]
    fn input_refs_never_alias_allocations() {
        let ctx = ExprContext::new();
        let s = ctx.fresh_symbol(Sort::Address);
        let a = ctx.mk_concrete_ref(1);

        assert!(ctx.mk_eq(s, a).is_false());
    }

    #[test]
    fn ite_folding() {
        let ctx = ExprContext::new();
        let v = ctx.mk_size(7);
        let w = ctx.mk_size(8);
        let cond = ctx.fresh_symbol(Sort::Bool);

        assert_eq!(ctx.mk_ite(ctx.mk_true(), v.clone(), w.clone()), v);
        assert_eq!(ctx.mk_ite(ctx.mk_false(), v.clone(), w.clone()), w);
        assert_eq!(ctx.mk_ite(cond, v.clone(), v.clone()), v);
    }

    #[test]
    fn size_arithmetic_folds_constants() {
        let ctx = ExprContext::new();
        let sum = ctx.mk_add(ctx.mk_size(3), ctx.mk_size(4));
        assert_eq!(sum.as_bits(), Some(7));

        let diff = ctx.mk_sub(ctx.mk_size(10), ctx.mk_size(4));
        assert_eq!(diff.as_bits(), Some(6));

        let idx = ctx.fresh_symbol(Sort::size());
        assert_eq!(ctx.mk_add(idx.clone(), ctx.mk_size(0)), idx);
    }
}
