pub(crate) mod builders;
mod fmt;

use std::rc::Rc;

use crate::abs::{CollectionId, RawAddress, Sort, SymVarId};

pub use builders::ExprContext;

pub type ExprRef = Rc<Expr>;

/// An immutable expression node. Equality and hashing are structural; nodes
/// are shared through [`ExprRef`] and never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    True,
    False,
    BitVec {
        bits: u64,
        size: u32,
    },
    /// A reference known to denote one specific allocated object.
    ConcreteRef(RawAddress),
    NullRef,
    /// A free symbolic variable, resolved only by a solver model.
    Symbol {
        id: SymVarId,
        sort: Sort,
    },
    Not(ExprRef),
    And(ExprRef, ExprRef),
    Or(ExprRef, ExprRef),
    Eq(ExprRef, ExprRef),
    /// Unsigned less-or-equal over size bit vectors.
    ULe(ExprRef, ExprRef),
    Add(ExprRef, ExprRef),
    Sub(ExprRef, ExprRef),
    Ite {
        cond: ExprRef,
        then: ExprRef,
        otherwise: ExprRef,
    },
    /// The initial (pre-update) content of an input collection at a key:
    /// unconstrained, pinned down only by the solver's model.
    BaseRead {
        collection: CollectionId,
        key: Vec<ExprRef>,
    },
}

impl Expr {
    pub fn sort(&self) -> Sort {
        match self {
            Expr::True
            | Expr::False
            | Expr::Not(_)
            | Expr::And(..)
            | Expr::Or(..)
            | Expr::Eq(..)
            | Expr::ULe(..) => Sort::Bool,
            Expr::BitVec { size, .. } => Sort::BitVec(*size),
            Expr::ConcreteRef(_) | Expr::NullRef => Sort::Address,
            Expr::Symbol { sort, .. } => *sort,
            Expr::Add(lhs, _) | Expr::Sub(lhs, _) => lhs.sort(),
            Expr::Ite { then, .. } => then.sort(),
            Expr::BaseRead { collection, .. } => collection.region.elem_sort,
        }
    }

    #[inline]
    pub fn is_true(&self) -> bool {
        matches!(self, Expr::True)
    }

    #[inline]
    pub fn is_false(&self) -> bool {
        matches!(self, Expr::False)
    }

    /// Whether this node is a literal of its sort.
    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            Expr::True | Expr::False | Expr::BitVec { .. } | Expr::ConcreteRef(_) | Expr::NullRef
        )
    }

    pub fn as_concrete_ref(&self) -> Option<RawAddress> {
        match self {
            Expr::ConcreteRef(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn as_bits(&self) -> Option<u64> {
        match self {
            Expr::BitVec { bits, .. } => Some(*bits),
            _ => None,
        }
    }
}
