//! The solver-facing side of the memory model: array-theory encodings of
//! update logs, solver models, and decoding of models back into concrete
//! regions. The decision procedure itself is a black box behind
//! [`crate::abs::backend::SolverAdapter`].

pub mod model;
pub mod translate;

use std::rc::Rc;

use crate::abs::CollectionId;
use crate::expr::ExprRef;

use crate::mem::keys::KeyAdapter;

/// Array-theory encoding of one collection: nested guarded stores (and
/// range copies) over an uninterpreted or constant base array.
#[derive(Debug, Clone)]
pub enum ArrayExpr {
    /// Uninterpreted initial content of an input collection.
    Base(CollectionId),
    /// Constant array holding an allocated collection's default.
    ConstDefault {
        collection: CollectionId,
        default: ExprRef,
    },
    Store {
        array: Rc<ArrayExpr>,
        key: Vec<ExprRef>,
        value: ExprRef,
        guard: ExprRef,
    },
    /// First-class bulk copy; the adapter lowers it to whatever its theory
    /// supports (lambda, bounded expansion).
    CopyRange {
        dst: Rc<ArrayExpr>,
        src: Rc<ArrayExpr>,
        map: RangeMap,
        guard: ExprRef,
    },
}

#[derive(Debug, Clone)]
pub enum RangeMap {
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

impl From<&KeyAdapter> for RangeMap {
    fn from(adapter: &KeyAdapter) -> Self {
        match adapter {
            KeyAdapter::Offset { src_obj, dst_obj, src_from, dst_from, dst_to } => {
                RangeMap::Offset {
                    src_obj: src_obj.clone(),
                    dst_obj: dst_obj.clone(),
                    src_from: src_from.clone(),
                    dst_from: dst_from.clone(),
                    dst_to: dst_to.clone(),
                }
            }
            KeyAdapter::Merge { src_obj, dst_obj } => RangeMap::Merge {
                src_obj: src_obj.clone(),
                dst_obj: dst_obj.clone(),
            },
        }
    }
}
