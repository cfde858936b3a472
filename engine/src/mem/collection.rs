//! The region abstraction itself: an identity, an update log and a base.
//!
//! Allocated collections carry a concrete default as their base; input
//! collections bottom out in an unconstrained `BaseRead`, pinned down only
//! by the solver's model.

use std::rc::Rc;

use crate::abs::CollectionId;
use crate::expr::{ExprContext, ExprRef};

use super::keys::{KeyAdapter, KeyInfo};
use super::updates::{FlatUpdates, TreeUpdates, UpdateNode};

#[derive(Debug)]
pub(crate) struct Collection<I: KeyInfo> {
    id: CollectionId,
    default: Option<ExprRef>,
    updates: Updates<I>,
}

#[derive(Debug)]
pub(crate) enum Updates<I: KeyInfo> {
    Flat(FlatUpdates<I>),
    Tree(TreeUpdates<I>),
}

impl<I: KeyInfo> Clone for Collection<I> {
    fn clone(&self) -> Self {
        Collection {
            id: self.id.clone(),
            default: self.default.clone(),
            updates: match &self.updates {
                Updates::Flat(u) => Updates::Flat(u.clone()),
                Updates::Tree(u) => Updates::Tree(u.clone()),
            },
        }
    }
}

impl<I: KeyInfo> Collection<I> {
    pub(crate) fn new_flat(id: CollectionId, default: Option<ExprRef>) -> Self {
        Collection { id, default, updates: Updates::Flat(FlatUpdates::new()) }
    }

    pub(crate) fn new_tree(id: CollectionId, default: Option<ExprRef>) -> Self {
        Collection { id, default, updates: Updates::Tree(TreeUpdates::new()) }
    }

    pub(crate) fn id(&self) -> &CollectionId {
        &self.id
    }

    pub(crate) fn default(&self) -> Option<&ExprRef> {
        self.default.as_ref()
    }

    fn base_value(&self, ctx: &ExprContext, key: &I::Key) -> ExprRef {
        match &self.default {
            Some(default) => default.clone(),
            None => ctx.mk_base_read(self.id.clone(), I::key_exprs(key)),
        }
    }

    /// Folds the log from the newest entry to the oldest into a nested
    /// conditional, terminating at the base. Pure; the collection is not
    /// changed. A newest entry that covers the key outright short-circuits
    /// the fold.
    pub(crate) fn read(&self, ctx: &ExprContext, key: &I::Key) -> ExprRef {
        let localized = match &self.updates {
            Updates::Flat(u) => Updates::Flat(u.read(ctx, key)),
            Updates::Tree(u) => Updates::Tree(u.read(ctx, key)),
        };

        let last = match &localized {
            Updates::Flat(u) => u.last_update().cloned(),
            Updates::Tree(u) => u.last_update().cloned(),
        };
        if let Some(last) = last {
            if last.includes_symbolically(ctx, key).is_true() {
                return last.value(ctx, key);
            }
        }

        let nodes = match &localized {
            Updates::Flat(u) => u.iter_oldest(),
            Updates::Tree(u) => u.iter_oldest(),
        };

        let mut result = self.base_value(ctx, key);
        for node in nodes {
            let covers = node.includes_symbolically(ctx, key);
            if covers.is_false() {
                continue;
            }
            result = ctx.mk_ite(covers, node.value(ctx, key), result);
        }
        result
    }

    /// Returns a new collection with one more logged write; `self` stays
    /// valid and unaffected.
    pub(crate) fn write(&self, key: I::Key, value: ExprRef, guard: ExprRef) -> Self {
        Collection {
            id: self.id.clone(),
            default: self.default.clone(),
            updates: match &self.updates {
                Updates::Flat(u) => Updates::Flat(u.write(key, value, guard)),
                Updates::Tree(u) => Updates::Tree(u.write(key, value, guard)),
            },
        }
    }

    /// Records a bulk assignment from a snapshot of [`src`].
    pub(crate) fn copy_range(
        &self,
        src: Rc<Collection<I>>,
        adapter: KeyAdapter,
        guard: ExprRef,
    ) -> Self {
        Collection {
            id: self.id.clone(),
            default: self.default.clone(),
            updates: match &self.updates {
                Updates::Flat(u) => Updates::Flat(u.copy_range(src, adapter, guard)),
                Updates::Tree(u) => Updates::Tree(u.copy_range(src, adapter, guard)),
            },
        }
    }

    /// Updates from the oldest to the most recent one.
    pub(crate) fn iter_oldest(&self) -> Vec<Rc<UpdateNode<I>>> {
        match &self.updates {
            Updates::Flat(u) => u.iter_oldest(),
            Updates::Tree(u) => u.iter_oldest(),
        }
    }

    /// Identity of the current log head, for per-session translation memo
    /// keys. Stable as long as the collection is alive.
    pub(crate) fn log_ptr(&self) -> usize {
        match &self.updates {
            Updates::Flat(u) => u.head_ptr(),
            Updates::Tree(u) => u.root_ptr(),
        }
    }
}
