//! Guarded write logs: the flat (single-key) and range-folded (tree)
//! representations of a region's update history.
//!
//! Nodes are immutable once created and chained through `Rc`, so a forked
//! path clones a log by bumping one reference count. Appending never
//! reasons away older entries for symbolic keys; an older write may still
//! be observed whenever a newer write's key or guard fails at solve time.

use std::rc::Rc;

use crate::expr::{ExprContext, ExprRef};

use super::collection::Collection;
use super::keys::{KeyAdapter, KeyInfo};
use super::ranges::{KeyRange, RangeRelation};

/// One logged write. Closed set: the processing below relies on there being
/// exactly these two shapes.
#[derive(Debug)]
pub(crate) enum UpdateNode<I: KeyInfo> {
    Pinpoint(PinpointUpdate<I>),
    Ranged(RangedUpdate<I>),
}

#[derive(Debug)]
pub(crate) struct PinpointUpdate<I: KeyInfo> {
    pub key: I::Key,
    pub value: ExprRef,
    pub guard: ExprRef,
}

/// Bulk assignment from a snapshot of another collection, read through the
/// adapter's key remapping. Individual indices are never materialized.
#[derive(Debug)]
pub(crate) struct RangedUpdate<I: KeyInfo> {
    pub src: Rc<Collection<I>>,
    pub adapter: KeyAdapter,
    pub guard: ExprRef,
}

impl<I: KeyInfo> UpdateNode<I> {
    /// Will [`key`] get overwritten by this write in every possible concrete
    /// state, assuming [`precondition`] holds?
    pub(crate) fn includes_concretely(&self, key: &I::Key, precondition: &ExprRef) -> bool {
        match self {
            UpdateNode::Pinpoint(node) => {
                I::eq_concrete(&node.key, key)
                    && (node.guard.is_true() || node.guard == *precondition)
            }
            // A ranged node's coverage depends on its bounds and guard;
            // it never reports concrete coverage.
            UpdateNode::Ranged(_) => false,
        }
    }

    /// Is this write definitely shadowed by the (newer) [`update`]?
    pub(crate) fn is_included_by_concretely(&self, update: &UpdateNode<I>) -> bool {
        match self {
            UpdateNode::Pinpoint(node) => update.includes_concretely(&node.key, &node.guard),
            UpdateNode::Ranged(_) => false,
        }
    }

    /// Condition expressing that this write covers [`key`]. Implies the
    /// node's guard.
    pub(crate) fn includes_symbolically(&self, ctx: &ExprContext, key: &I::Key) -> ExprRef {
        match self {
            UpdateNode::Pinpoint(node) => ctx.mk_and(
                I::eq_symbolic(ctx, &node.key, key),
                node.guard.clone(),
            ),
            UpdateNode::Ranged(node) => ctx.mk_and(
                I::adapter_includes(ctx, &node.adapter, key),
                node.guard.clone(),
            ),
        }
    }

    /// The value this write leaves at [`key`].
    pub(crate) fn value(&self, ctx: &ExprContext, key: &I::Key) -> ExprRef {
        match self {
            UpdateNode::Pinpoint(node) => node.value.clone(),
            UpdateNode::Ranged(node) => {
                let src_key = I::adapt(ctx, &node.adapter, key);
                node.src.read(ctx, &src_key)
            }
        }
    }

    /// The range this node was recorded under, before any tree splitting.
    pub(crate) fn range(&self) -> I::Range {
        match self {
            UpdateNode::Pinpoint(node) => I::key_range(&node.key),
            UpdateNode::Ranged(node) => I::adapter_range(&node.adapter),
        }
    }
}

//region Flat updates

#[derive(Debug)]
pub(crate) struct FlatUpdates<I: KeyInfo> {
    head: Option<Rc<FlatNode<I>>>,
}

#[derive(Debug)]
struct FlatNode<I: KeyInfo> {
    update: Rc<UpdateNode<I>>,
    next: FlatUpdates<I>,
}

impl<I: KeyInfo> Clone for FlatUpdates<I> {
    fn clone(&self) -> Self {
        FlatUpdates { head: self.head.clone() }
    }
}

impl<I: KeyInfo> FlatUpdates<I> {
    pub(crate) fn new() -> Self {
        FlatUpdates { head: None }
    }

    pub(crate) fn last_update(&self) -> Option<&Rc<UpdateNode<I>>> {
        self.head.as_ref().map(|node| &node.update)
    }

    fn push(&self, update: UpdateNode<I>) -> Self {
        FlatUpdates {
            head: Some(Rc::new(FlatNode {
                update: Rc::new(update),
                next: self.clone(),
            })),
        }
    }

    pub(crate) fn write(&self, key: I::Key, value: ExprRef, guard: ExprRef) -> Self {
        self.push(UpdateNode::Pinpoint(PinpointUpdate { key, value, guard }))
    }

    pub(crate) fn copy_range(
        &self,
        src: Rc<Collection<I>>,
        adapter: KeyAdapter,
        guard: ExprRef,
    ) -> Self {
        self.push(UpdateNode::Ranged(RangedUpdate { src, adapter, guard }))
    }

    /// Drops leading entries that definitely do not cover [`key`].
    pub(crate) fn read(&self, ctx: &ExprContext, key: &I::Key) -> Self {
        let mut current = self;
        while let Some(node) = &current.head {
            if node.update.includes_symbolically(ctx, key).is_false() {
                current = &node.next;
            } else {
                break;
            }
        }
        current.clone()
    }

    /// Updates from the oldest to the most recent one.
    pub(crate) fn iter_oldest(&self) -> Vec<Rc<UpdateNode<I>>> {
        let mut out = Vec::new();
        let mut current = self;
        while let Some(node) = &current.head {
            out.push(node.update.clone());
            current = &node.next;
        }
        out.reverse();
        out
    }

    pub(crate) fn head_ptr(&self) -> usize {
        self.head.as_ref().map_or(0, |node| Rc::as_ptr(node) as usize)
    }
}

//endregion

//region Region tree

/// Persistent event storage grouped by abstract key ranges, maintaining two
/// invariants: sibling ranges are pairwise disjoint, and child ranges are
/// included in their parent's range. Entries at one level are ordered from
/// the oldest write to the most recent one.
#[derive(Debug)]
pub(crate) struct RegionTree<R: KeyRange, V: Clone> {
    entries: Rc<Vec<TreeEntry<R, V>>>,
}

#[derive(Clone, Debug)]
struct TreeEntry<R: KeyRange, V: Clone> {
    range: R,
    value: V,
    children: RegionTree<R, V>,
}

impl<R: KeyRange, V: Clone> Clone for RegionTree<R, V> {
    fn clone(&self) -> Self {
        RegionTree { entries: self.entries.clone() }
    }
}

impl<R: KeyRange, V: Clone> RegionTree<R, V> {
    pub(crate) fn empty() -> Self {
        RegionTree { entries: Rc::new(Vec::new()) }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn add_with_filter(
        out: &mut Vec<TreeEntry<R, V>>,
        entry: TreeEntry<R, V>,
        filter: &impl Fn(&V) -> bool,
    ) {
        if entry.range.is_empty() {
            return;
        }
        if filter(&entry.value) {
            out.push(entry);
        } else {
            // A filtered-out node is replaced by its children.
            out.extend(entry.children.entries.iter().cloned());
        }
    }

    /// Splits into the part completely covered by [`range`] and the part
    /// disjoint with it. Nodes failing [`filter`] are dropped (their
    /// children take their place).
    fn split_recursively(&self, range: &R, filter: &impl Fn(&V) -> bool) -> (Self, Self) {
        if self.is_empty() {
            return (self.clone(), self.clone());
        }

        let mut included = Vec::new();
        let mut disjoint = Vec::new();

        for entry in self.entries.iter() {
            match range.compare(&entry.range) {
                RangeRelation::Includes => {
                    Self::add_with_filter(&mut included, entry.clone(), filter)
                }
                RangeRelation::Disjoint => {
                    Self::add_with_filter(&mut disjoint, entry.clone(), filter)
                }
                RangeRelation::Intersects => {
                    let (child_included, child_disjoint) =
                        entry.children.split_recursively(range, filter);
                    Self::add_with_filter(
                        &mut included,
                        TreeEntry {
                            range: entry.range.intersect(range),
                            value: entry.value.clone(),
                            children: child_included,
                        },
                        filter,
                    );
                    Self::add_with_filter(
                        &mut disjoint,
                        TreeEntry {
                            range: entry.range.subtract(range),
                            value: entry.value.clone(),
                            children: child_disjoint,
                        },
                        filter,
                    );
                }
            }
        }

        (
            RegionTree { entries: Rc::new(included) },
            RegionTree { entries: Rc::new(disjoint) },
        )
    }

    /// The subtree of entries relevant for [`range`].
    pub(crate) fn localize(&self, range: &R, filter: impl Fn(&V) -> bool) -> Self {
        self.split_recursively(range, &filter).0
    }

    /// Records `(range, value)` preserving the tree invariants: entries
    /// covered by [`range`] move below the new node, the rest stay
    /// siblings.
    pub(crate) fn write(&self, range: R, value: V, filter: impl Fn(&V) -> bool) -> Self {
        let (included, mut disjoint) = {
            let (included, disjoint) = self.split_recursively(&range, &filter);
            (included, Rc::try_unwrap(disjoint.entries).unwrap_or_else(|rc| (*rc).clone()))
        };
        disjoint.push(TreeEntry { range, value, children: included });
        RegionTree { entries: Rc::new(disjoint) }
    }

    pub(crate) fn last_entry(&self) -> Option<(&R, &V)> {
        self.entries.last().map(|entry| (&entry.range, &entry.value))
    }

    /// Visits values bottom-up, oldest first within each level, so the
    /// overall order runs from the oldest write to the most recent one.
    pub(crate) fn for_each_topo(&self, f: &mut impl FnMut(&R, &V)) {
        for entry in self.entries.iter() {
            entry.children.for_each_topo(f);
            f(&entry.range, &entry.value);
        }
    }

    pub(crate) fn root_ptr(&self) -> usize {
        Rc::as_ptr(&self.entries) as usize
    }
}

//endregion

//region Tree updates

#[derive(Debug)]
pub(crate) struct TreeUpdates<I: KeyInfo> {
    tree: RegionTree<I::Range, Rc<UpdateNode<I>>>,
}

impl<I: KeyInfo> Clone for TreeUpdates<I> {
    fn clone(&self) -> Self {
        TreeUpdates { tree: self.tree.clone() }
    }
}

impl<I: KeyInfo> TreeUpdates<I> {
    pub(crate) fn new() -> Self {
        TreeUpdates { tree: RegionTree::empty() }
    }

    pub(crate) fn last_update(&self) -> Option<&Rc<UpdateNode<I>>> {
        self.tree.last_entry().map(|(_, node)| node)
    }

    pub(crate) fn write(&self, key: I::Key, value: ExprRef, guard: ExprRef) -> Self {
        let node = Rc::new(UpdateNode::Pinpoint(PinpointUpdate { key, value, guard }));
        let range = node.range();
        TreeUpdates {
            tree: self
                .tree
                .write(range, node.clone(), |old| !old.is_included_by_concretely(&node)),
        }
    }

    pub(crate) fn copy_range(
        &self,
        src: Rc<Collection<I>>,
        adapter: KeyAdapter,
        guard: ExprRef,
    ) -> Self {
        let node = Rc::new(UpdateNode::Ranged(RangedUpdate { src, adapter, guard }));
        let range = node.range();
        TreeUpdates {
            tree: self
                .tree
                .write(range, node.clone(), |old| !old.is_included_by_concretely(&node)),
        }
    }

    pub(crate) fn read(&self, ctx: &ExprContext, key: &I::Key) -> Self {
        let range = I::key_range(key);
        TreeUpdates {
            tree: self.tree.localize(&range, |node| {
                !node.includes_symbolically(ctx, key).is_false()
            }),
        }
    }

    /// Updates from the oldest to the most recent one. A node split across
    /// several ranges by later writes is emitted exactly once.
    pub(crate) fn iter_oldest(&self) -> Vec<Rc<UpdateNode<I>>> {
        let mut out: Vec<Rc<UpdateNode<I>>> = Vec::new();
        let mut emitted: Vec<*const UpdateNode<I>> = Vec::new();
        self.tree.for_each_topo(&mut |range, node| {
            // A narrowed range marks a clone produced by tree splitting.
            let was_cloned = *range != node.range();
            if was_cloned {
                let ptr = Rc::as_ptr(node);
                if emitted.contains(&ptr) {
                    return;
                }
                emitted.push(ptr);
            }
            out.push(node.clone());
        });
        out
    }

    pub(crate) fn root_ptr(&self) -> usize {
        self.tree.root_ptr()
    }
}

//endregion

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::ranges::IntervalSet;

    fn span(lo: u64, hi: u64) -> IntervalSet {
        IntervalSet::span(lo, hi)
    }

    #[test]
    fn region_tree_write_and_localize() {
        let tree: RegionTree<IntervalSet, u32> = RegionTree::empty();
        let tree = tree.write(span(0, 9), 1, |_| true);
        let tree = tree.write(span(3, 5), 2, |_| true);

        // The newer write is a sibling at top level; the old one is split.
        let local = tree.localize(&IntervalSet::point(4), |_| true);
        let mut seen = Vec::new();
        local.for_each_topo(&mut |_, v| seen.push(*v));
        assert_eq!(seen, vec![1, 2]);

        let outside = tree.localize(&IntervalSet::point(8), |_| true);
        let mut seen = Vec::new();
        outside.for_each_topo(&mut |_, v| seen.push(*v));
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn region_tree_orders_oldest_first() {
        let tree: RegionTree<IntervalSet, u32> = RegionTree::empty();
        let tree = tree.write(span(0, 4), 1, |_| true);
        let tree = tree.write(span(5, 9), 2, |_| true);
        let tree = tree.write(span(0, 9), 3, |_| true);

        let mut seen = Vec::new();
        tree.for_each_topo(&mut |_, v| seen.push(*v));
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn region_tree_filter_drops_shadowed() {
        let tree: RegionTree<IntervalSet, u32> = RegionTree::empty();
        let tree = tree.write(span(2, 2), 1, |_| true);
        // Dropping the old value when the new write covers it.
        let tree = tree.write(span(0, 4), 2, |old| *old != 1);

        let mut seen = Vec::new();
        tree.for_each_topo(&mut |_, v| seen.push(*v));
        assert_eq!(seen, vec![2]);
    }

    #[test]
    fn flat_updates_share_structure() {
        use crate::abs::Sort;
        use crate::expr::ExprContext;
        use crate::mem::keys::{RefKey, RefKeyInfo};

        let ctx = ExprContext::new();
        let base: FlatUpdates<RefKeyInfo> = FlatUpdates::new();
        let k = RefKey(ctx.fresh_symbol(Sort::Address));
        let one = base.write(k.clone(), ctx.mk_size(1), ctx.mk_true());
        let two = one.write(k.clone(), ctx.mk_size(2), ctx.mk_true());

        assert_eq!(one.iter_oldest().len(), 1);
        assert_eq!(two.iter_oldest().len(), 2);
        // The older log is untouched by the newer write.
        assert_eq!(
            one.last_update().unwrap().value(&ctx, &k).as_bits(),
            Some(1)
        );
    }
}
