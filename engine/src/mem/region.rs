//! Memory regions: one allocated partition plus one lazily created input
//! partition per region identity.
//!
//! Specialization per region kind is data, not behavior: a [`RegionPolicy`]
//! row decides the key shape, the log representation, whether ranged
//! writes are meaningful and what the allocated default is. All kinds share
//! the same collection machinery, so the aliasing logic exists exactly
//! once.

use std::collections::HashMap;
use std::rc::Rc;

use crate::abs::{CollectionBase, CollectionId, RawAddress, RegionId, RegionKind, Payload, Sort};
use crate::expr::{ExprContext, ExprRef};

use super::collection::Collection;
use super::keys::{IndexedKey, IndexedKeyInfo, KeyAdapter, RefKey, RefKeyInfo};
use super::split::{GuardedExpr, SplitHeapRefs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyShape {
    /// Keyed by the object reference alone.
    Ref,
    /// Keyed by the object reference and an index/key expression.
    Indexed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogRepr {
    Flat,
    Tree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DefaultPolicy {
    /// Fresh lengths are zero.
    ZeroSize,
    /// Unwritten slots hold a sort-appropriate sample value.
    SortSample,
    /// Fresh membership flags are false.
    Absent,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RegionPolicy {
    pub shape: KeyShape,
    pub repr: LogRepr,
    pub ranged: bool,
    pub default: DefaultPolicy,
    pub key_sort: Sort,
}

impl RegionId {
    pub(crate) fn policy(&self) -> RegionPolicy {
        use RegionKind::*;
        let keyed_sort = match &self.payload {
            Payload::Keyed { key_sort, .. } => Some(*key_sort),
            _ => None,
        };
        match self.kind {
            ObjectField => RegionPolicy {
                shape: KeyShape::Ref,
                repr: LogRepr::Flat,
                ranged: false,
                default: DefaultPolicy::SortSample,
                key_sort: Sort::Address,
            },
            ArrayElements => RegionPolicy {
                shape: KeyShape::Indexed,
                repr: LogRepr::Tree,
                ranged: true,
                default: DefaultPolicy::SortSample,
                key_sort: Sort::size(),
            },
            ArrayLength | MapLength => RegionPolicy {
                shape: KeyShape::Ref,
                repr: LogRepr::Flat,
                ranged: false,
                default: DefaultPolicy::ZeroSize,
                key_sort: Sort::Address,
            },
            MapEntries => RegionPolicy {
                shape: KeyShape::Indexed,
                repr: LogRepr::Flat,
                ranged: true,
                default: DefaultPolicy::SortSample,
                key_sort: keyed_sort.unwrap_or_else(Sort::size),
            },
            SetMembership => RegionPolicy {
                shape: KeyShape::Indexed,
                repr: LogRepr::Flat,
                ranged: true,
                default: DefaultPolicy::Absent,
                key_sort: keyed_sort.unwrap_or_else(Sort::size),
            },
        }
    }

    /// The value an unwritten allocated slot holds.
    pub(crate) fn default_value(&self, ctx: &ExprContext) -> ExprRef {
        match self.policy().default {
            DefaultPolicy::ZeroSize => ctx.mk_size(0),
            DefaultPolicy::Absent => ctx.mk_false(),
            DefaultPolicy::SortSample => match self.elem_sort {
                Sort::Bool => ctx.mk_false(),
                Sort::BitVec(size) => ctx.mk_bv(0, size),
                Sort::Address => ctx.null_ref(),
            },
        }
    }

    pub(crate) fn input_collection_id(&self) -> CollectionId {
        CollectionId { region: self.clone(), base: CollectionBase::Input }
    }

    pub(crate) fn allocated_collection_id(&self, addr: RawAddress) -> CollectionId {
        CollectionId { region: self.clone(), base: CollectionBase::Allocated(addr) }
    }
}

#[derive(Debug)]
pub(crate) enum MemoryRegion {
    Scalar(ScalarRegion),
    Indexed(IndexedRegion),
}

impl Clone for MemoryRegion {
    fn clone(&self) -> Self {
        match self {
            MemoryRegion::Scalar(r) => MemoryRegion::Scalar(r.clone()),
            MemoryRegion::Indexed(r) => MemoryRegion::Indexed(r.clone()),
        }
    }
}

impl MemoryRegion {
    pub(crate) fn new(id: RegionId) -> Self {
        match id.policy().shape {
            KeyShape::Ref => MemoryRegion::Scalar(ScalarRegion::new(id)),
            KeyShape::Indexed => MemoryRegion::Indexed(IndexedRegion::new(id)),
        }
    }

}

/// Region keyed by the object reference alone: fields and lengths.
#[derive(Debug)]
pub(crate) struct ScalarRegion {
    pub(crate) id: RegionId,
    /// Every concrete address ever written appears here.
    allocated: Rc<HashMap<RawAddress, ExprRef>>,
    /// Created on first symbolic access.
    input: Option<Collection<RefKeyInfo>>,
}

impl Clone for ScalarRegion {
    fn clone(&self) -> Self {
        ScalarRegion {
            id: self.id.clone(),
            allocated: self.allocated.clone(),
            input: self.input.clone(),
        }
    }
}

impl ScalarRegion {
    fn new(id: RegionId) -> Self {
        ScalarRegion { id, allocated: Rc::new(HashMap::new()), input: None }
    }

    pub(crate) fn allocated_entries(&self) -> &HashMap<RawAddress, ExprRef> {
        &self.allocated
    }

    pub(crate) fn input(&self) -> Option<&Collection<RefKeyInfo>> {
        self.input.as_ref()
    }

    fn case_value(&self, ctx: &ExprContext, addr: RawAddress) -> ExprRef {
        self.allocated
            .get(&addr)
            .cloned()
            .unwrap_or_else(|| self.id.default_value(ctx))
    }

    fn residual_value(&self, ctx: &ExprContext, residual: &ExprRef) -> ExprRef {
        match &self.input {
            Some(collection) => collection.read(ctx, &RefKey(residual.clone())),
            None => ctx.mk_base_read(self.id.input_collection_id(), vec![residual.clone()]),
        }
    }

    pub(crate) fn read(&self, ctx: &ExprContext, split: &SplitHeapRefs) -> ExprRef {
        let mut cases: Vec<(ExprRef, ExprRef)> = Vec::new();
        for GuardedExpr { expr, guard } in &split.concrete {
            cases.push((guard.clone(), self.case_value(ctx, *expr)));
        }
        for GuardedExpr { expr, guard } in &split.symbolic {
            cases.push((guard.clone(), self.residual_value(ctx, expr)));
        }
        combine_cases(ctx, cases)
    }

    pub(crate) fn write(
        &self,
        ctx: &ExprContext,
        split: &SplitHeapRefs,
        value: &ExprRef,
        guard: &ExprRef,
    ) -> Self {
        let mut allocated = self.allocated.clone();
        let entries = Rc::make_mut(&mut allocated);
        for GuardedExpr { expr: addr, guard: case_guard } in &split.concrete {
            let total = ctx.mk_and(case_guard.clone(), guard.clone());
            if total.is_false() {
                continue;
            }
            // Concrete aliasing is syntactically decidable, so the slot is
            // overwritten in place instead of growing a chain. The previous
            // value comes from the in-progress table: a reference may reach
            // the same address through several guarded cases.
            let stored = if total.is_true() {
                value.clone()
            } else {
                let previous = entries
                    .get(addr)
                    .cloned()
                    .unwrap_or_else(|| self.id.default_value(ctx));
                ctx.mk_ite(total, value.clone(), previous)
            };
            entries.insert(*addr, stored);
        }

        let mut input = self.input.clone();
        for GuardedExpr { expr, guard: case_guard } in &split.symbolic {
            let total = ctx.mk_and(case_guard.clone(), guard.clone());
            if total.is_false() {
                continue;
            }
            let collection = input.take().unwrap_or_else(|| {
                Collection::new_flat(self.id.input_collection_id(), None)
            });
            input = Some(collection.write(RefKey(expr.clone()), value.clone(), total));
        }

        ScalarRegion { id: self.id.clone(), allocated, input }
    }
}

/// Region keyed by an object reference plus an index/key expression:
/// array elements, map entries, set membership.
#[derive(Debug)]
pub(crate) struct IndexedRegion {
    pub(crate) id: RegionId,
    allocated: Rc<HashMap<RawAddress, Collection<IndexedKeyInfo>>>,
    input: Option<Collection<IndexedKeyInfo>>,
}

impl Clone for IndexedRegion {
    fn clone(&self) -> Self {
        IndexedRegion {
            id: self.id.clone(),
            allocated: self.allocated.clone(),
            input: self.input.clone(),
        }
    }
}

impl IndexedRegion {
    fn new(id: RegionId) -> Self {
        IndexedRegion { id, allocated: Rc::new(HashMap::new()), input: None }
    }

    pub(crate) fn allocated_collections(&self) -> &HashMap<RawAddress, Collection<IndexedKeyInfo>> {
        &self.allocated
    }

    pub(crate) fn input(&self) -> Option<&Collection<IndexedKeyInfo>> {
        self.input.as_ref()
    }

    fn new_allocated_collection(&self, ctx: &ExprContext, addr: RawAddress) -> Collection<IndexedKeyInfo> {
        let id = self.id.allocated_collection_id(addr);
        let default = Some(self.id.default_value(ctx));
        match self.id.policy().repr {
            LogRepr::Flat => Collection::new_flat(id, default),
            LogRepr::Tree => Collection::new_tree(id, default),
        }
    }

    fn new_input_collection(&self) -> Collection<IndexedKeyInfo> {
        let id = self.id.input_collection_id();
        match self.id.policy().repr {
            LogRepr::Flat => Collection::new_flat(id, None),
            LogRepr::Tree => Collection::new_tree(id, None),
        }
    }

    fn allocated_snapshot(&self, ctx: &ExprContext, addr: RawAddress) -> Collection<IndexedKeyInfo> {
        self.allocated
            .get(&addr)
            .cloned()
            .unwrap_or_else(|| self.new_allocated_collection(ctx, addr))
    }

    fn input_snapshot(&self) -> Collection<IndexedKeyInfo> {
        self.input.clone().unwrap_or_else(|| self.new_input_collection())
    }

    pub(crate) fn read(&self, ctx: &ExprContext, split: &SplitHeapRefs, index: &ExprRef) -> ExprRef {
        let mut cases: Vec<(ExprRef, ExprRef)> = Vec::new();
        for GuardedExpr { expr: addr, guard } in &split.concrete {
            let key = IndexedKey { obj: ctx.mk_concrete_ref(*addr), index: index.clone() };
            let value = match self.allocated.get(addr) {
                Some(collection) => collection.read(ctx, &key),
                None => self.id.default_value(ctx),
            };
            cases.push((guard.clone(), value));
        }
        for GuardedExpr { expr, guard } in &split.symbolic {
            let key = IndexedKey { obj: expr.clone(), index: index.clone() };
            let value = match &self.input {
                Some(collection) => collection.read(ctx, &key),
                None => ctx.mk_base_read(
                    self.id.input_collection_id(),
                    vec![expr.clone(), index.clone()],
                ),
            };
            cases.push((guard.clone(), value));
        }
        combine_cases(ctx, cases)
    }

    pub(crate) fn write(
        &self,
        ctx: &ExprContext,
        split: &SplitHeapRefs,
        index: &ExprRef,
        value: &ExprRef,
        guard: &ExprRef,
    ) -> Self {
        let mut allocated = self.allocated.clone();
        let entries = Rc::make_mut(&mut allocated);
        for GuardedExpr { expr: addr, guard: case_guard } in &split.concrete {
            let total = ctx.mk_and(case_guard.clone(), guard.clone());
            if total.is_false() {
                continue;
            }
            let key = IndexedKey { obj: ctx.mk_concrete_ref(*addr), index: index.clone() };
            let collection = entries
                .get(addr)
                .cloned()
                .unwrap_or_else(|| self.new_allocated_collection(ctx, *addr));
            entries.insert(*addr, collection.write(key, value.clone(), total));
        }

        let mut input = self.input.clone();
        for GuardedExpr { expr, guard: case_guard } in &split.symbolic {
            let total = ctx.mk_and(case_guard.clone(), guard.clone());
            if total.is_false() {
                continue;
            }
            let key = IndexedKey { obj: expr.clone(), index: index.clone() };
            let collection = input.take().unwrap_or_else(|| self.new_input_collection());
            input = Some(collection.write(key, value.clone(), total));
        }

        IndexedRegion { id: self.id.clone(), allocated, input }
    }

    /// Records a guarded bulk copy for every (source case, destination
    /// case) pair, each through a key-remapping adapter. Per-key precision
    /// is preserved: nothing is enumerated eagerly.
    pub(crate) fn copy_range(
        &self,
        ctx: &ExprContext,
        src_split: &SplitHeapRefs,
        dst_split: &SplitHeapRefs,
        src_from: &ExprRef,
        dst_from: &ExprRef,
        dst_to: &ExprRef,
        guard: &ExprRef,
    ) -> Self {
        self.ranged_update(ctx, src_split, dst_split, guard, |src_obj, dst_obj| {
            KeyAdapter::Offset {
                src_obj,
                dst_obj,
                src_from: src_from.clone(),
                dst_from: dst_from.clone(),
                dst_to: dst_to.clone(),
            }
        })
    }

    /// Records a guarded whole-collection merge (map put-all, set union).
    pub(crate) fn merge(
        &self,
        ctx: &ExprContext,
        src_split: &SplitHeapRefs,
        dst_split: &SplitHeapRefs,
        guard: &ExprRef,
    ) -> Self {
        self.ranged_update(ctx, src_split, dst_split, guard, |src_obj, dst_obj| {
            KeyAdapter::Merge { src_obj, dst_obj }
        })
    }

    fn ranged_update(
        &self,
        ctx: &ExprContext,
        src_split: &SplitHeapRefs,
        dst_split: &SplitHeapRefs,
        guard: &ExprRef,
        mk_adapter: impl Fn(ExprRef, ExprRef) -> KeyAdapter,
    ) -> Self {
        let src_cases: Vec<(ExprRef, ExprRef, Collection<IndexedKeyInfo>)> = src_split
            .concrete
            .iter()
            .map(|case| {
                (
                    ctx.mk_concrete_ref(case.expr),
                    case.guard.clone(),
                    self.allocated_snapshot(ctx, case.expr),
                )
            })
            .chain(src_split.symbolic.iter().map(|case| {
                (case.expr.clone(), case.guard.clone(), self.input_snapshot())
            }))
            .collect();

        let mut result = self.clone();
        for GuardedExpr { expr: dst_addr, guard: dst_guard } in &dst_split.concrete {
            let dst_obj = ctx.mk_concrete_ref(*dst_addr);
            for (src_obj, src_guard, src) in &src_cases {
                let total = ctx.mk_and(
                    guard.clone(),
                    ctx.mk_and(dst_guard.clone(), src_guard.clone()),
                );
                if total.is_false() {
                    continue;
                }
                let adapter = mk_adapter(src_obj.clone(), dst_obj.clone());
                let entries = Rc::make_mut(&mut result.allocated);
                let collection = entries
                    .get(dst_addr)
                    .cloned()
                    .unwrap_or_else(|| self.new_allocated_collection(ctx, *dst_addr));
                entries.insert(
                    *dst_addr,
                    collection.copy_range(Rc::new(src.clone()), adapter, total),
                );
            }
        }
        for GuardedExpr { expr: dst_obj, guard: dst_guard } in &dst_split.symbolic {
            for (src_obj, src_guard, src) in &src_cases {
                let total = ctx.mk_and(
                    guard.clone(),
                    ctx.mk_and(dst_guard.clone(), src_guard.clone()),
                );
                if total.is_false() {
                    continue;
                }
                let adapter = mk_adapter(src_obj.clone(), dst_obj.clone());
                let collection = result
                    .input
                    .take()
                    .unwrap_or_else(|| self.new_input_collection());
                result.input =
                    Some(collection.copy_range(Rc::new(src.clone()), adapter, total));
            }
        }
        result
    }
}

/// Folds mutually exclusive guarded cases into one expression. The last
/// case lands innermost; with a single case the value is returned as-is.
fn combine_cases(ctx: &ExprContext, mut cases: Vec<(ExprRef, ExprRef)>) -> ExprRef {
    let (_, mut result) = cases.pop().expect("partitioning produced no cases");
    while let Some((guard, value)) = cases.pop() {
        result = ctx.mk_ite(guard, value, result);
    }
    result
}
