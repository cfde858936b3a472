//! Recombination of forked update logs: a child state's guarded writes are
//! replayed on top of a parent snapshot, with the child's base reads and
//! symbols substituted against the parent. No per-guard information is
//! lost; every replayed write carries its composed guard.

use std::cell::RefCell;
use std::collections::HashMap;

use itertools::Itertools;

use common::log_debug;

use crate::abs::{Checkpoint, CollectionBase, MemoryError, SymVarId};
use crate::expr::{Expr, ExprRef};

use super::collection::Collection;
use super::keys::{IndexedKeyInfo, KeyAdapter, RefKeyInfo};
use super::region::MemoryRegion;
use super::updates::UpdateNode;
use super::{Key, MemoryState};

/// Substitutes a state's ambient unknowns (free symbols and input base
/// reads) against a target state.
pub struct Composer<'a> {
    target: &'a MemoryState,
    substitution: &'a HashMap<SymVarId, ExprRef>,
    cache: RefCell<HashMap<ExprRef, ExprRef>>,
}

impl<'a> Composer<'a> {
    pub fn new(target: &'a MemoryState, substitution: &'a HashMap<SymVarId, ExprRef>) -> Self {
        Composer { target, substitution, cache: RefCell::new(HashMap::new()) }
    }

    pub fn compose(&self, expr: &ExprRef) -> Result<ExprRef, MemoryError> {
        if let Some(hit) = self.cache.borrow().get(expr) {
            return Ok(hit.clone());
        }
        let ctx = self.target.ctx();
        let composed = match &**expr {
            Expr::True
            | Expr::False
            | Expr::BitVec { .. }
            | Expr::ConcreteRef(_)
            | Expr::NullRef => expr.clone(),
            Expr::Symbol { id, .. } => self
                .substitution
                .get(id)
                .cloned()
                .unwrap_or_else(|| expr.clone()),
            Expr::Not(e) => ctx.mk_not(self.compose(e)?),
            Expr::And(l, r) => ctx.mk_and(self.compose(l)?, self.compose(r)?),
            Expr::Or(l, r) => ctx.mk_or(self.compose(l)?, self.compose(r)?),
            Expr::Eq(l, r) => ctx.mk_eq(self.compose(l)?, self.compose(r)?),
            Expr::ULe(l, r) => ctx.mk_ule(self.compose(l)?, self.compose(r)?),
            Expr::Add(l, r) => ctx.mk_add(self.compose(l)?, self.compose(r)?),
            Expr::Sub(l, r) => ctx.mk_sub(self.compose(l)?, self.compose(r)?),
            Expr::Ite { cond, then, otherwise } => ctx.mk_ite(
                self.compose(cond)?,
                self.compose(then)?,
                self.compose(otherwise)?,
            ),
            Expr::BaseRead { collection, key } => {
                debug_assert!(matches!(collection.base, CollectionBase::Input));
                let composed_key = match key.as_slice() {
                    [obj] => Key::Ref(self.compose(obj)?),
                    [obj, index] => Key::Indexed {
                        obj: self.compose(obj)?,
                        index: self.compose(index)?,
                    },
                    _ => unreachable!("base reads carry one or two key components"),
                };
                self.target.read(&collection.region, &composed_key)?
            }
        };
        self.cache
            .borrow_mut()
            .insert(expr.clone(), composed.clone());
        Ok(composed)
    }
}

impl MemoryState {
    /// Replays this state's writes (to regions touched after [`since`]) on
    /// top of [`parent`], composing keys, values and guards through
    /// [`substitution`]. Base reads recorded in this state's logs resolve
    /// against the parent snapshot.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn rebase_onto(
        &self,
        parent: &MemoryState,
        since: Checkpoint,
        substitution: &HashMap<SymVarId, ExprRef>,
    ) -> Result<MemoryState, MemoryError> {
        let composer = Composer::new(parent, substitution);
        let mut out = parent.clone();

        for region_id in self.regions_touched_since(since) {
            let Some(region) = self.region(&region_id) else {
                continue;
            };
            log_debug!("Recombining region {}", region_id);
            match region {
                MemoryRegion::Scalar(scalar) => {
                    for (addr, value) in scalar
                        .allocated_entries()
                        .iter()
                        .sorted_by_key(|(addr, _)| **addr)
                    {
                        let key = Key::Ref(out.ctx().mk_concrete_ref(*addr));
                        let value = composer.compose(value)?;
                        out = out.write(&region_id, &key, value, out.ctx().mk_true())?;
                    }
                    if let Some(input) = scalar.input() {
                        out = self.replay_ref_log(out, &composer, input)?;
                    }
                }
                MemoryRegion::Indexed(indexed) => {
                    for (_, collection) in indexed
                        .allocated_collections()
                        .iter()
                        .sorted_by_key(|(addr, _)| **addr)
                    {
                        out = self.replay_indexed_log(out, &composer, collection)?;
                    }
                    if let Some(input) = indexed.input() {
                        out = self.replay_indexed_log(out, &composer, input)?;
                    }
                }
            }
        }
        Ok(out)
    }

    fn replay_ref_log(
        &self,
        mut out: MemoryState,
        composer: &Composer<'_>,
        collection: &Collection<RefKeyInfo>,
    ) -> Result<MemoryState, MemoryError> {
        let region_id = collection.id().region.clone();
        for node in collection.iter_oldest() {
            match &*node {
                UpdateNode::Pinpoint(write) => {
                    let guard = composer.compose(&write.guard)?;
                    if guard.is_false() {
                        continue;
                    }
                    let key = Key::Ref(composer.compose(&write.key.0)?);
                    let value = composer.compose(&write.value)?;
                    out = out.write(&region_id, &key, value, guard)?;
                }
                UpdateNode::Ranged(_) => {
                    unreachable!("ranged updates are not recorded for ref-keyed collections")
                }
            }
        }
        Ok(out)
    }

    fn replay_indexed_log(
        &self,
        mut out: MemoryState,
        composer: &Composer<'_>,
        collection: &Collection<IndexedKeyInfo>,
    ) -> Result<MemoryState, MemoryError> {
        let region_id = collection.id().region.clone();
        for node in collection.iter_oldest() {
            match &*node {
                UpdateNode::Pinpoint(write) => {
                    let guard = composer.compose(&write.guard)?;
                    if guard.is_false() {
                        continue;
                    }
                    let key = Key::Indexed {
                        obj: composer.compose(&write.key.obj)?,
                        index: composer.compose(&write.key.index)?,
                    };
                    let value = composer.compose(&write.value)?;
                    out = out.write(&region_id, &key, value, guard)?;
                }
                UpdateNode::Ranged(ranged) => {
                    let guard = composer.compose(&ranged.guard)?;
                    if guard.is_false() {
                        continue;
                    }
                    out = match &ranged.adapter {
                        KeyAdapter::Offset {
                            src_obj,
                            dst_obj,
                            src_from,
                            dst_from,
                            dst_to,
                        } => out.copy_range(
                            &region_id,
                            &composer.compose(src_obj)?,
                            &composer.compose(dst_obj)?,
                            composer.compose(src_from)?,
                            composer.compose(dst_from)?,
                            composer.compose(dst_to)?,
                            guard,
                        )?,
                        KeyAdapter::Merge { src_obj, dst_obj } => out.merge(
                            &region_id,
                            &composer.compose(src_obj)?,
                            &composer.compose(dst_obj)?,
                            guard,
                        )?,
                    };
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::abs::{RegionId, Sort};
    use crate::config::EngineConfig;
    use crate::expr::ExprContext;

    fn state() -> MemoryState {
        MemoryState::new(Rc::new(ExprContext::new()), EngineConfig::default())
    }

    fn symbol_id(expr: &ExprRef) -> SymVarId {
        match &**expr {
            Expr::Symbol { id, .. } => *id,
            other => panic!("not a symbol: {:?}", other),
        }
    }

    #[test]
    fn compose_substitutes_symbols() {
        let parent = state();
        let ctx = parent.ctx();
        let s = ctx.fresh_symbol(Sort::size());
        let sum = ctx.mk_add(s.clone(), ctx.mk_size(1));

        let mut substitution = HashMap::new();
        substitution.insert(symbol_id(&s), ctx.mk_size(41));
        let composer = Composer::new(&parent, &substitution);

        assert_eq!(composer.compose(&sum).unwrap().as_bits(), Some(42));
    }

    #[test_log::test]
    fn base_reads_resolve_against_parent() {
        let lengths = RegionId::map_length(3);
        let ctx = Rc::new(ExprContext::new());
        let parent = MemoryState::new(ctx.clone(), EngineConfig::default());
        let concrete = ctx.mk_concrete_ref(ctx.fresh_address());
        let parent = parent
            .write(
                &lengths,
                &Key::Ref(concrete.clone()),
                ctx.mk_size(7),
                ctx.mk_true(),
            )
            .unwrap();

        // The child reads an input length and stores a derived value.
        let child = MemoryState::new(ctx.clone(), EngineConfig::default());
        let sym_ref = ctx.fresh_symbol(Sort::Address);
        let cp = child.checkpoint();
        let length = child.read(&lengths, &Key::Ref(sym_ref.clone())).unwrap();
        let bumped = ctx.mk_add(length, ctx.mk_size(1));
        let child = child
            .write(&lengths, &Key::Ref(sym_ref.clone()), bumped, ctx.mk_true())
            .unwrap();

        // Recombine, pinning the symbolic reference to the parent's object.
        let mut substitution = HashMap::new();
        substitution.insert(symbol_id(&sym_ref), concrete.clone());
        let out = child.rebase_onto(&parent, cp, &substitution).unwrap();

        assert_eq!(
            out.read(&lengths, &Key::Ref(concrete)).unwrap().as_bits(),
            Some(8)
        );
    }

    #[test]
    fn replayed_writes_keep_their_guards() {
        let fields = RegionId::object_field(2, 0, Sort::size());
        let ctx = Rc::new(ExprContext::new());
        let r = ctx.fresh_symbol(Sort::Address);

        let parent = MemoryState::new(ctx.clone(), EngineConfig::default());
        let parent = parent
            .write(&fields, &Key::Ref(r.clone()), ctx.mk_size(1), ctx.mk_true())
            .unwrap();

        let child = MemoryState::new(ctx.clone(), EngineConfig::default());
        let cp = child.checkpoint();
        let g = ctx.fresh_symbol(Sort::Bool);
        let child = child
            .write(&fields, &Key::Ref(r.clone()), ctx.mk_size(2), g.clone())
            .unwrap();

        let substitution = HashMap::new();
        let out = child.rebase_onto(&parent, cp, &substitution).unwrap();

        // The parent's write survives in the else branch of the child's
        // guarded one.
        let read = out.read(&fields, &Key::Ref(r)).unwrap();
        match &*read {
            Expr::Ite { cond, then, otherwise } => {
                assert_eq!(cond, &g);
                assert_eq!(then.as_bits(), Some(2));
                assert_eq!(otherwise.as_bits(), Some(1));
            }
            other => panic!("expected guarded layering, got {:?}", other),
        }
    }
}
