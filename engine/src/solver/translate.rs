//! Translation of update logs into array-theory expressions.
//!
//! Each collection's log is walked once, oldest to newest, producing nested
//! guarded stores over its base array. Results are memoized per translator,
//! and a translator lives for one solver session, so re-translating an
//! unchanged region is free. Oversized logs are abandoned: the collection
//! is encoded as its uninterpreted base (fully symbolic, worst case) and
//! the degradation is counted.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use itertools::Itertools;

use common::log_debug;

use crate::abs::{CollectionBase, CollectionId, RegionId};
use crate::mem::collection::Collection;
use crate::mem::keys::KeyInfo;
use crate::mem::region::MemoryRegion;
use crate::mem::MemoryState;
use crate::mem::updates::UpdateNode;

use super::{ArrayExpr, RangeMap};

/// Array encodings of every collection a region currently consists of.
pub struct RegionTranslation {
    pub region: RegionId,
    pub parts: Vec<TranslatedCollection>,
}

pub struct TranslatedCollection {
    pub collection: CollectionId,
    pub array: Rc<ArrayExpr>,
}

pub struct Translator<'a> {
    state: &'a MemoryState,
    cache: RefCell<HashMap<(CollectionId, usize), Rc<ArrayExpr>>>,
}

impl<'a> Translator<'a> {
    pub fn new(state: &'a MemoryState) -> Self {
        Translator { state, cache: RefCell::new(HashMap::new()) }
    }

    pub fn translate_region(&self, id: &RegionId) -> RegionTranslation {
        let mut parts = Vec::new();
        match self.state.region(id) {
            None => {}
            Some(MemoryRegion::Scalar(scalar)) => {
                if !scalar.allocated_entries().is_empty() {
                    parts.push(self.translate_allocated_table(id, scalar.allocated_entries()));
                }
                if let Some(input) = scalar.input() {
                    parts.push(TranslatedCollection {
                        collection: input.id().clone(),
                        array: self.translate_collection(input),
                    });
                }
            }
            Some(MemoryRegion::Indexed(indexed)) => {
                for (_, collection) in indexed
                    .allocated_collections()
                    .iter()
                    .sorted_by_key(|(addr, _)| **addr)
                {
                    parts.push(TranslatedCollection {
                        collection: collection.id().clone(),
                        array: self.translate_collection(collection),
                    });
                }
                if let Some(input) = indexed.input() {
                    parts.push(TranslatedCollection {
                        collection: input.id().clone(),
                        array: self.translate_collection(input),
                    });
                }
            }
        }
        RegionTranslation { region: id.clone(), parts }
    }

    fn translate_allocated_table(
        &self,
        id: &RegionId,
        entries: &HashMap<crate::abs::RawAddress, crate::expr::ExprRef>,
    ) -> TranslatedCollection {
        let ctx = self.state.ctx();
        let collection = CollectionId { region: id.clone(), base: CollectionBase::AllocatedTable };
        let mut array = Rc::new(ArrayExpr::ConstDefault {
            collection: collection.clone(),
            default: id.default_value(ctx),
        });
        for (addr, value) in entries.iter().sorted_by_key(|(addr, _)| **addr) {
            array = Rc::new(ArrayExpr::Store {
                array,
                key: vec![ctx.mk_concrete_ref(*addr)],
                value: value.clone(),
                guard: ctx.mk_true(),
            });
        }
        TranslatedCollection { collection, array }
    }

    pub(crate) fn translate_collection<I: KeyInfo>(
        &self,
        collection: &Collection<I>,
    ) -> Rc<ArrayExpr> {
        let cache_key = (collection.id().clone(), collection.log_ptr());
        if let Some(hit) = self.cache.borrow().get(&cache_key) {
            return hit.clone();
        }

        let ctx = self.state.ctx();
        let updates = collection.iter_oldest();
        let translated = if updates.len() > self.state.config().translation.max_chain_length {
            ctx.stats().bump_translation();
            log_debug!(
                "Update log of {} too long ({}), encoding as fully symbolic",
                collection.id(),
                updates.len()
            );
            Rc::new(ArrayExpr::Base(collection.id().clone()))
        } else {
            let mut array = match collection.default() {
                Some(default) => Rc::new(ArrayExpr::ConstDefault {
                    collection: collection.id().clone(),
                    default: default.clone(),
                }),
                None => Rc::new(ArrayExpr::Base(collection.id().clone())),
            };
            for node in updates {
                array = match &*node {
                    UpdateNode::Pinpoint(write) => Rc::new(ArrayExpr::Store {
                        array,
                        key: I::key_exprs(&write.key),
                        value: write.value.clone(),
                        guard: write.guard.clone(),
                    }),
                    UpdateNode::Ranged(ranged) => Rc::new(ArrayExpr::CopyRange {
                        dst: array,
                        src: self.translate_collection(&ranged.src),
                        map: RangeMap::from(&ranged.adapter),
                        guard: ranged.guard.clone(),
                    }),
                };
            }
            array
        };

        self.cache.borrow_mut().insert(cache_key, translated.clone());
        translated
    }
}
