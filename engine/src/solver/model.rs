//! Solver models and decoded (concretized) regions.
//!
//! A [`Model`] assigns concrete values to free symbols and to the base
//! arrays of input collections. Decoding wraps a concluded path's region in
//! a read-only view, either evaluated eagerly (small, enumerable regions)
//! or lazily with a per-read memo; the two strategies agree on every key
//! the path ever wrote or read, and are free to differ on untouched keys.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use delegate::delegate;

use common::log_debug;

use crate::abs::{
    CollectionId, ConcreteVal, MemoryError, RawAddress, RegionId, SymVarId, NULL_ADDRESS,
};
use crate::config::DecodeStrategy;
use crate::expr::{Expr, ExprContext, ExprRef};
use crate::mem::collection::Collection;
use crate::mem::keys::{IndexedKeyInfo, KeyAdapter, RefKeyInfo};
use crate::mem::region::MemoryRegion;
use crate::mem::updates::UpdateNode;
use crate::mem::{Key, MemoryState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    SortMismatch,
    Memory(MemoryError),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::SortMismatch => write!(f, "sort mismatch during evaluation"),
            EvalError::Memory(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for EvalError {}

impl From<MemoryError> for EvalError {
    fn from(err: MemoryError) -> Self {
        EvalError::Memory(err)
    }
}

/// Interpretation of one collection's base array: explicit entries plus a
/// default for everything else.
pub struct RegionInterp {
    pub entries: Vec<(Vec<ConcreteVal>, ConcreteVal)>,
    pub default: ConcreteVal,
}

/// A satisfying assignment returned by the solver adapter. Values missing
/// from the assignment are completed on first use with a sort sample and
/// memoized, so repeated evaluation stays consistent.
#[derive(Default)]
pub struct Model {
    symbols: RefCell<HashMap<SymVarId, ConcreteVal>>,
    regions: HashMap<CollectionId, RegionInterp>,
}

impl Model {
    pub fn new() -> Self {
        Model::default()
    }

    /// Binds a free symbol. Panics if [`symbol`] is not a symbol node.
    pub fn assign(&mut self, symbol: &ExprRef, value: ConcreteVal) {
        match &**symbol {
            Expr::Symbol { id, .. } => {
                self.symbols.borrow_mut().insert(*id, value);
            }
            other => panic!("expected a symbol to assign, got {:?}", other),
        }
    }

    pub fn interpret_region(&mut self, collection: CollectionId, interp: RegionInterp) {
        self.regions.insert(collection, interp);
    }

    pub fn eval(&self, expr: &ExprRef) -> Result<ConcreteVal, EvalError> {
        let value = match &**expr {
            Expr::True => ConcreteVal::Bool(true),
            Expr::False => ConcreteVal::Bool(false),
            Expr::BitVec { bits, size } => ConcreteVal::BitVec { bits: *bits, size: *size },
            Expr::ConcreteRef(addr) => ConcreteVal::Addr(*addr),
            Expr::NullRef => ConcreteVal::Addr(NULL_ADDRESS),
            Expr::Symbol { id, sort } => *self
                .symbols
                .borrow_mut()
                .entry(*id)
                .or_insert_with(|| ConcreteVal::sample(*sort)),
            Expr::Not(e) => ConcreteVal::Bool(!as_bool(self.eval(e)?)?),
            Expr::And(l, r) => {
                ConcreteVal::Bool(as_bool(self.eval(l)?)? && as_bool(self.eval(r)?)?)
            }
            Expr::Or(l, r) => {
                ConcreteVal::Bool(as_bool(self.eval(l)?)? || as_bool(self.eval(r)?)?)
            }
            Expr::Eq(l, r) => ConcreteVal::Bool(values_equal(self.eval(l)?, self.eval(r)?)?),
            Expr::ULe(l, r) => {
                ConcreteVal::Bool(as_bits(self.eval(l)?)? <= as_bits(self.eval(r)?)?)
            }
            Expr::Add(l, r) => {
                let (bits, size) = as_sized_bits(self.eval(l)?)?;
                let rhs = as_bits(self.eval(r)?)?;
                ConcreteVal::BitVec { bits: mask(bits.wrapping_add(rhs), size), size }
            }
            Expr::Sub(l, r) => {
                let (bits, size) = as_sized_bits(self.eval(l)?)?;
                let rhs = as_bits(self.eval(r)?)?;
                ConcreteVal::BitVec { bits: mask(bits.wrapping_sub(rhs), size), size }
            }
            Expr::Ite { cond, then, otherwise } => {
                if as_bool(self.eval(cond)?)? {
                    self.eval(then)?
                } else {
                    self.eval(otherwise)?
                }
            }
            Expr::BaseRead { collection, key } => {
                let evaluated: Vec<ConcreteVal> = key
                    .iter()
                    .map(|k| self.eval(k))
                    .collect::<Result<_, _>>()?;
                match self.regions.get(collection) {
                    Some(interp) => interp
                        .entries
                        .iter()
                        .find(|(entry_key, _)| *entry_key == evaluated)
                        .map(|(_, value)| *value)
                        .unwrap_or(interp.default),
                    None => ConcreteVal::sample(collection.region.elem_sort),
                }
            }
        };
        Ok(value)
    }
}

fn as_bool(value: ConcreteVal) -> Result<bool, EvalError> {
    match value {
        ConcreteVal::Bool(b) => Ok(b),
        _ => Err(EvalError::SortMismatch),
    }
}

fn as_bits(value: ConcreteVal) -> Result<u64, EvalError> {
    match value {
        ConcreteVal::BitVec { bits, .. } => Ok(bits),
        _ => Err(EvalError::SortMismatch),
    }
}

fn as_sized_bits(value: ConcreteVal) -> Result<(u64, u32), EvalError> {
    match value {
        ConcreteVal::BitVec { bits, size } => Ok((bits, size)),
        _ => Err(EvalError::SortMismatch),
    }
}

fn mask(bits: u64, size: u32) -> u64 {
    if size >= 64 { bits } else { bits & ((1u64 << size) - 1) }
}

fn values_equal(lhs: ConcreteVal, rhs: ConcreteVal) -> Result<bool, EvalError> {
    match (lhs, rhs) {
        (ConcreteVal::Bool(a), ConcreteVal::Bool(b)) => Ok(a == b),
        (ConcreteVal::BitVec { bits: a, .. }, ConcreteVal::BitVec { bits: b, .. }) => Ok(a == b),
        (ConcreteVal::Addr(a), ConcreteVal::Addr(b)) => Ok(a == b),
        _ => Err(EvalError::SortMismatch),
    }
}

/// A fully concrete key of a decoded region.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConcreteKey {
    Ref(RawAddress),
    Indexed { addr: RawAddress, index: ConcreteVal },
}

/// Read-only view over a region of a concluded path.
pub enum DecodedRegion {
    Eager(EagerRegion),
    Lazy(LazyRegion),
}

impl DecodedRegion {
    delegate! {
        to match self {
            DecodedRegion::Eager(region) => region,
            DecodedRegion::Lazy(region) => region,
        } {
            pub fn read(&self, key: &ConcreteKey) -> Result<ConcreteVal, EvalError>;
            pub fn snapshot_known_entries(
                &self,
            ) -> Result<Vec<(ConcreteKey, ConcreteVal)>, EvalError>;
        }
    }
}

/// Shared decode plumbing: reifies a concrete key back into expressions and
/// evaluates the (pure) region read under the model.
struct DecodeCore {
    region: RegionId,
    state: MemoryState,
    model: Rc<Model>,
    /// Original expression-level keys for every key known to be touched.
    known: HashMap<ConcreteKey, Key>,
}

impl DecodeCore {
    fn compute(&self, key: &ConcreteKey) -> Result<ConcreteVal, EvalError> {
        let expr_key = match self.known.get(key) {
            Some(original) => original.clone(),
            None => self.reify(key)?,
        };
        let read = self.state.read(&self.region, &expr_key)?;
        self.model.eval(&read)
    }

    fn reify(&self, key: &ConcreteKey) -> Result<Key, EvalError> {
        let ctx = self.state.ctx();
        let lift = |value: &ConcreteVal| match value {
            ConcreteVal::Bool(b) => ctx.mk_bool(*b),
            ConcreteVal::BitVec { bits, size } => ctx.mk_bv(*bits, *size),
            ConcreteVal::Addr(NULL_ADDRESS) => ctx.null_ref(),
            ConcreteVal::Addr(addr) => ctx.mk_concrete_ref(*addr),
        };
        Ok(match key {
            ConcreteKey::Ref(NULL_ADDRESS)
            | ConcreteKey::Indexed { addr: NULL_ADDRESS, .. } => {
                return Err(EvalError::Memory(MemoryError::NullKey {
                    region: self.region.clone(),
                }))
            }
            ConcreteKey::Ref(addr) => Key::Ref(ctx.mk_concrete_ref(*addr)),
            ConcreteKey::Indexed { addr, index } => Key::Indexed {
                obj: ctx.mk_concrete_ref(*addr),
                index: lift(index),
            },
        })
    }
}

pub struct EagerRegion {
    core: DecodeCore,
    entries: HashMap<ConcreteKey, ConcreteVal>,
}

impl EagerRegion {
    pub fn read(&self, key: &ConcreteKey) -> Result<ConcreteVal, EvalError> {
        if let Some(value) = self.entries.get(key) {
            return Ok(*value);
        }
        self.core.compute(key)
    }

    pub fn snapshot_known_entries(&self) -> Result<Vec<(ConcreteKey, ConcreteVal)>, EvalError> {
        Ok(self.entries.iter().map(|(k, v)| (k.clone(), *v)).collect())
    }
}

pub struct LazyRegion {
    core: DecodeCore,
    memo: RefCell<HashMap<ConcreteKey, ConcreteVal>>,
}

impl LazyRegion {
    pub fn read(&self, key: &ConcreteKey) -> Result<ConcreteVal, EvalError> {
        if let Some(value) = self.memo.borrow().get(key) {
            return Ok(*value);
        }
        let value = self.core.compute(key)?;
        self.memo.borrow_mut().insert(key.clone(), value);
        Ok(value)
    }

    pub fn snapshot_known_entries(&self) -> Result<Vec<(ConcreteKey, ConcreteVal)>, EvalError> {
        let keys: Vec<ConcreteKey> = self.core.known.keys().cloned().collect();
        keys.into_iter()
            .map(|key| self.read(&key).map(|value| (key, value)))
            .collect()
    }
}

/// Decodes a region against a model, marking the state terminal. Strategy
/// selection is policy: eager when the touched key set is small and fully
/// enumerable, lazy otherwise; callers never need to know which.
pub fn decode_region(
    state: &MemoryState,
    id: &RegionId,
    model: Rc<Model>,
) -> Result<DecodedRegion, EvalError> {
    state.mark_decoded();

    let (known, enumerable) = collect_known_keys(state, id, &model)?;
    let core = DecodeCore {
        region: id.clone(),
        state: state.clone(),
        model,
        known,
    };

    let config = &state.config().decoding;
    let eager = match config.strategy {
        DecodeStrategy::Eager => true,
        DecodeStrategy::Lazy => false,
        DecodeStrategy::Auto => enumerable && core.known.len() <= config.eager_threshold,
    };
    log_debug!(
        "Decoding region {} with {} known keys ({})",
        id,
        core.known.len(),
        if eager { "eager" } else { "lazy" }
    );

    if eager {
        let mut entries = HashMap::with_capacity(core.known.len());
        for key in core.known.keys() {
            entries.insert(key.clone(), core.compute(key)?);
        }
        Ok(DecodedRegion::Eager(EagerRegion { core, entries }))
    } else {
        Ok(DecodedRegion::Lazy(LazyRegion { core, memo: RefCell::new(HashMap::new()) }))
    }
}

/// Every key the region is known to have been written at, evaluated under
/// the model, with its original expression form. The flag reports whether
/// ranged updates could be enumerated exhaustively.
fn collect_known_keys(
    state: &MemoryState,
    id: &RegionId,
    model: &Model,
) -> Result<(HashMap<ConcreteKey, Key>, bool), EvalError> {
    let mut known = HashMap::new();
    let mut enumerable = true;

    match state.region(id) {
        None => {}
        Some(MemoryRegion::Scalar(scalar)) => {
            let ctx = state.ctx();
            for addr in scalar.allocated_entries().keys() {
                known.insert(ConcreteKey::Ref(*addr), Key::Ref(ctx.mk_concrete_ref(*addr)));
            }
            if let Some(input) = scalar.input() {
                collect_ref_log_keys(input, model, &mut known)?;
            }
        }
        Some(MemoryRegion::Indexed(indexed)) => {
            let ctx = state.ctx();
            for collection in indexed.allocated_collections().values() {
                collect_indexed_log_keys(ctx, collection, model, &mut known, &mut enumerable)?;
            }
            if let Some(input) = indexed.input() {
                collect_indexed_log_keys(ctx, input, model, &mut known, &mut enumerable)?;
            }
        }
    }
    Ok((known, enumerable))
}

fn collect_ref_log_keys(
    collection: &Collection<RefKeyInfo>,
    model: &Model,
    known: &mut HashMap<ConcreteKey, Key>,
) -> Result<(), EvalError> {
    for node in collection.iter_oldest() {
        match &*node {
            UpdateNode::Pinpoint(write) => {
                let addr = match model.eval(&write.key.0)? {
                    ConcreteVal::Addr(addr) => addr,
                    _ => return Err(EvalError::SortMismatch),
                };
                known
                    .entry(ConcreteKey::Ref(addr))
                    .or_insert_with(|| Key::Ref(write.key.0.clone()));
            }
            UpdateNode::Ranged(_) => {
                unreachable!("ranged updates are not recorded for ref-keyed collections")
            }
        }
    }
    Ok(())
}

fn collect_indexed_log_keys(
    ctx: &ExprContext,
    collection: &Collection<IndexedKeyInfo>,
    model: &Model,
    known: &mut HashMap<ConcreteKey, Key>,
    enumerable: &mut bool,
) -> Result<(), EvalError> {
    for node in collection.iter_oldest() {
        match &*node {
            UpdateNode::Pinpoint(write) => {
                insert_indexed_key(model, known, &write.key.obj, &write.key.index)?;
            }
            UpdateNode::Ranged(ranged) => match &ranged.adapter {
                KeyAdapter::Offset { dst_obj, dst_from, dst_to, .. } => {
                    let from = as_bits(model.eval(dst_from)?)?;
                    let to = as_bits(model.eval(dst_to)?)?;
                    // A huge or reversed span is not worth enumerating.
                    if from > to || to - from >= 1 << 16 {
                        *enumerable = false;
                        continue;
                    }
                    for i in from..=to {
                        let index = ctx.mk_size(i);
                        insert_indexed_key(model, known, dst_obj, &index)?;
                    }
                }
                KeyAdapter::Merge { dst_obj, .. } => {
                    // Merged-in keys are the source's written keys, read at
                    // the destination object.
                    for src_node in ranged.src.iter_oldest() {
                        match &*src_node {
                            UpdateNode::Pinpoint(src_write) => {
                                insert_indexed_key(model, known, dst_obj, &src_write.key.index)?;
                            }
                            UpdateNode::Ranged(_) => {
                                *enumerable = false;
                            }
                        }
                    }
                }
            },
        }
    }
    Ok(())
}

fn insert_indexed_key(
    model: &Model,
    known: &mut HashMap<ConcreteKey, Key>,
    obj: &ExprRef,
    index: &ExprRef,
) -> Result<(), EvalError> {
    let addr = match model.eval(obj)? {
        ConcreteVal::Addr(addr) => addr,
        _ => return Err(EvalError::SortMismatch),
    };
    let idx = model.eval(index)?;
    known
        .entry(ConcreteKey::Indexed { addr, index: idx })
        .or_insert_with(|| Key::Indexed { obj: obj.clone(), index: index.clone() });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abs::{RegionId, Sort};
    use crate::config::{DecodeStrategy, EngineConfig};
    use crate::mem::split::split_heap_ref;

    fn size_val(bits: u64) -> ConcreteVal {
        ConcreteVal::BitVec { bits, size: 64 }
    }

    fn state_with(config: EngineConfig) -> MemoryState {
        MemoryState::new(Rc::new(ExprContext::new()), config)
    }

    fn state() -> MemoryState {
        state_with(EngineConfig::default())
    }

    #[test]
    fn missing_symbols_complete_consistently() {
        let ctx = ExprContext::new();
        let model = Model::new();
        let s = ctx.fresh_symbol(Sort::size());

        let first = model.eval(&s).unwrap();
        let second = model.eval(&s).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, size_val(0));
    }

    #[test]
    fn symbolic_aliasing_is_sound_under_both_outcomes() {
        let fields = RegionId::object_field(1, 0, Sort::size());
        let s = state();
        let ctx = s.ctx();
        let k1 = ctx.fresh_symbol(Sort::Address);
        let k2 = ctx.fresh_symbol(Sort::Address);

        let s = s
            .write(&fields, &Key::Ref(k1.clone()), ctx.mk_size(5), ctx.mk_true())
            .unwrap();
        let read = s.read(&fields, &Key::Ref(k2.clone())).unwrap();

        // Model equating the keys observes the write.
        let mut aliased = Model::new();
        aliased.assign(&k1, ConcreteVal::Addr(0x100));
        aliased.assign(&k2, ConcreteVal::Addr(0x100));
        assert_eq!(aliased.eval(&read).unwrap(), size_val(5));

        // Model separating them observes the prior (base) content.
        let mut separate = Model::new();
        separate.assign(&k1, ConcreteVal::Addr(0x100));
        separate.assign(&k2, ConcreteVal::Addr(0x200));
        separate.interpret_region(
            fields.input_collection_id(),
            RegionInterp {
                entries: vec![(vec![ConcreteVal::Addr(0x200)], size_val(9))],
                default: size_val(0),
            },
        );
        assert_eq!(separate.eval(&read).unwrap(), size_val(9));
    }

    #[test]
    fn partitioning_selects_exactly_one_branch_per_model() {
        let s = state();
        let ctx = s.ctx();
        let c1 = ctx.fresh_symbol(Sort::Bool);
        let c2 = ctx.fresh_symbol(Sort::Bool);
        let sym = ctx.fresh_symbol(Sort::Address);
        let reference = ctx.mk_ite(
            c1.clone(),
            ctx.mk_concrete_ref(1),
            ctx.mk_ite(c2.clone(), ctx.mk_concrete_ref(2), sym.clone()),
        );

        let split = split_heap_ref(
            ctx,
            &s.config().partitioning,
            &reference,
            &ctx.mk_true(),
        );

        for (b1, b2) in [(true, false), (false, true), (false, false), (true, true)] {
            let mut model = Model::new();
            model.assign(&c1, ConcreteVal::Bool(b1));
            model.assign(&c2, ConcreteVal::Bool(b2));
            model.assign(&sym, ConcreteVal::Addr(0x900));

            let mut satisfied = 0;
            for case in &split.concrete {
                if as_bool(model.eval(&case.guard).unwrap()).unwrap() {
                    satisfied += 1;
                }
            }
            for case in &split.symbolic {
                if as_bool(model.eval(&case.guard).unwrap()).unwrap() {
                    satisfied += 1;
                }
            }
            assert_eq!(satisfied, 1, "model ({}, {})", b1, b2);
        }
    }

    #[test]
    fn input_length_is_unbounded_above() {
        let lengths = RegionId::map_length(6);
        let s = state();
        let sym = s.ctx().fresh_symbol(Sort::Address);
        let read = s.read(&lengths, &Key::Ref(sym)).unwrap();

        // The region asserts no upper bound: a model may pick any
        // non-negative length.
        for length in [0u64, 1, 1234, u64::MAX] {
            let mut model = Model::new();
            model.interpret_region(
                lengths.input_collection_id(),
                RegionInterp { entries: vec![], default: size_val(length) },
            );
            assert_eq!(model.eval(&read).unwrap(), size_val(length));
        }
    }

    fn copied_array_state(config: EngineConfig) -> (MemoryState, RawAddress, RawAddress) {
        let s = state_with(config);
        let elements = RegionId::array_elements(5, Sort::size());
        let addr_a = s.ctx().fresh_address();
        let addr_b = s.ctx().fresh_address();
        let a = s.ctx().mk_concrete_ref(addr_a);
        let b = s.ctx().mk_concrete_ref(addr_b);

        let mut st = s;
        for (i, v) in [10u64, 20, 30, 40, 50].into_iter().enumerate() {
            let key = Key::Indexed { obj: a.clone(), index: st.ctx().mk_size(i as u64) };
            let value = st.ctx().mk_size(v);
            let guard = st.ctx().mk_true();
            st = st.write(&elements, &key, value, guard).unwrap();
        }
        let st = st
            .copy_range(
                &elements,
                &a,
                &b,
                st.ctx().mk_size(0),
                st.ctx().mk_size(0),
                st.ctx().mk_size(4),
                st.ctx().mk_true(),
            )
            .unwrap();
        (st, addr_a, addr_b)
    }

    #[test]
    fn decode_is_idempotent() {
        let elements = RegionId::array_elements(5, Sort::size());
        let (st, addr_a, addr_b) = copied_array_state(EngineConfig::default());
        let model = Rc::new(Model::new());

        let first = decode_region(&st, &elements, model.clone()).unwrap();
        let second = decode_region(&st, &elements, model).unwrap();

        for addr in [addr_a, addr_b] {
            for i in 0..5 {
                let key = ConcreteKey::Indexed { addr, index: size_val(i) };
                assert_eq!(first.read(&key).unwrap(), second.read(&key).unwrap());
            }
        }
    }

    #[test]
    fn eager_and_lazy_decode_agree() {
        let elements = RegionId::array_elements(5, Sort::size());

        let mut eager_config = EngineConfig::default();
        eager_config.decoding.strategy = DecodeStrategy::Eager;
        let mut lazy_config = EngineConfig::default();
        lazy_config.decoding.strategy = DecodeStrategy::Lazy;

        // Same deterministic scenario in both states.
        let (eager_state, addr_a, addr_b) = copied_array_state(eager_config);
        let (lazy_state, ..) = copied_array_state(lazy_config);

        let eager = decode_region(&eager_state, &elements, Rc::new(Model::new())).unwrap();
        let lazy = decode_region(&lazy_state, &elements, Rc::new(Model::new())).unwrap();
        assert!(matches!(eager, DecodedRegion::Eager(_)));
        assert!(matches!(lazy, DecodedRegion::Lazy(_)));

        for addr in [addr_a, addr_b] {
            for i in 0..5 {
                let key = ConcreteKey::Indexed { addr, index: size_val(i) };
                assert_eq!(eager.read(&key).unwrap(), lazy.read(&key).unwrap());
            }
        }
        // The copied destination reads the source's values.
        let b2 = ConcreteKey::Indexed { addr: addr_b, index: size_val(2) };
        assert_eq!(eager.read(&b2).unwrap(), size_val(30));

        let mut eager_entries = eager.snapshot_known_entries().unwrap();
        let mut lazy_entries = lazy.snapshot_known_entries().unwrap();
        eager_entries.sort_by(|a, b| format!("{:?}", a.0).cmp(&format!("{:?}", b.0)));
        lazy_entries.sort_by(|a, b| format!("{:?}", a.0).cmp(&format!("{:?}", b.0)));
        assert_eq!(eager_entries, lazy_entries);
    }

    #[test]
    fn decoded_state_rejects_writes() {
        let elements = RegionId::array_elements(5, Sort::size());
        let (st, addr_a, _) = copied_array_state(EngineConfig::default());
        let _ = decode_region(&st, &elements, Rc::new(Model::new())).unwrap();

        let key = Key::Indexed {
            obj: st.ctx().mk_concrete_ref(addr_a),
            index: st.ctx().mk_size(0),
        };
        let value = st.ctx().mk_size(1);
        let guard = st.ctx().mk_true();
        let err = st.write(&elements, &key, value, guard).unwrap_err();
        assert_eq!(err, MemoryError::WriteAfterDecode);
    }
}

