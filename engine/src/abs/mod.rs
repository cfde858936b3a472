pub mod backend;

use std::cell::Cell;
use std::fmt;

use derive_more as dm;

pub use common::types::{FieldIndex, RawAddress, SymVarId, TypeTag, NULL_ADDRESS};

/// Width of the bit vectors used for sizes, lengths and indices.
pub const SIZE_BITS: u32 = 64;

/// A theory sort tagging every expression node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sort {
    Bool,
    BitVec(u32),
    Address,
}

impl Sort {
    #[inline]
    pub fn size() -> Self {
        Sort::BitVec(SIZE_BITS)
    }

    #[inline]
    pub fn is_size(&self) -> bool {
        matches!(self, Sort::BitVec(SIZE_BITS))
    }
}

impl fmt::Display for Sort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sort::Bool => write!(f, "bool"),
            Sort::BitVec(size) => write!(f, "bv{}", size),
            Sort::Address => write!(f, "addr"),
        }
    }
}

/// Which logical collection a memory region is.
///
/// Identities are purely descriptive values: two regions with equal kind,
/// element sort and payload are the same region in every state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegionId {
    pub kind: RegionKind,
    pub elem_sort: Sort,
    pub payload: Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// A declared field of objects of one type.
    ObjectField,
    /// Elements of array-typed objects, indexed by size expressions.
    ArrayElements,
    /// Lengths of array-typed objects.
    ArrayLength,
    /// Lengths of map-typed objects.
    MapLength,
    /// Entries of map-typed objects, keyed by a primitive key sort.
    MapEntries,
    /// Membership flags of set-typed objects.
    SetMembership,
}

/// Discriminates regions of the same kind: which declared field, which
/// synthetic type tag, or which key sort a keyed collection carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Payload {
    Field { type_tag: TypeTag, field: FieldIndex },
    TypeTag(TypeTag),
    Keyed { type_tag: TypeTag, key_sort: Sort },
}

impl RegionId {
    pub fn object_field(type_tag: TypeTag, field: FieldIndex, elem_sort: Sort) -> Self {
        RegionId {
            kind: RegionKind::ObjectField,
            elem_sort,
            payload: Payload::Field { type_tag, field },
        }
    }

    pub fn array_elements(type_tag: TypeTag, elem_sort: Sort) -> Self {
        RegionId {
            kind: RegionKind::ArrayElements,
            elem_sort,
            payload: Payload::TypeTag(type_tag),
        }
    }

    pub fn array_length(type_tag: TypeTag) -> Self {
        RegionId {
            kind: RegionKind::ArrayLength,
            elem_sort: Sort::size(),
            payload: Payload::TypeTag(type_tag),
        }
    }

    pub fn map_length(type_tag: TypeTag) -> Self {
        RegionId {
            kind: RegionKind::MapLength,
            elem_sort: Sort::size(),
            payload: Payload::TypeTag(type_tag),
        }
    }

    pub fn map_entries(type_tag: TypeTag, key_sort: Sort, elem_sort: Sort) -> Self {
        RegionId {
            kind: RegionKind::MapEntries,
            elem_sort,
            payload: Payload::Keyed { type_tag, key_sort },
        }
    }

    pub fn set_membership(type_tag: TypeTag, key_sort: Sort) -> Self {
        RegionId {
            kind: RegionKind::SetMembership,
            elem_sort: Sort::Bool,
            payload: Payload::Keyed { type_tag, key_sort },
        }
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}<{}>", self.kind, self.elem_sort)?;
        match &self.payload {
            Payload::Field { type_tag, field } => write!(f, "#{}@{}", field, type_tag),
            Payload::TypeTag(tag) => write!(f, "@{}", tag),
            Payload::Keyed { type_tag, key_sort } => write!(f, "[{}]@{}", key_sort, type_tag),
        }
    }
}

/// One collection instance within a region: either the lazily created
/// partition for input (symbolic) instances, or the partition of one
/// allocated object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionId {
    pub region: RegionId,
    pub base: CollectionBase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionBase {
    Input,
    Allocated(RawAddress),
    /// The whole allocated partition of a ref-keyed region, viewed as one
    /// address-indexed array.
    AllocatedTable,
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.base {
            CollectionBase::Input => write!(f, "{}:input", self.region),
            CollectionBase::Allocated(addr) => write!(f, "{}:0x{:x}", self.region, addr),
            CollectionBase::AllocatedTable => write!(f, "{}:allocated", self.region),
        }
    }
}

/// Marks a position in a state's touch log, for incremental solver-query
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Checkpoint(pub(crate) usize);

/// A concrete value produced by a solver model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConcreteVal {
    Bool(bool),
    BitVec { bits: u64, size: u32 },
    Addr(RawAddress),
}

impl ConcreteVal {
    pub fn sort(&self) -> Sort {
        match self {
            ConcreteVal::Bool(_) => Sort::Bool,
            ConcreteVal::BitVec { size, .. } => Sort::BitVec(*size),
            ConcreteVal::Addr(_) => Sort::Address,
        }
    }

    /// The "don't care" completion for values a model does not pin down.
    pub fn sample(sort: Sort) -> Self {
        match sort {
            Sort::Bool => ConcreteVal::Bool(false),
            Sort::BitVec(size) => ConcreteVal::BitVec { bits: 0, size },
            Sort::Address => ConcreteVal::Addr(NULL_ADDRESS),
        }
    }
}

impl fmt::Display for ConcreteVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcreteVal::Bool(b) => write!(f, "{}", b),
            ConcreteVal::BitVec { bits, size } => write!(f, "{}bv{}", bits, size),
            ConcreteVal::Addr(addr) => write!(f, "0x{:x}", addr),
        }
    }
}

/// Contract violations raised at the memory boundary. These abort the
/// current path; the persistent region structures guarantee sibling paths
/// stay intact.
#[derive(Debug, Clone, PartialEq, Eq, dm::Display, dm::Error)]
pub enum MemoryError {
    #[display("null reference used as a key for region {region}")]
    NullKey { region: RegionId },
    #[display("key shape does not match region {region}")]
    KeyShapeMismatch { region: RegionId },
    #[display("sort mismatch for region {region}: expected {expected}, got {actual}")]
    SortMismatch {
        region: RegionId,
        expected: Sort,
        actual: Sort,
    },
    #[display("write issued on a decoded (terminal) state")]
    WriteAfterDecode,
    #[display("ranged writes are not meaningful for region {region}")]
    RangedWriteUnsupported { region: RegionId },
}

/// Counters accounting for precision cutoffs. Cutoffs are silent
/// degradations, never errors; these make the completeness loss measurable.
#[derive(Debug, Default)]
pub struct PrecisionStats {
    partition_cutoffs: Cell<u64>,
    translation_cutoffs: Cell<u64>,
}

impl PrecisionStats {
    pub(crate) fn bump_partition(&self) {
        self.partition_cutoffs.set(self.partition_cutoffs.get() + 1);
    }

    pub(crate) fn bump_translation(&self) {
        self.translation_cutoffs.set(self.translation_cutoffs.get() + 1);
    }

    pub fn partition_cutoffs(&self) -> u64 {
        self.partition_cutoffs.get()
    }

    pub fn translation_cutoffs(&self) -> u64 {
        self.translation_cutoffs.get()
    }
}
