/// A concrete (allocated) heap address. Zero is reserved for the null
/// reference and never denotes an allocated object.
pub type RawAddress = u64;

pub const NULL_ADDRESS: RawAddress = 0;

pub type FieldIndex = u32;

/// Synthetic tag distinguishing collections of the same kind, e.g. maps of
/// different declared types whose lengths live in separate regions.
pub type TypeTag = u64;

/// Identifier of a free symbolic variable within one analysis context.
pub type SymVarId = u32;
