//! Runtime Errors

use alloc::string::String;
use thiserror::Error;

/// An unrecoverable execution error.
///
/// Traps unwind the stack up to the outermost invocation; they are never caught inside the
/// runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Trap {
    #[error("null reference")]
    NullReference,
    #[error("heap access out of bounds")]
    HeapOutOfBounds,
    #[error("memory access out of bounds")]
    MemoryOutOfBounds,
    #[error("table access out of bounds")]
    TableOutOfBounds,
    #[error("uninitialized table element")]
    UndefinedElement,
    #[error("cast failure")]
    CastFailure,
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("unreachable instruction")]
    Unreachable,
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("host function error")]
    Host,
}

/// An import that could not be resolved at instantiation time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("unknown import {module}.{name}")]
    UnknownImport { module: String, name: String },
    #[error("signature mismatch for import {module}.{name}")]
    SignatureMismatch { module: String, name: String },
    #[error("incompatible import {module}.{name}")]
    IncompatibleImport { module: String, name: String },
}

/// A malformed module or function body.
///
/// The external decoder is expected to validate modules; these errors cover the checks the
/// runtime still performs when reading raw code bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("type index {0} out of range")]
    BadTypeIndex(u32),
    #[error("invalid heap type code {0}")]
    BadHeapType(i64),
    #[error("field index {0} out of range")]
    BadFieldIndex(u32),
    #[error("local index {0} out of range")]
    BadLocalIndex(u32),
    #[error("function index {0} out of range")]
    BadFuncIndex(u32),
    #[error("global index {0} out of range")]
    BadGlobalIndex(u32),
    #[error("table index {0} out of range")]
    BadTableIndex(u32),
    #[error("memory index {0} out of range")]
    BadMemIndex(u32),
    #[error("unsupported opcode {0:#04x}")]
    UnsupportedOpcode(u8),
    #[error("unsupported gc opcode {0:#04x}")]
    UnsupportedGcOpcode(u32),
    #[error("unsupported block type {0}")]
    UnsupportedBlockType(i64),
    #[error("truncated function body")]
    UnexpectedEnd,
    #[error("malformed control structure")]
    MalformedControl,
    #[error("write to immutable global")]
    ImmutableGlobal,
    #[error("write to immutable field")]
    ImmutableField,
}

/// An invalid string encoding crossing the canonical ABI boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("invalid utf-8 string")]
    InvalidUtf8,
    #[error("unpaired utf-16 surrogate")]
    UnpairedSurrogate,
    #[error("misaligned utf-16 pointer")]
    MisalignedPointer,
    #[error("invalid unicode scalar value {0:#x}")]
    InvalidCodepoint(u32),
}

/// An access or grow request falling outside the bounds of a memory, table, or string region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OutOfBoundsError {
    #[error("range {offset}+{len} exceeds size {size}")]
    Range { offset: u64, len: u64, size: u64 },
    #[error("grow to {requested} exceeds maximum {max}")]
    Grow { requested: u64, max: u64 },
}

/// The top level error type of the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("trap: {0}")]
    Trap(#[from] Trap),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    OutOfBounds(#[from] OutOfBoundsError),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
