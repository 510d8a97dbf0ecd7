//! WebAssembly Types

use alloc::vec::Vec;

use collections::entity_impl;

use crate::error::ValidationError;

/// Index of a type in a module's type section.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct TypeIndex(u32);
entity_impl!(TypeIndex);

/// A WebAssembly value type, as declared for locals, globals, table slots and struct fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
    FuncRef,
    ExternRef,
    AnyRef,
}

impl ValueType {
    pub fn is_ref(self) -> bool {
        matches!(self, ValueType::FuncRef | ValueType::ExternRef | ValueType::AnyRef)
    }
}

/// The type of a function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FuncType {
    params: Vec<ValueType>,
    results: Vec<ValueType>,
}

impl FuncType {
    pub fn new(params: Vec<ValueType>, results: Vec<ValueType>) -> Self {
        Self { params, results }
    }

    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    pub fn results(&self) -> &[ValueType] {
        &self.results
    }
}

// ——————————————————————————————— Heap Types ——————————————————————————————— //

// Sentinel codes of the abstract heap types, as found in signed LEB128 immediates.
const HT_NONE: i64 = -15;
const HT_FUNC: i64 = -16;
const HT_ANY: i64 = -17;
const HT_EXTERN: i64 = -18;
const HT_EQ: i64 = -19;
const HT_I31: i64 = -20;
const HT_STRUCT: i64 = -21;
const HT_ARRAY: i64 = -22;

/// A heap type, as it appears in ref-typed instructions: either one of the abstract sentinels or
/// a concrete module type index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapType {
    Any,
    Eq,
    I31,
    Struct,
    Array,
    Func,
    None,
    Extern,
    Concrete(TypeIndex),
}

impl HeapType {
    /// Decodes a heap type immediate. Non-negative codes are concrete type indices.
    pub fn from_code(code: i64) -> Result<Self, ValidationError> {
        match code {
            HT_NONE => Ok(HeapType::None),
            HT_FUNC => Ok(HeapType::Func),
            HT_ANY => Ok(HeapType::Any),
            HT_EXTERN => Ok(HeapType::Extern),
            HT_EQ => Ok(HeapType::Eq),
            HT_I31 => Ok(HeapType::I31),
            HT_STRUCT => Ok(HeapType::Struct),
            HT_ARRAY => Ok(HeapType::Array),
            idx if (0..=u32::MAX as i64).contains(&idx) => {
                Ok(HeapType::Concrete(TypeIndex::from_u32(idx as u32)))
            }
            _ => Err(ValidationError::BadHeapType(code)),
        }
    }
}

// —————————————————————————————— Type Section —————————————————————————————— //

/// A field of a struct type, or the element type of an array type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldType {
    pub ty: ValueType,
    pub mutable: bool,
}

impl FieldType {
    pub fn mutable(ty: ValueType) -> Self {
        Self { ty, mutable: true }
    }

    pub fn immutable(ty: ValueType) -> Self {
        Self { ty, mutable: false }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructType {
    pub fields: Vec<FieldType>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArrayType {
    pub element: FieldType,
}

/// A composite type from a module's type section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompositeType {
    Struct(StructType),
    Array(ArrayType),
    Func(FuncType),
}

/// A type definition: a composite type plus its super types.
///
/// Only single inheritance is supported, subtyping walks the first super type entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeDef {
    pub composite: CompositeType,
    pub supers: Vec<TypeIndex>,
    pub is_final: bool,
}

impl TypeDef {
    pub fn new(composite: CompositeType) -> Self {
        Self {
            composite,
            supers: Vec::new(),
            is_final: true,
        }
    }

    /// Declares `parent` as the super type of this definition.
    pub fn with_super(mut self, parent: TypeIndex) -> Self {
        self.supers.push(parent);
        self.is_final = false;
        self
    }

    pub fn struct_type(&self) -> Option<&StructType> {
        match &self.composite {
            CompositeType::Struct(ty) => Some(ty),
            _ => None,
        }
    }

    pub fn array_type(&self) -> Option<&ArrayType> {
        match &self.composite {
            CompositeType::Array(ty) => Some(ty),
            _ => None,
        }
    }

    pub fn func_type(&self) -> Option<&FuncType> {
        match &self.composite {
            CompositeType::Func(ty) => Some(ty),
            _ => None,
        }
    }
}
