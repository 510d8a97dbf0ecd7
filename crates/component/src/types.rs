//! Component Model Types
//!
//! The closed set of component level value types, with their canonical sizes, alignments, and
//! flat core decompositions.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

/// A flat core type: the shape a component value takes on the core wasm side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoreType {
    I32,
    I64,
    F32,
    F64,
}

/// A named field of a record type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub ty: ValType,
}

/// A case of a variant type, with an optional payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Case {
    pub name: String,
    pub ty: Option<ValType>,
}

/// A component level value type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValType {
    Bool,
    S8,
    U8,
    S16,
    U16,
    S32,
    U32,
    S64,
    U64,
    F32,
    F64,
    Char,
    String,
    List(Box<ValType>),
    Record(Vec<Field>),
    Variant(Vec<Case>),
    Enum(Vec<String>),
    /// A bitset of up to 32 named flags.
    Flags(Vec<String>),
    Option(Box<ValType>),
    Result {
        ok: Option<Box<ValType>>,
        err: Option<Box<ValType>>,
    },
}

impl ValType {
    /// Alignment of the value in linear memory, in bytes.
    pub fn align(&self) -> u32 {
        match self {
            ValType::Bool | ValType::S8 | ValType::U8 => 1,
            ValType::S16 | ValType::U16 => 2,
            ValType::S32 | ValType::U32 | ValType::F32 | ValType::Char => 4,
            ValType::S64 | ValType::U64 | ValType::F64 => 8,
            ValType::String | ValType::List(_) | ValType::Flags(_) => 4,
            ValType::Record(fields) => fields
                .iter()
                .map(|field| field.ty.align())
                .max()
                .unwrap_or(1),
            ValType::Variant(cases) => {
                let payload = cases
                    .iter()
                    .filter_map(|case| case.ty.as_ref())
                    .map(|ty| ty.align())
                    .max()
                    .unwrap_or(1);
                discriminant_size(cases.len()).max(payload)
            }
            ValType::Enum(cases) => discriminant_size(cases.len()),
            ValType::Option(ty) => ty.align().max(1),
            ValType::Result { ok, err } => [ok, err]
                .into_iter()
                .filter_map(|ty| ty.as_deref())
                .map(|ty| ty.align())
                .max()
                .unwrap_or(1),
        }
    }

    /// Byte size of the value in linear memory.
    pub fn size(&self) -> u32 {
        match self {
            ValType::Bool | ValType::S8 | ValType::U8 => 1,
            ValType::S16 | ValType::U16 => 2,
            ValType::S32 | ValType::U32 | ValType::F32 | ValType::Char => 4,
            ValType::S64 | ValType::U64 | ValType::F64 => 8,
            ValType::String | ValType::List(_) => 8,
            ValType::Flags(_) => 4,
            ValType::Record(fields) => {
                let mut offset = 0;
                for field in fields {
                    offset = align_to(offset, field.ty.align());
                    offset += field.ty.size();
                }
                align_to(offset, self.align())
            }
            ValType::Variant(cases) => {
                let payload = cases
                    .iter()
                    .filter_map(|case| case.ty.as_ref())
                    .map(|ty| ty.size())
                    .max()
                    .unwrap_or(0);
                let offset = align_to(discriminant_size(cases.len()), self.align());
                align_to(offset + payload, self.align())
            }
            ValType::Enum(cases) => discriminant_size(cases.len()),
            ValType::Option(ty) => {
                let offset = align_to(1, self.align());
                align_to(offset + ty.size(), self.align())
            }
            ValType::Result { ok, err } => {
                let payload = [ok, err]
                    .into_iter()
                    .filter_map(|ty| ty.as_deref())
                    .map(|ty| ty.size())
                    .max()
                    .unwrap_or(0);
                let offset = align_to(1, self.align());
                align_to(offset + payload, self.align())
            }
        }
    }

    /// Appends the flat core types this value decomposes into. Each scalar maps to exactly one
    /// flat type; strings and lists flatten to two i32s (pointer, length).
    pub fn flatten(&self, out: &mut Vec<CoreType>) {
        match self {
            ValType::Bool
            | ValType::S8
            | ValType::U8
            | ValType::S16
            | ValType::U16
            | ValType::S32
            | ValType::U32
            | ValType::Char
            | ValType::Enum(_)
            | ValType::Flags(_) => out.push(CoreType::I32),
            ValType::S64 | ValType::U64 => out.push(CoreType::I64),
            ValType::F32 => out.push(CoreType::F32),
            ValType::F64 => out.push(CoreType::F64),
            ValType::String | ValType::List(_) => {
                out.push(CoreType::I32);
                out.push(CoreType::I32);
            }
            ValType::Record(fields) => {
                for field in fields {
                    field.ty.flatten(out);
                }
            }
            ValType::Variant(cases) => {
                out.push(CoreType::I32);
                join_cases(cases.iter().map(|case| case.ty.as_ref()), out);
            }
            ValType::Option(ty) => {
                out.push(CoreType::I32);
                join_cases([None, Some(&**ty)].into_iter(), out);
            }
            ValType::Result { ok, err } => {
                out.push(CoreType::I32);
                join_cases([ok.as_deref(), err.as_deref()].into_iter(), out);
            }
        }
    }

    /// True for the types [`crate::lift_scalar`] handles.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            ValType::Bool
                | ValType::S8
                | ValType::U8
                | ValType::S16
                | ValType::U16
                | ValType::S32
                | ValType::U32
                | ValType::S64
                | ValType::U64
                | ValType::F32
                | ValType::F64
                | ValType::Char
                | ValType::Enum(_)
                | ValType::Flags(_)
        )
    }
}

/// Flattens every case and joins them element-wise, so that one flat shape can carry any case's
/// payload.
fn join_cases<'a>(cases: impl Iterator<Item = Option<&'a ValType>>, out: &mut Vec<CoreType>) {
    let base = out.len();
    for case in cases {
        let Some(ty) = case else { continue };
        let mut flat = Vec::new();
        ty.flatten(&mut flat);
        for (i, new) in flat.into_iter().enumerate() {
            match out.get(base + i) {
                Some(&existing) => out[base + i] = join(existing, new),
                None => out.push(new),
            }
        }
    }
}

/// Joins two flat types into one that can carry both bit patterns.
fn join(a: CoreType, b: CoreType) -> CoreType {
    if a == b {
        return a;
    }
    match (a, b) {
        (CoreType::I32, CoreType::F32) | (CoreType::F32, CoreType::I32) => CoreType::I32,
        _ => CoreType::I64,
    }
}

/// Number of bytes of a variant discriminant.
fn discriminant_size(cases: usize) -> u32 {
    match cases {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        _ => 4,
    }
}

fn align_to(offset: u32, align: u32) -> u32 {
    offset.div_ceil(align) * align
}
