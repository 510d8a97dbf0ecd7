//! Canonical ABI
//!
//! Lifting converts flat core values into component values, lowering is the inverse. Scalars
//! are reinterpreted bit-exactly according to the declared type; strings travel through linear
//! memory as (pointer, length) pairs, in UTF-8 or UTF-16LE wire encoding.
//!
//! Lowering bounds-checks before mutating, so a failed lower never commits bytes past the
//! check that failed.

use alloc::string::String;

use thiserror::Error;

use runtime::{EncodingError, OutOfBoundsError};

use crate::types::{CoreType, ValType};
use crate::values::{CoreValue, Value};

/// An error crossing the canonical ABI boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AbiError {
    #[error("flat type mismatch: expected {expected:?}, found {found:?}")]
    TypeMismatch {
        expected: CoreType,
        found: CoreType,
    },
    #[error("discriminant {0} out of range")]
    BadDiscriminant(u32),
    #[error("not a scalar type")]
    NotScalar,
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    OutOfBounds(#[from] OutOfBoundsError),
}

// ————————————————————————————————— Scalars ———————————————————————————————— //

/// Lifts a flat core value into a component scalar.
///
/// The flat type must match the declared one: i32 carries booleans, integers up to 32 bits,
/// chars, flags and enum discriminants; i64 carries the 64-bit integers; floats travel as
/// themselves. A wider i32 source is truncated to the declared width, and the declared
/// signedness decides how the raw bits are reinterpreted.
pub fn lift_scalar(ty: &ValType, value: CoreValue) -> Result<Value, AbiError> {
    match ty {
        ValType::Bool => Ok(Value::Bool(expect_i32(value)? != 0)),
        ValType::S8 => Ok(Value::S8(expect_i32(value)? as i8)),
        ValType::U8 => Ok(Value::U8(expect_i32(value)? as u8)),
        ValType::S16 => Ok(Value::S16(expect_i32(value)? as i16)),
        ValType::U16 => Ok(Value::U16(expect_i32(value)? as u16)),
        ValType::S32 => Ok(Value::S32(expect_i32(value)?)),
        ValType::U32 => Ok(Value::U32(expect_i32(value)? as u32)),
        ValType::S64 => Ok(Value::S64(expect_i64(value)?)),
        ValType::U64 => Ok(Value::U64(expect_i64(value)? as u64)),
        ValType::F32 => Ok(Value::F32(expect_f32(value)?)),
        ValType::F64 => Ok(Value::F64(expect_f64(value)?)),
        ValType::Char => {
            let code = expect_i32(value)? as u32;
            // `from_u32` rejects surrogates and anything past 0x10FFFF.
            match char::from_u32(code) {
                Some(c) => Ok(Value::Char(c)),
                None => Err(EncodingError::InvalidCodepoint(code).into()),
            }
        }
        ValType::Flags(_) => Ok(Value::Flags(expect_i32(value)? as u32)),
        ValType::Enum(cases) => {
            let index = expect_i32(value)? as u32;
            if index as usize >= cases.len() {
                return Err(AbiError::BadDiscriminant(index));
            }
            Ok(Value::Enum(index))
        }
        _ => Err(AbiError::NotScalar),
    }
}

/// Lowers a component scalar to its flat core value.
///
/// Booleans become 0 or 1, signed integers sign-extend to the flat width, unsigned integers
/// zero-extend, and a char becomes an i32 holding its codepoint.
pub fn lower_scalar(value: Value) -> CoreValue {
    match value {
        Value::Bool(v) => CoreValue::I32(v as i32),
        Value::S8(v) => CoreValue::I32(v as i32),
        Value::U8(v) => CoreValue::I32(v as i32),
        Value::S16(v) => CoreValue::I32(v as i32),
        Value::U16(v) => CoreValue::I32(v as i32),
        Value::S32(v) => CoreValue::I32(v),
        Value::U32(v) => CoreValue::I32(v as i32),
        Value::S64(v) => CoreValue::I64(v),
        Value::U64(v) => CoreValue::I64(v as i64),
        Value::F32(v) => CoreValue::F32(v),
        Value::F64(v) => CoreValue::F64(v),
        Value::Char(v) => CoreValue::I32(v as i32),
        Value::Flags(v) => CoreValue::I32(v as i32),
        Value::Enum(v) => CoreValue::I32(v as i32),
    }
}

fn expect_i32(value: CoreValue) -> Result<i32, AbiError> {
    match value {
        CoreValue::I32(v) => Ok(v),
        other => Err(mismatch(CoreType::I32, other)),
    }
}

fn expect_i64(value: CoreValue) -> Result<i64, AbiError> {
    match value {
        CoreValue::I64(v) => Ok(v),
        other => Err(mismatch(CoreType::I64, other)),
    }
}

fn expect_f32(value: CoreValue) -> Result<f32, AbiError> {
    match value {
        CoreValue::F32(v) => Ok(v),
        other => Err(mismatch(CoreType::F32, other)),
    }
}

fn expect_f64(value: CoreValue) -> Result<f64, AbiError> {
    match value {
        CoreValue::F64(v) => Ok(v),
        other => Err(mismatch(CoreType::F64, other)),
    }
}

fn mismatch(expected: CoreType, found: CoreValue) -> AbiError {
    AbiError::TypeMismatch {
        expected,
        found: found.ty(),
    }
}

// ————————————————————————————————— Strings ———————————————————————————————— //

/// Lifts a UTF-8 string from linear memory, borrowing the validated bytes without copying.
pub fn lift_string_utf8(memory: &[u8], ptr: u32, byte_len: u32) -> Result<&str, AbiError> {
    let bytes = range(memory, ptr, byte_len)?;
    core::str::from_utf8(bytes).map_err(|_| EncodingError::InvalidUtf8.into())
}

/// Lifts a UTF-16LE string from linear memory, transcoding it into an owned UTF-8 buffer.
///
/// `unit_len` counts 16-bit code units. The pointer must be 2-aligned, and surrogates must come
/// in well ordered pairs: a matched pair decodes to its supplementary plane scalar, a lone one
/// is an error.
pub fn lift_string_utf16(memory: &[u8], ptr: u32, unit_len: u32) -> Result<String, AbiError> {
    if ptr % 2 != 0 {
        return Err(EncodingError::MisalignedPointer.into());
    }
    let byte_len = unit_len.checked_mul(2).ok_or(OutOfBoundsError::Range {
        offset: ptr as u64,
        len: unit_len as u64 * 2,
        size: memory.len() as u64,
    })?;
    let bytes = range(memory, ptr, byte_len)?;
    let units = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));

    let mut out = String::with_capacity(unit_len as usize);
    for decoded in char::decode_utf16(units) {
        match decoded {
            Ok(c) => out.push(c),
            Err(_) => return Err(EncodingError::UnpairedSurrogate.into()),
        }
    }
    Ok(out)
}

/// Lowers a string into linear memory verbatim, returning the (offset, byte length) pair.
///
/// The whole target range is checked before any byte is written.
pub fn lower_string_utf8(
    memory: &mut [u8],
    offset: u32,
    s: &str,
) -> Result<(u32, u32), AbiError> {
    let len = s.len() as u32;
    let size = memory.len() as u64;
    let target = (offset as usize)
        .checked_add(s.len())
        .and_then(|end| memory.get_mut(offset as usize..end))
        .ok_or(OutOfBoundsError::Range {
            offset: offset as u64,
            len: s.len() as u64,
            size,
        })?;
    target.copy_from_slice(s.as_bytes());
    Ok((offset, len))
}

/// Lowers a string into linear memory as UTF-16LE, returning the (offset, code unit count)
/// pair.
///
/// Scalars below 0x10000 take one code unit, the rest a surrogate pair. Each unit is
/// bounds-checked before it is written, so a failed lower leaves only the units already in
/// bounds.
pub fn lower_string_utf16(
    memory: &mut [u8],
    offset: u32,
    s: &str,
) -> Result<(u32, u32), AbiError> {
    if offset % 2 != 0 {
        return Err(EncodingError::MisalignedPointer.into());
    }
    let size = memory.len() as u64;
    let mut at = offset as usize;
    let mut units: u32 = 0;
    for unit in s.encode_utf16() {
        let target = memory
            .get_mut(at..at + 2)
            .ok_or(OutOfBoundsError::Range {
                offset: at as u64,
                len: 2,
                size,
            })?;
        target.copy_from_slice(&unit.to_le_bytes());
        at += 2;
        units += 1;
    }
    Ok((offset, units))
}

fn range(memory: &[u8], ptr: u32, len: u32) -> Result<&[u8], OutOfBoundsError> {
    let out_of_bounds = OutOfBoundsError::Range {
        offset: ptr as u64,
        len: len as u64,
        size: memory.len() as u64,
    };
    (ptr as usize)
        .checked_add(len as usize)
        .and_then(|end| memory.get(ptr as usize..end))
        .ok_or(out_of_bounds)
}
