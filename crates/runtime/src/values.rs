//! Operand Stack Values
//!
//! Every value that can live on the operand stack, in a local, a global, or a table slot is a
//! single 64-bit word. References are distinguished by tag bits so that the collector can find
//! them without type maps:
//!
//! - the zero word is the null reference,
//! - i31 references have bit 63 set and their payload in the low 31 bits,
//! - GC heap references have bit 63 clear, bit 32 set, and `address + 1` in the low 32 bits,
//! - everything else (funcref, externref, raw scalars) is untagged and interpreted by its static
//!   type.
//!
//! A word is never both i31 and GC tagged, and zero always denotes null.

use crate::error::Trap;

/// Tag bit of i31 references.
const I31_TAG: u64 = 1 << 63;
/// Tag bit of GC heap references.
const GC_TAG: u64 = 1 << 32;
/// Mask of the 31-bit i31 payload.
const I31_MASK: u64 = 0x7FFF_FFFF;
/// Mask of the low 32 bits holding `address + 1`.
const ADDR_MASK: u64 = 0xFFFF_FFFF;

/// A 64-bit operand stack word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct StackValue(u64);

impl StackValue {
    /// The null reference (also the default value of every storage slot).
    pub const NULL: StackValue = StackValue(0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn from_i32(val: i32) -> Self {
        Self(val as u32 as u64)
    }

    pub fn from_i64(val: i64) -> Self {
        Self(val as u64)
    }

    pub fn from_f32(val: f32) -> Self {
        Self(val.to_bits() as u64)
    }

    pub fn from_f64(val: f64) -> Self {
        Self(val.to_bits())
    }

    pub fn as_i32(self) -> i32 {
        self.0 as u32 as i32
    }

    pub fn as_i64(self) -> i64 {
        self.0 as i64
    }

    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }

    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn is_i31(self) -> bool {
        self.0 & I31_TAG != 0
    }

    pub fn is_gc_ref(self) -> bool {
        self.0 & I31_TAG == 0 && self.0 & GC_TAG != 0
    }

    /// Encodes an i32 as an i31 reference, truncating the payload to 31 bits.
    pub fn encode_i31(val: i32) -> Self {
        Self(I31_TAG | (val as u32 as u64 & I31_MASK))
    }

    /// Decodes an i31 reference, sign-extending the 31-bit payload.
    pub fn decode_i31_signed(self) -> Result<i32, Trap> {
        let payload = self.i31_payload()?;
        // Shift up then arithmetic-shift down to sign-extend bit 30.
        Ok(((payload as i32) << 1) >> 1)
    }

    /// Decodes an i31 reference, zero-extending the 31-bit payload.
    pub fn decode_i31_unsigned(self) -> Result<u32, Trap> {
        self.i31_payload()
    }

    fn i31_payload(self) -> Result<u32, Trap> {
        if self.is_null() {
            return Err(Trap::NullReference);
        }
        if !self.is_i31() {
            return Err(Trap::CastFailure);
        }
        Ok((self.0 & I31_MASK) as u32)
    }

    /// Encodes a GC heap address.
    ///
    /// The stored payload is `addr + 1` so that the zero word stays reserved for null; address
    /// `u32::MAX` is therefore not representable.
    pub fn encode_gc_ref(addr: u32) -> Self {
        debug_assert!(addr != u32::MAX);
        Self(GC_TAG | (addr as u64 + 1))
    }

    /// Decodes a GC reference into a heap address.
    pub fn decode_gc_ref(self) -> Result<u32, Trap> {
        if self.is_null() {
            return Err(Trap::NullReference);
        }
        if !self.is_gc_ref() {
            return Err(Trap::CastFailure);
        }
        // A word can carry the GC tag with a zero payload only if it was forged from raw bits.
        match self.0 & ADDR_MASK {
            0 => Err(Trap::HeapOutOfBounds),
            payload => Ok(payload as u32 - 1),
        }
    }
}

/// A 128-bit root word.
///
/// An interpreter carrying v128 values uses a wider operand stack; for root scanning the low 64
/// bits are reinterpreted as a [`StackValue`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct WideValue(pub u128);

impl WideValue {
    pub fn narrow(self) -> StackValue {
        StackValue(self.0 as u64)
    }
}

impl From<StackValue> for WideValue {
    fn from(value: StackValue) -> Self {
        Self(value.0 as u128)
    }
}
