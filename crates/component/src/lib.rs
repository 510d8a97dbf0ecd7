#![no_std]
//! ## Component Model support for the Reef runtime.
//!
//! Implements the canonical ABI: the bit-exact rules for moving values between core wasm and
//! component types. Scalars travel as flat core values, strings through linear memory in UTF-8
//! or UTF-16LE. The [`wit`] module tokenizes interface definitions so that embedders can feed
//! type information to the ABI layer.

extern crate alloc;

mod abi;
mod types;
mod values;
pub mod wit;

pub use abi::*;
pub use types::*;
pub use values::*;
