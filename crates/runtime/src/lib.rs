#![no_std]
//! ## Reef WebAssembly runtime core.
//!
//! The runtime executes decoded modules: it keeps the process wide [`Store`] of functions,
//! memories, tables and globals, instantiates modules against it, and runs their code, including
//! the GC instruction set (struct and array objects, i31 references, subtype casts) backed by a
//! mark and sweep heap.
//!
//! Module decoding is not part of this crate: an external decoder produces [`Module`] values,
//! the runtime only reads raw function bodies.

extern crate alloc;

mod error;
mod exec;
mod heap;
mod instance;
mod module;
mod reader;
mod store;
mod subtype;
mod types;
mod values;

#[cfg(test)]
mod tests;

pub use error::*;
pub use exec::*;
pub use heap::*;
pub use instance::*;
pub use module::*;
pub use reader::*;
pub use store::*;
pub use subtype::*;
pub use types::*;
pub use values::*;
