//! Runtime Store
//!
//! The store is the per-runtime registry of functions, memories, tables, globals and segments.
//! Adding an entity hands back a stable integer handle; instances bind their module-local
//! indices to those handles. Everything in a store is shared by its instances and mutated only
//! by the single thread driving it.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use collections::{entity_impl, PrimaryMap};
use log::trace;

use crate::error::{LinkError, OutOfBoundsError, Trap, ValidationError};
use crate::exec::{JumpTable, Vm};
use crate::heap::{GcHeap, HeapConfig};
use crate::instance::Instance;
use crate::module::{GlobalType, MemoryType, TableType};
use crate::types::FuncType;
use crate::values::StackValue;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct FuncId(u32);
entity_impl!(FuncId);

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct TableId(u32);
entity_impl!(TableId);

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct MemId(u32);
entity_impl!(MemId);

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct GlobalId(u32);
entity_impl!(GlobalId);

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct ElemId(u32);
entity_impl!(ElemId);

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct DataId(u32);
entity_impl!(DataId);

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct InstanceId(u32);
entity_impl!(InstanceId);

// ——————————————————————————————— Functions ———————————————————————————————— //

/// A host function callback.
///
/// The callback receives the running VM and the context word registered along the function; it
/// reads its arguments and writes its results through the VM's operand stack, and may call back
/// into the interpreter on the same call stack.
pub type HostFunc = fn(&mut Vm, u64) -> Result<(), Trap>;

/// The immutable part of a wasm function, shared between the store and running frames.
pub struct WasmFunc {
    pub ty: FuncType,
    /// Number of local slots beyond the parameters.
    pub locals: u32,
    /// Raw code body.
    pub code: Vec<u8>,
    /// The instance owning this function, used to resolve call targets.
    pub instance: InstanceId,
}

/// A function registered in the store.
pub enum Function {
    Wasm {
        func: Arc<WasmFunc>,
        /// Branch targets of the body, built on the first call.
        jump_table: Option<Arc<JumpTable>>,
    },
    Host {
        ty: FuncType,
        callback: HostFunc,
        context: u64,
    },
}

impl Function {
    pub fn ty(&self) -> &FuncType {
        match self {
            Function::Wasm { func, .. } => &func.ty,
            Function::Host { ty, .. } => ty,
        }
    }
}

// ———————————————————————————————— Memories ———————————————————————————————— //

/// Size of a linear memory page, in bytes.
pub const PAGE_SIZE: usize = 64 * 1024;

/// A linear memory.
pub struct Memory {
    data: Vec<u8>,
    max_pages: Option<u32>,
}

impl Memory {
    pub fn new(ty: MemoryType) -> Self {
        Self {
            data: vec![0; ty.min_pages as usize * PAGE_SIZE],
            max_pages: ty.max_pages,
        }
    }

    pub fn size_pages(&self) -> u32 {
        (self.data.len() / PAGE_SIZE) as u32
    }

    /// Grows the memory by `delta` pages, returning the previous size in pages.
    pub fn grow(&mut self, delta: u32) -> Result<u32, OutOfBoundsError> {
        let previous = self.size_pages();
        let requested = previous as u64 + delta as u64;
        let max = self.max_pages.map(|max| max as u64).unwrap_or(65536);
        if requested > max {
            return Err(OutOfBoundsError::Grow { requested, max });
        }
        self.data.resize(requested as usize * PAGE_SIZE, 0);
        Ok(previous)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Reads `len` bytes at `offset`.
    pub fn read(&self, offset: u32, len: u32) -> Result<&[u8], Trap> {
        (offset as usize)
            .checked_add(len as usize)
            .and_then(|end| self.data.get(offset as usize..end))
            .ok_or(Trap::MemoryOutOfBounds)
    }

    /// Writes `bytes` at `offset`.
    pub fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Trap> {
        let target = (offset as usize)
            .checked_add(bytes.len())
            .and_then(|end| self.data.get_mut(offset as usize..end))
            .ok_or(Trap::MemoryOutOfBounds)?;
        target.copy_from_slice(bytes);
        Ok(())
    }
}

// ————————————————————————————————— Tables ————————————————————————————————— //

/// A table of optional references. `None` marks a slot that was never initialized.
pub struct Table {
    elems: Vec<Option<StackValue>>,
    max: Option<u32>,
}

impl Table {
    pub fn new(ty: TableType) -> Self {
        Self {
            elems: vec![None; ty.min as usize],
            max: ty.max,
        }
    }

    /// Returns the element at `index`; `None` means the slot is undefined.
    pub fn get(&self, index: u32) -> Result<Option<StackValue>, Trap> {
        self.elems
            .get(index as usize)
            .copied()
            .ok_or(Trap::TableOutOfBounds)
    }

    /// Returns the element at `index`, trapping on undefined slots.
    pub fn lookup(&self, index: u32) -> Result<StackValue, Trap> {
        self.get(index)?.ok_or(Trap::UndefinedElement)
    }

    pub fn set(&mut self, index: u32, value: Option<StackValue>) -> Result<(), Trap> {
        match self.elems.get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Trap::TableOutOfBounds),
        }
    }

    pub fn size(&self) -> u32 {
        self.elems.len() as u32
    }

    /// Grows the table by `n` slots initialized to `init`, returning the previous size.
    pub fn grow(&mut self, n: u32, init: Option<StackValue>) -> Result<u32, OutOfBoundsError> {
        let previous = self.size();
        let requested = previous as u64 + n as u64;
        if let Some(max) = self.max {
            if requested > max as u64 {
                return Err(OutOfBoundsError::Grow {
                    requested,
                    max: max as u64,
                });
            }
        }
        self.elems.resize(requested as usize, init);
        Ok(previous)
    }

    /// All slots, for root scanning.
    pub fn entries(&self) -> &[Option<StackValue>] {
        &self.elems
    }
}

// ———————————————————————————— Globals & Segments —————————————————————————— //

/// A global variable.
pub struct Global {
    value: StackValue,
    ty: GlobalType,
}

impl Global {
    pub fn new(ty: GlobalType, value: StackValue) -> Self {
        Self { value, ty }
    }

    pub fn value(&self) -> StackValue {
        self.value
    }

    pub fn ty(&self) -> GlobalType {
        self.ty
    }

    pub fn set(&mut self, value: StackValue) -> Result<(), ValidationError> {
        if !self.ty.mutable {
            return Err(ValidationError::ImmutableGlobal);
        }
        self.value = value;
        Ok(())
    }
}

/// An element segment instantiated in the store.
pub struct ElemInstance {
    pub funcs: Vec<FuncId>,
    pub dropped: bool,
}

/// A data segment instantiated in the store.
pub struct DataInstance {
    pub bytes: Vec<u8>,
    pub dropped: bool,
}

// ———————————————————————————— Export Bindings ————————————————————————————— //

/// Tag discriminating the kinds of exportable items.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternTag {
    Func,
    Table,
    Memory,
    Global,
}

/// A handle to an item registered in the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternHandle {
    Func(FuncId),
    Table(TableId),
    Memory(MemId),
    Global(GlobalId),
}

impl ExternHandle {
    pub fn tag(self) -> ExternTag {
        match self {
            ExternHandle::Func(_) => ExternTag::Func,
            ExternHandle::Table(_) => ExternTag::Table,
            ExternHandle::Memory(_) => ExternTag::Memory,
            ExternHandle::Global(_) => ExternTag::Global,
        }
    }

    pub fn as_func(self) -> Option<FuncId> {
        match self {
            ExternHandle::Func(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_table(self) -> Option<TableId> {
        match self {
            ExternHandle::Table(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_memory(self) -> Option<MemId> {
        match self {
            ExternHandle::Memory(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_global(self) -> Option<GlobalId> {
        match self {
            ExternHandle::Global(id) => Some(id),
            _ => None,
        }
    }
}

/// An export binding: `(module, name)` mapped to a store handle.
pub struct ExportBinding {
    pub module: String,
    pub name: String,
    pub handle: ExternHandle,
}

// ————————————————————————————————— Store —————————————————————————————————— //

/// The per-runtime registry of entities.
pub struct Store {
    funcs: PrimaryMap<FuncId, Function>,
    tables: PrimaryMap<TableId, Table>,
    memories: PrimaryMap<MemId, Memory>,
    globals: PrimaryMap<GlobalId, Global>,
    elems: PrimaryMap<ElemId, ElemInstance>,
    datas: PrimaryMap<DataId, DataInstance>,
    instances: PrimaryMap<InstanceId, Instance>,
    bindings: Vec<ExportBinding>,
    heap: GcHeap,
}

impl Store {
    pub fn new() -> Self {
        Self::with_heap_config(HeapConfig::default())
    }

    pub fn with_heap_config(config: HeapConfig) -> Self {
        Self {
            funcs: PrimaryMap::new(),
            tables: PrimaryMap::new(),
            memories: PrimaryMap::new(),
            globals: PrimaryMap::new(),
            elems: PrimaryMap::new(),
            datas: PrimaryMap::new(),
            instances: PrimaryMap::new(),
            bindings: Vec::new(),
            heap: GcHeap::with_config(config),
        }
    }

    // Registration. Every method returns the stable handle of the new entity.

    pub fn add_function(&mut self, function: Function) -> FuncId {
        self.funcs.push(function)
    }

    pub fn add_table(&mut self, table: Table) -> TableId {
        self.tables.push(table)
    }

    pub fn add_memory(&mut self, memory: Memory) -> MemId {
        self.memories.push(memory)
    }

    pub fn add_global(&mut self, global: Global) -> GlobalId {
        self.globals.push(global)
    }

    pub fn add_elem(&mut self, elem: ElemInstance) -> ElemId {
        self.elems.push(elem)
    }

    pub fn add_data(&mut self, data: DataInstance) -> DataId {
        self.datas.push(data)
    }

    pub(crate) fn add_instance(&mut self, instance: Instance) -> InstanceId {
        self.instances.push(instance)
    }

    /// The handle the next instance will get.
    pub(crate) fn next_instance_id(&self) -> InstanceId {
        self.instances.next_key()
    }

    // Lookups. Handles are stable and never invalidated, so plain indexing is used: an invalid
    // handle is a bug in the embedder, not a runtime condition.

    pub fn func(&self, id: FuncId) -> &Function {
        &self.funcs[id]
    }

    pub fn table(&self, id: TableId) -> &Table {
        &self.tables[id]
    }

    pub fn table_mut(&mut self, id: TableId) -> &mut Table {
        &mut self.tables[id]
    }

    pub fn memory(&self, id: MemId) -> &Memory {
        &self.memories[id]
    }

    pub fn memory_mut(&mut self, id: MemId) -> &mut Memory {
        &mut self.memories[id]
    }

    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id]
    }

    pub fn global_mut(&mut self, id: GlobalId) -> &mut Global {
        &mut self.globals[id]
    }

    pub fn elem(&self, id: ElemId) -> &ElemInstance {
        &self.elems[id]
    }

    pub fn elem_mut(&mut self, id: ElemId) -> &mut ElemInstance {
        &mut self.elems[id]
    }

    pub fn data(&self, id: DataId) -> &DataInstance {
        &self.datas[id]
    }

    pub fn data_mut(&mut self, id: DataId) -> &mut DataInstance {
        &mut self.datas[id]
    }

    pub fn instance(&self, id: InstanceId) -> &Instance {
        &self.instances[id]
    }

    pub fn heap(&self) -> &GcHeap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut GcHeap {
        &mut self.heap
    }

    /// Caches the jump table of a wasm function after its first call.
    pub(crate) fn cache_jump_table(&mut self, id: FuncId, table: Arc<JumpTable>) {
        if let Function::Wasm { jump_table, .. } = &mut self.funcs[id] {
            *jump_table = Some(table);
        }
    }

    // Import/export bindings.

    /// Registers an export binding under `(module, name)`.
    pub fn register_export(&mut self, module: &str, name: &str, handle: ExternHandle) {
        trace!("store: export {}.{}", module, name);
        self.bindings.push(ExportBinding {
            module: module.into(),
            name: name.into(),
            handle,
        });
    }

    /// Finds the binding registered for `(module, name)` with the given tag.
    pub fn lookup_import(
        &self,
        module: &str,
        name: &str,
        tag: ExternTag,
    ) -> Result<ExternHandle, LinkError> {
        self.bindings
            .iter()
            .find(|binding| {
                binding.module == module && binding.name == name && binding.handle.tag() == tag
            })
            .map(|binding| binding.handle)
            .ok_or_else(|| LinkError::UnknownImport {
                module: module.into(),
                name: name.into(),
            })
    }

    /// Registers a host function and exports it under `(module, name)`.
    pub fn expose_host_function(
        &mut self,
        module: &str,
        name: &str,
        ty: FuncType,
        callback: HostFunc,
        context: u64,
    ) -> FuncId {
        let id = self.add_function(Function::Host {
            ty,
            callback,
            context,
        });
        self.register_export(module, name, ExternHandle::Func(id));
        id
    }

    /// Runs a collection cycle.
    ///
    /// `extra_roots` holds the interpreter state (operand stack and frame locals); globals and
    /// table entries are appended here, so that every escape hatch for references is covered.
    pub fn collect_garbage(&mut self, extra_roots: &[StackValue]) {
        let mut roots = Vec::with_capacity(extra_roots.len());
        roots.extend_from_slice(extra_roots);
        for global in self.globals.values() {
            roots.push(global.value());
        }
        for table in self.tables.values() {
            for entry in table.entries() {
                if let Some(value) = entry {
                    roots.push(*value);
                }
            }
        }
        self.heap.collect(&roots);
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueType;

    #[test]
    fn table_bounds() {
        let mut table = Table::new(TableType {
            ty: ValueType::AnyRef,
            min: 2,
            max: Some(3),
        });
        assert_eq!(table.size(), 2);
        assert_eq!(table.get(0), Ok(None));
        assert_eq!(table.lookup(0), Err(Trap::UndefinedElement));
        assert_eq!(table.get(2), Err(Trap::TableOutOfBounds));

        table.set(1, Some(StackValue::encode_i31(5))).unwrap();
        assert_eq!(table.lookup(1), Ok(StackValue::encode_i31(5)));

        assert_eq!(table.grow(1, None), Ok(2));
        assert_eq!(table.size(), 3);
        // Growing past the declared maximum fails and leaves the table untouched.
        assert_eq!(
            table.grow(1, None),
            Err(OutOfBoundsError::Grow { requested: 4, max: 3 })
        );
        assert_eq!(table.size(), 3);
    }

    #[test]
    fn memory_grow_and_access() {
        let mut memory = Memory::new(MemoryType {
            min_pages: 1,
            max_pages: Some(2),
        });
        assert_eq!(memory.size_pages(), 1);
        memory.write(0, &[1, 2, 3]).unwrap();
        assert_eq!(memory.read(0, 3), Ok(&[1u8, 2, 3][..]));
        assert_eq!(
            memory.write(PAGE_SIZE as u32 - 1, &[0, 0]),
            Err(Trap::MemoryOutOfBounds)
        );

        assert_eq!(memory.grow(1), Ok(1));
        assert_eq!(memory.size_pages(), 2);
        assert_eq!(
            memory.grow(1),
            Err(OutOfBoundsError::Grow { requested: 3, max: 2 })
        );
    }

    #[test]
    fn immutable_global() {
        let mut global = Global::new(
            GlobalType {
                ty: ValueType::I32,
                mutable: false,
            },
            StackValue::from_i32(7),
        );
        assert_eq!(global.set(StackValue::from_i32(8)), Err(ValidationError::ImmutableGlobal));
        assert_eq!(global.value().as_i32(), 7);
    }

    #[test]
    fn import_lookup() {
        let mut store = Store::new();
        let table = store.add_table(Table::new(TableType {
            ty: ValueType::FuncRef,
            min: 1,
            max: None,
        }));
        store.register_export("env", "table", ExternHandle::Table(table));

        assert_eq!(
            store.lookup_import("env", "table", ExternTag::Table),
            Ok(ExternHandle::Table(table))
        );
        // The tag is part of the key.
        assert!(store.lookup_import("env", "table", ExternTag::Func).is_err());
        assert!(store.lookup_import("env", "nope", ExternTag::Table).is_err());
    }
}
