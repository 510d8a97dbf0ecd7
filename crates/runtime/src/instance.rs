//! Module Instances
//!
//! An instance binds a decoded module to a store: imports are resolved against the store's
//! export bindings, the module's own entities are registered, segments are applied, the start
//! function runs, and the exports are published so that later instantiations can import them.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use collections::{FrozenMap, HashMap};
use log::debug;

use crate::error::{LinkError, RuntimeError, ValidationError};
use crate::exec::Vm;
use crate::module::{
    FuncIndex, FuncInfo, GlobIndex, GlobInfo, ItemRef, MemIndex, MemInfo, Module, TableIndex,
    TableInfo,
};
use crate::store::{
    DataInstance, ElemInstance, ExternHandle, ExternTag, FuncId, Function, Global, GlobalId,
    InstanceId, MemId, Memory, Store, Table, TableId, WasmFunc,
};
use crate::values::StackValue;

/// A module bound to a store.
pub struct Instance {
    /// The name under which the instance's exports are published.
    name: String,

    /// The module this instance was created from.
    module: Arc<Module>,

    /// The functions of the instance.
    funcs: FrozenMap<FuncIndex, FuncId>,

    /// The tables of the instance.
    tables: FrozenMap<TableIndex, TableId>,

    /// The memories of the instance.
    memories: FrozenMap<MemIndex, MemId>,

    /// The global variables of the instance.
    globs: FrozenMap<GlobIndex, GlobalId>,

    /// A map of all exported items.
    items: HashMap<String, ExternHandle>,
}

impl Instance {
    /// Instantiates a module in the store under the given name.
    pub fn instantiate(
        store: &mut Store,
        module: Module,
        name: &str,
    ) -> Result<InstanceId, RuntimeError> {
        let module = Arc::new(module);
        let instance_id = store.next_instance_id();

        // Resolve or create functions.
        let funcs = module.funcs().try_map(|info| match info {
            FuncInfo::Owned { ty, locals, code } => {
                let ty = module.func_type(*ty)?.clone();
                Ok(store.add_function(Function::Wasm {
                    func: Arc::new(WasmFunc {
                        ty,
                        locals: *locals,
                        code: code.clone(),
                        instance: instance_id,
                    }),
                    jump_table: None,
                }))
            }
            FuncInfo::Imported {
                module: from,
                name: item,
                ty,
            } => {
                let handle = store.lookup_import(from, item, ExternTag::Func)?;
                let func_id = match handle.as_func() {
                    Some(id) => id,
                    None => {
                        return Err(LinkError::UnknownImport {
                            module: from.clone(),
                            name: item.clone(),
                        }
                        .into())
                    }
                };
                // Imported functions must match the declared signature exactly.
                if store.func(func_id).ty() != module.func_type(*ty)? {
                    return Err(LinkError::SignatureMismatch {
                        module: from.clone(),
                        name: item.clone(),
                    }
                    .into());
                }
                Ok::<FuncId, RuntimeError>(func_id)
            }
        })?;

        // Resolve or allocate tables.
        let tables = module.tables().try_map(|info| match info {
            TableInfo::Owned { ty } => Ok(store.add_table(Table::new(*ty))),
            TableInfo::Imported {
                module: from,
                name: item,
                ty,
            } => {
                let handle = store.lookup_import(from, item, ExternTag::Table)?;
                let table_id = match handle.as_table() {
                    Some(id) => id,
                    None => {
                        return Err(LinkError::UnknownImport {
                            module: from.clone(),
                            name: item.clone(),
                        }
                        .into())
                    }
                };
                if store.table(table_id).size() < ty.min {
                    return Err(incompatible(from, item).into());
                }
                Ok::<TableId, RuntimeError>(table_id)
            }
        })?;

        // Resolve or allocate memories.
        let memories = module.memories().try_map(|info| match info {
            MemInfo::Owned { ty } => Ok(store.add_memory(Memory::new(*ty))),
            MemInfo::Imported {
                module: from,
                name: item,
                ty,
            } => {
                let handle = store.lookup_import(from, item, ExternTag::Memory)?;
                let mem_id = match handle.as_memory() {
                    Some(id) => id,
                    None => {
                        return Err(LinkError::UnknownImport {
                            module: from.clone(),
                            name: item.clone(),
                        }
                        .into())
                    }
                };
                if store.memory(mem_id).size_pages() < ty.min_pages {
                    return Err(incompatible(from, item).into());
                }
                Ok::<MemId, RuntimeError>(mem_id)
            }
        })?;

        // Resolve or create globals.
        let globs = module.globs().try_map(|info| match info {
            GlobInfo::Owned { ty, init } => Ok(store.add_global(Global::new(*ty, init.value()))),
            GlobInfo::Imported {
                module: from,
                name: item,
                ty,
            } => {
                let handle = store.lookup_import(from, item, ExternTag::Global)?;
                let global_id = match handle.as_global() {
                    Some(id) => id,
                    None => {
                        return Err(LinkError::UnknownImport {
                            module: from.clone(),
                            name: item.clone(),
                        }
                        .into())
                    }
                };
                if store.global(global_id).ty() != *ty {
                    return Err(incompatible(from, item).into());
                }
                Ok::<GlobalId, RuntimeError>(global_id)
            }
        })?;

        // Resolve the export map.
        let items = module
            .public_items()
            .iter()
            .map(|(item_name, item)| {
                let handle = match item {
                    ItemRef::Func(idx) => ExternHandle::Func(funcs[*idx]),
                    ItemRef::Table(idx) => ExternHandle::Table(tables[*idx]),
                    ItemRef::Memory(idx) => ExternHandle::Memory(memories[*idx]),
                    ItemRef::Global(idx) => ExternHandle::Global(globs[*idx]),
                };
                (item_name.clone(), handle)
            })
            .collect::<HashMap<String, ExternHandle>>();
        let exports: Vec<(String, ExternHandle)> = items
            .iter()
            .map(|(item_name, handle)| (item_name.clone(), *handle))
            .collect();

        let instance = Self {
            name: name.into(),
            module: module.clone(),
            funcs,
            tables,
            memories,
            globs,
            items,
        };
        let id = store.add_instance(instance);
        debug_assert_eq!(id, instance_id);

        // Apply data segments. The applied segments stay registered, marked as dropped.
        for segment in module.data_segments() {
            let base = match segment.base {
                Some(glob) => {
                    let global_id = store.instance(id).globs[glob];
                    store.global(global_id).value().as_i32() as u32
                }
                None => 0,
            };
            let mem_id = store.instance(id).memories[segment.memory];
            store
                .memory_mut(mem_id)
                .write(base.wrapping_add(segment.offset), &segment.data)?;
            store.add_data(DataInstance {
                bytes: segment.data.clone(),
                dropped: true,
            });
        }

        // Apply element segments, writing function references into the tables.
        for element in module.table_segments() {
            let table_id = store.instance(id).tables[element.table];
            let mut resolved = Vec::with_capacity(element.funcs.len());
            for (i, func_idx) in element.funcs.iter().enumerate() {
                let func_id = store.instance(id).funcs[*func_idx];
                // Function references are untagged words holding the store handle.
                let word = StackValue::from_bits(func_id.as_u32() as u64);
                store
                    .table_mut(table_id)
                    .set(element.offset + i as u32, Some(word))?;
                resolved.push(func_id);
            }
            store.add_elem(ElemInstance {
                funcs: resolved,
                dropped: true,
            });
        }

        // Run the start function.
        if let Some(start) = module.start() {
            let func = store.instance(id).funcs[start];
            Vm::invoke(store, func, &[])?;
        }

        // Publish the exports.
        for (export_name, handle) in exports {
            store.register_export(name, &export_name, handle);
        }

        debug!("instantiated module as '{}'", name);
        Ok(id)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// Returns the exported item registered under `name`.
    pub fn get_export(&self, name: &str) -> Option<ExternHandle> {
        self.items.get(name).copied()
    }

    /// Returns the exported function registered under `name`.
    pub fn get_func(&self, name: &str) -> Option<FuncId> {
        self.get_export(name)?.as_func()
    }

    /// Resolves a module-local function index to its store handle.
    pub fn func_id(&self, idx: FuncIndex) -> Result<FuncId, ValidationError> {
        self.funcs
            .get(idx)
            .copied()
            .ok_or(ValidationError::BadFuncIndex(idx.as_u32()))
    }

    /// Resolves a module-local table index to its store handle.
    pub fn table_id(&self, idx: TableIndex) -> Result<TableId, ValidationError> {
        self.tables
            .get(idx)
            .copied()
            .ok_or(ValidationError::BadTableIndex(idx.as_u32()))
    }

    /// Resolves a module-local memory index to its store handle.
    pub fn mem_id(&self, idx: MemIndex) -> Result<MemId, ValidationError> {
        self.memories
            .get(idx)
            .copied()
            .ok_or(ValidationError::BadMemIndex(idx.as_u32()))
    }

    /// Resolves a module-local global index to its store handle.
    pub fn global_id(&self, idx: GlobIndex) -> Result<GlobalId, ValidationError> {
        self.globs
            .get(idx)
            .copied()
            .ok_or(ValidationError::BadGlobalIndex(idx.as_u32()))
    }
}

fn incompatible(module: &str, name: &str) -> LinkError {
    LinkError::IncompatibleImport {
        module: module.into(),
        name: name.into(),
    }
}
