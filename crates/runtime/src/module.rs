//! Wasm Module Model
//!
//! The runtime does not decode binaries itself: an external decoder validates the section
//! structure and hands over a [`Module`], which holds the declarations in entity maps. Function
//! bodies stay raw bytes, the interpreter reads them directly.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use collections::{entity_impl, FrozenMap, HashMap, PrimaryMap};

use crate::error::ValidationError;
use crate::types::{CompositeType, FuncType, TypeDef, TypeIndex, ValueType};
use crate::values::StackValue;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct FuncIndex(u32);
entity_impl!(FuncIndex);

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct TableIndex(u32);
entity_impl!(TableIndex);

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct MemIndex(u32);
entity_impl!(MemIndex);

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct GlobIndex(u32);
entity_impl!(GlobIndex);

/// A reference to a module item, used for exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemRef {
    Func(FuncIndex),
    Table(TableIndex),
    Memory(MemIndex),
    Global(GlobIndex),
}

impl ItemRef {
    pub fn as_func(self) -> Option<FuncIndex> {
        match self {
            ItemRef::Func(idx) => Some(idx),
            _ => None,
        }
    }
}

// ————————————————————————————— Declarations ——————————————————————————————— //

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableType {
    pub ty: ValueType,
    pub min: u32,
    pub max: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryType {
    pub min_pages: u32,
    pub max_pages: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalType {
    pub ty: ValueType,
    pub mutable: bool,
}

/// Possible initial values for a global variable.
#[derive(Clone, Copy, Debug)]
pub enum GlobInit {
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
    RefNull,
}

impl GlobInit {
    pub fn value(self) -> StackValue {
        match self {
            GlobInit::I32(x) => StackValue::from_i32(x),
            GlobInit::I64(x) => StackValue::from_i64(x),
            GlobInit::F32(x) => StackValue::from_bits(x as u64),
            GlobInit::F64(x) => StackValue::from_bits(x),
            GlobInit::RefNull => StackValue::NULL,
        }
    }
}

/// A function of a module: defined by the module itself, or imported.
pub enum FuncInfo {
    Owned {
        ty: TypeIndex,
        /// Number of local slots beyond the parameters.
        locals: u32,
        code: Vec<u8>,
    },
    Imported {
        module: String,
        name: String,
        ty: TypeIndex,
    },
}

impl FuncInfo {
    pub fn ty(&self) -> TypeIndex {
        match self {
            FuncInfo::Owned { ty, .. } => *ty,
            FuncInfo::Imported { ty, .. } => *ty,
        }
    }

    pub fn is_imported(&self) -> bool {
        matches!(self, FuncInfo::Imported { .. })
    }
}

pub enum TableInfo {
    Owned { ty: TableType },
    Imported { module: String, name: String, ty: TableType },
}

pub enum MemInfo {
    Owned { ty: MemoryType },
    Imported { module: String, name: String, ty: MemoryType },
}

pub enum GlobInfo {
    Owned { ty: GlobalType, init: GlobInit },
    Imported { module: String, name: String, ty: GlobalType },
}

/// A data segment used to initialize a memory.
#[derive(Clone)]
pub struct DataSegment {
    /// The memory to which the segment must be applied.
    pub memory: MemIndex,
    /// An optional base, in the form of a global.
    pub base: Option<GlobIndex>,
    /// Offset, relative to the base if any, to 0 otherwise.
    pub offset: u32,
    /// The actual data.
    pub data: Vec<u8>,
}

/// An element segment used to initialize a table with function references.
#[derive(Clone)]
pub struct TableSegment {
    /// The table to which the segment must be applied.
    pub table: TableIndex,
    /// Offset of the first element.
    pub offset: u32,
    /// The functions referenced by the segment.
    pub funcs: Vec<FuncIndex>,
}

// ————————————————————————————————— Module ————————————————————————————————— //

/// A decoded WebAssembly module.
pub struct Module {
    exported_items: HashMap<String, ItemRef>,
    types: FrozenMap<TypeIndex, TypeDef>,
    funcs: FrozenMap<FuncIndex, FuncInfo>,
    tables: FrozenMap<TableIndex, TableInfo>,
    memories: FrozenMap<MemIndex, MemInfo>,
    globs: FrozenMap<GlobIndex, GlobInfo>,
    segments: Vec<DataSegment>,
    elements: Vec<TableSegment>,
    start: Option<FuncIndex>,
}

impl Module {
    pub fn start(&self) -> Option<FuncIndex> {
        self.start
    }

    pub fn types(&self) -> &FrozenMap<TypeIndex, TypeDef> {
        &self.types
    }

    pub fn funcs(&self) -> &FrozenMap<FuncIndex, FuncInfo> {
        &self.funcs
    }

    pub fn tables(&self) -> &FrozenMap<TableIndex, TableInfo> {
        &self.tables
    }

    pub fn memories(&self) -> &FrozenMap<MemIndex, MemInfo> {
        &self.memories
    }

    pub fn globs(&self) -> &FrozenMap<GlobIndex, GlobInfo> {
        &self.globs
    }

    pub fn data_segments(&self) -> &[DataSegment] {
        &self.segments
    }

    pub fn table_segments(&self) -> &[TableSegment] {
        &self.elements
    }

    pub fn public_items(&self) -> &HashMap<String, ItemRef> {
        &self.exported_items
    }

    /// Resolves a type index to a function type.
    pub fn func_type(&self, ty: TypeIndex) -> Result<&FuncType, ValidationError> {
        self.types
            .get(ty)
            .and_then(|def| def.func_type())
            .ok_or(ValidationError::BadTypeIndex(ty.as_u32()))
    }
}

/// A builder for modules, standing in for the external decoder.
pub struct ModuleBuilder {
    exported_items: HashMap<String, ItemRef>,
    types: PrimaryMap<TypeIndex, TypeDef>,
    funcs: PrimaryMap<FuncIndex, FuncInfo>,
    tables: PrimaryMap<TableIndex, TableInfo>,
    memories: PrimaryMap<MemIndex, MemInfo>,
    globs: PrimaryMap<GlobIndex, GlobInfo>,
    segments: Vec<DataSegment>,
    elements: Vec<TableSegment>,
    start: Option<FuncIndex>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self {
            exported_items: HashMap::new(),
            types: PrimaryMap::new(),
            funcs: PrimaryMap::new(),
            tables: PrimaryMap::new(),
            memories: PrimaryMap::new(),
            globs: PrimaryMap::new(),
            segments: Vec::new(),
            elements: Vec::new(),
            start: None,
        }
    }

    /// Adds a type definition and returns its index.
    pub fn add_type(&mut self, def: TypeDef) -> TypeIndex {
        self.types.push(def)
    }

    /// Adds a plain function type and returns its index.
    pub fn add_func_type(&mut self, params: Vec<ValueType>, results: Vec<ValueType>) -> TypeIndex {
        self.types
            .push(TypeDef::new(CompositeType::Func(FuncType::new(params, results))))
    }

    /// Adds a function defined by this module.
    pub fn add_func(&mut self, ty: TypeIndex, locals: u32, code: Vec<u8>) -> FuncIndex {
        self.funcs.push(FuncInfo::Owned { ty, locals, code })
    }

    /// Declares an imported function.
    pub fn import_func(&mut self, module: &str, name: &str, ty: TypeIndex) -> FuncIndex {
        self.funcs.push(FuncInfo::Imported {
            module: module.to_string(),
            name: name.to_string(),
            ty,
        })
    }

    pub fn add_table(&mut self, ty: TableType) -> TableIndex {
        self.tables.push(TableInfo::Owned { ty })
    }

    pub fn import_table(&mut self, module: &str, name: &str, ty: TableType) -> TableIndex {
        self.tables.push(TableInfo::Imported {
            module: module.to_string(),
            name: name.to_string(),
            ty,
        })
    }

    pub fn add_memory(&mut self, ty: MemoryType) -> MemIndex {
        self.memories.push(MemInfo::Owned { ty })
    }

    pub fn import_memory(&mut self, module: &str, name: &str, ty: MemoryType) -> MemIndex {
        self.memories.push(MemInfo::Imported {
            module: module.to_string(),
            name: name.to_string(),
            ty,
        })
    }

    pub fn add_glob(&mut self, ty: GlobalType, init: GlobInit) -> GlobIndex {
        self.globs.push(GlobInfo::Owned { ty, init })
    }

    pub fn import_glob(&mut self, module: &str, name: &str, ty: GlobalType) -> GlobIndex {
        self.globs.push(GlobInfo::Imported {
            module: module.to_string(),
            name: name.to_string(),
            ty,
        })
    }

    pub fn add_data_segment(&mut self, segment: DataSegment) {
        self.segments.push(segment);
    }

    pub fn add_table_segment(&mut self, element: TableSegment) {
        self.elements.push(element);
    }

    pub fn set_start(&mut self, func: FuncIndex) {
        self.start = Some(func);
    }

    /// Marks a function as exported under the given name.
    pub fn export_func(&mut self, name: &str, func: FuncIndex) {
        self.exported_items.insert(name.to_string(), ItemRef::Func(func));
    }

    /// Marks a table as exported under the given name.
    pub fn export_table(&mut self, name: &str, table: TableIndex) {
        self.exported_items.insert(name.to_string(), ItemRef::Table(table));
    }

    /// Marks a memory as exported under the given name.
    pub fn export_memory(&mut self, name: &str, memory: MemIndex) {
        self.exported_items.insert(name.to_string(), ItemRef::Memory(memory));
    }

    /// Marks a global as exported under the given name.
    pub fn export_glob(&mut self, name: &str, glob: GlobIndex) {
        self.exported_items.insert(name.to_string(), ItemRef::Global(glob));
    }

    pub fn build(self) -> Module {
        Module {
            exported_items: self.exported_items,
            types: FrozenMap::freeze(self.types),
            funcs: FrozenMap::freeze(self.funcs),
            tables: FrozenMap::freeze(self.tables),
            memories: FrozenMap::freeze(self.memories),
            globs: FrozenMap::freeze(self.globs),
            segments: self.segments,
            elements: self.elements,
            start: self.start,
        }
    }
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}
