//! Bytecode Execution
//!
//! The interpreter runs raw function bodies straight from the module: a frame per call, one
//! operand stack shared by the whole call stack, and a lazily built jump table per function for
//! the structured control instructions. It covers the GC instruction set plus the small numeric
//! and control subset the runtime needs; the full arithmetic surface of WebAssembly lives in an
//! external interpreter that calls into the same store.
//!
//! Collections run at allocation points only: right before an allocation the heap is asked
//! whether a cycle is due, and the roots are gathered from the stack, the frame locals, the
//! globals, the tables, and the operands already popped for the pending allocation (which are
//! off the stack but must stay reachable until the new object anchors them).

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use collections::{EntityRef, HashMap};
use log::trace;

use crate::error::{RuntimeError, Trap, ValidationError};
use crate::module::{FuncIndex, GlobIndex, Module, TableIndex};
use crate::reader::Reader;
use crate::store::{FuncId, Function, HostFunc, InstanceId, Store, WasmFunc};
use crate::subtype::matches_heap_type;
use crate::types::{HeapType, StructType, TypeIndex};
use crate::values::StackValue;

// ———————————————————————————————— Opcodes ————————————————————————————————— //

pub(crate) mod op {
    pub const UNREACHABLE: u8 = 0x00;
    pub const NOP: u8 = 0x01;
    pub const BLOCK: u8 = 0x02;
    pub const LOOP: u8 = 0x03;
    pub const IF: u8 = 0x04;
    pub const ELSE: u8 = 0x05;
    pub const END: u8 = 0x0B;
    pub const BR: u8 = 0x0C;
    pub const BR_IF: u8 = 0x0D;
    pub const RETURN: u8 = 0x0F;
    pub const CALL: u8 = 0x10;
    pub const DROP: u8 = 0x1A;
    pub const SELECT: u8 = 0x1B;
    pub const LOCAL_GET: u8 = 0x20;
    pub const LOCAL_SET: u8 = 0x21;
    pub const LOCAL_TEE: u8 = 0x22;
    pub const GLOBAL_GET: u8 = 0x23;
    pub const GLOBAL_SET: u8 = 0x24;
    pub const TABLE_GET: u8 = 0x25;
    pub const TABLE_SET: u8 = 0x26;
    pub const I32_CONST: u8 = 0x41;
    pub const I64_CONST: u8 = 0x42;
    pub const F32_CONST: u8 = 0x43;
    pub const F64_CONST: u8 = 0x44;
    pub const I32_EQZ: u8 = 0x45;
    pub const I32_EQ: u8 = 0x46;
    pub const I32_NE: u8 = 0x47;
    pub const I32_LT_S: u8 = 0x48;
    pub const I32_GT_S: u8 = 0x4A;
    pub const I32_ADD: u8 = 0x6A;
    pub const I32_SUB: u8 = 0x6B;
    pub const I32_MUL: u8 = 0x6C;
    pub const I32_DIV_S: u8 = 0x6D;
    pub const I32_DIV_U: u8 = 0x6E;
    pub const I64_ADD: u8 = 0x7C;
    pub const I64_SUB: u8 = 0x7D;
    pub const I64_MUL: u8 = 0x7E;
    pub const REF_NULL: u8 = 0xD0;
    pub const REF_IS_NULL: u8 = 0xD1;
    pub const GC_PREFIX: u8 = 0xFB;

    // Sub-opcodes of the 0xFB prefix.
    pub const STRUCT_NEW: u32 = 0x00;
    pub const STRUCT_NEW_DEFAULT: u32 = 0x01;
    pub const STRUCT_GET: u32 = 0x02;
    pub const STRUCT_SET: u32 = 0x05;
    pub const ARRAY_NEW: u32 = 0x06;
    pub const ARRAY_NEW_FIXED: u32 = 0x08;
    pub const ARRAY_GET: u32 = 0x0B;
    pub const ARRAY_SET: u32 = 0x0E;
    pub const ARRAY_LEN: u32 = 0x0F;
    pub const REF_TEST: u32 = 0x14;
    pub const REF_CAST: u32 = 0x16;
    pub const REF_I31: u32 = 0x1C;
    pub const I31_GET_S: u32 = 0x1D;
    pub const I31_GET_U: u32 = 0x1E;
}

// ——————————————————————————————— Jump Table ——————————————————————————————— //

#[derive(Clone, Copy, Debug)]
struct BlockTarget {
    /// Offset just past the matching `end`.
    end: u32,
    /// Offset just past the `else`, when the block is an `if` with an else branch.
    else_branch: Option<u32>,
}

/// Branch targets for the structured instructions of one function body.
///
/// The table is built on the first call and cached on the store entry; the interpreter borrows
/// it for the duration of a call.
pub struct JumpTable {
    targets: HashMap<u32, BlockTarget>,
}

impl JumpTable {
    /// Scans a function body and records the targets of every `block`, `loop` and `if`.
    pub fn build(code: &[u8]) -> Result<Self, ValidationError> {
        struct Open {
            offset: u32,
            else_branch: Option<u32>,
        }

        let mut reader = Reader::new(code);
        let mut targets = HashMap::new();
        let mut open: Vec<Open> = Vec::new();
        while !reader.is_at_end() {
            let at = reader.pos() as u32;
            let opcode = reader.read_u8()?;
            match opcode {
                op::BLOCK | op::LOOP | op::IF => {
                    read_block_arity(&mut reader)?;
                    open.push(Open {
                        offset: at,
                        else_branch: None,
                    });
                }
                op::ELSE => {
                    let top = open.last_mut().ok_or(ValidationError::MalformedControl)?;
                    top.else_branch = Some(reader.pos() as u32);
                }
                op::END => {
                    // The last `end` closes the function body itself.
                    if let Some(block) = open.pop() {
                        targets.insert(
                            block.offset,
                            BlockTarget {
                                end: reader.pos() as u32,
                                else_branch: block.else_branch,
                            },
                        );
                    }
                }
                _ => skip_immediates(&mut reader, opcode)?,
            }
        }
        if !open.is_empty() {
            return Err(ValidationError::MalformedControl);
        }
        Ok(Self { targets })
    }

    fn target(&self, offset: u32) -> Result<BlockTarget, ValidationError> {
        self.targets
            .get(&offset)
            .copied()
            .ok_or(ValidationError::MalformedControl)
    }
}

/// Reads a block type immediate and returns the result arity of the block.
///
/// Only the empty and single value type forms are handled here; type-index signatures and typed
/// reference block types come out of the validation layer, which is external.
fn read_block_arity(reader: &mut Reader) -> Result<usize, ValidationError> {
    let code = reader.read_i64()?;
    match code {
        -64 => Ok(0), // 0x40, the empty block type
        -28 | -29 => Err(ValidationError::UnsupportedBlockType(code)),
        code if code < 0 => Ok(1),
        code => Err(ValidationError::UnsupportedBlockType(code)),
    }
}

/// Advances the reader past the immediates of `opcode`.
///
/// Unknown opcodes are rejected here: a single byte misread would desynchronize the whole scan.
fn skip_immediates(reader: &mut Reader, opcode: u8) -> Result<(), ValidationError> {
    match opcode {
        op::BR | op::BR_IF | op::CALL | op::LOCAL_GET | op::LOCAL_SET | op::LOCAL_TEE
        | op::GLOBAL_GET | op::GLOBAL_SET | op::TABLE_GET | op::TABLE_SET => {
            reader.read_u32()?;
        }
        op::I32_CONST | op::I64_CONST | op::REF_NULL => {
            reader.read_i64()?;
        }
        op::F32_CONST => {
            reader.read_f32()?;
        }
        op::F64_CONST => {
            reader.read_f64()?;
        }
        op::GC_PREFIX => {
            let sub = reader.read_u32()?;
            match sub {
                op::STRUCT_NEW | op::STRUCT_NEW_DEFAULT | op::ARRAY_NEW | op::ARRAY_GET
                | op::ARRAY_SET => {
                    reader.read_u32()?;
                }
                op::STRUCT_GET | op::STRUCT_SET | op::ARRAY_NEW_FIXED => {
                    reader.read_u32()?;
                    reader.read_u32()?;
                }
                op::ARRAY_LEN | op::REF_I31 | op::I31_GET_S | op::I31_GET_U => {}
                op::REF_TEST | op::REF_CAST => {
                    reader.read_i64()?;
                }
                sub => return Err(ValidationError::UnsupportedGcOpcode(sub)),
            }
        }
        op::UNREACHABLE | op::NOP | op::RETURN | op::DROP | op::SELECT | op::REF_IS_NULL
        | op::I32_EQZ | op::I32_EQ | op::I32_NE | op::I32_LT_S | op::I32_GT_S | op::I32_ADD
        | op::I32_SUB | op::I32_MUL | op::I32_DIV_S | op::I32_DIV_U | op::I64_ADD | op::I64_SUB
        | op::I64_MUL => {}
        opcode => return Err(ValidationError::UnsupportedOpcode(opcode)),
    }
    Ok(())
}

// ————————————————————————————————— Labels ————————————————————————————————— //

#[derive(Clone, Copy)]
enum LabelKind {
    /// `block` and `if`: branches jump forward, past the `end`.
    Block { end: u32 },
    /// `loop`: branches jump back to the first instruction of the body.
    Loop { restart: u32 },
}

#[derive(Clone, Copy)]
struct Label {
    kind: LabelKind,
    /// Number of values a branch to this label carries.
    branch_arity: usize,
    /// Operand stack height at block entry.
    height: usize,
}

// ——————————————————————————————————— VM ——————————————————————————————————— //

struct Frame {
    locals: Vec<StackValue>,
    instance: InstanceId,
    module: Arc<Module>,
}

/// The virtual machine driving one call stack.
///
/// A `Vm` borrows the store exclusively for the duration of the outermost invocation; host
/// callbacks receive it back and may re-enter [`Vm::call`] on the same call stack.
pub struct Vm<'s> {
    store: &'s mut Store,
    stack: Vec<StackValue>,
    frames: Vec<Frame>,
}

impl<'s> Vm<'s> {
    /// Invokes a function with the given arguments and returns its results.
    ///
    /// This is the single entry point of the interpreter: traps propagate up to here and are
    /// never caught inside.
    pub fn invoke(
        store: &mut Store,
        func: FuncId,
        args: &[StackValue],
    ) -> Result<Vec<StackValue>, RuntimeError> {
        let results = store.func(func).ty().results().len();
        let mut vm = Vm {
            store,
            stack: args.to_vec(),
            frames: Vec::new(),
        };
        vm.call(func)?;
        if vm.stack.len() < results {
            return Err(Trap::StackUnderflow.into());
        }
        Ok(vm.stack.split_off(vm.stack.len() - results))
    }

    /// Calls a function: host callbacks run directly, wasm functions get a frame and run to
    /// completion.
    pub fn call(&mut self, func: FuncId) -> Result<(), RuntimeError> {
        enum Target {
            Wasm(Arc<WasmFunc>, Arc<JumpTable>),
            Host(HostFunc, u64),
        }

        let target = match self.store.func(func) {
            Function::Host {
                callback, context, ..
            } => Target::Host(*callback, *context),
            Function::Wasm { func: wasm, jump_table } => match jump_table {
                Some(table) => Target::Wasm(wasm.clone(), table.clone()),
                None => {
                    let wasm = wasm.clone();
                    let table = Arc::new(JumpTable::build(&wasm.code)?);
                    trace!("exec: built jump table for function {}", func.index());
                    self.store.cache_jump_table(func, table.clone());
                    Target::Wasm(wasm, table)
                }
            },
        };
        match target {
            // A host error surfaces as a trap.
            Target::Host(callback, context) => Ok(callback(self, context)?),
            Target::Wasm(wasm, table) => self.run(&wasm, &table),
        }
    }

    /// Runs a wasm function to completion: moves the arguments into a fresh frame, executes the
    /// body, and leaves exactly the declared results on the operand stack.
    fn run(&mut self, func: &WasmFunc, jump_table: &JumpTable) -> Result<(), RuntimeError> {
        let params = func.ty.params().len();
        let results = func.ty.results().len();
        if self.stack.len() < params {
            return Err(Trap::StackUnderflow.into());
        }
        let base = self.stack.len() - params;
        let mut locals = self.stack.split_off(base);
        locals.resize(params + func.locals as usize, StackValue::NULL);

        let module = self.store.instance(func.instance).module().clone();
        self.frames.push(Frame {
            locals,
            instance: func.instance,
            module,
        });
        let frame = self.frames.len() - 1;

        let outcome = self.exec_body(func, jump_table, frame);
        self.frames.pop();
        outcome?;

        // Keep exactly the declared results above the frame base.
        if self.stack.len() < base + results {
            return Err(Trap::StackUnderflow.into());
        }
        let returned = self.stack.split_off(self.stack.len() - results);
        self.stack.truncate(base);
        self.stack.extend_from_slice(&returned);
        Ok(())
    }

    fn exec_body(
        &mut self,
        func: &WasmFunc,
        jump_table: &JumpTable,
        frame: usize,
    ) -> Result<(), RuntimeError> {
        let mut reader = Reader::new(&func.code);
        let mut labels: Vec<Label> = Vec::new();

        loop {
            // The body may end without an explicit final `end` marker in the table; running off
            // the end is the function epilogue either way.
            if reader.is_at_end() {
                return Ok(());
            }
            let at = reader.pos() as u32;
            let opcode = reader.read_u8()?;
            match opcode {
                op::UNREACHABLE => return Err(Trap::Unreachable.into()),
                op::NOP => {}

                op::BLOCK => {
                    let arity = read_block_arity(&mut reader)?;
                    let target = jump_table.target(at)?;
                    labels.push(Label {
                        kind: LabelKind::Block { end: target.end },
                        branch_arity: arity,
                        height: self.stack.len(),
                    });
                }
                op::LOOP => {
                    read_block_arity(&mut reader)?;
                    labels.push(Label {
                        kind: LabelKind::Loop {
                            restart: reader.pos() as u32,
                        },
                        // Branches to a loop restart it with its parameters; parameterized
                        // blocks are not supported, so nothing is carried.
                        branch_arity: 0,
                        height: self.stack.len(),
                    });
                }
                op::IF => {
                    let arity = read_block_arity(&mut reader)?;
                    let target = jump_table.target(at)?;
                    let condition = self.pop()?.as_i32();
                    if condition != 0 {
                        labels.push(Label {
                            kind: LabelKind::Block { end: target.end },
                            branch_arity: arity,
                            height: self.stack.len(),
                        });
                    } else if let Some(else_branch) = target.else_branch {
                        reader.jump(else_branch as usize);
                        labels.push(Label {
                            kind: LabelKind::Block { end: target.end },
                            branch_arity: arity,
                            height: self.stack.len(),
                        });
                    } else {
                        reader.jump(target.end as usize);
                    }
                }
                op::ELSE => {
                    // Falling into `else` means the then-branch is done: skip to the end.
                    let label = labels.pop().ok_or(ValidationError::MalformedControl)?;
                    match label.kind {
                        LabelKind::Block { end } => reader.jump(end as usize),
                        LabelKind::Loop { .. } => {
                            return Err(ValidationError::MalformedControl.into())
                        }
                    }
                }
                op::END => {
                    // Closes either a block or the function body.
                    if labels.pop().is_none() {
                        return Ok(());
                    }
                }
                op::BR => {
                    let depth = reader.read_u32()?;
                    if self.branch(depth, &mut labels, &mut reader)? {
                        return Ok(());
                    }
                }
                op::BR_IF => {
                    let depth = reader.read_u32()?;
                    if self.pop()?.as_i32() != 0 && self.branch(depth, &mut labels, &mut reader)? {
                        return Ok(());
                    }
                }
                op::RETURN => return Ok(()),
                op::CALL => {
                    let idx = FuncIndex::from_u32(reader.read_u32()?);
                    let callee = self.store.instance(self.frames[frame].instance).func_id(idx)?;
                    self.call(callee)?;
                }

                op::DROP => {
                    self.pop()?;
                }
                op::SELECT => {
                    let condition = self.pop()?.as_i32();
                    let on_zero = self.pop()?;
                    let on_nonzero = self.pop()?;
                    self.push(if condition != 0 { on_nonzero } else { on_zero });
                }

                op::LOCAL_GET => {
                    let idx = reader.read_u32()?;
                    let value = *self.frames[frame]
                        .locals
                        .get(idx as usize)
                        .ok_or(ValidationError::BadLocalIndex(idx))?;
                    self.push(value);
                }
                op::LOCAL_SET => {
                    let idx = reader.read_u32()?;
                    let value = self.pop()?;
                    *self.frames[frame]
                        .locals
                        .get_mut(idx as usize)
                        .ok_or(ValidationError::BadLocalIndex(idx))? = value;
                }
                op::LOCAL_TEE => {
                    let idx = reader.read_u32()?;
                    let value = self.pop()?;
                    self.push(value);
                    *self.frames[frame]
                        .locals
                        .get_mut(idx as usize)
                        .ok_or(ValidationError::BadLocalIndex(idx))? = value;
                }

                op::GLOBAL_GET => {
                    let idx = GlobIndex::from_u32(reader.read_u32()?);
                    let id = self.store.instance(self.frames[frame].instance).global_id(idx)?;
                    self.push(self.store.global(id).value());
                }
                op::GLOBAL_SET => {
                    let idx = GlobIndex::from_u32(reader.read_u32()?);
                    let value = self.pop()?;
                    let id = self.store.instance(self.frames[frame].instance).global_id(idx)?;
                    self.store.global_mut(id).set(value)?;
                }

                op::TABLE_GET => {
                    let idx = TableIndex::from_u32(reader.read_u32()?);
                    let id = self.store.instance(self.frames[frame].instance).table_id(idx)?;
                    let entry = self.pop()?.as_i32() as u32;
                    let value = self.store.table(id).get(entry)?;
                    self.push(value.unwrap_or(StackValue::NULL));
                }
                op::TABLE_SET => {
                    let idx = TableIndex::from_u32(reader.read_u32()?);
                    let id = self.store.instance(self.frames[frame].instance).table_id(idx)?;
                    let value = self.pop()?;
                    let entry = self.pop()?.as_i32() as u32;
                    self.store.table_mut(id).set(entry, Some(value))?;
                }

                op::I32_CONST => {
                    let value = reader.read_i32()?;
                    self.push(StackValue::from_i32(value));
                }
                op::I64_CONST => {
                    let value = reader.read_i64()?;
                    self.push(StackValue::from_i64(value));
                }
                op::F32_CONST => {
                    let value = reader.read_f32()?;
                    self.push(StackValue::from_f32(value));
                }
                op::F64_CONST => {
                    let value = reader.read_f64()?;
                    self.push(StackValue::from_f64(value));
                }

                op::I32_EQZ => {
                    let value = self.pop()?.as_i32();
                    self.push(StackValue::from_i32((value == 0) as i32));
                }
                op::I32_EQ => self.binop_i32(|a, b| (a == b) as i32)?,
                op::I32_NE => self.binop_i32(|a, b| (a != b) as i32)?,
                op::I32_LT_S => self.binop_i32(|a, b| (a < b) as i32)?,
                op::I32_GT_S => self.binop_i32(|a, b| (a > b) as i32)?,
                op::I32_ADD => self.binop_i32(|a, b| a.wrapping_add(b))?,
                op::I32_SUB => self.binop_i32(|a, b| a.wrapping_sub(b))?,
                op::I32_MUL => self.binop_i32(|a, b| a.wrapping_mul(b))?,
                op::I32_DIV_S => {
                    let divisor = self.pop()?.as_i32();
                    let dividend = self.pop()?.as_i32();
                    if divisor == 0 {
                        return Err(Trap::DivisionByZero.into());
                    }
                    let quotient = dividend
                        .checked_div(divisor)
                        .ok_or(Trap::IntegerOverflow)?;
                    self.push(StackValue::from_i32(quotient));
                }
                op::I32_DIV_U => {
                    let divisor = self.pop()?.as_i32() as u32;
                    let dividend = self.pop()?.as_i32() as u32;
                    if divisor == 0 {
                        return Err(Trap::DivisionByZero.into());
                    }
                    self.push(StackValue::from_i32((dividend / divisor) as i32));
                }
                op::I64_ADD => self.binop_i64(|a, b| a.wrapping_add(b))?,
                op::I64_SUB => self.binop_i64(|a, b| a.wrapping_sub(b))?,
                op::I64_MUL => self.binop_i64(|a, b| a.wrapping_mul(b))?,

                op::REF_NULL => {
                    HeapType::from_code(reader.read_i64()?)?;
                    self.push(StackValue::NULL);
                }
                op::REF_IS_NULL => {
                    let value = self.pop()?;
                    self.push(StackValue::from_i32(value.is_null() as i32));
                }

                op::GC_PREFIX => {
                    let sub = reader.read_u32()?;
                    self.exec_gc(sub, &mut reader, frame)?;
                }

                opcode => return Err(ValidationError::UnsupportedOpcode(opcode).into()),
            }
        }
    }

    /// Executes one instruction of the `0xFB` prefix space.
    fn exec_gc(
        &mut self,
        sub: u32,
        reader: &mut Reader,
        frame: usize,
    ) -> Result<(), RuntimeError> {
        match sub {
            op::STRUCT_NEW => {
                let (type_index, field_count) =
                    self.read_struct_type(reader, frame, |ty| ty.fields.len())?;
                let mut fields = vec![StackValue::NULL; field_count];
                for slot in fields.iter_mut().rev() {
                    *slot = self.pop()?;
                }
                self.maybe_collect(&fields);
                let addr = self.store.heap_mut().alloc_struct(type_index, fields);
                self.push(StackValue::encode_gc_ref(addr));
            }
            op::STRUCT_NEW_DEFAULT => {
                let (type_index, field_count) =
                    self.read_struct_type(reader, frame, |ty| ty.fields.len())?;
                self.maybe_collect(&[]);
                let addr = self
                    .store
                    .heap_mut()
                    .alloc_struct(type_index, vec![StackValue::NULL; field_count]);
                self.push(StackValue::encode_gc_ref(addr));
            }
            op::STRUCT_GET => {
                let (_, field_count) = self.read_struct_type(reader, frame, |ty| ty.fields.len())?;
                let field = reader.read_u32()?;
                if field as usize >= field_count {
                    return Err(ValidationError::BadFieldIndex(field).into());
                }
                let addr = self.pop()?.decode_gc_ref()?;
                let object = self.store.heap().get(addr)?;
                if !object.is_struct() {
                    return Err(Trap::CastFailure.into());
                }
                let value = object.get(field)?;
                self.push(value);
            }
            op::STRUCT_SET => {
                let (_, fields) = self.read_struct_type(reader, frame, |ty| ty.fields.clone())?;
                let field = reader.read_u32()?;
                match fields.get(field as usize) {
                    Some(field_ty) if field_ty.mutable => {}
                    Some(_) => return Err(ValidationError::ImmutableField.into()),
                    None => return Err(ValidationError::BadFieldIndex(field).into()),
                }
                let value = self.pop()?;
                let addr = self.pop()?.decode_gc_ref()?;
                let object = self.store.heap_mut().get_mut(addr)?;
                if !object.is_struct() {
                    return Err(Trap::CastFailure.into());
                }
                object.set(field, value)?;
            }
            op::ARRAY_NEW => {
                let type_index = self.read_array_type(reader, frame)?;
                let len = self.pop()?.as_i32() as u32;
                let init = self.pop()?;
                self.maybe_collect(&[init]);
                let addr = self.store.heap_mut().alloc_array(type_index, len, init);
                self.push(StackValue::encode_gc_ref(addr));
            }
            op::ARRAY_NEW_FIXED => {
                let type_index = self.read_array_type(reader, frame)?;
                let count = reader.read_u32()? as usize;
                let mut elems = vec![StackValue::NULL; count];
                for slot in elems.iter_mut().rev() {
                    *slot = self.pop()?;
                }
                self.maybe_collect(&elems);
                let addr = self.store.heap_mut().alloc_array_with(type_index, elems);
                self.push(StackValue::encode_gc_ref(addr));
            }
            op::ARRAY_GET => {
                self.read_array_type(reader, frame)?;
                let index = self.pop()?.as_i32() as u32;
                let addr = self.pop()?.decode_gc_ref()?;
                let object = self.store.heap().get(addr)?;
                if !object.is_array() {
                    return Err(Trap::CastFailure.into());
                }
                let value = object.get(index)?;
                self.push(value);
            }
            op::ARRAY_SET => {
                self.read_array_type(reader, frame)?;
                let value = self.pop()?;
                let index = self.pop()?.as_i32() as u32;
                let addr = self.pop()?.decode_gc_ref()?;
                let object = self.store.heap_mut().get_mut(addr)?;
                if !object.is_array() {
                    return Err(Trap::CastFailure.into());
                }
                object.set(index, value)?;
            }
            op::ARRAY_LEN => {
                let addr = self.pop()?.decode_gc_ref()?;
                let object = self.store.heap().get(addr)?;
                if !object.is_array() {
                    return Err(Trap::CastFailure.into());
                }
                self.push(StackValue::from_i32(object.len() as i32));
            }
            op::REF_TEST => {
                let target = HeapType::from_code(reader.read_i64()?)?;
                let value = self.pop()?;
                let matches = matches_heap_type(
                    value,
                    target,
                    self.frames[frame].module.types(),
                    self.store.heap(),
                );
                self.push(StackValue::from_i32(matches as i32));
            }
            op::REF_CAST => {
                let target = HeapType::from_code(reader.read_i64()?)?;
                let value = self.pop()?;
                if !matches_heap_type(
                    value,
                    target,
                    self.frames[frame].module.types(),
                    self.store.heap(),
                ) {
                    return Err(Trap::CastFailure.into());
                }
                self.push(value);
            }
            op::REF_I31 => {
                let value = self.pop()?.as_i32();
                self.push(StackValue::encode_i31(value));
            }
            op::I31_GET_S => {
                let value = self.pop()?.decode_i31_signed()?;
                self.push(StackValue::from_i32(value));
            }
            op::I31_GET_U => {
                let value = self.pop()?.decode_i31_unsigned()?;
                self.push(StackValue::from_i32(value as i32));
            }
            sub => return Err(ValidationError::UnsupportedGcOpcode(sub).into()),
        }
        Ok(())
    }

    /// Reads a struct type immediate and projects it through `f`.
    fn read_struct_type<T>(
        &self,
        reader: &mut Reader,
        frame: usize,
        f: impl FnOnce(&StructType) -> T,
    ) -> Result<(TypeIndex, T), RuntimeError> {
        let raw = reader.read_u32()?;
        let type_index = TypeIndex::from_u32(raw);
        let module = &self.frames[frame].module;
        let def = module
            .types()
            .get(type_index)
            .ok_or(ValidationError::BadTypeIndex(raw))?;
        let ty = def
            .struct_type()
            .ok_or(ValidationError::BadTypeIndex(raw))?;
        Ok((type_index, f(ty)))
    }

    /// Reads an array type immediate.
    fn read_array_type(
        &self,
        reader: &mut Reader,
        frame: usize,
    ) -> Result<TypeIndex, RuntimeError> {
        let raw = reader.read_u32()?;
        let type_index = TypeIndex::from_u32(raw);
        let module = &self.frames[frame].module;
        let def = module
            .types()
            .get(type_index)
            .ok_or(ValidationError::BadTypeIndex(raw))?;
        def.array_type().ok_or(ValidationError::BadTypeIndex(raw))?;
        Ok(type_index)
    }

    /// Takes a branch. Returns true when the branch targets the function itself, which is a
    /// return.
    fn branch(
        &mut self,
        depth: u32,
        labels: &mut Vec<Label>,
        reader: &mut Reader,
    ) -> Result<bool, RuntimeError> {
        if depth as usize >= labels.len() {
            return Ok(true);
        }
        let index = labels.len() - 1 - depth as usize;
        let label = labels[index];

        // Carry the branch values, discard everything else above the label.
        if self.stack.len() < label.height + label.branch_arity {
            return Err(Trap::StackUnderflow.into());
        }
        let carried = self.stack.split_off(self.stack.len() - label.branch_arity);
        self.stack.truncate(label.height);
        self.stack.extend_from_slice(&carried);

        match label.kind {
            LabelKind::Block { end } => {
                labels.truncate(index);
                reader.jump(end as usize);
            }
            LabelKind::Loop { restart } => {
                // The loop label itself stays live.
                labels.truncate(index + 1);
                reader.jump(restart as usize);
            }
        }
        Ok(false)
    }

    /// Runs a collection when the heap asks for one. Called right before each allocation;
    /// `extra` holds the operands already popped for the pending allocation, which the stack no
    /// longer roots but which must survive until the new object anchors them.
    fn maybe_collect(&mut self, extra: &[StackValue]) {
        if !self.store.heap().should_collect() {
            return;
        }
        let mut roots = self.stack.clone();
        roots.extend_from_slice(extra);
        for frame in &self.frames {
            roots.extend_from_slice(&frame.locals);
        }
        self.store.collect_garbage(&roots);
    }

    fn binop_i32(&mut self, f: impl FnOnce(i32, i32) -> i32) -> Result<(), RuntimeError> {
        let b = self.pop()?.as_i32();
        let a = self.pop()?.as_i32();
        self.push(StackValue::from_i32(f(a, b)));
        Ok(())
    }

    fn binop_i64(&mut self, f: impl FnOnce(i64, i64) -> i64) -> Result<(), RuntimeError> {
        let b = self.pop()?.as_i64();
        let a = self.pop()?.as_i64();
        self.push(StackValue::from_i64(f(a, b)));
        Ok(())
    }

    // Host callback surface: callbacks read their arguments and write their results here.

    /// Pushes a value on the operand stack.
    pub fn push(&mut self, value: StackValue) {
        self.stack.push(value);
    }

    /// Pops a value from the operand stack.
    pub fn pop(&mut self) -> Result<StackValue, Trap> {
        self.stack.pop().ok_or(Trap::StackUnderflow)
    }

    pub fn store(&self) -> &Store {
        self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        self.store
    }
}
