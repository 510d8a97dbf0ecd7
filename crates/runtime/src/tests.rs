//! End-to-end scenarios: modules are hand-assembled the way the external decoder would produce
//! them, instantiated in a fresh store, and driven through their exports.

use alloc::vec;
use alloc::vec::Vec;

use collections::EntityRef;

use crate::exec::op;
use crate::{
    ArrayType, CompositeType, DataSegment, FieldType, FuncId, FuncType, GlobInit, GlobalType,
    HeapConfig, Instance, InstanceId, LinkError, MemoryType, Module, ModuleBuilder, RuntimeError,
    StackValue, Store, StructType, TableSegment, TableType, Trap, TypeDef, ValueType, Vm,
};

#[test]
fn the_answer() {
    let mut module = ModuleBuilder::new();
    let ty = module.add_func_type(vec![], vec![ValueType::I32]);
    let main = module.add_func(ty, 0, Asm::new().i32c(42).build());
    module.export_func("main", main);
    assert_eq!(execute(module.build(), &[]), Ok(42));
}

#[test]
fn add_and_square() {
    let mut module = ModuleBuilder::new();
    let binary = module.add_func_type(vec![ValueType::I32, ValueType::I32], vec![ValueType::I32]);
    let unary = module.add_func_type(vec![ValueType::I32], vec![ValueType::I32]);
    let main = module.add_func(
        binary,
        0,
        Asm::new()
            .op(op::LOCAL_GET)
            .u(0)
            .op(op::LOCAL_GET)
            .u(1)
            .op(op::I32_ADD)
            .op(op::CALL)
            .u(1)
            .build(),
    );
    let square = module.add_func(
        unary,
        0,
        Asm::new()
            .op(op::LOCAL_GET)
            .u(0)
            .op(op::LOCAL_GET)
            .u(0)
            .op(op::I32_MUL)
            .build(),
    );
    assert_eq!(square.index(), 1);
    module.export_func("main", main);
    assert_eq!(execute(module.build(), &[2, 3]), Ok(25));
}

// ———————————————————————————— GC Instructions ————————————————————————————— //

#[test]
fn struct_new_and_get() {
    // type 0 = struct { mut i32, mut i32 }, main(a, b) allocates (a, b) and reads field 1.
    let mut module = ModuleBuilder::new();
    let pair = module.add_type(pair_struct());
    let ty = module.add_func_type(vec![ValueType::I32, ValueType::I32], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        0,
        Asm::new()
            .op(op::LOCAL_GET)
            .u(0)
            .op(op::LOCAL_GET)
            .u(1)
            .gc(op::STRUCT_NEW)
            .u(pair.index() as u32)
            .gc(op::STRUCT_GET)
            .u(0)
            .u(1)
            .build(),
    );
    module.export_func("main", main);
    assert_eq!(execute(module.build(), &[10, 20]), Ok(20));
}

#[test]
fn struct_new_default_set_get() {
    // main(x) creates a default struct, stores x into field 0, and reads it back. The extra
    // local stashes the reference between the accesses.
    let mut module = ModuleBuilder::new();
    module.add_type(pair_struct());
    let ty = module.add_func_type(vec![ValueType::I32], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        1,
        Asm::new()
            .gc(op::STRUCT_NEW_DEFAULT)
            .u(0)
            .op(op::LOCAL_TEE)
            .u(1)
            .op(op::LOCAL_GET)
            .u(0)
            .gc(op::STRUCT_SET)
            .u(0)
            .u(0)
            .op(op::LOCAL_GET)
            .u(1)
            .gc(op::STRUCT_GET)
            .u(0)
            .u(0)
            .build(),
    );
    module.export_func("main", main);
    assert_eq!(execute(module.build(), &[99]), Ok(99));
}

#[test]
fn array_new_and_get() {
    // type 0 = array (mut i32), main(init, len) allocates and reads element 0.
    let mut module = ModuleBuilder::new();
    module.add_type(i32_array());
    let ty = module.add_func_type(vec![ValueType::I32, ValueType::I32], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        0,
        Asm::new()
            .op(op::LOCAL_GET)
            .u(0)
            .op(op::LOCAL_GET)
            .u(1)
            .gc(op::ARRAY_NEW)
            .u(0)
            .i32c(0)
            .gc(op::ARRAY_GET)
            .u(0)
            .build(),
    );
    module.export_func("main", main);
    assert_eq!(execute(module.build(), &[42, 3]), Ok(42));
}

#[test]
fn array_out_of_bounds_traps() {
    let mut module = ModuleBuilder::new();
    module.add_type(i32_array());
    let ty = module.add_func_type(vec![], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        0,
        Asm::new()
            .i32c(42)
            .i32c(3)
            .gc(op::ARRAY_NEW)
            .u(0)
            .i32c(5)
            .gc(op::ARRAY_GET)
            .u(0)
            .build(),
    );
    module.export_func("main", main);
    assert_eq!(
        execute(module.build(), &[]),
        Err(RuntimeError::Trap(Trap::HeapOutOfBounds))
    );
}

#[test]
fn array_set_and_len() {
    // main(x) allocates [0; 4], writes x at index 2, and returns element 2 plus the length.
    let mut module = ModuleBuilder::new();
    module.add_type(i32_array());
    let ty = module.add_func_type(vec![ValueType::I32], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        1,
        Asm::new()
            .i32c(0)
            .i32c(4)
            .gc(op::ARRAY_NEW)
            .u(0)
            .op(op::LOCAL_TEE)
            .u(1)
            .i32c(2)
            .op(op::LOCAL_GET)
            .u(0)
            .gc(op::ARRAY_SET)
            .u(0)
            .op(op::LOCAL_GET)
            .u(1)
            .i32c(2)
            .gc(op::ARRAY_GET)
            .u(0)
            .op(op::LOCAL_GET)
            .u(1)
            .gc(op::ARRAY_LEN)
            .op(op::I32_ADD)
            .build(),
    );
    module.export_func("main", main);
    assert_eq!(execute(module.build(), &[38]), Ok(42));
}

#[test]
fn i31_round_trip() {
    let mut module = ModuleBuilder::new();
    let ty = module.add_func_type(vec![ValueType::I32], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        0,
        Asm::new()
            .op(op::LOCAL_GET)
            .u(0)
            .gc(op::REF_I31)
            .gc(op::I31_GET_S)
            .build(),
    );
    module.export_func("main", main);
    let module = module.build();
    let (mut store, id) = instantiate(module);
    assert_eq!(call_main(&mut store, id, &[42]), Ok(42));
    assert_eq!(call_main(&mut store, id, &[-1]), Ok(-1));
}

#[test]
fn ref_test_i31() {
    let mut module = ModuleBuilder::new();
    let ty = module.add_func_type(vec![ValueType::I32], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        0,
        Asm::new()
            .op(op::LOCAL_GET)
            .u(0)
            .gc(op::REF_I31)
            .gc(op::REF_TEST)
            .s(-20)
            .build(),
    );
    module.export_func("main", main);
    assert_eq!(execute(module.build(), &[42]), Ok(1));
}

#[test]
fn ref_cast_null_traps() {
    let mut module = ModuleBuilder::new();
    let ty = module.add_func_type(vec![], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        0,
        Asm::new()
            .op(op::REF_NULL)
            .s(-20)
            .gc(op::REF_CAST)
            .s(-20)
            .gc(op::I31_GET_S)
            .build(),
    );
    module.export_func("main", main);
    assert_eq!(
        execute(module.build(), &[]),
        Err(RuntimeError::Trap(Trap::CastFailure))
    );
}

#[test]
fn struct_get_on_null_traps() {
    let mut module = ModuleBuilder::new();
    module.add_type(pair_struct());
    let ty = module.add_func_type(vec![], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        0,
        Asm::new()
            .op(op::REF_NULL)
            .s(-21)
            .gc(op::STRUCT_GET)
            .u(0)
            .u(0)
            .build(),
    );
    module.export_func("main", main);
    assert_eq!(
        execute(module.build(), &[]),
        Err(RuntimeError::Trap(Trap::NullReference))
    );
}

#[test]
fn concrete_subtype_cast() {
    // type 0 = struct { mut i32 }, type 1 extends it with a second field. A type 1 value casts
    // to type 0 and still answers `ref.test` for both.
    let mut module = ModuleBuilder::new();
    let base = module.add_type(TypeDef::new(CompositeType::Struct(StructType {
        fields: vec![FieldType::mutable(ValueType::I32)],
    })));
    let sub = module.add_type(
        TypeDef::new(CompositeType::Struct(StructType {
            fields: vec![
                FieldType::mutable(ValueType::I32),
                FieldType::mutable(ValueType::I32),
            ],
        }))
        .with_super(base),
    );
    let ty = module.add_func_type(vec![ValueType::I32], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        0,
        Asm::new()
            .op(op::LOCAL_GET)
            .u(0)
            .op(op::LOCAL_GET)
            .u(0)
            .gc(op::STRUCT_NEW)
            .u(sub.index() as u32)
            .gc(op::REF_CAST)
            .s(base.index() as i64)
            .gc(op::STRUCT_GET)
            .u(sub.index() as u32)
            .u(0)
            .build(),
    );
    module.export_func("main", main);
    assert_eq!(execute(module.build(), &[7]), Ok(7));
}

#[test]
fn upcast_fails() {
    // A base-typed value is not a subtype of the extension.
    let mut module = ModuleBuilder::new();
    let base = module.add_type(TypeDef::new(CompositeType::Struct(StructType {
        fields: vec![FieldType::mutable(ValueType::I32)],
    })));
    let sub = module.add_type(
        TypeDef::new(CompositeType::Struct(StructType {
            fields: vec![
                FieldType::mutable(ValueType::I32),
                FieldType::mutable(ValueType::I32),
            ],
        }))
        .with_super(base),
    );
    let ty = module.add_func_type(vec![], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        0,
        Asm::new()
            .i32c(7)
            .gc(op::STRUCT_NEW)
            .u(base.index() as u32)
            .gc(op::REF_TEST)
            .s(sub.index() as i64)
            .build(),
    );
    module.export_func("main", main);
    assert_eq!(execute(module.build(), &[]), Ok(0));
}

#[test]
fn loop_allocations_are_collected() {
    // Allocate a garbage struct per iteration with a tiny collection threshold: the heap must
    // stay bounded by reusing freed slots.
    let mut module = ModuleBuilder::new();
    module.add_type(pair_struct());
    let ty = module.add_func_type(vec![ValueType::I32], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        0,
        Asm::new()
            .op(op::LOOP)
            .s(-64)
            .gc(op::STRUCT_NEW_DEFAULT)
            .u(0)
            .op(op::DROP)
            .op(op::LOCAL_GET)
            .u(0)
            .i32c(1)
            .op(op::I32_SUB)
            .op(op::LOCAL_TEE)
            .u(0)
            .op(op::BR_IF)
            .u(0)
            .op(op::END)
            .i32c(42)
            .build(),
    );
    module.export_func("main", main);

    let mut store = Store::with_heap_config(HeapConfig { gc_threshold: 8 });
    let id = Instance::instantiate(&mut store, module.build(), "main_mod").unwrap();
    assert_eq!(call_main(&mut store, id, &[100]), Ok(42));
    // 100 allocations went through a heap that never holds more than one live object.
    assert!(store.heap().capacity() <= 16);
}

#[test]
fn struct_operands_survive_allocation_gc() {
    // The inner reference is popped off the stack before the outer allocation; the collection
    // running at that allocation point must still treat it as a root. The garbage allocation in
    // between arms the collector, and the threshold of 1 forces a cycle on every allocation.
    let mut module = ModuleBuilder::new();
    module.add_type(pair_struct());
    let ty = module.add_func_type(vec![ValueType::I32], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        0,
        Asm::new()
            // inner = struct { x, 0 }
            .op(op::LOCAL_GET)
            .u(0)
            .i32c(0)
            .gc(op::STRUCT_NEW)
            .u(0)
            // garbage, so the next allocation point collects
            .gc(op::STRUCT_NEW_DEFAULT)
            .u(0)
            .op(op::DROP)
            // outer = struct { inner, 0 }, collecting while inner is off the stack
            .i32c(0)
            .gc(op::STRUCT_NEW)
            .u(0)
            .gc(op::STRUCT_GET)
            .u(0)
            .u(0)
            .gc(op::STRUCT_GET)
            .u(0)
            .u(0)
            .build(),
    );
    module.export_func("main", main);

    let mut store = Store::with_heap_config(HeapConfig { gc_threshold: 1 });
    let id = Instance::instantiate(&mut store, module.build(), "main_mod").unwrap();
    assert_eq!(call_main(&mut store, id, &[41]), Ok(41));
}

#[test]
fn array_init_survives_allocation_gc() {
    // Same shape for `array.new`: the init reference is already popped when the allocation
    // point collects.
    let mut module = ModuleBuilder::new();
    module.add_type(pair_struct());
    module.add_type(i32_array());
    let ty = module.add_func_type(vec![ValueType::I32], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        0,
        Asm::new()
            .op(op::LOCAL_GET)
            .u(0)
            .i32c(0)
            .gc(op::STRUCT_NEW)
            .u(0)
            .gc(op::STRUCT_NEW_DEFAULT)
            .u(0)
            .op(op::DROP)
            .i32c(2)
            .gc(op::ARRAY_NEW)
            .u(1)
            .i32c(0)
            .gc(op::ARRAY_GET)
            .u(1)
            .gc(op::STRUCT_GET)
            .u(0)
            .u(0)
            .build(),
    );
    module.export_func("main", main);

    let mut store = Store::with_heap_config(HeapConfig { gc_threshold: 1 });
    let id = Instance::instantiate(&mut store, module.build(), "main_mod").unwrap();
    assert_eq!(call_main(&mut store, id, &[41]), Ok(41));
}

#[test]
fn array_new_fixed_operands_survive_allocation_gc() {
    // And for `array.new_fixed`, whose element operands travel the same way.
    let mut module = ModuleBuilder::new();
    module.add_type(pair_struct());
    module.add_type(i32_array());
    let ty = module.add_func_type(vec![ValueType::I32], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        0,
        Asm::new()
            .op(op::LOCAL_GET)
            .u(0)
            .i32c(0)
            .gc(op::STRUCT_NEW)
            .u(0)
            .gc(op::STRUCT_NEW_DEFAULT)
            .u(0)
            .op(op::DROP)
            .gc(op::ARRAY_NEW_FIXED)
            .u(1)
            .u(1)
            .i32c(0)
            .gc(op::ARRAY_GET)
            .u(1)
            .gc(op::STRUCT_GET)
            .u(0)
            .u(0)
            .build(),
    );
    module.export_func("main", main);

    let mut store = Store::with_heap_config(HeapConfig { gc_threshold: 1 });
    let id = Instance::instantiate(&mut store, module.build(), "main_mod").unwrap();
    assert_eq!(call_main(&mut store, id, &[41]), Ok(41));
}

// —————————————————————————— Control & Numerics ———————————————————————————— //

#[test]
fn block_branches() {
    // Sums 1..=n with a loop wrapped in an exit block.
    let mut module = ModuleBuilder::new();
    let ty = module.add_func_type(vec![ValueType::I32], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        1,
        Asm::new()
            .op(op::BLOCK)
            .s(-64)
            .op(op::LOOP)
            .s(-64)
            .op(op::LOCAL_GET)
            .u(0)
            .op(op::I32_EQZ)
            .op(op::BR_IF)
            .u(1)
            .op(op::LOCAL_GET)
            .u(1)
            .op(op::LOCAL_GET)
            .u(0)
            .op(op::I32_ADD)
            .op(op::LOCAL_SET)
            .u(1)
            .op(op::LOCAL_GET)
            .u(0)
            .i32c(1)
            .op(op::I32_SUB)
            .op(op::LOCAL_SET)
            .u(0)
            .op(op::BR)
            .u(0)
            .op(op::END)
            .op(op::END)
            .op(op::LOCAL_GET)
            .u(1)
            .build(),
    );
    module.export_func("main", main);
    assert_eq!(execute(module.build(), &[5]), Ok(15));
}

#[test]
fn if_else() {
    let mut module = ModuleBuilder::new();
    let ty = module.add_func_type(vec![ValueType::I32], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        0,
        Asm::new()
            .op(op::LOCAL_GET)
            .u(0)
            .op(op::IF)
            .s(-1)
            .i32c(1)
            .op(op::ELSE)
            .i32c(2)
            .op(op::END)
            .build(),
    );
    module.export_func("main", main);
    let (mut store, id) = instantiate(module.build());
    assert_eq!(call_main(&mut store, id, &[3]), Ok(1));
    assert_eq!(call_main(&mut store, id, &[0]), Ok(2));
}

#[test]
fn select_picks_by_condition() {
    let mut module = ModuleBuilder::new();
    let ty = module.add_func_type(vec![ValueType::I32], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        0,
        Asm::new()
            .i32c(10)
            .i32c(20)
            .op(op::LOCAL_GET)
            .u(0)
            .op(op::SELECT)
            .build(),
    );
    module.export_func("main", main);
    let (mut store, id) = instantiate(module.build());
    assert_eq!(call_main(&mut store, id, &[1]), Ok(10));
    assert_eq!(call_main(&mut store, id, &[0]), Ok(20));
}

#[test]
fn division_by_zero_traps() {
    let mut module = ModuleBuilder::new();
    let ty = module.add_func_type(vec![], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        0,
        Asm::new().i32c(1).i32c(0).op(op::I32_DIV_S).build(),
    );
    module.export_func("main", main);
    assert_eq!(
        execute(module.build(), &[]),
        Err(RuntimeError::Trap(Trap::DivisionByZero))
    );
}

#[test]
fn unreachable_traps() {
    let mut module = ModuleBuilder::new();
    let ty = module.add_func_type(vec![], vec![]);
    let main = module.add_func(ty, 0, Asm::new().op(op::UNREACHABLE).build());
    module.export_func("main", main);
    assert_eq!(
        execute(module.build(), &[]),
        Err(RuntimeError::Trap(Trap::Unreachable))
    );
}

// ———————————————————————— Imports, Globals, Tables ———————————————————————— //

#[test]
fn import() {
    let mut answer = ModuleBuilder::new();
    let ty = answer.add_func_type(vec![], vec![ValueType::I32]);
    let the_answer = answer.add_func(ty, 0, Asm::new().i32c(42).build());
    answer.export_func("the_answer", the_answer);

    let mut module = ModuleBuilder::new();
    let ty = module.add_func_type(vec![], vec![ValueType::I32]);
    module.import_func("answer", "the_answer", ty);
    let main = module.add_func(ty, 0, Asm::new().op(op::CALL).u(0).build());
    module.export_func("main", main);

    let mut store = Store::new();
    Instance::instantiate(&mut store, answer.build(), "answer").unwrap();
    let id = Instance::instantiate(&mut store, module.build(), "main_mod").unwrap();
    assert_eq!(call_main(&mut store, id, &[]), Ok(42));
}

#[test]
fn unknown_import() {
    let mut module = ModuleBuilder::new();
    let ty = module.add_func_type(vec![], vec![]);
    module.import_func("missing", "nope", ty);

    let mut store = Store::new();
    let result = Instance::instantiate(&mut store, module.build(), "main_mod");
    assert!(matches!(
        result,
        Err(RuntimeError::Link(LinkError::UnknownImport { .. }))
    ));
}

#[test]
fn import_signature_mismatch() {
    let mut answer = ModuleBuilder::new();
    let ty = answer.add_func_type(vec![], vec![ValueType::I32]);
    let the_answer = answer.add_func(ty, 0, Asm::new().i32c(42).build());
    answer.export_func("the_answer", the_answer);

    let mut module = ModuleBuilder::new();
    // Wrong signature: expects a parameter the export does not have.
    let ty = module.add_func_type(vec![ValueType::I32], vec![ValueType::I32]);
    module.import_func("answer", "the_answer", ty);

    let mut store = Store::new();
    Instance::instantiate(&mut store, answer.build(), "answer").unwrap();
    let result = Instance::instantiate(&mut store, module.build(), "main_mod");
    assert!(matches!(
        result,
        Err(RuntimeError::Link(LinkError::SignatureMismatch { .. }))
    ));
}

#[test]
fn import_host_func() {
    fn add_ten(vm: &mut Vm, _context: u64) -> Result<(), Trap> {
        let value = vm.pop()?.as_i32();
        vm.push(StackValue::from_i32(value + 10));
        Ok(())
    }

    let mut module = ModuleBuilder::new();
    let ty = module.add_func_type(vec![ValueType::I32], vec![ValueType::I32]);
    module.import_func("env", "add_ten", ty);
    let main = module.add_func(
        ty,
        0,
        Asm::new().op(op::LOCAL_GET).u(0).op(op::CALL).u(0).build(),
    );
    module.export_func("main", main);

    let mut store = Store::new();
    store.expose_host_function(
        "env",
        "add_ten",
        FuncType::new(vec![ValueType::I32], vec![ValueType::I32]),
        add_ten,
        0,
    );
    let id = Instance::instantiate(&mut store, module.build(), "main_mod").unwrap();
    assert_eq!(call_main(&mut store, id, &[32]), Ok(42));
}

#[test]
fn host_reentrancy() {
    // The host callback re-enters the interpreter; the callee handle travels in the context
    // word.
    fn trampoline(vm: &mut Vm, context: u64) -> Result<(), Trap> {
        let callee = FuncId::new(context as usize);
        vm.call(callee).map_err(|_| Trap::Host)
    }

    let mut answer = ModuleBuilder::new();
    let ty = answer.add_func_type(vec![], vec![ValueType::I32]);
    let the_answer = answer.add_func(ty, 0, Asm::new().i32c(42).build());
    answer.export_func("the_answer", the_answer);

    let mut store = Store::new();
    let answer_id = Instance::instantiate(&mut store, answer.build(), "answer").unwrap();
    let callee = store.instance(answer_id).get_func("the_answer").unwrap();
    store.expose_host_function(
        "env",
        "tramp",
        FuncType::new(vec![], vec![ValueType::I32]),
        trampoline,
        callee.index() as u64,
    );

    let mut module = ModuleBuilder::new();
    let ty = module.add_func_type(vec![], vec![ValueType::I32]);
    module.import_func("env", "tramp", ty);
    let main = module.add_func(ty, 0, Asm::new().op(op::CALL).u(0).build());
    module.export_func("main", main);
    let id = Instance::instantiate(&mut store, module.build(), "main_mod").unwrap();
    assert_eq!(call_main(&mut store, id, &[]), Ok(42));
}

#[test]
fn global_read() {
    let mut module = ModuleBuilder::new();
    module.add_glob(
        GlobalType {
            ty: ValueType::I32,
            mutable: false,
        },
        GlobInit::I32(42),
    );
    let ty = module.add_func_type(vec![], vec![ValueType::I32]);
    let main = module.add_func(ty, 0, Asm::new().op(op::GLOBAL_GET).u(0).build());
    module.export_func("main", main);
    assert_eq!(execute(module.build(), &[]), Ok(42));
}

#[test]
fn global_write() {
    let mut module = ModuleBuilder::new();
    module.add_glob(
        GlobalType {
            ty: ValueType::I32,
            mutable: true,
        },
        GlobInit::I32(0),
    );
    let ty = module.add_func_type(vec![], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        0,
        Asm::new()
            .i32c(42)
            .op(op::GLOBAL_SET)
            .u(0)
            .op(op::GLOBAL_GET)
            .u(0)
            .build(),
    );
    module.export_func("main", main);
    assert_eq!(execute(module.build(), &[]), Ok(42));
}

#[test]
fn table_get_set() {
    // main(x) stores x as an i31 at slot 1 and reads it back.
    let mut module = ModuleBuilder::new();
    module.add_table(TableType {
        ty: ValueType::AnyRef,
        min: 2,
        max: Some(2),
    });
    let ty = module.add_func_type(vec![ValueType::I32], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        0,
        Asm::new()
            .i32c(1)
            .op(op::LOCAL_GET)
            .u(0)
            .gc(op::REF_I31)
            .op(op::TABLE_SET)
            .u(0)
            .i32c(1)
            .op(op::TABLE_GET)
            .u(0)
            .gc(op::I31_GET_S)
            .build(),
    );
    module.export_func("main", main);
    assert_eq!(execute(module.build(), &[7]), Ok(7));
}

#[test]
fn table_roots_survive_collection() {
    // A reference stored in a table keeps its object alive across a collection triggered by
    // later garbage.
    let mut module = ModuleBuilder::new();
    module.add_type(pair_struct());
    module.add_table(TableType {
        ty: ValueType::AnyRef,
        min: 1,
        max: Some(1),
    });
    let ty = module.add_func_type(vec![ValueType::I32], vec![ValueType::I32]);
    let main = module.add_func(
        ty,
        0,
        Asm::new()
            // table[0] = struct { x, 0 }
            .i32c(0)
            .op(op::LOCAL_GET)
            .u(0)
            .i32c(0)
            .gc(op::STRUCT_NEW)
            .u(0)
            .op(op::TABLE_SET)
            .u(0)
            // churn the heap with garbage
            .gc(op::STRUCT_NEW_DEFAULT)
            .u(0)
            .op(op::DROP)
            .gc(op::STRUCT_NEW_DEFAULT)
            .u(0)
            .op(op::DROP)
            .gc(op::STRUCT_NEW_DEFAULT)
            .u(0)
            .op(op::DROP)
            // read it back
            .i32c(0)
            .op(op::TABLE_GET)
            .u(0)
            .gc(op::STRUCT_GET)
            .u(0)
            .u(0)
            .build(),
    );
    module.export_func("main", main);

    let mut store = Store::with_heap_config(HeapConfig { gc_threshold: 1 });
    let id = Instance::instantiate(&mut store, module.build(), "main_mod").unwrap();
    assert_eq!(call_main(&mut store, id, &[41]), Ok(41));
}

// —————————————————————— Instantiation Side Effects ———————————————————————— //

#[test]
fn start_runs_at_instantiation() {
    let mut module = ModuleBuilder::new();
    let glob = module.add_glob(
        GlobalType {
            ty: ValueType::I32,
            mutable: true,
        },
        GlobInit::I32(0),
    );
    let ty = module.add_func_type(vec![], vec![]);
    let start = module.add_func(
        ty,
        0,
        Asm::new().i32c(7).op(op::GLOBAL_SET).u(0).build(),
    );
    module.set_start(start);
    module.export_glob("g", glob);

    let (store, id) = instantiate(module.build());
    let handle = store.instance(id).get_export("g").unwrap();
    let global = store.global(handle.as_global().unwrap());
    assert_eq!(global.value().as_i32(), 7);
}

#[test]
fn data_segment_initializes_memory() {
    let mut module = ModuleBuilder::new();
    let memory = module.add_memory(MemoryType {
        min_pages: 1,
        max_pages: Some(1),
    });
    module.add_data_segment(DataSegment {
        memory,
        base: None,
        offset: 4,
        data: vec![1, 2, 3],
    });
    module.export_memory("memory", memory);

    let (store, id) = instantiate(module.build());
    let handle = store.instance(id).get_export("memory").unwrap();
    let memory = store.memory(handle.as_memory().unwrap());
    assert_eq!(memory.read(4, 3), Ok(&[1u8, 2, 3][..]));
    assert_eq!(memory.read(3, 1), Ok(&[0u8][..]));
}

#[test]
fn element_segment_populates_table() {
    let mut module = ModuleBuilder::new();
    let table = module.add_table(TableType {
        ty: ValueType::FuncRef,
        min: 4,
        max: Some(4),
    });
    let ty = module.add_func_type(vec![], vec![]);
    let func = module.add_func(ty, 0, Asm::new().build());
    module.add_table_segment(TableSegment {
        table,
        offset: 1,
        funcs: vec![func],
    });
    module.export_table("table", table);

    let (store, id) = instantiate(module.build());
    let handle = store.instance(id).get_export("table").unwrap();
    let table = store.table(handle.as_table().unwrap());
    assert!(table.get(1).unwrap().is_some());
    assert_eq!(table.lookup(0), Err(Trap::UndefinedElement));
}

// ———————————————————————————— Helper Functions ———————————————————————————— //

/// type = struct { mut i32, mut i32 }
fn pair_struct() -> TypeDef {
    TypeDef::new(CompositeType::Struct(StructType {
        fields: vec![
            FieldType::mutable(ValueType::I32),
            FieldType::mutable(ValueType::I32),
        ],
    }))
}

/// type = array (mut i32)
fn i32_array() -> TypeDef {
    TypeDef::new(CompositeType::Array(ArrayType {
        element: FieldType::mutable(ValueType::I32),
    }))
}

fn instantiate(module: Module) -> (Store, InstanceId) {
    let mut store = Store::new();
    let id = Instance::instantiate(&mut store, module, "main_mod").unwrap();
    (store, id)
}

/// Calls the function exported as "main" and returns its first result as an i32.
fn call_main(store: &mut Store, id: InstanceId, args: &[i32]) -> Result<i32, RuntimeError> {
    let func = store.instance(id).get_func("main").unwrap();
    let args: Vec<StackValue> = args.iter().map(|arg| StackValue::from_i32(*arg)).collect();
    let results = Vm::invoke(store, func, &args)?;
    Ok(results.first().map(|value| value.as_i32()).unwrap_or(0))
}

/// Instantiates a module and calls its "main" export.
fn execute(module: Module, args: &[i32]) -> Result<i32, RuntimeError> {
    let (mut store, id) = instantiate(module);
    call_main(&mut store, id, args)
}

/// A small assembler for raw function bodies.
struct Asm {
    code: Vec<u8>,
}

impl Asm {
    fn new() -> Self {
        Self { code: Vec::new() }
    }

    fn op(mut self, opcode: u8) -> Self {
        self.code.push(opcode);
        self
    }

    /// Emits the `0xFB` prefix followed by a GC sub-opcode.
    fn gc(mut self, sub: u32) -> Self {
        self.code.push(op::GC_PREFIX);
        self.code.extend(uleb(sub));
        self
    }

    /// Emits an unsigned LEB128 immediate.
    fn u(mut self, imm: u32) -> Self {
        self.code.extend(uleb(imm));
        self
    }

    /// Emits a signed LEB128 immediate (heap types, block types).
    fn s(mut self, imm: i64) -> Self {
        self.code.extend(sleb(imm));
        self
    }

    /// Emits `i32.const imm`.
    fn i32c(mut self, imm: i32) -> Self {
        self.code.push(op::I32_CONST);
        self.code.extend(sleb(imm as i64));
        self
    }

    fn build(mut self) -> Vec<u8> {
        self.code.push(op::END);
        self.code
    }
}

fn uleb(mut value: u32) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

fn sleb(mut value: i64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}
