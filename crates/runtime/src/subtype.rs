//! Heap Subtype Checking

use collections::FrozenMap;

use crate::heap::GcHeap;
use crate::types::{HeapType, TypeDef, TypeIndex};
use crate::values::StackValue;

/// Returns true when `sub` is a concrete subtype of `sup`.
///
/// Every type is a subtype of itself. Only the first super type entry is walked (single
/// inheritance); an empty chain or an out of range index ends the walk without a match. The walk
/// is bounded by the number of type definitions, so a malformed cyclic chain can not loop.
pub fn is_concrete_subtype(
    types: &FrozenMap<TypeIndex, TypeDef>,
    sub: TypeIndex,
    sup: TypeIndex,
) -> bool {
    let mut current = sub;
    for _ in 0..=types.len() {
        if current == sup {
            return true;
        }
        match types.get(current) {
            Some(def) => match def.supers.first() {
                Some(&parent) => current = parent,
                None => return false,
            },
            None => return false,
        }
    }
    false
}

/// Checks a runtime value against a heap type.
///
/// The object type of a GC reference lives in the heap, which is why the heap is always
/// required. Untagged words carry no dynamic type: they are funcrefs (or externrefs, which the
/// encoding can not tell apart) and only match `func` besides the non-null `any` rule; finer
/// discrimination is the static type system's job.
pub fn matches_heap_type(
    value: StackValue,
    target: HeapType,
    types: &FrozenMap<TypeIndex, TypeDef>,
    heap: &GcHeap,
) -> bool {
    if value.is_null() {
        return false;
    }
    match target {
        HeapType::Any => return true,
        HeapType::None => return false,
        _ => {}
    }
    if value.is_i31() {
        return matches!(target, HeapType::I31 | HeapType::Eq);
    }
    if value.is_gc_ref() {
        let Ok(addr) = value.decode_gc_ref() else {
            return false;
        };
        let Ok(object) = heap.get(addr) else {
            return false;
        };
        return match target {
            HeapType::Eq => true,
            HeapType::Struct => object.is_struct(),
            HeapType::Array => object.is_array(),
            HeapType::Concrete(sup) => is_concrete_subtype(types, object.type_index(), sup),
            _ => false,
        };
    }
    matches!(target, HeapType::Func)
}
