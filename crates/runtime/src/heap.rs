//! GC Heap
//!
//! Struct and array objects live in a slot arena. References handed out to wasm code are slot
//! indices rather than pointers: the collector never moves objects, so an address stays valid
//! for the whole lifetime of the object it names.
//!
//! Collection is mark and sweep: the caller hands over every root word (operand stack, frame
//! locals, globals, table entries), reachable slots are marked breadth-first, and unmarked slots
//! are linked into a LIFO free list that later allocations consume before the arena grows.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

use log::debug;

use crate::error::Trap;
use crate::types::TypeIndex;
use crate::values::{StackValue, WideValue};

/// Number of allocations after which a collection is requested.
const DEFAULT_GC_THRESHOLD: u32 = 1024;

/// Tuning knobs for the GC heap.
#[derive(Clone, Copy, Debug)]
pub struct HeapConfig {
    /// Number of allocations between two collection requests.
    pub gc_threshold: u32,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            gc_threshold: DEFAULT_GC_THRESHOLD,
        }
    }
}

// ———————————————————————————————— Objects ————————————————————————————————— //

/// The payload of a heap object: struct fields or array elements, stored as raw operand stack
/// words either way.
#[derive(Debug, PartialEq)]
enum GcPayload {
    Struct(Box<[StackValue]>),
    Array(Box<[StackValue]>),
}

/// A struct or array object.
#[derive(Debug, PartialEq)]
pub struct GcObject {
    type_index: TypeIndex,
    payload: GcPayload,
}

impl GcObject {
    /// The object's type, an index into the owning module's type section.
    pub fn type_index(&self) -> TypeIndex {
        self.type_index
    }

    pub fn is_struct(&self) -> bool {
        matches!(self.payload, GcPayload::Struct(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self.payload, GcPayload::Array(_))
    }

    /// Number of fields or elements.
    pub fn len(&self) -> usize {
        self.words().len()
    }

    pub fn is_empty(&self) -> bool {
        self.words().is_empty()
    }

    /// Reads a field or element.
    pub fn get(&self, index: u32) -> Result<StackValue, Trap> {
        self.words()
            .get(index as usize)
            .copied()
            .ok_or(Trap::HeapOutOfBounds)
    }

    /// Writes a field or element.
    pub fn set(&mut self, index: u32, value: StackValue) -> Result<(), Trap> {
        match self.words_mut().get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Trap::HeapOutOfBounds),
        }
    }

    fn words(&self) -> &[StackValue] {
        match &self.payload {
            GcPayload::Struct(words) | GcPayload::Array(words) => words,
        }
    }

    fn words_mut(&mut self) -> &mut [StackValue] {
        match &mut self.payload {
            GcPayload::Struct(words) | GcPayload::Array(words) => words,
        }
    }
}

// ————————————————————————————————— Heap ——————————————————————————————————— //

enum Slot {
    Occupied { object: GcObject, marked: bool },
    Free { next_free: Option<u32> },
}

/// The garbage collected heap of a store.
pub struct GcHeap {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    alloc_since_gc: u32,
    config: HeapConfig,
}

impl GcHeap {
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    pub fn with_config(config: HeapConfig) -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            alloc_since_gc: 0,
            config,
        }
    }

    /// Allocates a struct object and returns its address.
    pub fn alloc_struct(&mut self, type_index: TypeIndex, fields: Vec<StackValue>) -> u32 {
        self.alloc(GcObject {
            type_index,
            payload: GcPayload::Struct(fields.into_boxed_slice()),
        })
    }

    /// Allocates an array of `len` copies of `init`.
    pub fn alloc_array(&mut self, type_index: TypeIndex, len: u32, init: StackValue) -> u32 {
        self.alloc(GcObject {
            type_index,
            payload: GcPayload::Array(vec![init; len as usize].into_boxed_slice()),
        })
    }

    /// Allocates an array from explicit element values.
    pub fn alloc_array_with(&mut self, type_index: TypeIndex, elems: Vec<StackValue>) -> u32 {
        self.alloc(GcObject {
            type_index,
            payload: GcPayload::Array(elems.into_boxed_slice()),
        })
    }

    fn alloc(&mut self, object: GcObject) -> u32 {
        self.alloc_since_gc += 1;
        match self.free_head {
            Some(idx) => {
                match &self.slots[idx as usize] {
                    Slot::Free { next_free } => self.free_head = *next_free,
                    Slot::Occupied { .. } => unreachable!("free list entry is occupied"),
                }
                self.slots[idx as usize] = Slot::Occupied {
                    object,
                    marked: false,
                };
                idx
            }
            None => {
                self.slots.push(Slot::Occupied {
                    object,
                    marked: false,
                });
                (self.slots.len() - 1) as u32
            }
        }
    }

    /// Returns the object at `addr`, trapping when the address is out of range or freed.
    pub fn get(&self, addr: u32) -> Result<&GcObject, Trap> {
        match self.slots.get(addr as usize) {
            Some(Slot::Occupied { object, .. }) => Ok(object),
            _ => Err(Trap::HeapOutOfBounds),
        }
    }

    /// Mutable version of [`Self::get`].
    pub fn get_mut(&mut self, addr: u32) -> Result<&mut GcObject, Trap> {
        match self.slots.get_mut(addr as usize) {
            Some(Slot::Occupied { object, .. }) => Ok(object),
            _ => Err(Trap::HeapOutOfBounds),
        }
    }

    /// Encodes a heap address as an operand stack word.
    pub fn encode_ref(&self, addr: u32) -> StackValue {
        StackValue::encode_gc_ref(addr)
    }

    /// Decodes an operand stack word into a heap address.
    pub fn decode_ref(&self, value: StackValue) -> Result<u32, Trap> {
        value.decode_gc_ref()
    }

    /// True when enough allocations happened since the last collection for a cycle to be worth
    /// running. Callers check this right before allocating.
    pub fn should_collect(&self) -> bool {
        self.alloc_since_gc >= self.config.gc_threshold
    }

    /// Number of slots in the arena, free or not.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live objects.
    pub fn live_objects(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Occupied { .. }))
            .count()
    }

    /// Runs a mark and sweep collection.
    ///
    /// `roots` must contain every word that can directly reach a heap object: the operand
    /// stack, the locals of all active frames, the globals, and the table entries. Null, i31,
    /// and untagged words are skipped by the tag test; a tagged word whose address does not name
    /// a live slot is treated as a raw integer that happens to carry the tag bit.
    pub fn collect(&mut self, roots: &[StackValue]) {
        // Clear marks so that a previous cycle can not leak liveness into this one.
        for slot in &mut self.slots {
            if let Slot::Occupied { marked, .. } = slot {
                *marked = false;
            }
        }

        // Mark phase, breadth-first. Marking before enqueueing guarantees termination on cyclic
        // object graphs.
        let mut queue = VecDeque::new();
        for root in roots {
            self.mark(*root, &mut queue);
        }
        while let Some(addr) = queue.pop_front() {
            let words: Vec<StackValue> = match &self.slots[addr as usize] {
                Slot::Occupied { object, .. } => object.words().to_vec(),
                Slot::Free { .. } => continue,
            };
            for word in words {
                self.mark(word, &mut queue);
            }
        }

        // Sweep phase: unmarked slots join the free list, survivors get their mark cleared so
        // that all mark bits are clear outside a cycle.
        let mut freed = 0usize;
        for idx in 0..self.slots.len() {
            let reclaim = match &mut self.slots[idx] {
                Slot::Occupied { marked, .. } => {
                    if *marked {
                        *marked = false;
                        false
                    } else {
                        true
                    }
                }
                Slot::Free { .. } => false,
            };
            if reclaim {
                // Dropping the slot releases the field/element buffer.
                self.slots[idx] = Slot::Free {
                    next_free: self.free_head,
                };
                self.free_head = Some(idx as u32);
                freed += 1;
            }
        }

        self.alloc_since_gc = 0;
        debug!("gc: freed {} of {} slots", freed, self.slots.len());
    }

    /// Same as [`Self::collect`], for the wide operand stack layout.
    pub fn collect_wide(&mut self, roots: &[WideValue]) {
        let narrow: Vec<StackValue> = roots.iter().map(|root| root.narrow()).collect();
        self.collect(&narrow);
    }

    /// Marks the slot referenced by `word`, if any, and queues it for tracing.
    fn mark(&mut self, word: StackValue, queue: &mut VecDeque<u32>) {
        if !word.is_gc_ref() {
            return;
        }
        let Ok(addr) = word.decode_gc_ref() else {
            return;
        };
        match self.slots.get_mut(addr as usize) {
            Some(Slot::Occupied { marked, .. }) if !*marked => {
                *marked = true;
                queue.push_back(addr);
            }
            _ => {}
        }
    }
}

impl Default for GcHeap {
    fn default() -> Self {
        Self::new()
    }
}
