#![no_std]
//! ## Collections used through the runtime.
//!
//! The entity-indexed maps come from the `cranelift_entity` crate: every kind of runtime object
//! (function, memory, table, ...) gets its own index type, so handles to different registries can
//! not be mixed up.

extern crate alloc;
use alloc::vec::Vec;

use core::marker::PhantomData;
use core::ops::{Index, IndexMut};

// ——————————————————————————————— Re-Exports ——————————————————————————————— //

pub use cranelift_entity::entity_impl;
pub use cranelift_entity::{EntityRef, PrimaryMap, SecondaryMap};
pub use hashbrown::HashMap;

// ———————————————————————————— New Collections ————————————————————————————— //

/// A fixed length map with tagged indexes.
///
/// The values can still be modified, but the set of keys is fixed. A new FrozenMap can be created
/// either by consuming a PrimaryMap, or by mapping another FrozenMap.
pub struct FrozenMap<K, V> {
    elems: Vec<V>,
    unused: PhantomData<K>,
}

impl<K, V> FrozenMap<K, V>
where
    K: EntityRef,
{
    /// Freeze a PrimaryMap, meaning that no new items can be added. It is still possible to mutate
    /// the existing entries.
    pub fn freeze(map: PrimaryMap<K, V>) -> Self {
        // PrimaryMap does not expose its internal vector, so the elements are moved into a fresh
        // one.
        let elems = map.into_iter().map(|(_, v)| v).collect();
        Self {
            elems,
            unused: PhantomData,
        }
    }

    /// Creates an empty map.
    pub const fn empty() -> Self {
        Self {
            elems: Vec::new(),
            unused: PhantomData,
        }
    }

    pub fn map<F, U>(&self, f: F) -> FrozenMap<K, U>
    where
        F: FnMut(&V) -> U,
    {
        let elems = self.elems.iter().map(f).collect();
        FrozenMap {
            elems,
            unused: PhantomData,
        }
    }

    pub fn try_map<F, U, E>(&self, mut f: F) -> Result<FrozenMap<K, U>, E>
    where
        F: FnMut(&V) -> Result<U, E>,
    {
        let mut elems = Vec::with_capacity(self.len());
        for elem in &self.elems {
            elems.push(f(elem)?);
        }
        Ok(FrozenMap {
            elems,
            unused: PhantomData,
        })
    }

    /// Same as [`Self::try_map`], but the closure also receives the key.
    pub fn try_map_enumerate<F, U, E>(&self, mut f: F) -> Result<FrozenMap<K, U>, E>
    where
        F: FnMut(K, &V) -> Result<U, E>,
    {
        let mut elems = Vec::with_capacity(self.len());
        for (idx, elem) in self.elems.iter().enumerate() {
            elems.push(f(K::new(idx), elem)?);
        }
        Ok(FrozenMap {
            elems,
            unused: PhantomData,
        })
    }

    /// Get the element at `k` if it exists.
    pub fn get(&self, k: K) -> Option<&V> {
        self.elems.get(k.index())
    }

    /// Get the element at `k` if it exists, mutable version.
    pub fn get_mut(&mut self, k: K) -> Option<&mut V> {
        self.elems.get_mut(k.index())
    }

    /// Get the number of elements in the map.
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// Iterate over all keys and values in the map.
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.elems
            .iter()
            .enumerate()
            .map(|(idx, elem)| (K::new(idx), elem))
    }

    /// Iterate over all keys and values in the map, mutable version.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut V)> {
        self.elems
            .iter_mut()
            .enumerate()
            .map(|(idx, elem)| (K::new(idx), elem))
    }

    /// Iterate over all the values.
    pub fn values(&self) -> core::slice::Iter<V> {
        self.elems.iter()
    }

    /// Iterate over all the keys.
    pub fn keys(&self) -> impl Iterator<Item = K> {
        (0..self.elems.len()).map(K::new)
    }
}

impl<K, V> FromIterator<V> for FrozenMap<K, V>
where
    K: EntityRef,
{
    fn from_iter<T: IntoIterator<Item = V>>(iter: T) -> Self {
        Self {
            elems: iter.into_iter().collect(),
            unused: PhantomData,
        }
    }
}

/// Immutable indexing into a `FrozenMap`.
impl<K, V> Index<K> for FrozenMap<K, V>
where
    K: EntityRef,
{
    type Output = V;

    fn index(&self, k: K) -> &V {
        &self.elems[k.index()]
    }
}

/// Mutable indexing into a `FrozenMap`.
impl<K, V> IndexMut<K> for FrozenMap<K, V>
where
    K: EntityRef,
{
    fn index_mut(&mut self, k: K) -> &mut V {
        &mut self.elems[k.index()]
    }
}
