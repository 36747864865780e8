//! eBPF Map registry.
//!
//! Maps are created from a [`MapDef`] and addressed by a small integer fd,
//! the same value programs pass in r1 of the map helpers. Every map type
//! implements [`BpfMap`]; the registry only hands out shared handles, so a
//! map stays alive while a helper is using it even if it is destroyed
//! concurrently.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::any::Any;

use spin::Mutex;

use crate::error::{BpfError, Result};
use crate::perf_event::PerfEventArray;
use crate::rcu::{self, RcuReadGuard};
use crate::stackmap::StackTraceStore;

/// Map type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapType {
    /// Call stacks indexed by stack id.
    StackTrace,
    /// Per-slot perf event targets for `perf_event_output`/`perf_event_read`.
    PerfEventArray,
}

/// Map definition for creating new maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapDef {
    /// Type of map.
    pub map_type: MapType,
    /// Size of key in bytes.
    pub key_size: u32,
    /// Size of value in bytes.
    pub value_size: u32,
    /// Maximum number of entries.
    pub max_entries: u32,
}

/// Operations shared by every map type.
///
/// Implementations must be usable from the dispatch path: no method may
/// block except through the map's own short internal locks.
pub trait BpfMap: Send + Sync {
    /// Definition the map was created from.
    fn def(&self) -> &MapDef;

    /// Borrow the value stored under `key` for as long as `guard` lives.
    fn lookup_elem<'g>(&'g self, key: &[u8], guard: &'g RcuReadGuard) -> Result<&'g [u8]>;

    /// Copy the value stored under `key`.
    fn lookup_copy(&self, key: &[u8]) -> Result<Vec<u8>> {
        let guard = rcu::read_lock();
        let value = self.lookup_elem(key, &guard)?.to_vec();
        Ok(value)
    }

    /// Store `value` under `key`.
    fn update_elem(&self, key: &[u8], value: &[u8], flags: u64) -> Result<()>;

    /// Remove the value under `key`.
    fn delete_elem(&self, key: &[u8]) -> Result<()>;

    /// Write the key following `key` (or the first key) into `next_key`.
    fn get_next_key(&self, key: Option<&[u8]>, next_key: &mut [u8]) -> Result<()>;

    /// Shared handle for downcasting to the concrete map type.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Global map registry.
static MAP_REGISTRY: Mutex<Vec<Option<Arc<dyn BpfMap>>>> = Mutex::new(Vec::new());

/// Create a new map and return its fd.
///
/// # Arguments
/// * `def` - Map definition specifying type, sizes, and capacity.
///
/// # Returns
/// Map fd on success. Validation errors come from the map type.
pub fn create(def: &MapDef) -> Result<u32> {
    let map: Arc<dyn BpfMap> = match def.map_type {
        MapType::StackTrace => Arc::new(StackTraceStore::from_def(def)?),
        MapType::PerfEventArray => Arc::new(PerfEventArray::from_def(def)?),
    };
    let fd = register(map);
    log::debug!("Created map {} with type {:?}", fd, def.map_type);
    Ok(fd)
}

/// Register an already constructed map and return its fd.
pub fn register(map: Arc<dyn BpfMap>) -> u32 {
    let mut registry = MAP_REGISTRY.lock();

    // Find empty slot or append
    for (i, slot) in registry.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(map);
            return i as u32;
        }
    }

    let fd = registry.len() as u32;
    registry.push(Some(map));
    fd
}

/// Shared handle to the map behind `fd`.
pub fn get(fd: u32) -> Option<Arc<dyn BpfMap>> {
    let registry = MAP_REGISTRY.lock();
    registry.get(fd as usize)?.clone()
}

/// The stack-trace map behind `fd`, if `fd` is one.
pub fn stack_map(fd: u32) -> Option<Arc<StackTraceStore>> {
    get(fd)?.into_any().downcast::<StackTraceStore>().ok()
}

/// The perf event array behind `fd`, if `fd` is one.
pub fn perf_event_array(fd: u32) -> Option<Arc<PerfEventArray>> {
    get(fd)?.into_any().downcast::<PerfEventArray>().ok()
}

/// Lookup an element in a map.
///
/// # Arguments
/// * `fd` - Map fd returned by create().
/// * `key` - Key bytes.
///
/// # Returns
/// A copy of the value bytes.
pub fn lookup_elem(fd: u32, key: &[u8]) -> Result<Vec<u8>> {
    get(fd).ok_or(BpfError::NotFound)?.lookup_copy(key)
}

/// Update an element in a map.
///
/// # Arguments
/// * `fd` - Map fd.
/// * `key` - Key bytes.
/// * `value` - Value bytes.
/// * `flags` - Update flags, interpreted by the map type.
pub fn update_elem(fd: u32, key: &[u8], value: &[u8], flags: u64) -> Result<()> {
    get(fd)
        .ok_or(BpfError::NotFound)?
        .update_elem(key, value, flags)
}

/// Delete an element from a map.
pub fn delete_elem(fd: u32, key: &[u8]) -> Result<()> {
    get(fd).ok_or(BpfError::NotFound)?.delete_elem(key)
}

/// Key following `key`, or the first key when `key` is `None`.
pub fn get_next_key(fd: u32, key: Option<&[u8]>) -> Result<Vec<u8>> {
    let map = get(fd).ok_or(BpfError::NotFound)?;
    let mut next = vec![0u8; map.def().key_size as usize];
    map.get_next_key(key, &mut next)?;
    Ok(next)
}

/// Get the number of maps in the registry.
pub fn count() -> usize {
    let registry = MAP_REGISTRY.lock();
    registry.iter().filter(|s| s.is_some()).count()
}

/// Delete a map by fd.
///
/// Entries are released once in-flight readers are done with them.
pub fn destroy(fd: u32) -> Result<()> {
    let map = {
        let mut registry = MAP_REGISTRY.lock();
        let slot = registry.get_mut(fd as usize).ok_or(BpfError::NotFound)?;
        slot.take().ok_or(BpfError::NotFound)?
    };
    // Dropped outside the registry lock; the last handle retires the entries.
    drop(map);
    log::debug!("Destroyed map {}", fd);
    Ok(())
}
