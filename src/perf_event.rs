//! Perf event array: per-slot conduits from programs to observers.
//!
//! Each slot holds a [`PerfEvent`] installed by the control plane: the kind
//! of event, the execution unit it is bound to, and the [`PerfEventSink`]
//! that receives records. Programs reach a slot by index through
//! `perf_event_output` (raw records) or `perf_event_read` (counter values).
//! Both checks run against the emitting unit so a record never lands in a
//! buffer owned by another unit.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::error::{BpfError, Result};
use crate::maps::{BpfMap, MapDef, MapType};
use crate::platform;
use crate::rcu::{self, RcuCell, RcuReadGuard};

/// Records kept by a [`PerfBuffer`] unless configured otherwise.
pub const DEFAULT_PERF_BUFFER_CAPACITY: usize = 4096;

/// What a perf event counts or carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfEventKind {
    /// Generalized hardware counter.
    Hardware,
    /// Raw PMU counter.
    Raw,
    /// Software counter other than the program output channel.
    Software,
    /// Software event that carries raw records from programs.
    BpfOutput,
}

impl PerfEventKind {
    /// Whether programs may emit records into events of this kind.
    pub fn accepts_output(self) -> bool {
        self == Self::BpfOutput
    }

    /// Whether programs may read the counter of events of this kind.
    pub fn is_readable_counter(self) -> bool {
        matches!(self, Self::Hardware | Self::Raw)
    }
}

/// One record emitted by a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfRecord {
    /// Monotonic timestamp in nanoseconds.
    pub timestamp_ns: u64,
    /// Emitting execution unit.
    pub cpu: u32,
    /// Raw payload, copied out of program memory.
    pub data: Vec<u8>,
}

/// Receiver behind a perf event slot.
///
/// Called on the dispatch path: implementations must not block.
pub trait PerfEventSink: Send + Sync {
    /// Accept one raw record.
    fn output(&self, record: PerfRecord) -> Result<()>;

    /// Current counter value, for counting events.
    fn read_counter(&self) -> u64 {
        0
    }
}

/// An installed perf event.
pub struct PerfEvent {
    kind: PerfEventKind,
    owner_cpu: u32,
    sink: Arc<dyn PerfEventSink>,
}

impl PerfEvent {
    /// Create an event of `kind` bound to execution unit `owner_cpu`.
    pub fn new(kind: PerfEventKind, owner_cpu: u32, sink: Arc<dyn PerfEventSink>) -> Self {
        Self {
            kind,
            owner_cpu,
            sink,
        }
    }

    pub fn kind(&self) -> PerfEventKind {
        self.kind
    }

    pub fn owner_cpu(&self) -> u32 {
        self.owner_cpu
    }

    pub fn sink(&self) -> &Arc<dyn PerfEventSink> {
        &self.sink
    }
}

// =============================================================================
// PerfBuffer
// =============================================================================

/// Bounded in-memory sink.
///
/// Records arriving while the buffer is full are dropped and counted as lost,
/// leaving what the consumer has not read yet intact.
pub struct PerfBuffer {
    records: Mutex<VecDeque<PerfRecord>>,
    capacity: usize,
    lost: AtomicU64,
    counter: AtomicU64,
}

impl PerfBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PERF_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity,
            lost: AtomicU64::new(0),
            counter: AtomicU64::new(0),
        }
    }

    /// Read and consume records.
    ///
    /// `max_records == 0` means no explicit limit.
    pub fn consume(&self, max_records: usize) -> Vec<PerfRecord> {
        let limit = if max_records == 0 {
            usize::MAX
        } else {
            max_records
        };
        let mut q = self.records.lock();
        let n = limit.min(q.len());
        q.drain(..n).collect()
    }

    /// Records waiting to be consumed.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records dropped because the buffer was full.
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Set the value reported by `perf_event_read`.
    pub fn set_counter(&self, value: u64) {
        self.counter.store(value, Ordering::Relaxed);
    }

    /// Bump the value reported by `perf_event_read`.
    pub fn add_counter(&self, delta: u64) {
        self.counter.fetch_add(delta, Ordering::Relaxed);
    }
}

impl Default for PerfBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PerfEventSink for PerfBuffer {
    fn output(&self, record: PerfRecord) -> Result<()> {
        let mut q = self.records.lock();
        if q.len() >= self.capacity {
            self.lost.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        q.try_reserve(1).map_err(|_| BpfError::OutOfMemory)?;
        q.push_back(record);
        Ok(())
    }

    fn read_counter(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

// =============================================================================
// PerfEventArray
// =============================================================================

/// Map of perf event slots indexed by `u32`.
pub struct PerfEventArray {
    def: MapDef,
    slots: Box<[RcuCell<PerfEvent>]>,
}

impl PerfEventArray {
    /// Create an array with `max_entries` empty slots.
    pub fn new(max_entries: u32) -> Result<Self> {
        Self::from_def(&MapDef {
            map_type: MapType::PerfEventArray,
            key_size: 4,
            value_size: 4,
            max_entries,
        })
    }

    /// Create an array from a generic map definition.
    ///
    /// Keys and values are both 4 bytes; values are opaque event handles.
    pub fn from_def(def: &MapDef) -> Result<Self> {
        if def.max_entries == 0 || def.key_size != 4 || def.value_size != 4 {
            return Err(BpfError::InvalidArgument);
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(def.max_entries as usize)
            .map_err(|_| BpfError::OutOfMemory)?;
        slots.extend((0..def.max_entries).map(|_| RcuCell::empty()));
        Ok(Self {
            def: def.clone(),
            slots: slots.into_boxed_slice(),
        })
    }

    pub fn max_entries(&self) -> u32 {
        self.slots.len() as u32
    }

    fn slot(&self, index: u64) -> Result<&RcuCell<PerfEvent>> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.slots.get(i))
            .ok_or(BpfError::TooBig)
    }

    /// Install `event` at `index`, replacing any previous event.
    pub fn set(&self, index: u32, event: PerfEvent) -> Result<()> {
        self.slot(u64::from(index))?.replace(Some(Box::new(event)));
        Ok(())
    }

    /// Remove the event at `index`.
    pub fn clear(&self, index: u32) -> Result<()> {
        if self.slot(u64::from(index))?.take() {
            Ok(())
        } else {
            Err(BpfError::NotFound)
        }
    }

    /// Emit `data` as one raw record through the event at `index`.
    ///
    /// # Errors
    /// * `TooBig` - `index` is outside the array.
    /// * `NotFound` - no event is installed at `index`.
    /// * `Unsupported` - the event does not carry program output.
    /// * `WrongContext` - the event belongs to another execution unit.
    pub fn output(&self, index: u64, data: &[u8]) -> Result<()> {
        let slot = self.slot(index)?;
        let guard = rcu::read_lock();
        let event = slot.load(&guard).ok_or(BpfError::NotFound)?;

        if !event.kind.accepts_output() {
            return Err(BpfError::Unsupported);
        }
        let cpu = platform::cpu_id();
        if event.owner_cpu != cpu {
            return Err(BpfError::WrongContext);
        }

        let mut payload = Vec::new();
        payload
            .try_reserve_exact(data.len())
            .map_err(|_| BpfError::OutOfMemory)?;
        payload.extend_from_slice(data);

        event.sink.output(PerfRecord {
            timestamp_ns: platform::time_ns(),
            cpu,
            data: payload,
        })
    }

    /// Read the local counter of the event at `index`.
    ///
    /// # Errors
    /// * `TooBig` / `NotFound` - as for [`output`](Self::output).
    /// * `InvalidArgument` - the event belongs to another execution unit or
    ///   is not a hardware or raw counter.
    pub fn read_counter(&self, index: u64) -> Result<u64> {
        let slot = self.slot(index)?;
        let guard = rcu::read_lock();
        let event = slot.load(&guard).ok_or(BpfError::NotFound)?;

        if event.owner_cpu != platform::cpu_id() || !event.kind.is_readable_counter() {
            return Err(BpfError::InvalidArgument);
        }
        Ok(event.sink.read_counter())
    }
}

impl BpfMap for PerfEventArray {
    fn def(&self) -> &MapDef {
        &self.def
    }

    fn lookup_elem<'g>(&'g self, _key: &[u8], _guard: &'g RcuReadGuard) -> Result<&'g [u8]> {
        // Slots hold live handles, not plain values.
        Err(BpfError::Unsupported)
    }

    fn update_elem(&self, _key: &[u8], _value: &[u8], _flags: u64) -> Result<()> {
        // Events are installed through `set`.
        Err(BpfError::InvalidArgument)
    }

    fn delete_elem(&self, key: &[u8]) -> Result<()> {
        let bytes: [u8; 4] = key.try_into().map_err(|_| BpfError::InvalidArgument)?;
        self.clear(u32::from_le_bytes(bytes))
    }

    fn get_next_key(&self, key: Option<&[u8]>, next_key: &mut [u8]) -> Result<()> {
        let next = match key {
            None => 0,
            Some(k) => {
                let bytes: [u8; 4] = k.try_into().map_err(|_| BpfError::InvalidArgument)?;
                let index = u32::from_le_bytes(bytes);
                if index >= self.max_entries() {
                    0
                } else {
                    index.checked_add(1).ok_or(BpfError::NotFound)?
                }
            }
        };
        if next >= self.max_entries() {
            return Err(BpfError::NotFound);
        }
        let out = next_key.get_mut(..4).ok_or(BpfError::InvalidArgument)?;
        out.copy_from_slice(&next.to_le_bytes());
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
