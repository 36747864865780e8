//! Stack-trace deduplication map.
//!
//! A fixed, power-of-two array of buckets. Each bucket holds at most one
//! captured call stack; the bucket index is the stack id handed back to the
//! program. Ids are derived from a 32-bit digest of the frames, so two
//! different stacks may compete for one bucket. Such a conflict is reported
//! unless the caller explicitly allows the old stack to be evicted.
//!
//! Buckets are published through [`RcuCell`]: readers never block, and a
//! replaced or deleted stack is freed only after every reader that could
//! still see it has left its read-side section.

pub mod jhash;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::mem::size_of;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{BpfError, Result};
use crate::maps::{BpfMap, MapDef, MapType};
use crate::platform::{self, PAGE_SIZE, PtRegs};
use crate::rcu::{self, RcuCell, RcuReadGuard};

/// Deepest stack a single bucket can hold.
pub const PERF_MAX_STACK_DEPTH: u32 = 127;

/// `get_stackid` flag bits.
pub mod flags {
    /// Number of innermost frames to drop.
    pub const SKIP_FIELD_MASK: u64 = 0xff;
    /// Capture the user-space stack instead of the kernel one.
    pub const USER_STACK: u64 = 1 << 8;
    /// Trust a matching digest without comparing frames.
    pub const FAST_STACK_CMP: u64 = 1 << 9;
    /// Evict a different stack that already occupies the bucket.
    pub const REUSE_STACKID: u64 = 1 << 10;

    pub(crate) const ALL: u64 = SKIP_FIELD_MASK | USER_STACK | FAST_STACK_CMP | REUSE_STACKID;
}

/// Decoded `get_stackid` flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackIdFlags {
    /// Innermost frames to drop before hashing.
    pub skip: u32,
    /// Walk the user stack.
    pub user: bool,
    /// Accept a digest match as identity.
    pub fast_compare: bool,
    /// Replace a conflicting occupant.
    pub reuse_on_collision: bool,
}

impl StackIdFlags {
    /// Decode raw flag bits, rejecting anything unknown.
    pub fn from_bits(bits: u64) -> Result<Self> {
        if bits & !flags::ALL != 0 {
            return Err(BpfError::InvalidArgument);
        }
        Ok(Self {
            skip: (bits & flags::SKIP_FIELD_MASK) as u32,
            user: bits & flags::USER_STACK != 0,
            fast_compare: bits & flags::FAST_STACK_CMP != 0,
            reuse_on_collision: bits & flags::REUSE_STACKID != 0,
        })
    }

    /// Encode back into raw flag bits.
    pub fn bits(&self) -> u64 {
        let mut bits = u64::from(self.skip) & flags::SKIP_FIELD_MASK;
        if self.user {
            bits |= flags::USER_STACK;
        }
        if self.fast_compare {
            bits |= flags::FAST_STACK_CMP;
        }
        if self.reuse_on_collision {
            bits |= flags::REUSE_STACKID;
        }
        bits
    }
}

/// One stored stack.
struct StackBucket {
    hash: u32,
    nr: u32,
    /// `max_depth` slots, zero past `nr`.
    ips: Box<[u64]>,
}

impl StackBucket {
    fn new(hash: u32, frames: &[u64], max_depth: usize) -> Result<Box<Self>> {
        let mut ips = Vec::new();
        ips.try_reserve_exact(max_depth)
            .map_err(|_| BpfError::OutOfMemory)?;
        ips.extend_from_slice(frames);
        ips.resize(max_depth, 0);
        Ok(Box::new(Self {
            hash,
            nr: frames.len() as u32,
            ips: ips.into_boxed_slice(),
        }))
    }

    fn frames(&self) -> &[u64] {
        &self.ips[..self.nr as usize]
    }

    fn value_bytes(&self) -> &[u8] {
        // SAFETY: any initialized u64 slice is a valid byte slice of 8x length.
        unsafe {
            core::slice::from_raw_parts(self.ips.as_ptr().cast::<u8>(), self.ips.len() * 8)
        }
    }
}

/// Stack-trace map.
pub struct StackTraceStore {
    def: MapDef,
    max_depth: usize,
    buckets: Box<[RcuCell<StackBucket>]>,
    allocations: AtomicU64,
}

impl StackTraceStore {
    /// Create a store with room for `max_entries` ids (rounded up to a power
    /// of two) of `value_size / 8` frames each.
    pub fn new(max_entries: u32, value_size: u32) -> Result<Self> {
        Self::from_def(&MapDef {
            map_type: MapType::StackTrace,
            key_size: 4,
            value_size,
            max_entries,
        })
    }

    /// Create a store from a generic map definition.
    ///
    /// # Errors
    /// * `InvalidArgument` - zero entries, key not 4 bytes, or a value size
    ///   that is not a positive multiple of 8 up to [`PERF_MAX_STACK_DEPTH`]
    ///   frames.
    /// * `TooBig` - the table would not fit the memory accounting limit.
    /// * `OutOfMemory` - the bucket array could not be allocated.
    pub fn from_def(def: &MapDef) -> Result<Self> {
        if def.max_entries == 0
            || def.key_size != 4
            || def.value_size < 8
            || def.value_size % 8 != 0
            || def.value_size / 8 > PERF_MAX_STACK_DEPTH
        {
            return Err(BpfError::InvalidArgument);
        }

        let n_buckets = def
            .max_entries
            .checked_next_power_of_two()
            .ok_or(BpfError::TooBig)?;

        let limit = u64::from(u32::MAX) - PAGE_SIZE as u64;
        let mut cost = u64::from(n_buckets) * size_of::<RcuCell<StackBucket>>() as u64
            + size_of::<Self>() as u64;
        if cost >= limit {
            return Err(BpfError::TooBig);
        }
        cost += u64::from(n_buckets)
            * (u64::from(def.value_size) + size_of::<StackBucket>() as u64);
        if cost >= limit {
            return Err(BpfError::TooBig);
        }

        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(n_buckets as usize)
            .map_err(|_| BpfError::OutOfMemory)?;
        buckets.extend((0..n_buckets).map(|_| RcuCell::empty()));

        log::debug!(
            "stackmap: {} buckets, depth {}",
            n_buckets,
            def.value_size / 8
        );

        Ok(Self {
            def: def.clone(),
            max_depth: (def.value_size / 8) as usize,
            buckets: buckets.into_boxed_slice(),
            allocations: AtomicU64::new(0),
        })
    }

    /// Number of buckets (the id space).
    pub fn n_buckets(&self) -> u32 {
        self.buckets.len() as u32
    }

    /// Frames stored per entry.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Number of occupied buckets right now.
    pub fn occupied(&self) -> usize {
        self.buckets.iter().filter(|b| !b.is_empty()).count()
    }

    /// Entries allocated over the lifetime of the store.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Capture the stack at `regs` and return its id.
    ///
    /// # Arguments
    /// * `regs` - Registers at the instrumentation point.
    /// * `flags` - Skip count and `flags::*` bits.
    ///
    /// # Errors
    /// * `InvalidArgument` - unknown flag bits.
    /// * `Fault` - no call chain, or nothing left after skipping.
    /// * `AlreadyExists` / `OutOfMemory` - see [`insert_or_get`](Self::insert_or_get).
    pub fn get_stackid(&self, regs: &PtRegs, flags: u64) -> Result<u32> {
        let flags = StackIdFlags::from_bits(flags)?;

        let mut chain = [0u64; PERF_MAX_STACK_DEPTH as usize];
        let nr = platform::ops()
            .callchain(regs, flags.user, &mut chain[..self.max_depth])
            .ok_or(BpfError::Fault)?
            .min(self.max_depth);
        let skip = flags.skip as usize;
        if nr <= skip {
            return Err(BpfError::Fault);
        }

        self.insert_or_get(
            &chain[skip..nr],
            flags.reuse_on_collision,
            flags.fast_compare,
        )
    }

    /// Store `frames` (innermost first) or find the identical stored stack.
    ///
    /// # Errors
    /// * `Fault` - `frames` is empty.
    /// * `TooBig` - more frames than the store holds per entry.
    /// * `AlreadyExists` - the bucket holds a different stack and
    ///   `reuse_on_collision` is false.
    /// * `OutOfMemory` - a new entry could not be allocated.
    pub fn insert_or_get(
        &self,
        frames: &[u64],
        reuse_on_collision: bool,
        fast_compare: bool,
    ) -> Result<u32> {
        if frames.is_empty() {
            return Err(BpfError::Fault);
        }
        if frames.len() > self.max_depth {
            return Err(BpfError::TooBig);
        }
        let hash = jhash::hash_frames(frames);
        self.insert_hashed(hash, frames, reuse_on_collision, fast_compare)
    }

    pub(crate) fn insert_hashed(
        &self,
        hash: u32,
        frames: &[u64],
        reuse_on_collision: bool,
        fast_compare: bool,
    ) -> Result<u32> {
        let id = hash & (self.n_buckets() - 1);
        let slot = &self.buckets[id as usize];

        let matches = |bucket: &StackBucket| {
            bucket.hash == hash && (fast_compare || bucket.frames() == frames)
        };

        {
            let guard = rcu::read_lock();
            if let Some(bucket) = slot.load(&guard) {
                if matches(bucket) {
                    return Ok(id);
                }
                if !reuse_on_collision {
                    return Err(BpfError::AlreadyExists);
                }
            }
        }

        let bucket = StackBucket::new(hash, frames, self.max_depth)?;
        self.allocations.fetch_add(1, Ordering::Relaxed);

        if reuse_on_collision {
            slot.replace(Some(bucket));
            return Ok(id);
        }

        // Another writer may have filled the bucket since the check above.
        if slot.publish_if_empty(bucket).is_err() {
            let guard = rcu::read_lock();
            return match slot.load(&guard) {
                Some(current) if matches(current) => Ok(id),
                _ => Err(BpfError::AlreadyExists),
            };
        }
        Ok(id)
    }

    /// Padded frame buffer stored under `id`, valid while `guard` lives.
    ///
    /// # Errors
    /// * `TooBig` - `id` is outside the table.
    /// * `NotFound` - the bucket is empty.
    pub fn lookup<'g>(&'g self, id: u32, guard: &'g RcuReadGuard) -> Result<&'g [u64]> {
        let slot = self.buckets.get(id as usize).ok_or(BpfError::TooBig)?;
        slot.load(guard)
            .map(|b| &b.ips[..])
            .ok_or(BpfError::NotFound)
    }

    /// Captured frames under `id`, without padding.
    pub fn lookup_frames(&self, id: u32) -> Result<Vec<u64>> {
        let slot = self.buckets.get(id as usize).ok_or(BpfError::TooBig)?;
        let guard = rcu::read_lock();
        slot.load(&guard)
            .map(|b| b.frames().to_vec())
            .ok_or(BpfError::NotFound)
    }

    /// Remove the stack under `id`.
    ///
    /// # Errors
    /// * `TooBig` - `id` is outside the table.
    /// * `NotFound` - the bucket was already empty.
    pub fn delete(&self, id: u32) -> Result<()> {
        let slot = self.buckets.get(id as usize).ok_or(BpfError::TooBig)?;
        if slot.take() {
            Ok(())
        } else {
            Err(BpfError::NotFound)
        }
    }

    /// Enumeration is not offered: ids are sparse and owned by the hash.
    pub fn get_next_key(&self, _id: Option<u32>) -> Result<u32> {
        Err(BpfError::Unsupported)
    }

    /// Destroy the store once in-flight readers are gone.
    ///
    /// Blocks. Must not be called from inside a read-side section.
    ///
    /// # Returns
    /// Number of entries that were still stored.
    pub fn teardown(self) -> usize {
        rcu::synchronize();
        let released = self.buckets.iter().filter(|b| b.take()).count();
        drop(self);
        rcu::barrier();
        log::debug!("stackmap: released {} entries", released);
        released
    }

    fn key_to_id(key: &[u8]) -> Result<u32> {
        let bytes: [u8; 4] = key.try_into().map_err(|_| BpfError::InvalidArgument)?;
        Ok(u32::from_le_bytes(bytes))
    }
}

impl BpfMap for StackTraceStore {
    fn def(&self) -> &MapDef {
        &self.def
    }

    fn lookup_elem<'g>(&'g self, key: &[u8], guard: &'g RcuReadGuard) -> Result<&'g [u8]> {
        let id = Self::key_to_id(key)?;
        let slot = self.buckets.get(id as usize).ok_or(BpfError::TooBig)?;
        slot.load(guard)
            .map(StackBucket::value_bytes)
            .ok_or(BpfError::NotFound)
    }

    fn update_elem(&self, _key: &[u8], _value: &[u8], _flags: u64) -> Result<()> {
        // Entries only come from captured stacks.
        Err(BpfError::InvalidArgument)
    }

    fn delete_elem(&self, key: &[u8]) -> Result<()> {
        self.delete(Self::key_to_id(key)?)
    }

    fn get_next_key(&self, _key: Option<&[u8]>, _next_key: &mut [u8]) -> Result<()> {
        Err(BpfError::Unsupported)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
