//! eBPF helper functions.
//!
//! Helpers available to tracing programs. IDs follow Linux BPF helper
//! numbering. Every helper returns its result in r0; failures are negative
//! errnos from [`BpfError`].
//!
//! Pointer arguments that a helper only reads (keys, values, format strings,
//! output payloads) are copied through the fault-tolerant probe, so a bad
//! pointer becomes an error code. Destination buffers are trusted to be
//! program stack of the stated size, as established by the loader.

use crate::error::{BpfError, Result, helper_ret};
use crate::maps;
use crate::platform;
use crate::printk;
use crate::probe_read::{self, MAX_BPF_STACK};
use crate::rcu;
use crate::runtime::{self, ProgramType};

/// Helper function signature matching rbpf expectations.
/// Arguments: r1, r2, r3, r4, r5 (from eBPF registers)
/// Returns: u64 (stored in r0)
pub type HelperFn = fn(u64, u64, u64, u64, u64) -> u64;

/// Standard BPF helper function IDs.
pub mod id {
    /// bpf_map_lookup_elem(map_fd, key_ptr) -> value_ptr or 0
    pub const MAP_LOOKUP_ELEM: u32 = 1;
    /// bpf_map_update_elem(map_fd, key_ptr, value_ptr, flags) -> 0 or -errno
    pub const MAP_UPDATE_ELEM: u32 = 2;
    /// bpf_map_delete_elem(map_fd, key_ptr) -> 0 or -errno
    pub const MAP_DELETE_ELEM: u32 = 3;
    /// bpf_probe_read(dst, size, unsafe_ptr) -> 0 or -errno
    pub const PROBE_READ: u32 = 4;
    /// bpf_ktime_get_ns() -> nanoseconds
    pub const KTIME_GET_NS: u32 = 5;
    /// bpf_trace_printk(fmt, fmt_size, args...) -> bytes written
    pub const TRACE_PRINTK: u32 = 6;
    /// bpf_get_smp_processor_id() -> CPU ID
    pub const GET_SMP_PROCESSOR_ID: u32 = 8;
    /// bpf_tail_call(ctx, prog_array, index); not provided here.
    pub const TAIL_CALL: u32 = 12;
    /// bpf_get_current_pid_tgid(); not provided here.
    pub const GET_CURRENT_PID_TGID: u32 = 14;
    /// bpf_get_current_uid_gid(); not provided here.
    pub const GET_CURRENT_UID_GID: u32 = 15;
    /// bpf_get_current_comm(buf, size); not provided here.
    pub const GET_CURRENT_COMM: u32 = 16;
    /// bpf_perf_event_read(map_fd, index) -> counter or -errno
    pub const PERF_EVENT_READ: u32 = 22;
    /// bpf_perf_event_output(ctx, map_fd, index, data, size) -> 0 or -errno
    pub const PERF_EVENT_OUTPUT: u32 = 25;
    /// bpf_get_stackid(ctx, map_fd, flags) -> stack id or -errno
    pub const GET_STACKID: u32 = 27;
}

/// Helpers shared by kprobe, tracepoint and perf event programs.
pub const TRACING_HELPERS: &[u32] = &[
    id::MAP_LOOKUP_ELEM,
    id::MAP_UPDATE_ELEM,
    id::MAP_DELETE_ELEM,
    id::PROBE_READ,
    id::KTIME_GET_NS,
    id::TRACE_PRINTK,
    id::GET_SMP_PROCESSOR_ID,
    id::PERF_EVENT_READ,
    id::PERF_EVENT_OUTPUT,
    id::GET_STACKID,
];

/// List of all supported helper IDs.
pub const SUPPORTED_HELPERS: &[u32] = TRACING_HELPERS;

// =============================================================================
// Program Memory Access
// =============================================================================

/// Copy `len` bytes of program memory at `addr` into the front of `buf`.
fn copy_in(buf: &mut [u8; MAX_BPF_STACK], addr: u64, len: u64) -> Result<&[u8]> {
    let len = usize::try_from(len)
        .ok()
        .filter(|n| *n <= MAX_BPF_STACK)
        .ok_or(BpfError::InvalidArgument)?;
    let addr = usize::try_from(addr).map_err(|_| BpfError::Fault)?;
    probe_read::read(&mut buf[..len], addr)?;
    Ok(&buf[..len])
}

/// Program stack buffer at `addr`.
fn program_buf_mut<'a>(addr: u64, len: usize) -> Result<&'a mut [u8]> {
    if addr == 0 {
        return Err(BpfError::Fault);
    }
    // SAFETY: destination arguments of verified programs point into the
    // program's own stack and cover `len` bytes; the stack outlives the call.
    Ok(unsafe { core::slice::from_raw_parts_mut(addr as usize as *mut u8, len) })
}

fn map_handle(map_fd: u64) -> Result<alloc::sync::Arc<dyn maps::BpfMap>> {
    let fd = u32::try_from(map_fd).map_err(|_| BpfError::NotFound)?;
    maps::get(fd).ok_or(BpfError::NotFound)
}

// =============================================================================
// Helper Implementations
// =============================================================================

/// bpf_map_lookup_elem - lookup map element by key.
///
/// r1 = map fd, r2 = key pointer
/// Returns: pointer to the value, or 0 if not found. The value stays valid
/// until the program returns. Direct loads through it are outside the
/// interpreter's checked regions, so programs copy it with `probe_read`.
fn bpf_map_lookup_elem(map_fd: u64, key: u64, _r3: u64, _r4: u64, _r5: u64) -> u64 {
    let lookup = || -> Result<u64> {
        let map = map_handle(map_fd)?;
        let mut buf = [0u8; MAX_BPF_STACK];
        let key = copy_in(&mut buf, key, u64::from(map.def().key_size))?;
        let guard = rcu::read_lock();
        let value = map.lookup_elem(key, &guard)?;
        // The caller's execution holds a read-side section for the whole
        // program run, so the value outlives this guard.
        Ok(value.as_ptr() as u64)
    };
    lookup().unwrap_or(0)
}

/// bpf_map_update_elem - update or insert map element.
///
/// r1 = map fd, r2 = key pointer, r3 = value pointer, r4 = flags
fn bpf_map_update_elem(map_fd: u64, key: u64, value: u64, flags: u64, _r5: u64) -> u64 {
    helper_ret((|| -> Result<u64> {
        let map = map_handle(map_fd)?;
        let def = map.def();
        let mut key_buf = [0u8; MAX_BPF_STACK];
        let mut value_buf = [0u8; MAX_BPF_STACK];
        let key = copy_in(&mut key_buf, key, u64::from(def.key_size))?;
        let value = copy_in(&mut value_buf, value, u64::from(def.value_size))?;
        map.update_elem(key, value, flags)?;
        Ok(0)
    })())
}

/// bpf_map_delete_elem - delete map element.
///
/// r1 = map fd, r2 = key pointer
fn bpf_map_delete_elem(map_fd: u64, key: u64, _r3: u64, _r4: u64, _r5: u64) -> u64 {
    helper_ret((|| -> Result<u64> {
        let map = map_handle(map_fd)?;
        let mut buf = [0u8; MAX_BPF_STACK];
        let key = copy_in(&mut buf, key, u64::from(map.def().key_size))?;
        map.delete_elem(key)?;
        Ok(0)
    })())
}

/// bpf_probe_read - copy memory from an unchecked address.
///
/// r1 = destination, r2 = size, r3 = source
/// Returns: 0, -EINVAL for oversized reads, -EFAULT (destination zeroed).
fn bpf_probe_read(dst: u64, size: u64, src: u64, _r4: u64, _r5: u64) -> u64 {
    helper_ret((|| -> Result<u64> {
        let size = usize::try_from(size)
            .ok()
            .filter(|n| *n <= MAX_BPF_STACK)
            .ok_or(BpfError::InvalidArgument)?;
        let dst = program_buf_mut(dst, size)?;
        let src = usize::try_from(src).map_err(|_| BpfError::Fault)?;
        probe_read::probe_read(dst, src)?;
        Ok(0)
    })())
}

/// bpf_ktime_get_ns - get current time in nanoseconds.
fn bpf_ktime_get_ns(_r1: u64, _r2: u64, _r3: u64, _r4: u64, _r5: u64) -> u64 {
    platform::time_ns()
}

/// bpf_trace_printk - formatted debug output.
///
/// r1 = format pointer, r2 = format size including NUL, r3..r5 = arguments
/// Returns: bytes written, or -EINVAL for a rejected format.
fn bpf_trace_printk(fmt: u64, fmt_size: u64, a1: u64, a2: u64, a3: u64) -> u64 {
    helper_ret((|| -> Result<u64> {
        let mut buf = [0u8; MAX_BPF_STACK];
        let format = copy_in(&mut buf, fmt, fmt_size)?;
        let written = printk::trace_printk(format, [a1, a2, a3])?;
        Ok(written as u64)
    })())
}

/// bpf_get_smp_processor_id - get current CPU ID.
fn bpf_get_smp_processor_id(_r1: u64, _r2: u64, _r3: u64, _r4: u64, _r5: u64) -> u64 {
    u64::from(platform::cpu_id())
}

/// bpf_perf_event_read - read a counter from a perf event array slot.
///
/// r1 = map fd, r2 = index
fn bpf_perf_event_read(map_fd: u64, index: u64, _r3: u64, _r4: u64, _r5: u64) -> u64 {
    helper_ret((|| -> Result<u64> {
        let fd = u32::try_from(map_fd).map_err(|_| BpfError::NotFound)?;
        let array = maps::perf_event_array(fd).ok_or(BpfError::InvalidArgument)?;
        array.read_counter(index)
    })())
}

/// bpf_perf_event_output - emit a raw record.
///
/// r1 = ctx, r2 = map fd, r3 = index, r4 = data pointer, r5 = size
fn bpf_perf_event_output(_ctx: u64, map_fd: u64, index: u64, data: u64, size: u64) -> u64 {
    helper_ret((|| -> Result<u64> {
        let fd = u32::try_from(map_fd).map_err(|_| BpfError::NotFound)?;
        let array = maps::perf_event_array(fd).ok_or(BpfError::InvalidArgument)?;
        let mut buf = [0u8; MAX_BPF_STACK];
        let payload = copy_in(&mut buf, data, size)?;
        array.output(index, payload)?;
        Ok(0)
    })())
}

/// bpf_get_stackid - capture and deduplicate the current call stack.
///
/// r1 = ctx, r2 = map fd, r3 = flags
/// Registers come from the running invocation, never from r1.
fn bpf_get_stackid(_ctx: u64, map_fd: u64, flags: u64, _r4: u64, _r5: u64) -> u64 {
    helper_ret((|| -> Result<u64> {
        let invocation = runtime::current_invocation().ok_or(BpfError::Fault)?;
        let fd = u32::try_from(map_fd).map_err(|_| BpfError::NotFound)?;
        let map = maps::stack_map(fd).ok_or(BpfError::InvalidArgument)?;
        map.get_stackid(&invocation.regs, flags).map(u64::from)
    })())
}

// =============================================================================
// Helper Registration
// =============================================================================

/// Get a helper function by ID.
///
/// # Arguments
/// * `id` - Helper function ID from the `id` module.
///
/// # Returns
/// The helper function if supported, None otherwise.
pub fn get_helper(id: u32) -> Option<HelperFn> {
    match id {
        id::MAP_LOOKUP_ELEM => Some(bpf_map_lookup_elem),
        id::MAP_UPDATE_ELEM => Some(bpf_map_update_elem),
        id::MAP_DELETE_ELEM => Some(bpf_map_delete_elem),
        id::PROBE_READ => Some(bpf_probe_read),
        id::KTIME_GET_NS => Some(bpf_ktime_get_ns),
        id::TRACE_PRINTK => Some(bpf_trace_printk),
        id::GET_SMP_PROCESSOR_ID => Some(bpf_get_smp_processor_id),
        id::PERF_EVENT_READ => Some(bpf_perf_event_read),
        id::PERF_EVENT_OUTPUT => Some(bpf_perf_event_output),
        id::GET_STACKID => Some(bpf_get_stackid),
        _ => None,
    }
}

/// Register the helpers `prog_type` may call to an rbpf EbpfVmRaw.
pub fn register_for(vm: &mut rbpf::EbpfVmRaw, prog_type: ProgramType) {
    for &id in prog_type.allowed_helpers() {
        let Some(helper) = get_helper(id) else {
            continue;
        };
        if let Err(e) = vm.register_helper(id, helper) {
            log::warn!("Failed to register helper {}: {:?}", id, e);
        }
    }
}
