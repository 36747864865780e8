//! Platform abstraction layer for kernel operations.
//!
//! Everything the dispatch layer needs from its host goes through
//! [`PlatformOps`]: time, the current execution unit, NMI detection,
//! fault-tolerant memory copies and call-chain capture.
//!
//! With the `std` feature the default is [`HostPlatform`], which treats every
//! thread as one execution unit and supports thread-local mock overrides for
//! testing. Without it an embedding kernel installs its own ops with
//! [`install`] during boot.

use core::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of execution units (CPUs) tracked by per-unit state.
pub const MAX_CPUS: usize = 64;

/// Page granularity used to split nofault copies.
pub const PAGE_SIZE: usize = 4096;

/// Register snapshot taken when an instrumentation point fires.
pub use crate::context::PtRegs;

/// Reasons a nofault copy did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault;

/// Platform operations trait.
///
/// Abstracts over kernel-specific operations to enable mock testing.
pub trait PlatformOps: Sync {
    /// Get current monotonic time in nanoseconds.
    fn time_ns(&self) -> u64;

    /// Get current execution unit.
    ///
    /// Units below [`MAX_CPUS`] each get their own admission counter and
    /// invocation record. Firings on any other id are refused with
    /// [`Outcome::Unsupported`](crate::Outcome::Unsupported).
    fn cpu_id(&self) -> u32;

    /// Whether we are running in NMI context.
    fn in_nmi(&self) -> bool {
        false
    }

    /// Copy `dst.len()` bytes from `src` without faulting the caller.
    fn read_nofault(&self, dst: &mut [u8], src: usize) -> Result<(), Fault>;

    /// Walk the call chain for `regs`.
    ///
    /// Fills `out` from the innermost frame outwards and returns the number
    /// of frames written, or `None` if no chain is available.
    fn callchain(&self, regs: &PtRegs, user: bool, out: &mut [u64]) -> Option<usize>;
}

static INSTALLED: spin::Once<&'static dyn PlatformOps> = spin::Once::new();

/// Install the platform ops used by the crate.
///
/// Only the first call has an effect. Must happen before the first firing.
pub fn install(ops: &'static dyn PlatformOps) {
    INSTALLED.call_once(|| ops);
}

/// Currently active platform ops.
pub fn ops() -> &'static dyn PlatformOps {
    match INSTALLED.get() {
        Some(ops) => *ops,
        None => &DEFAULT_PLATFORM,
    }
}

// =============================================================================
// Bare Implementation (no_std, nothing installed)
// =============================================================================

/// Time source for the bare platform.
static BARE_TIME_NS: AtomicU64 = AtomicU64::new(1_000_000_000); // 1 second

/// Fallback used by `no_std` builds until the kernel installs real ops.
///
/// Single execution unit, manual clock, and no readable foreign memory.
pub struct BarePlatform;

impl PlatformOps for BarePlatform {
    fn time_ns(&self) -> u64 {
        BARE_TIME_NS.load(Ordering::Relaxed)
    }

    fn cpu_id(&self) -> u32 {
        0
    }

    fn read_nofault(&self, _dst: &mut [u8], _src: usize) -> Result<(), Fault> {
        Err(Fault)
    }

    fn callchain(&self, _regs: &PtRegs, _user: bool, _out: &mut [u64]) -> Option<usize> {
        None
    }
}

#[cfg(not(feature = "std"))]
static DEFAULT_PLATFORM: BarePlatform = BarePlatform;

// =============================================================================
// Host Implementation (std)
// =============================================================================

#[cfg(feature = "std")]
static DEFAULT_PLATFORM: host::HostPlatform = host::HostPlatform;

#[cfg(feature = "std")]
pub use host::HostPlatform;

#[cfg(feature = "std")]
mod host {
    use core::cell::{Cell, RefCell};
    use core::sync::atomic::{AtomicU64, Ordering};
    use std::time::Instant;
    use std::vec::Vec;

    use super::{Fault, MAX_CPUS, PAGE_SIZE, PlatformOps, PtRegs};

    /// Bitmap of execution-unit slots handed out to live threads.
    static UNIT_SLOTS: AtomicU64 = AtomicU64::new(0);

    static EPOCH: spin::Once<Instant> = spin::Once::new();

    /// Slot owned by the current thread, released when the thread exits.
    struct UnitSlot(u32);

    impl UnitSlot {
        fn claim() -> Self {
            let mut current = UNIT_SLOTS.load(Ordering::Relaxed);
            loop {
                let free = (!current).trailing_zeros();
                if free as usize >= MAX_CPUS {
                    // Every slot is taken; share the last one. The reentrancy
                    // guard filters the overlap.
                    return Self(MAX_CPUS as u32 - 1);
                }
                match UNIT_SLOTS.compare_exchange_weak(
                    current,
                    current | (1 << free),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Self(free),
                    Err(x) => current = x,
                }
            }
        }
    }

    impl Drop for UnitSlot {
        fn drop(&mut self) {
            UNIT_SLOTS.fetch_and(!(1 << self.0), Ordering::AcqRel);
        }
    }

    std::thread_local! {
        static UNIT: UnitSlot = UnitSlot::claim();
        static MOCK_CPU_ID: Cell<Option<u32>> = const { Cell::new(None) };
        static MOCK_TIME_NS: Cell<Option<u64>> = const { Cell::new(None) };
        static MOCK_IN_NMI: Cell<bool> = const { Cell::new(false) };
        static MOCK_KERNEL_STACK: RefCell<Option<Vec<u64>>> = const { RefCell::new(None) };
        static MOCK_USER_STACK: RefCell<Option<Vec<u64>>> = const { RefCell::new(None) };
    }

    /// Host platform: one execution unit per thread.
    ///
    /// Only [`MAX_CPUS`] threads get a unit of their own at a time. Threads
    /// beyond that all report the last unit and therefore exclude each other:
    /// while one of them runs a program, firings on the others are filtered.
    pub struct HostPlatform;

    impl PlatformOps for HostPlatform {
        fn time_ns(&self) -> u64 {
            if let Some(ns) = MOCK_TIME_NS.with(Cell::get) {
                return ns;
            }
            let start = EPOCH.call_once(Instant::now);
            start.elapsed().as_nanos() as u64
        }

        fn cpu_id(&self) -> u32 {
            if let Some(id) = MOCK_CPU_ID.with(Cell::get) {
                return id;
            }
            UNIT.try_with(|slot| slot.0).unwrap_or(MAX_CPUS as u32 - 1)
        }

        fn in_nmi(&self) -> bool {
            MOCK_IN_NMI.with(Cell::get)
        }

        fn read_nofault(&self, dst: &mut [u8], src: usize) -> Result<(), Fault> {
            // The first page is never mapped.
            if src < PAGE_SIZE {
                return Err(Fault);
            }
            src.checked_add(dst.len()).ok_or(Fault)?;
            nofault::copy(dst, src)
        }

        fn callchain(&self, _regs: &PtRegs, user: bool, out: &mut [u64]) -> Option<usize> {
            let mock = if user {
                MOCK_USER_STACK.with(|s| s.borrow().clone())
            } else {
                MOCK_KERNEL_STACK.with(|s| s.borrow().clone())
            };
            if let Some(frames) = mock {
                let n = frames.len().min(out.len());
                out[..n].copy_from_slice(&frames[..n]);
                return Some(n);
            }
            if user {
                // No separate user address space on the host.
                return None;
            }
            let mut n = 0;
            backtrace::trace(|frame| {
                if n >= out.len() {
                    return false;
                }
                out[n] = frame.ip() as u64;
                n += 1;
                true
            });
            Some(n)
        }
    }

    pub(super) fn set_mock_cpu_id(id: Option<u32>) {
        MOCK_CPU_ID.with(|c| c.set(id));
    }

    pub(super) fn set_mock_time(ns: Option<u64>) {
        MOCK_TIME_NS.with(|c| c.set(ns));
    }

    pub(super) fn mock_time() -> Option<u64> {
        MOCK_TIME_NS.with(Cell::get)
    }

    pub(super) fn set_mock_in_nmi(nmi: bool) {
        MOCK_IN_NMI.with(|c| c.set(nmi));
    }

    pub(super) fn set_mock_stack(user: bool, frames: Option<Vec<u64>>) {
        if user {
            MOCK_USER_STACK.with(|s| *s.borrow_mut() = frames);
        } else {
            MOCK_KERNEL_STACK.with(|s| *s.borrow_mut() = frames);
        }
    }

    /// Fault-tolerant copies out of our own address space.
    mod nofault {
        use super::{Fault, PAGE_SIZE};

        pub(super) fn copy(dst: &mut [u8], src: usize) -> Result<(), Fault> {
            // Split on page boundaries so a fault never hides a readable prefix
            // behind a partially mapped range.
            let mut done = 0;
            while done < dst.len() {
                let addr = src + done;
                let chunk = (PAGE_SIZE - addr % PAGE_SIZE).min(dst.len() - done);
                copy_chunk(&mut dst[done..done + chunk], addr)?;
                done += chunk;
            }
            Ok(())
        }

        #[cfg(target_os = "linux")]
        fn copy_chunk(dst: &mut [u8], src: usize) -> Result<(), Fault> {
            let local = libc::iovec {
                iov_base: dst.as_mut_ptr().cast(),
                iov_len: dst.len(),
            };
            let remote = libc::iovec {
                iov_base: src as *mut libc::c_void,
                iov_len: dst.len(),
            };
            // SAFETY: the kernel validates the remote range and reports EFAULT
            // instead of faulting; the local range is a live &mut slice.
            let n = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
            if n >= 0 {
                return if n as usize == dst.len() { Ok(()) } else { Err(Fault) };
            }
            match std::io::Error::last_os_error().raw_os_error() {
                // Syscall filtered or unavailable: fall back to the pipe probe.
                Some(libc::ENOSYS) | Some(libc::EPERM) => pipe_copy(dst, src),
                _ => Err(Fault),
            }
        }

        #[cfg(all(unix, not(target_os = "linux")))]
        fn copy_chunk(dst: &mut [u8], src: usize) -> Result<(), Fault> {
            pipe_copy(dst, src)
        }

        #[cfg(not(unix))]
        fn copy_chunk(_dst: &mut [u8], _src: usize) -> Result<(), Fault> {
            Err(Fault)
        }

        /// Let the kernel read `src` on our behalf by writing it into a pipe.
        #[cfg(unix)]
        fn pipe_copy(dst: &mut [u8], src: usize) -> Result<(), Fault> {
            let mut fds = [0 as libc::c_int; 2];
            // SAFETY: fds is a valid two-element array.
            if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
                return Err(Fault);
            }
            let [rfd, wfd] = fds;
            // SAFETY: write() validates the user buffer and fails with EFAULT;
            // chunks never exceed one page, well under the pipe capacity.
            let written = unsafe { libc::write(wfd, src as *const libc::c_void, dst.len()) };
            let result = if written >= 0 && written as usize == dst.len() {
                // SAFETY: reading back into a live &mut slice of the same size.
                let read = unsafe { libc::read(rfd, dst.as_mut_ptr().cast(), dst.len()) };
                if read >= 0 && read as usize == dst.len() {
                    Ok(())
                } else {
                    Err(Fault)
                }
            } else {
                Err(Fault)
            };
            // SAFETY: both descriptors were opened above and are closed once.
            unsafe {
                libc::close(rfd);
                libc::close(wfd);
            }
            result
        }
    }
}

// =============================================================================
// Mock Overrides
// =============================================================================

/// Set mock time for testing.
pub fn set_mock_time(ns: u64) {
    #[cfg(feature = "std")]
    host::set_mock_time(Some(ns));
    #[cfg(not(feature = "std"))]
    BARE_TIME_NS.store(ns, Ordering::Relaxed);
}

/// Advance mock time by given nanoseconds.
pub fn advance_mock_time(ns: u64) {
    #[cfg(feature = "std")]
    {
        let now = host::mock_time().unwrap_or_else(time_ns);
        host::set_mock_time(Some(now + ns));
    }
    #[cfg(not(feature = "std"))]
    BARE_TIME_NS.fetch_add(ns, Ordering::Relaxed);
}

/// Pin the calling thread to a mock execution unit.
#[cfg(feature = "std")]
pub fn set_mock_cpu_id(id: u32) {
    host::set_mock_cpu_id(Some(id));
}

/// Pretend the calling thread runs in NMI context.
#[cfg(feature = "std")]
pub fn set_mock_in_nmi(nmi: bool) {
    host::set_mock_in_nmi(nmi);
}

/// Call chain returned for kernel stacks on the calling thread.
#[cfg(feature = "std")]
pub fn set_mock_kernel_stack(frames: &[u64]) {
    host::set_mock_stack(false, Some(frames.to_vec()));
}

/// Call chain returned for user stacks on the calling thread.
#[cfg(feature = "std")]
pub fn set_mock_user_stack(frames: &[u64]) {
    host::set_mock_stack(true, Some(frames.to_vec()));
}

/// Drop every mock override of the calling thread.
#[cfg(feature = "std")]
pub fn clear_mocks() {
    host::set_mock_cpu_id(None);
    host::set_mock_time(None);
    host::set_mock_in_nmi(false);
    host::set_mock_stack(false, None);
    host::set_mock_stack(true, None);
}

// =============================================================================
// Convenience Functions
// =============================================================================

/// Get current time in nanoseconds.
#[inline]
pub fn time_ns() -> u64 {
    ops().time_ns()
}

/// Get current execution unit.
#[inline]
pub fn cpu_id() -> u32 {
    ops().cpu_id()
}

/// Whether the caller runs in NMI context.
#[inline]
pub fn in_nmi() -> bool {
    ops().in_nmi()
}

// =============================================================================
// Tests
// =============================================================================
