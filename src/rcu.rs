//! Epoch-based deferred reclamation.
//!
//! A thin layer over `crossbeam-epoch`. Readers enter a read-side section
//! with [`read_lock`]; everything they load through an [`RcuCell`] stays
//! valid until the returned guard is dropped. Writers publish a replacement
//! with a single atomic swap and hand the old value to [`call_rcu`], which
//! destroys it once every reader that could have seen it has left its
//! section.
//!
//! Every deferral is flushed to the global queue immediately, so any later
//! pin, [`poll`] or [`synchronize`] on any unit can reclaim it.
//!
//! [`synchronize`] and [`barrier`] block and must never be called from
//! inside a read-side section. Everything else here is non-blocking and safe
//! to use from the dispatch path.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

/// Deferred callbacks executing right now.
static RUNNING: AtomicUsize = AtomicUsize::new(0);

#[cfg(feature = "std")]
fn pin() -> Guard {
    epoch::pin()
}

#[cfg(not(feature = "std"))]
static COLLECTOR: spin::Lazy<epoch::Collector> = spin::Lazy::new(epoch::Collector::new);

#[cfg(not(feature = "std"))]
fn pin() -> Guard {
    // The participant stays registered until the guard is dropped.
    COLLECTOR.register().pin()
}

/// Proof of an active read-side section.
///
/// Not `Send`: a section begins and ends on the same execution unit.
pub struct RcuReadGuard {
    inner: Guard,
}

/// Enter a read-side section. Sections nest.
pub fn read_lock() -> RcuReadGuard {
    RcuReadGuard { inner: pin() }
}

/// Queue `callback` to run after the current grace period.
pub fn call_rcu<F>(callback: F)
where
    F: FnOnce() + Send + 'static,
{
    let guard = pin();
    guard.defer(move || {
        RUNNING.fetch_add(1, Ordering::SeqCst);
        callback();
        RUNNING.fetch_sub(1, Ordering::SeqCst);
    });
    guard.flush();
}

/// Try to advance the epoch and run expired callbacks, without blocking.
///
/// Safe inside a read-side section.
pub fn poll() {
    pin().flush();
}

/// Block until every read-side section active at the time of the call has
/// ended.
///
/// Must not be called from inside a read-side section.
pub fn synchronize() {
    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    call_rcu(move || flag.store(true, Ordering::Release));
    while !done.load(Ordering::Acquire) {
        poll();
        relax();
    }
}

/// Wait for a grace period and for every callback queued before the call
/// to finish.
///
/// The global queue is drained in order, so once the grace-period marker
/// has run, earlier callbacks have at least started.
pub fn barrier() {
    synchronize();
    while RUNNING.load(Ordering::SeqCst) != 0 {
        relax();
    }
}

#[cfg(feature = "std")]
fn relax() {
    std::thread::yield_now();
}

#[cfg(not(feature = "std"))]
fn relax() {
    core::hint::spin_loop();
}

// =============================================================================
// RcuCell
// =============================================================================

/// An optional, heap-allocated value published through one atomic pointer.
///
/// Loads require a read-side guard; replacements retire the previous value
/// through [`call_rcu`].
pub struct RcuCell<T: Send + 'static> {
    ptr: Atomic<T>,
}

/// Defer destruction of a value that was just unlinked from a cell.
fn retire<T: Send + 'static>(old: Shared<'_, T>) -> bool {
    if old.is_null() {
        return false;
    }
    // SAFETY: the caller's swap removed `old` from its cell, so no new
    // reader can reach it, and the value is dropped only after the grace
    // period.
    let owned = unsafe { old.into_owned() };
    call_rcu(move || drop(owned));
    true
}

impl<T: Send + 'static> RcuCell<T> {
    /// An empty cell.
    pub const fn empty() -> Self {
        Self { ptr: Atomic::null() }
    }

    /// A cell holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            ptr: Atomic::new(value),
        }
    }

    /// Load the current value for the duration of `guard`.
    pub fn load<'g>(&self, guard: &'g RcuReadGuard) -> Option<&'g T> {
        let current = self.ptr.load(Ordering::Acquire, &guard.inner);
        // SAFETY: published values are destroyed only through `retire`,
        // after every guard pinned before their removal has been dropped.
        unsafe { current.as_ref() }
    }

    /// Whether the cell currently holds nothing.
    pub fn is_empty(&self) -> bool {
        let guard = pin();
        self.ptr.load(Ordering::Acquire, &guard).is_null()
    }

    /// Publish `value` and retire the previous value.
    ///
    /// Returns whether a previous value existed.
    pub fn replace(&self, value: Option<Box<T>>) -> bool {
        let guard = pin();
        let new = match value {
            Some(value) => Owned::<T>::from(value).into_shared(&guard),
            None => Shared::null(),
        };
        retire(self.ptr.swap(new, Ordering::AcqRel, &guard))
    }

    /// Publish `value` only if the cell is empty.
    ///
    /// Gives `value` back if the cell was occupied.
    pub fn publish_if_empty(&self, value: Box<T>) -> Result<(), Box<T>> {
        let guard = pin();
        self.ptr
            .compare_exchange(
                Shared::null(),
                Owned::from(value),
                Ordering::AcqRel,
                Ordering::Acquire,
                &guard,
            )
            .map(|_| ())
            .map_err(|e| e.new.into_box())
    }

    /// Remove the value, retiring it. Returns whether there was one.
    pub fn take(&self) -> bool {
        self.replace(None)
    }
}

impl<T: Send + 'static> Drop for RcuCell<T> {
    fn drop(&mut self) {
        let guard = pin();
        // References loaded under a guard may outlive the cell itself.
        retire(self.ptr.swap(Shared::null(), Ordering::AcqRel, &guard));
    }
}
