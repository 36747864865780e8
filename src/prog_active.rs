//! Per-unit program admission.
//!
//! At most one program invocation runs on an execution unit at a time. A
//! point that fires while a program is already running on the same unit
//! (for example a probe hit from inside a helper) is turned away instead of
//! nesting, which keeps helpers free of reentrancy concerns.
//!
//! Only ids below [`MAX_CPUS`] have a counter; any other id is never
//! admitted.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::platform::MAX_CPUS;

static ACTIVE: [AtomicU32; MAX_CPUS] = [const { AtomicU32::new(0) }; MAX_CPUS];

/// Admission held by the running invocation; released on drop.
#[must_use]
pub struct ActiveToken {
    pub(crate) cpu: usize,
}

impl Drop for ActiveToken {
    fn drop(&mut self) {
        ACTIVE[self.cpu].fetch_sub(1, Ordering::SeqCst);
    }
}

/// Try to become the active invocation on `cpu`.
///
/// The counter is incremented either way and undone before returning `None`,
/// so a concurrent holder always sees a value above one. Returns `None` for
/// ids at or above [`MAX_CPUS`].
pub fn enter(cpu: u32) -> Option<ActiveToken> {
    let counter = ACTIVE.get(cpu as usize)?;
    if counter.fetch_add(1, Ordering::SeqCst) != 0 {
        counter.fetch_sub(1, Ordering::SeqCst);
        return None;
    }
    Some(ActiveToken { cpu: cpu as usize })
}

/// Whether an invocation currently holds `cpu`.
pub fn is_active(cpu: u32) -> bool {
    ACTIVE
        .get(cpu as usize)
        .is_some_and(|c| c.load(Ordering::SeqCst) != 0)
}
