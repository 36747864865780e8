//! eBPF program attachment management.
//!
//! Every instrumentation point owns an ordered, immutable [`ProgArray`].
//! Attach and detach build a new array from the current one and publish it
//! with a single swap; firings already running keep using the array they
//! loaded, and the old array is freed once they are done. One process-wide
//! lock orders concurrent attach/detach calls so no update is lost. It is
//! never taken on the firing path.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::context::PtRegs;
use crate::dispatch::{self, Outcome};
use crate::rcu::{self, RcuCell, RcuReadGuard};
use crate::runtime::{self, EbpfProgram};

/// Error types for attachment operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No instrumentation point with this name.
    PointNotFound(String),
    /// Program not found in registry.
    ProgramNotFound(u32),
    /// The program is already attached to this point.
    AlreadyAttached(String),
    /// The program is not attached to this point.
    NotAttached(String),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::PointNotFound(name) => write!(f, "Instrumentation point not found: {}", name),
            Self::ProgramNotFound(id) => write!(f, "Program not found: {}", id),
            Self::AlreadyAttached(name) => write!(f, "Program already attached to: {}", name),
            Self::NotAttached(name) => write!(f, "Program not attached to: {}", name),
        }
    }
}

impl core::error::Error for Error {}

/// Serializes every attach and detach.
static ATTACH_LOCK: Mutex<()> = Mutex::new(());

// =============================================================================
// ProgArray
// =============================================================================

/// Programs attached to one point, in attach order.
#[derive(Default)]
pub struct ProgArray {
    progs: Vec<Arc<EbpfProgram>>,
}

static EMPTY_ARRAY: ProgArray = ProgArray { progs: Vec::new() };

impl ProgArray {
    pub fn len(&self) -> usize {
        self.progs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.progs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EbpfProgram>> {
        self.progs.iter()
    }

    /// Whether the program with `prog_id` is in the array.
    pub fn contains(&self, prog_id: u32) -> bool {
        self.progs.iter().any(|p| p.id() == prog_id)
    }

    /// Program ids in attach order.
    pub fn ids(&self) -> Vec<u32> {
        self.progs.iter().map(|p| p.id()).collect()
    }

    fn with(&self, prog: Arc<EbpfProgram>) -> Self {
        let mut progs = Vec::with_capacity(self.progs.len() + 1);
        progs.extend(self.progs.iter().cloned());
        progs.push(prog);
        Self { progs }
    }

    fn without(&self, index: usize) -> Self {
        let mut progs = self.progs.clone();
        progs.remove(index);
        Self { progs }
    }
}

// =============================================================================
// TracePoint
// =============================================================================

/// An instrumentation point that programs can be attached to.
pub struct TracePoint {
    name: String,
    progs: RcuCell<ProgArray>,
}

impl TracePoint {
    /// A point with no programs attached.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            progs: RcuCell::new(ProgArray::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attached programs, valid for as long as `guard` lives.
    pub fn programs<'g>(&self, guard: &'g RcuReadGuard) -> &'g ProgArray {
        self.progs.load(guard).unwrap_or(&EMPTY_ARRAY)
    }

    /// Ids of the attached programs.
    pub fn attached_ids(&self) -> Vec<u32> {
        let guard = rcu::read_lock();
        self.programs(&guard).ids()
    }

    /// Append `prog` to the array.
    ///
    /// # Returns
    /// Ok(()) on success, Error::AlreadyAttached if `prog` is already here,
    /// Error::ProgramNotFound if `prog` never went through the registry.
    pub fn attach(&self, prog: Arc<EbpfProgram>) -> Result<(), Error> {
        // Detach finds programs by id, so every attached program needs its own.
        if prog.id() == u32::MAX {
            return Err(Error::ProgramNotFound(prog.id()));
        }
        let _lock = ATTACH_LOCK.lock();
        let next = {
            let guard = rcu::read_lock();
            let current = self.programs(&guard);
            if current.progs.iter().any(|p| Arc::ptr_eq(p, &prog)) {
                return Err(Error::AlreadyAttached(self.name.clone()));
            }
            current.with(prog.clone())
        };
        self.progs.replace(Some(Box::new(next)));
        log::debug!("Attached program {} to {}", prog.id(), self.name);
        Ok(())
    }

    /// Remove the program with `prog_id` from the array.
    ///
    /// # Returns
    /// The detached program. The caller's reference is the last one the
    /// point hands out; older arrays drop theirs after their grace period.
    pub fn detach(&self, prog_id: u32) -> Result<Arc<EbpfProgram>, Error> {
        let _lock = ATTACH_LOCK.lock();
        let (prog, next) = {
            let guard = rcu::read_lock();
            let current = self.programs(&guard);
            let index = current
                .progs
                .iter()
                .position(|p| p.id() == prog_id)
                .ok_or_else(|| Error::NotAttached(self.name.clone()))?;
            (current.progs[index].clone(), current.without(index))
        };
        self.progs.replace(Some(Box::new(next)));
        log::debug!("Detached program {} from {}", prog_id, self.name);
        Ok(prog)
    }

    /// Fire this point: run the attached programs for `regs` and `ctx`.
    pub fn fire(&self, regs: &PtRegs, ctx: &mut [u8]) -> Outcome {
        dispatch::trace_call_bpf(self, regs, ctx)
    }
}

// =============================================================================
// Point Registry
// =============================================================================

/// Global point registry: name -> point.
static POINTS: Mutex<BTreeMap<String, Arc<TracePoint>>> = Mutex::new(BTreeMap::new());

/// Get or create the point called `name`.
pub fn register_point(name: &str) -> Arc<TracePoint> {
    let mut points = POINTS.lock();
    points
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(TracePoint::new(name)))
        .clone()
}

/// Look up a registered point.
pub fn get_point(name: &str) -> Option<Arc<TracePoint>> {
    POINTS.lock().get(name).cloned()
}

/// Attach a loaded program to a point, registering the point if needed.
///
/// # Arguments
/// * `point` - Point name, e.g. "subsystem:event"
/// * `prog_id` - Program ID from runtime::load_program()
///
/// # Returns
/// Ok(()) on success, Error if the program is unknown or already attached.
pub fn attach(point: &str, prog_id: u32) -> Result<(), Error> {
    let prog = runtime::get_program(prog_id).ok_or(Error::ProgramNotFound(prog_id))?;
    register_point(point).attach(prog)
}

/// Detach a program from a point.
///
/// # Returns
/// The detached program id on success.
pub fn detach(point: &str, prog_id: u32) -> Result<u32, Error> {
    let tp = get_point(point).ok_or_else(|| Error::PointNotFound(point.to_string()))?;
    let prog = tp.detach(prog_id)?;
    Ok(prog.id())
}

/// Ids of the programs attached to a point.
///
/// # Returns
/// None if the point was never registered.
pub fn get_attached(point: &str) -> Option<Vec<u32>> {
    Some(get_point(point)?.attached_ids())
}

/// List all points that have programs attached.
///
/// # Returns
/// Vector of (point_name, program ids) pairs.
pub fn list_attachments() -> Vec<(String, Vec<u32>)> {
    let points: Vec<Arc<TracePoint>> = POINTS.lock().values().cloned().collect();
    points
        .iter()
        .map(|tp| (tp.name.clone(), tp.attached_ids()))
        .filter(|(_, ids)| !ids.is_empty())
        .collect()
}

/// Get count of attachments across all points.
pub fn attachment_count() -> usize {
    let points: Vec<Arc<TracePoint>> = POINTS.lock().values().cloned().collect();
    points.iter().map(|tp| tp.attached_ids().len()).sum()
}
