//! eBPF bytecode execution engine.
//!
//! Programs are loaded from raw, already verified bytecode and run on the
//! `rbpf` interpreter with the helpers their [`ProgramType`] allows. A
//! program only runs while it holds its unit's [`prog_active`] admission,
//! and for that time the unit publishes an [`Invocation`] record so helpers
//! can find the registers and program type of the current firing without
//! trusting what the program passes in r1.
//!
//! Program ids are never reused, so an id names one program for the whole
//! lifetime of the process, including after it is unloaded.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashSet;
use spin::Mutex;

use crate::context::PtRegs;
use crate::helpers;
use crate::platform::{self, MAX_CPUS};
use crate::prog_active::{self, ActiveToken};
use crate::rcu;

/// Error types for eBPF runtime operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The eBPF program is invalid or malformed.
    InvalidProgram,
    /// Program execution failed.
    ExecutionFailed,
    /// The interpreter's verifier rejected the program.
    VerificationFailed,
    /// Program not found in registry.
    NotFound,
    /// The execution unit already runs a program, or is not tracked.
    Busy,
    /// Every program id has been handed out.
    IdsExhausted,
    /// The program calls a helper its type may not use.
    HelperNotAllowed(u32),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidProgram => write!(f, "Invalid eBPF program"),
            Self::ExecutionFailed => write!(f, "eBPF execution failed"),
            Self::VerificationFailed => write!(f, "eBPF verification failed"),
            Self::NotFound => write!(f, "Program not found"),
            Self::Busy => write!(f, "Execution unit busy"),
            Self::IdsExhausted => write!(f, "Program ids exhausted"),
            Self::HelperNotAllowed(id) => write!(f, "Helper {} not allowed", id),
        }
    }
}

impl core::error::Error for Error {}

// =============================================================================
// Program Types
// =============================================================================

/// Where a program may be attached, and what it may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramType {
    /// Dynamic probe; the context is a [`PtRegs`].
    Kprobe,
    /// Static tracepoint; the context is the raw event record.
    Tracepoint,
    /// Sampling perf event; the context is the sample data.
    PerfEvent,
}

impl ProgramType {
    /// Helper ids a program of this type may call.
    pub fn allowed_helpers(self) -> &'static [u32] {
        match self {
            Self::Kprobe | Self::Tracepoint | Self::PerfEvent => helpers::TRACING_HELPERS,
        }
    }

    /// Whether helper `id` is in this type's capability set.
    pub fn allows(self, id: u32) -> bool {
        self.allowed_helpers().contains(&id)
    }
}

// =============================================================================
// Invocation Record
// =============================================================================

/// State of the firing a program is running for.
#[derive(Debug, Clone, Copy)]
pub struct Invocation {
    /// Type of the running program.
    pub prog_type: ProgramType,
    /// Registers at the instrumentation point.
    pub regs: PtRegs,
    /// Execution unit the program runs on.
    pub cpu: u32,
}

/// Record of the invocation running on each unit. Only the holder of the
/// unit's admission token writes its slot.
static INVOCATIONS: [Mutex<Option<Invocation>>; MAX_CPUS] =
    [const { Mutex::new(None) }; MAX_CPUS];

/// Publishes an invocation for the admitted unit until dropped.
struct InvocationScope<'a> {
    active: &'a ActiveToken,
}

impl<'a> InvocationScope<'a> {
    fn publish(active: &'a ActiveToken, record: Invocation) -> Self {
        *INVOCATIONS[active.cpu].lock() = Some(record);
        Self { active }
    }
}

impl Drop for InvocationScope<'_> {
    fn drop(&mut self) {
        *INVOCATIONS[self.active.cpu].lock() = None;
    }
}

/// Invocation running on the calling unit, if any.
pub fn current_invocation() -> Option<Invocation> {
    let slot = INVOCATIONS.get(platform::cpu_id() as usize)?;
    *slot.lock()
}

// =============================================================================
// EbpfProgram
// =============================================================================

/// BPF_JMP | BPF_CALL
const OP_CALL: u8 = 0x85;

/// Helper ids called by `bytecode`.
fn called_helpers(bytecode: &[u8]) -> HashSet<u32> {
    bytecode
        .chunks_exact(8)
        // src_reg 0 marks a helper call; anything else is a local call.
        .filter(|insn| insn[0] == OP_CALL && insn[1] >> 4 == 0)
        .map(|insn| u32::from_le_bytes([insn[4], insn[5], insn[6], insn[7]]))
        .collect()
}

/// A loaded eBPF program.
#[derive(Debug)]
pub struct EbpfProgram {
    id: u32,
    prog_type: ProgramType,
    name: Option<String>,
    bytecode: Vec<u8>,
}

impl EbpfProgram {
    /// Check `bytecode` for `prog_type`.
    ///
    /// # Returns
    /// EbpfProgram on success, Error if the bytecode is malformed, fails the
    /// interpreter's verifier or calls a helper outside the type's set.
    pub fn new(prog_type: ProgramType, bytecode: &[u8], name: Option<&str>) -> Result<Self, Error> {
        if bytecode.is_empty() || bytecode.len() % 8 != 0 {
            return Err(Error::InvalidProgram);
        }

        let mut calls: Vec<u32> = called_helpers(bytecode).into_iter().collect();
        calls.sort_unstable();
        if let Some(&id) = calls.iter().find(|id| !prog_type.allows(**id)) {
            log::warn!("{:?} program calls helper {} outside its set", prog_type, id);
            return Err(Error::HelperNotAllowed(id));
        }

        rbpf::EbpfVmRaw::new(Some(bytecode)).map_err(|e| {
            log::warn!("eBPF verification error: {:?}", e);
            Error::VerificationFailed
        })?;

        Ok(Self {
            id: u32::MAX,
            prog_type,
            name: name.map(String::from),
            bytecode: bytecode.to_vec(),
        })
    }

    /// Registry id, or `u32::MAX` for programs that were never loaded.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn prog_type(&self) -> ProgramType {
        self.prog_type
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Get the bytecode.
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    /// Execute the program on the calling unit.
    ///
    /// # Arguments
    /// * `ctx` - Context buffer, passed in r1.
    /// * `regs` - Registers of the firing, visible to helpers.
    ///
    /// # Returns
    /// The return value of the eBPF program (r0 register), or
    /// [`Error::Busy`] if a program already runs on this unit.
    pub fn execute(&self, ctx: &mut [u8], regs: &PtRegs) -> Result<u64, Error> {
        let active = prog_active::enter(platform::cpu_id()).ok_or(Error::Busy)?;
        self.execute_admitted(&active, ctx, regs)
    }

    /// Execute the program under admission already taken by the caller.
    pub(crate) fn execute_admitted(
        &self,
        active: &ActiveToken,
        ctx: &mut [u8],
        regs: &PtRegs,
    ) -> Result<u64, Error> {
        let mut vm = rbpf::EbpfVmRaw::new(Some(self.bytecode.as_slice())).map_err(|e| {
            log::error!("Failed to create VM: {:?}", e);
            Error::InvalidProgram
        })?;
        helpers::register_for(&mut vm, self.prog_type);

        let record = Invocation {
            prog_type: self.prog_type,
            regs: *regs,
            cpu: active.cpu as u32,
        };
        let _scope = InvocationScope::publish(active, record);
        // Values handed out by map helpers stay valid until the program returns.
        let _guard = rcu::read_lock();

        vm.execute_program(ctx).map_err(|e| {
            log::warn!("eBPF execution error: {:?}", e);
            Error::ExecutionFailed
        })
    }
}

// =============================================================================
// Program Registry
// =============================================================================

struct ProgramRegistry {
    next_id: u32,
    programs: BTreeMap<u32, Arc<EbpfProgram>>,
}

/// Global program registry.
static PROGRAM_REGISTRY: Mutex<ProgramRegistry> = Mutex::new(ProgramRegistry {
    next_id: 0,
    programs: BTreeMap::new(),
});

/// Load a program into the registry.
///
/// # Arguments
/// * `prog_type` - Where the program will be attached.
/// * `bytecode` - Raw eBPF bytecode.
///
/// # Returns
/// Program ID on success.
pub fn load_program(prog_type: ProgramType, bytecode: &[u8]) -> Result<u32, Error> {
    load_named_program(prog_type, bytecode, None)
}

/// Load a program with a display name.
pub fn load_named_program(
    prog_type: ProgramType,
    bytecode: &[u8],
    name: Option<&str>,
) -> Result<u32, Error> {
    let mut program = EbpfProgram::new(prog_type, bytecode, name)?;
    let mut registry = PROGRAM_REGISTRY.lock();

    // u32::MAX marks programs that were never loaded.
    let id = registry.next_id;
    if id == u32::MAX {
        return Err(Error::IdsExhausted);
    }
    registry.next_id += 1;
    program.id = id;
    registry.programs.insert(id, Arc::new(program));
    log::debug!("Loaded {:?} program {} ({} bytes)", prog_type, id, bytecode.len());
    Ok(id)
}

/// Get a loaded program by ID.
pub fn get_program(prog_id: u32) -> Option<Arc<EbpfProgram>> {
    PROGRAM_REGISTRY.lock().programs.get(&prog_id).cloned()
}

/// Unload a program from the registry.
///
/// Attachments keep their own reference; the program is freed once it has
/// been detached everywhere.
pub fn unload_program(prog_id: u32) -> Result<(), Error> {
    let program = PROGRAM_REGISTRY
        .lock()
        .programs
        .remove(&prog_id)
        .ok_or(Error::NotFound)?;
    drop(program);
    log::debug!("Unloaded program {}", prog_id);
    Ok(())
}

/// Run a loaded program by ID outside any instrumentation point.
///
/// Takes the calling unit's admission like a firing does, so it fails with
/// [`Error::Busy`] from inside another program.
///
/// # Arguments
/// * `prog_id` - Program ID returned by load_program().
/// * `ctx` - Context buffer for the program.
/// * `regs` - Registers reported to helpers.
///
/// # Returns
/// The return value of the eBPF program.
pub fn run_program(prog_id: u32, ctx: &mut [u8], regs: &PtRegs) -> Result<u64, Error> {
    let program = get_program(prog_id).ok_or(Error::NotFound)?;
    program.execute(ctx, regs)
}

/// Get the number of loaded programs.
pub fn program_count() -> usize {
    PROGRAM_REGISTRY.lock().programs.len()
}

/// Information about a loaded program.
#[derive(Debug, Clone)]
pub struct ProgramInfo {
    /// Program ID.
    pub id: u32,
    /// Program type.
    pub prog_type: ProgramType,
    /// Bytecode size in bytes.
    pub size: usize,
}

/// List all loaded programs.
///
/// # Returns
/// Vector of ProgramInfo for all loaded programs.
pub fn list_programs() -> Vec<ProgramInfo> {
    let registry = PROGRAM_REGISTRY.lock();
    registry
        .programs
        .values()
        .map(|prog| ProgramInfo {
            id: prog.id,
            prog_type: prog.prog_type,
            size: prog.bytecode.len(),
        })
        .collect()
}

// =============================================================================
// Initialization
// =============================================================================

/// Initialize the eBPF runtime.
pub fn init() {
    log::info!("Initializing eBPF runtime...");
    log::info!("  - {} helpers available", helpers::SUPPORTED_HELPERS.len());
}
