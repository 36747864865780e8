//! Entry point for firing instrumentation points.
//!
//! [`trace_call_bpf`] is what a probe or tracepoint handler calls. It runs
//! every program attached to the point exactly once, unless a program is
//! already running on the same execution unit, in which case the firing is
//! filtered out.

use crate::attach::TracePoint;
use crate::context::PtRegs;
use crate::platform::{self, MAX_CPUS};
use crate::prog_active;
use crate::rcu;

/// How a firing was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Fired in a context where programs cannot run (NMI, or a unit id at
    /// or above [`MAX_CPUS`]); nothing ran.
    Unsupported,
    /// Another program already runs on this unit; nothing ran.
    Filtered,
    /// The point has no programs attached.
    NoPrograms,
    /// Programs ran; bitwise AND of their low 32-bit return values.
    Ran(u32),
}

impl Outcome {
    /// Value handed back to the probe handler: 0 drops the event.
    pub fn verdict(self) -> u32 {
        match self {
            Self::Unsupported | Self::Filtered => 0,
            Self::NoPrograms => 1,
            Self::Ran(v) => v,
        }
    }

    /// Whether the probe handler should record the event.
    pub fn should_record(self) -> bool {
        self.verdict() != 0
    }
}

/// Run the programs attached to `point`.
///
/// # Arguments
/// * `point` - The instrumentation point that fired.
/// * `regs` - Registers at the point, visible to helpers.
/// * `ctx` - Context buffer handed to every program in r1.
///
/// A program that fails to execute contributes 0 to the verdict.
pub fn trace_call_bpf(point: &TracePoint, regs: &PtRegs, ctx: &mut [u8]) -> Outcome {
    let cpu = platform::cpu_id();
    if platform::in_nmi() || cpu as usize >= MAX_CPUS {
        return Outcome::Unsupported;
    }

    let Some(active) = prog_active::enter(cpu) else {
        return Outcome::Filtered;
    };

    let guard = rcu::read_lock();
    let progs = point.programs(&guard);
    if progs.is_empty() {
        return Outcome::NoPrograms;
    }

    let mut verdict = u32::MAX;
    for prog in progs.iter() {
        verdict &= match prog.execute_admitted(&active, ctx, regs) {
            Ok(ret) => ret as u32,
            Err(e) => {
                log::warn!("program {} on {} failed: {}", prog.id(), point.name(), e);
                0
            }
        };
    }
    Outcome::Ran(verdict)
}
