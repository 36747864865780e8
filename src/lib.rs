//! AxVisor eBPF tracing layer
//!
//! Stack-trace deduplication map and the safe dispatch path that runs eBPF
//! programs when an instrumentation point fires.
//!
//! # Features
//!
//! - `std` - Host platform (threads as execution units, nofault reads,
//!   backtrace call chains). Without it the kernel installs its own
//!   [`platform::PlatformOps`].
//!
//! # Quick Start
//!
//! ```ignore
//! use axbpf_trace::{attach, maps, runtime, MapDef, MapType, ProgramType, PtRegs};
//!
//! axbpf_trace::init();
//!
//! let stacks = maps::create(&MapDef {
//!     map_type: MapType::StackTrace,
//!     key_size: 4,
//!     value_size: 127 * 8,
//!     max_entries: 1024,
//! })?;
//!
//! let prog = runtime::load_program(ProgramType::Kprobe, &bytecode)?;
//! attach::attach("vmm:vcpu_run", prog)?;
//!
//! // From the probe handler:
//! if let Some(point) = attach::get_point("vmm:vcpu_run") {
//!     let regs = PtRegs::new(ip);
//!     let mut ctx = regs;
//!     if point.fire(&regs, ctx.as_bytes_mut()).should_record() {
//!         // record the event
//!     }
//! }
//! ```

#![no_std]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

#[macro_use]
extern crate log;

// =============================================================================
// Platform Abstraction (for testing support)
// =============================================================================

pub mod error;
pub mod platform;
pub mod rcu;

// =============================================================================
// Maps
// =============================================================================

pub mod maps;
pub mod perf_event;
pub mod stackmap;

// =============================================================================
// Runtime Module
// =============================================================================

pub mod context;
pub mod helpers;
pub mod printk;
pub mod probe_read;
pub mod runtime;

// =============================================================================
// Dispatch
// =============================================================================

pub mod attach;
pub mod dispatch;
pub mod prog_active;

// Re-export key types for convenience
pub use attach::{Error as AttachError, TracePoint};
pub use context::PtRegs;
pub use dispatch::{Outcome, trace_call_bpf};
pub use error::BpfError;
pub use maps::{BpfMap, MapDef, MapType};
pub use perf_event::{PerfBuffer, PerfEvent, PerfEventArray, PerfEventKind, PerfRecord};
pub use runtime::{EbpfProgram, Error as RuntimeError, ProgramType};
pub use stackmap::{StackIdFlags, StackTraceStore};

// =============================================================================
// Initialization
// =============================================================================

/// Initialize the tracing layer.
///
/// Call once during boot after the memory allocator is ready and, on kernel
/// builds, after [`platform::install`].
pub fn init() {
    info!("Initializing axbpf-trace...");
    info!("  - max execution units: {}", platform::MAX_CPUS);
    info!(
        "  - maps: StackTrace (depth {}), PerfEventArray",
        stackmap::PERF_MAX_STACK_DEPTH
    );
    info!(
        "  - helpers: {} standard functions",
        helpers::SUPPORTED_HELPERS.len()
    );
    runtime::init();
    info!("axbpf-trace initialization complete");
}
