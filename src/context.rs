//! Register snapshot passed to eBPF programs.

/// Registers captured when an instrumentation point fires.
///
/// Kprobe programs receive this structure as their context (C ABI) and the
/// call-chain walker starts from it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PtRegs {
    /// Instruction pointer at the probe.
    pub ip: u64,
    /// Stack pointer at the probe.
    pub sp: u64,
    /// Frame pointer at the probe.
    pub fp: u64,
    /// Function arguments 0..=5.
    pub args: [u64; 6],
    /// Return value register (valid for return probes).
    pub ret: u64,
}

impl PtRegs {
    /// Registers with just an instruction pointer.
    pub fn new(ip: u64) -> Self {
        Self {
            ip,
            ..Default::default()
        }
    }

    /// Set stack and frame pointers.
    pub fn with_stack(mut self, sp: u64, fp: u64) -> Self {
        self.sp = sp;
        self.fp = fp;
        self
    }

    /// Set arguments.
    pub fn with_args(mut self, args: [u64; 6]) -> Self {
        self.args = args;
        self
    }

    /// Convert to byte slice (for passing to eBPF VM).
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: PtRegs is repr(C) and made only of u64 fields, no padding.
        unsafe {
            core::slice::from_raw_parts(
                self as *const Self as *const u8,
                core::mem::size_of::<Self>(),
            )
        }
    }

    /// Convert to mutable byte slice.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; every bit pattern is a valid PtRegs.
        unsafe {
            core::slice::from_raw_parts_mut(
                self as *mut Self as *mut u8,
                core::mem::size_of::<Self>(),
            )
        }
    }
}

const _: () = assert!(core::mem::size_of::<PtRegs>() == 80);
