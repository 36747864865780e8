//! `bpf_trace_printk`: restricted printf for programs.
//!
//! Programs pass a format string that lives in their own memory plus up to
//! three raw 64-bit arguments. The format is checked against a short
//! whitelist before anything is rendered, so a bad format has no side
//! effects. At most one `%s` is accepted and its argument is an address that
//! is read through [`probe_read::read_str`] into a small local buffer.
//!
//! Rendered lines are logged and queued on the trace pipe.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use spin::Mutex;

use crate::error::{BpfError, Result};
use crate::probe_read;

/// Conversions allowed in one format string.
pub const MAX_CONVERSIONS: usize = 3;

/// Bytes copied for a `%s` argument, terminator included.
pub const STR_BUF_SIZE: usize = 64;

/// Lines kept on the trace pipe before the oldest are dropped.
pub const TRACE_PIPE_CAPACITY: usize = 1024;

/// Argument width selected by `l` modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// No modifier: low 32 bits.
    Int,
    /// `l`: native long.
    Long,
    /// `ll`: full 64 bits.
    LongLong,
}

/// One accepted conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// `%d`, `%ld`, `%lld`.
    Signed(Width),
    /// `%u`, `%lu`, `%llu`.
    Unsigned(Width),
    /// `%x`, `%lx`, `%llx`.
    Hex(Width),
    /// `%p`.
    Pointer,
    /// `%s`.
    Str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Piece<'a> {
    Literal(&'a str),
    Conv(Conversion),
}

/// A validated format string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format<'a> {
    pieces: Vec<Piece<'a>>,
}

fn is_space(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\n' | 0x0b | 0x0c | b'\r')
}

fn is_print(c: u8) -> bool {
    (0x20..=0x7e).contains(&c)
}

fn literal(bytes: &[u8]) -> Result<&str> {
    core::str::from_utf8(bytes).map_err(|_| BpfError::InvalidArgument)
}

impl<'a> Format<'a> {
    /// Validate `format`, which must end with its NUL terminator.
    pub fn parse(format: &'a [u8]) -> Result<Self> {
        let Some((&0, body)) = format.split_last() else {
            return Err(BpfError::InvalidArgument);
        };
        // The terminator is visible to lookahead.
        let at = |i: usize| body.get(i).copied().unwrap_or(0);

        let mut pieces = Vec::new();
        let mut convs = 0;
        let mut str_seen = false;
        let mut lit_start = 0;
        let mut i = 0;

        while i < body.len() {
            let c = body[i];
            if !is_print(c) && !is_space(c) {
                return Err(BpfError::InvalidArgument);
            }
            if c != b'%' {
                i += 1;
                continue;
            }
            if convs >= MAX_CONVERSIONS {
                return Err(BpfError::InvalidArgument);
            }
            if lit_start < i {
                pieces.push(Piece::Literal(literal(&body[lit_start..i])?));
            }
            i += 1;

            let mut longs = 0;
            if at(i) == b'l' {
                longs += 1;
                i += 1;
            } else if at(i) == b'p' || at(i) == b's' {
                let next = at(i + 1);
                if !is_space(next) && !next.is_ascii_punctuation() && next != 0 {
                    return Err(BpfError::InvalidArgument);
                }
                let conv = if at(i) == b's' {
                    if str_seen {
                        return Err(BpfError::InvalidArgument);
                    }
                    str_seen = true;
                    Conversion::Str
                } else {
                    Conversion::Pointer
                };
                pieces.push(Piece::Conv(conv));
                convs += 1;
                i += 1;
                lit_start = i;
                continue;
            }

            if at(i) == b'l' {
                longs += 1;
                i += 1;
            }
            let width = match longs {
                0 => Width::Int,
                1 => Width::Long,
                _ => Width::LongLong,
            };
            let conv = match at(i) {
                b'd' => Conversion::Signed(width),
                b'u' => Conversion::Unsigned(width),
                b'x' => Conversion::Hex(width),
                _ => return Err(BpfError::InvalidArgument),
            };
            pieces.push(Piece::Conv(conv));
            convs += 1;
            i += 1;
            lit_start = i;
        }
        if lit_start < body.len() {
            pieces.push(Piece::Literal(literal(&body[lit_start..])?));
        }

        Ok(Self { pieces })
    }

    /// Accepted conversions, in argument order.
    pub fn conversions(&self) -> impl Iterator<Item = Conversion> + '_ {
        self.pieces.iter().filter_map(|p| match p {
            Piece::Conv(c) => Some(*c),
            Piece::Literal(_) => None,
        })
    }

    /// Render with `args`, one slot per conversion.
    pub fn render(&self, args: [u64; MAX_CONVERSIONS]) -> String {
        let mut out = String::new();
        let mut next = args.iter().copied();
        for piece in &self.pieces {
            let conv = match piece {
                Piece::Literal(s) => {
                    out.push_str(s);
                    continue;
                }
                Piece::Conv(c) => *c,
            };
            let arg = next.next().unwrap_or(0);
            // Writing into a String cannot fail.
            let _ = match conv {
                Conversion::Signed(Width::Int) => write!(out, "{}", arg as u32 as i32),
                Conversion::Signed(_) => write!(out, "{}", arg as i64),
                Conversion::Unsigned(Width::Int) => write!(out, "{}", arg as u32),
                Conversion::Unsigned(_) => write!(out, "{}", arg),
                Conversion::Hex(Width::Int) => write!(out, "{:x}", arg as u32),
                Conversion::Hex(_) => write!(out, "{:x}", arg),
                Conversion::Pointer => write!(out, "{:016x}", arg),
                Conversion::Str => {
                    out.push_str(&read_user_str(arg));
                    Ok(())
                }
            };
        }
        out
    }
}

/// Copy a `%s` argument; unreadable strings render empty.
fn read_user_str(addr: u64) -> String {
    let mut buf = [0u8; STR_BUF_SIZE];
    let len = match usize::try_from(addr) {
        Ok(addr) => probe_read::read_str(&mut buf, addr).unwrap_or(0),
        Err(_) => 0,
    };
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

/// Validate `format` and render it with `args`.
pub fn validate_and_render(format: &[u8], args: [u64; MAX_CONVERSIONS]) -> Result<String> {
    Ok(Format::parse(format)?.render(args))
}

// =============================================================================
// Trace Pipe
// =============================================================================

static TRACE_PIPE: Mutex<VecDeque<String>> = Mutex::new(VecDeque::new());

fn trace_pipe_push(line: String) {
    let mut q = TRACE_PIPE.lock();
    if q.len() >= TRACE_PIPE_CAPACITY {
        let _ = q.pop_front();
    }
    q.push_back(line);
}

/// Read and consume every queued trace line.
pub fn trace_pipe_drain() -> Vec<String> {
    TRACE_PIPE.lock().drain(..).collect()
}

/// Validate, render and emit one trace line.
///
/// # Returns
/// Number of bytes written.
pub fn trace_printk(format: &[u8], args: [u64; MAX_CONVERSIONS]) -> Result<usize> {
    let line = validate_and_render(format, args)?;
    let len = line.len();
    log::info!("[bpf_trace] {}", line.trim_end_matches('\n'));
    trace_pipe_push(line);
    Ok(len)
}
