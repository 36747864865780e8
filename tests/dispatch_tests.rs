//! Integration tests for safe dispatch.
//!
//! Fires instrumentation points and checks verdict aggregation, reentrancy
//! filtering, NMI handling and helpers called from running programs.
//!
//! Per-unit state (the admission counter and the invocation record) is keyed
//! by execution unit, so every test here runs serially.

use std::sync::{Arc, Mutex};
use std::thread;

use serial_test::serial;

use axbpf_trace::perf_event::PerfEventSink;
use axbpf_trace::runtime::{self, ProgramType};
use axbpf_trace::{
    BpfError, MapDef, MapType, Outcome, PerfBuffer, PerfEvent, PerfEventKind, PerfRecord, PtRegs,
    TracePoint, maps, platform, printk, prog_active, trace_call_bpf,
};

// =============================================================================
// Bytecode Builders
// =============================================================================

const R0: u8 = 0;
const R1: u8 = 1;
const R2: u8 = 2;
const R3: u8 = 3;
const R4: u8 = 4;
const R5: u8 = 5;
const R10: u8 = 10;

fn insn(op: u8, dst: u8, src: u8, off: i16, imm: i32) -> [u8; 8] {
    let off = off.to_le_bytes();
    let imm = imm.to_le_bytes();
    [op, (src << 4) | dst, off[0], off[1], imm[0], imm[1], imm[2], imm[3]]
}

fn mov_imm(dst: u8, imm: i32) -> [u8; 8] {
    insn(0xb7, dst, 0, 0, imm)
}

fn mov_reg(dst: u8, src: u8) -> [u8; 8] {
    insn(0xbf, dst, src, 0, 0)
}

fn add_imm(dst: u8, imm: i32) -> [u8; 8] {
    insn(0x07, dst, 0, 0, imm)
}

fn lddw(dst: u8, imm: u64) -> [[u8; 8]; 2] {
    [
        insn(0x18, dst, 0, 0, imm as u32 as i32),
        insn(0x00, 0, 0, 0, (imm >> 32) as u32 as i32),
    ]
}

fn stxdw(dst: u8, off: i16, src: u8) -> [u8; 8] {
    insn(0x7b, dst, src, off, 0)
}

fn ldxdw(dst: u8, src: u8, off: i16) -> [u8; 8] {
    insn(0x79, dst, src, off, 0)
}

fn call(helper: u32) -> [u8; 8] {
    insn(0x85, 0, 0, 0, helper as i32)
}

fn exit() -> [u8; 8] {
    insn(0x95, 0, 0, 0, 0)
}

fn returning(value: i32) -> Vec<u8> {
    [mov_imm(R0, value), exit()].concat()
}

/// Loads far outside the context and fails at run time.
fn failing() -> Vec<u8> {
    [ldxdw(R0, R1, 0x1000), exit()].concat()
}

/// Store `bytes` at r10-8 and point `reg` at it.
fn on_stack(reg: u8, bytes: [u8; 8]) -> Vec<[u8; 8]> {
    let [lo, hi] = lddw(R1, u64::from_le_bytes(bytes));
    vec![lo, hi, stxdw(R10, -8, R1), mov_reg(reg, R10), add_imm(reg, -8)]
}

fn perf_output_prog(fd: u32, payload: [u8; 8]) -> Vec<u8> {
    let mut insns = on_stack(R4, payload);
    insns.extend([
        mov_imm(R2, fd as i32),
        mov_imm(R3, 0),
        mov_imm(R5, 8),
        call(25),
        exit(),
    ]);
    insns.concat()
}

// =============================================================================
// Fixtures
// =============================================================================

fn attach_all(point: &TracePoint, programs: &[Vec<u8>]) -> Vec<u32> {
    programs
        .iter()
        .map(|bytecode| {
            let id = runtime::load_program(ProgramType::Kprobe, bytecode).unwrap();
            point.attach(runtime::get_program(id).unwrap()).unwrap();
            id
        })
        .collect()
}

fn unload_all(ids: &[u32]) {
    for &id in ids {
        let _ = runtime::unload_program(id);
    }
}

fn fire(point: &TracePoint) -> Outcome {
    let regs = PtRegs::new(0xffff_8000_0000_1000);
    let mut ctx = regs;
    trace_call_bpf(point, &regs, ctx.as_bytes_mut())
}

/// Output channel on the calling unit, backed by `sink`.
fn output_channel(sink: Arc<dyn PerfEventSink>) -> u32 {
    let fd = maps::create(&MapDef {
        map_type: MapType::PerfEventArray,
        key_size: 4,
        value_size: 4,
        max_entries: 1,
    })
    .unwrap();
    maps::perf_event_array(fd)
        .unwrap()
        .set(0, PerfEvent::new(PerfEventKind::BpfOutput, platform::cpu_id(), sink))
        .unwrap();
    fd
}

// =============================================================================
// Verdict Tests
// =============================================================================

#[test]
#[serial]
fn test_no_programs() {
    let point = TracePoint::new("test:empty");
    let outcome = fire(&point);
    assert_eq!(outcome, Outcome::NoPrograms);
    assert_eq!(outcome.verdict(), 1);
    assert!(outcome.should_record());
}

#[test]
#[serial]
fn test_single_program_verdict() {
    let point = TracePoint::new("test:single");
    let ids = attach_all(&point, &[returning(42)]);
    assert_eq!(fire(&point), Outcome::Ran(42));
    unload_all(&ids);
}

#[test]
#[serial]
fn test_verdict_is_bitwise_and() {
    let point = TracePoint::new("test:and");
    let ids = attach_all(&point, &[returning(0b1100), returning(0b1010)]);
    let outcome = fire(&point);
    assert_eq!(outcome, Outcome::Ran(0b1000));
    assert!(outcome.should_record());
    unload_all(&ids);

    let point = TracePoint::new("test:and_zero");
    let ids = attach_all(&point, &[returning(-1), returning(0)]);
    let outcome = fire(&point);
    assert_eq!(outcome, Outcome::Ran(0));
    assert!(!outcome.should_record());
    unload_all(&ids);
}

#[test]
#[serial]
fn test_verdict_uses_low_32_bits() {
    let point = TracePoint::new("test:low_bits");
    let [lo, hi] = lddw(R0, 0x7_0000_0005);
    let ids = attach_all(&point, &[[lo, hi, exit()].concat()]);
    assert_eq!(fire(&point), Outcome::Ran(5));
    unload_all(&ids);
}

#[test]
#[serial]
fn test_failing_program_contributes_zero() {
    let buf = Arc::new(PerfBuffer::new());
    let fd = output_channel(buf.clone());
    let point = TracePoint::new("test:failing");
    let ids = attach_all(
        &point,
        &[returning(-1), failing(), perf_output_prog(fd, *b"after!!!")],
    );

    assert_eq!(fire(&point), Outcome::Ran(0));
    // Programs after the failing one still ran.
    assert_eq!(buf.consume(0)[0].data, b"after!!!");

    unload_all(&ids);
    maps::destroy(fd).unwrap();
}

// =============================================================================
// Guard Tests
// =============================================================================

#[test]
#[serial]
fn test_busy_unit_is_filtered() {
    let buf = Arc::new(PerfBuffer::new());
    let fd = output_channel(buf.clone());
    let point = TracePoint::new("test:busy");
    let ids = attach_all(&point, &[perf_output_prog(fd, *b"ran.....")]);

    let token = prog_active::enter(platform::cpu_id()).unwrap();
    let outcome = fire(&point);
    assert_eq!(outcome, Outcome::Filtered);
    assert_eq!(outcome.verdict(), 0);
    assert!(buf.is_empty());
    drop(token);

    assert!(!prog_active::is_active(platform::cpu_id()));
    assert_eq!(fire(&point), Outcome::Ran(0));
    assert_eq!(buf.len(), 1);

    unload_all(&ids);
    maps::destroy(fd).unwrap();
}

#[test]
#[serial]
fn test_other_unit_not_filtered() {
    let point = Arc::new(TracePoint::new("test:other_unit"));
    let ids = attach_all(&point, &[returning(7)]);

    let token = prog_active::enter(platform::cpu_id()).unwrap();
    let outcome = {
        let point = point.clone();
        thread::spawn(move || fire(&point)).join().unwrap()
    };
    assert_eq!(outcome, Outcome::Ran(7));
    drop(token);

    unload_all(&ids);
}

/// Sink that fires another point from inside a running program.
struct Refire {
    point: Arc<TracePoint>,
    outcomes: Mutex<Vec<Outcome>>,
}

impl PerfEventSink for Refire {
    fn output(&self, _record: PerfRecord) -> Result<(), BpfError> {
        let outcome = fire(&self.point);
        self.outcomes.lock().unwrap().push(outcome);
        Ok(())
    }
}

#[test]
#[serial]
fn test_nested_firing_is_filtered() {
    let inner = Arc::new(TracePoint::new("test:nested_inner"));
    let inner_ids = attach_all(&inner, &[returning(42)]);

    let sink = Arc::new(Refire {
        point: inner.clone(),
        outcomes: Mutex::new(Vec::new()),
    });
    let fd = output_channel(sink.clone());
    let outer = TracePoint::new("test:nested_outer");
    let outer_ids = attach_all(&outer, &[perf_output_prog(fd, [0; 8])]);

    assert_eq!(fire(&outer), Outcome::Ran(0));
    assert_eq!(*sink.outcomes.lock().unwrap(), [Outcome::Filtered]);

    // Outside any program the inner point runs normally.
    assert_eq!(fire(&inner), Outcome::Ran(42));
    assert!(!prog_active::is_active(platform::cpu_id()));

    unload_all(&inner_ids);
    unload_all(&outer_ids);
    maps::destroy(fd).unwrap();
}

#[test]
#[serial]
fn test_nmi_is_unsupported() {
    let buf = Arc::new(PerfBuffer::new());
    let fd = output_channel(buf.clone());
    let point = TracePoint::new("test:nmi");
    let ids = attach_all(&point, &[perf_output_prog(fd, [1; 8])]);

    platform::set_mock_in_nmi(true);
    let outcome = fire(&point);
    platform::clear_mocks();

    assert_eq!(outcome, Outcome::Unsupported);
    assert_eq!(outcome.verdict(), 0);
    assert!(buf.is_empty());
    assert!(!prog_active::is_active(platform::cpu_id()));

    unload_all(&ids);
    maps::destroy(fd).unwrap();
}

#[test]
#[serial]
fn test_untracked_unit_is_unsupported() {
    let buf = Arc::new(PerfBuffer::new());
    let fd = output_channel(buf.clone());
    let point = TracePoint::new("test:untracked_unit");
    let ids = attach_all(&point, &[perf_output_prog(fd, [2; 8])]);

    platform::set_mock_cpu_id(platform::MAX_CPUS as u32);
    let outcome = fire(&point);
    platform::clear_mocks();

    assert_eq!(outcome, Outcome::Unsupported);
    assert!(buf.is_empty());
    // The last tracked unit was never claimed on its behalf.
    assert!(!prog_active::is_active(platform::MAX_CPUS as u32 - 1));

    unload_all(&ids);
    maps::destroy(fd).unwrap();
}

#[test]
#[serial]
fn test_parallel_units() {
    let point = Arc::new(TracePoint::new("test:parallel"));
    let ids = attach_all(&point, &[returning(3), returning(1)]);

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let point = point.clone();
            thread::spawn(move || (0..100).map(|_| fire(&point)).collect::<Vec<_>>())
        })
        .collect();
    for w in workers {
        assert!(w.join().unwrap().iter().all(|o| *o == Outcome::Ran(1)));
    }

    unload_all(&ids);
}

// =============================================================================
// Helper Tests
// =============================================================================

#[test]
#[serial]
fn test_get_stackid_from_program() {
    let fd = maps::create(&MapDef {
        map_type: MapType::StackTrace,
        key_size: 4,
        value_size: 127 * 8,
        max_entries: 1 << 16,
    })
    .unwrap();
    let stackid = |flags: i32| {
        [mov_imm(R2, fd as i32), mov_imm(R3, flags), call(27), exit()].concat()
    };

    let point = TracePoint::new("test:stackid");
    let ids = attach_all(&point, &[stackid(0)]);
    platform::set_mock_kernel_stack(&[0xffff_0001, 0xffff_0002, 0xffff_0003]);

    let Outcome::Ran(id) = fire(&point) else {
        panic!("program did not run");
    };
    let store = maps::stack_map(fd).unwrap();
    assert_eq!(
        store.lookup_frames(id).unwrap(),
        [0xffff_0001, 0xffff_0002, 0xffff_0003]
    );
    // Same stack, same id.
    assert_eq!(fire(&point), Outcome::Ran(id));

    // Skip everything: the program sees -EFAULT.
    let skip_all = TracePoint::new("test:stackid_skip");
    let skip_ids = attach_all(&skip_all, &[stackid(3)]);
    assert_eq!(
        fire(&skip_all),
        Outcome::Ran(BpfError::Fault.to_helper_ret() as u32)
    );

    platform::clear_mocks();
    drop(store);
    unload_all(&ids);
    unload_all(&skip_ids);
    maps::destroy(fd).unwrap();
}

#[test]
#[serial]
fn test_trace_printk_from_program() {
    let mut insns = on_stack(R1, *b"hi %d\n\0\0");
    insns.extend([mov_imm(R2, 7), mov_imm(R3, 99), call(6), exit()]);

    let point = TracePoint::new("test:printk");
    let ids = attach_all(&point, &[insns.concat()]);

    assert_eq!(fire(&point), Outcome::Ran(6));
    assert!(
        printk::trace_pipe_drain()
            .iter()
            .any(|line| line == "hi 99\n")
    );

    unload_all(&ids);
}

#[test]
#[serial]
fn test_perf_output_from_program() {
    let buf = Arc::new(PerfBuffer::new());
    let fd = output_channel(buf.clone());
    let point = TracePoint::new("test:perf_output");
    let ids = attach_all(&point, &[perf_output_prog(fd, *b"payload!")]);

    platform::set_mock_time(5_000);
    assert_eq!(fire(&point), Outcome::Ran(0));
    platform::clear_mocks();

    let records = buf.consume(0);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].data, b"payload!");
    assert_eq!(records[0].cpu, platform::cpu_id());
    assert_eq!(records[0].timestamp_ns, 5_000);

    unload_all(&ids);
    maps::destroy(fd).unwrap();
}

#[test]
#[serial]
fn test_probe_read_from_program() {
    let value: u64 = 0x1234_5678_feed_f00d;
    let addr = &value as *const u64 as u64;
    let bytecode = [
        ldxdw(R3, R1, 0),
        mov_reg(R1, R10),
        add_imm(R1, -8),
        mov_imm(R2, 8),
        call(4),
        ldxdw(R0, R10, -8),
        exit(),
    ]
    .concat();
    let point = TracePoint::new("test:probe_read");
    let ids = attach_all(&point, &[bytecode]);

    let mut ctx = addr.to_le_bytes();
    assert_eq!(
        trace_call_bpf(&point, &PtRegs::default(), &mut ctx),
        Outcome::Ran(0xfeed_f00d)
    );

    // Unreadable source: the destination is zeroed.
    let mut ctx = 16u64.to_le_bytes();
    assert_eq!(
        trace_call_bpf(&point, &PtRegs::default(), &mut ctx),
        Outcome::Ran(0)
    );

    unload_all(&ids);
}
