//! Integration tests for eBPF helper functions.
//!
//! Tests helper registration and the helper ABI: arguments as raw register
//! values, results and negative errnos in r0.

use std::sync::Arc;

use axbpf_trace::helpers::{self, SUPPORTED_HELPERS, id};
use axbpf_trace::maps::{self, MapDef, MapType};
use axbpf_trace::{BpfError, PerfBuffer, PerfEvent, PerfEventKind, platform, printk, rcu};

fn err(e: BpfError) -> u64 {
    e.to_helper_ret()
}

fn stack_map(max_entries: u32) -> u32 {
    maps::create(&MapDef {
        map_type: MapType::StackTrace,
        key_size: 4,
        value_size: 4 * 8,
        max_entries,
    })
    .unwrap()
}

fn perf_array(max_entries: u32) -> u32 {
    maps::create(&MapDef {
        map_type: MapType::PerfEventArray,
        key_size: 4,
        value_size: 4,
        max_entries,
    })
    .unwrap()
}

// =============================================================================
// Helper Registration Tests
// =============================================================================

#[test]
fn test_supported_helpers_count() {
    assert_eq!(SUPPORTED_HELPERS.len(), 10);
    for &helper in SUPPORTED_HELPERS {
        assert!(helpers::get_helper(helper).is_some(), "helper {}", helper);
    }
}

#[test]
fn test_get_helper_unsupported() {
    assert!(helpers::get_helper(999).is_none());
    assert!(helpers::get_helper(id::TAIL_CALL).is_none());
    assert!(helpers::get_helper(id::GET_CURRENT_PID_TGID).is_none());
}

#[test]
fn test_helper_ids_match_linux() {
    assert_eq!(id::MAP_LOOKUP_ELEM, 1);
    assert_eq!(id::MAP_UPDATE_ELEM, 2);
    assert_eq!(id::MAP_DELETE_ELEM, 3);
    assert_eq!(id::PROBE_READ, 4);
    assert_eq!(id::KTIME_GET_NS, 5);
    assert_eq!(id::TRACE_PRINTK, 6);
    assert_eq!(id::GET_SMP_PROCESSOR_ID, 8);
    assert_eq!(id::TAIL_CALL, 12);
    assert_eq!(id::PERF_EVENT_READ, 22);
    assert_eq!(id::PERF_EVENT_OUTPUT, 25);
    assert_eq!(id::GET_STACKID, 27);
}

// =============================================================================
// Map Helper Tests
// =============================================================================

#[test]
fn test_map_helpers_on_stack_map() {
    let fd = stack_map(16);
    let store = maps::stack_map(fd).unwrap();
    let stack_id = store.insert_or_get(&[0x100, 0x200], false, false).unwrap();

    let lookup_fn = helpers::get_helper(id::MAP_LOOKUP_ELEM).unwrap();
    let update_fn = helpers::get_helper(id::MAP_UPDATE_ELEM).unwrap();
    let delete_fn = helpers::get_helper(id::MAP_DELETE_ELEM).unwrap();

    let key = stack_id.to_le_bytes();
    let key_ptr = key.as_ptr() as u64;

    {
        let _guard = rcu::read_lock();
        let value = lookup_fn(fd as u64, key_ptr, 0, 0, 0);
        assert_ne!(value, 0);
        // SAFETY: the value stays valid while the read-side section lives.
        let frames = unsafe { std::slice::from_raw_parts(value as *const u64, 4) };
        assert_eq!(frames, [0x100, 0x200, 0, 0]);
    }

    let value = [0u8; 32];
    assert_eq!(
        update_fn(fd as u64, key_ptr, value.as_ptr() as u64, 0, 0),
        err(BpfError::InvalidArgument)
    );

    assert_eq!(delete_fn(fd as u64, key_ptr, 0, 0, 0), 0);
    assert_eq!(
        delete_fn(fd as u64, key_ptr, 0, 0, 0),
        err(BpfError::NotFound)
    );
    assert_eq!(lookup_fn(fd as u64, key_ptr, 0, 0, 0), 0);

    // Cleanup
    drop(store);
    maps::destroy(fd).unwrap();
}

#[test]
fn test_map_helpers_bad_arguments() {
    let lookup_fn = helpers::get_helper(id::MAP_LOOKUP_ELEM).unwrap();
    let delete_fn = helpers::get_helper(id::MAP_DELETE_ELEM).unwrap();
    let key = 0u32.to_le_bytes();

    assert_eq!(lookup_fn(u64::MAX, key.as_ptr() as u64, 0, 0, 0), 0);
    assert_eq!(
        delete_fn(u64::from(u32::MAX), key.as_ptr() as u64, 0, 0, 0),
        err(BpfError::NotFound)
    );

    let fd = stack_map(4);
    // Unreadable key pointer.
    assert_eq!(delete_fn(fd as u64, 8, 0, 0, 0), err(BpfError::Fault));
    maps::destroy(fd).unwrap();
}

// =============================================================================
// Memory Helper Tests
// =============================================================================

#[test]
fn test_probe_read_helper() {
    let probe_fn = helpers::get_helper(id::PROBE_READ).unwrap();
    let src = 0x0102_0304_0506_0708u64;
    let mut dst = 0u64;
    let dst_ptr = &mut dst as *mut u64 as u64;

    assert_eq!(probe_fn(dst_ptr, 8, &src as *const u64 as u64, 0, 0), 0);
    assert_eq!(dst, src);

    assert_eq!(probe_fn(dst_ptr, 8, 16, 0, 0), err(BpfError::Fault));
    assert_eq!(dst, 0);

    assert_eq!(
        probe_fn(dst_ptr, 513, &src as *const u64 as u64, 0, 0),
        err(BpfError::InvalidArgument)
    );
    assert_eq!(probe_fn(0, 8, &src as *const u64 as u64, 0, 0), err(BpfError::Fault));
}

#[test]
fn test_ktime_helper() {
    let ktime_fn = helpers::get_helper(id::KTIME_GET_NS).unwrap();
    platform::set_mock_time(777);
    assert_eq!(ktime_fn(0, 0, 0, 0, 0), 777);
    platform::clear_mocks();
}

#[test]
fn test_cpu_id_helper() {
    let cpu_fn = helpers::get_helper(id::GET_SMP_PROCESSOR_ID).unwrap();
    assert_eq!(cpu_fn(0, 0, 0, 0, 0), u64::from(platform::cpu_id()));
}

// =============================================================================
// Output Helper Tests
// =============================================================================

#[test]
fn test_trace_printk_helper() {
    let printk_fn = helpers::get_helper(id::TRACE_PRINTK).unwrap();
    let fmt = b"helper %d-%x\n\0";
    let result = printk_fn(fmt.as_ptr() as u64, fmt.len() as u64, 7, 255, 0);
    assert_eq!(result, "helper 7-ff\n".len() as u64);
    assert!(
        printk::trace_pipe_drain()
            .iter()
            .any(|line| line == "helper 7-ff\n")
    );

    let bad = b"%d %d %d %d\0";
    assert_eq!(
        printk_fn(bad.as_ptr() as u64, bad.len() as u64, 1, 2, 3),
        err(BpfError::InvalidArgument)
    );
    // Size that cuts off the terminator.
    assert_eq!(
        printk_fn(fmt.as_ptr() as u64, 4, 0, 0, 0),
        err(BpfError::InvalidArgument)
    );
}

#[test]
fn test_perf_event_output_helper() {
    let fd = perf_array(2);
    let array = maps::perf_event_array(fd).unwrap();
    let buf = Arc::new(PerfBuffer::new());
    array
        .set(0, PerfEvent::new(PerfEventKind::BpfOutput, platform::cpu_id(), buf.clone()))
        .unwrap();

    let output_fn = helpers::get_helper(id::PERF_EVENT_OUTPUT).unwrap();
    let payload = *b"sample!!";
    let data = payload.as_ptr() as u64;

    assert_eq!(output_fn(0, fd as u64, 0, data, 8), 0);
    assert_eq!(buf.consume(0)[0].data, payload);

    assert_eq!(output_fn(0, fd as u64, 1, data, 8), err(BpfError::NotFound));
    assert_eq!(output_fn(0, fd as u64, 2, data, 8), err(BpfError::TooBig));
    assert_eq!(output_fn(0, fd as u64, 0, 16, 8), err(BpfError::Fault));

    let stacks = stack_map(4);
    assert_eq!(
        output_fn(0, stacks as u64, 0, data, 8),
        err(BpfError::InvalidArgument)
    );

    // Cleanup
    drop(array);
    maps::destroy(fd).unwrap();
    maps::destroy(stacks).unwrap();
}

#[test]
fn test_perf_event_read_helper() {
    let fd = perf_array(2);
    let array = maps::perf_event_array(fd).unwrap();
    let buf = Arc::new(PerfBuffer::new());
    buf.set_counter(99);
    array
        .set(1, PerfEvent::new(PerfEventKind::Hardware, platform::cpu_id(), buf.clone()))
        .unwrap();

    let read_fn = helpers::get_helper(id::PERF_EVENT_READ).unwrap();
    assert_eq!(read_fn(fd as u64, 1, 0, 0, 0), 99);
    assert_eq!(read_fn(fd as u64, 0, 0, 0, 0), err(BpfError::NotFound));
    assert_eq!(read_fn(fd as u64, 5, 0, 0, 0), err(BpfError::TooBig));

    // Cleanup
    drop(array);
    maps::destroy(fd).unwrap();
}

#[test]
fn test_get_stackid_outside_program() {
    let fd = stack_map(4);
    let stackid_fn = helpers::get_helper(id::GET_STACKID).unwrap();
    assert_eq!(stackid_fn(0, fd as u64, 0, 0, 0), err(BpfError::Fault));
    maps::destroy(fd).unwrap();
}

#[test]
fn test_errno_encoding() {
    assert_eq!(err(BpfError::InvalidArgument) as i64, -22);
    assert_eq!(err(BpfError::Fault) as i64, -14);
    assert_eq!(err(BpfError::AlreadyExists) as i64, -17);
    assert_eq!(err(BpfError::TooBig) as i64, -7);
    assert_eq!(
        BpfError::from_helper_ret(err(BpfError::WrongContext)),
        Some(BpfError::WrongContext)
    );
    assert_eq!(BpfError::from_helper_ret(5), None);
}
