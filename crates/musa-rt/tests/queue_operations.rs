mod common;

use std::ffi::c_void;
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use common::Harness;
use musa_rt::driver::{HostCall, HostDriver};
use musa_rt::instrumentation::{ExecutionHints, InstrumentationKind};
use musa_rt::operations::{MemcpyOperation, MemoryLocation, MemsetOperation, PrefetchOperation, Range3};
use musa_rt::{DeviceId, ErrorKind, QueueStatus, TaskNode};

fn location(device: DeviceId, data: &mut [u32], shape: Range3, offset: Range3) -> MemoryLocation {
    assert_eq!(data.len(), shape.size());
    unsafe { MemoryLocation::new(device, data.as_mut_ptr() as *mut c_void, shape, offset, 4) }
}

fn iota(len: usize) -> Vec<u32> {
    (0..len as u32).collect()
}

#[test]
fn contiguous_copy_round_trips_through_device() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    let shape = Range3::linear(16);
    let mut host = iota(16);
    let mut device = vec![0u32; 16];
    let mut back = vec![0u32; 16];

    let upload = MemcpyOperation::new(
        location(DeviceId::host(), &mut host, shape, Range3::zero()),
        location(DeviceId::musa(0), &mut device, shape, Range3::zero()),
        shape,
    );
    assert_eq!(upload.transfer_dimensionality(), 1);
    queue.submit_memcpy(&upload, None)?;

    let download = MemcpyOperation::new(
        location(DeviceId::musa(0), &mut device, shape, Range3::zero()),
        location(DeviceId::host(), &mut back, shape, Range3::zero()),
        shape,
    );
    queue.submit_memcpy(&download, None)?;
    queue.wait()?;

    assert_eq!(back, iota(16));
    Ok(())
}

#[test]
fn pitched_2d_copy_moves_sub_block() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    let shape = Range3::new(1, 4, 8);
    let mut src = iota(32);
    let mut dst = vec![0u32; 32];

    let op = MemcpyOperation::new(
        location(DeviceId::host(), &mut src, shape, Range3::new(0, 1, 2)),
        location(DeviceId::musa(0), &mut dst, shape, Range3::zero()),
        Range3::new(1, 2, 3),
    );
    assert_eq!(op.transfer_dimensionality(), 2);
    queue.submit_memcpy(&op, None)?;
    queue.wait()?;

    for row in 0..4 {
        for col in 0..8 {
            let expected = if row < 2 && col < 3 {
                ((row + 1) * 8 + col + 2) as u32
            } else {
                0
            };
            assert_eq!(dst[row * 8 + col], expected, "row {row} col {col}");
        }
    }
    Ok(())
}

#[test]
fn pitched_3d_copy_moves_slab() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    let shape = Range3::new(2, 4, 8);
    let mut src = iota(64);
    let mut dst = vec![0u32; 64];

    let op = MemcpyOperation::new(
        location(DeviceId::musa(0), &mut src, shape, Range3::new(0, 1, 0)),
        location(DeviceId::host(), &mut dst, shape, Range3::new(0, 2, 0)),
        Range3::new(2, 2, 8),
    );
    assert_eq!(op.transfer_dimensionality(), 3);
    queue.submit_memcpy(&op, None)?;
    queue.wait()?;

    for slice in 0..2 {
        for row in 0..2 {
            for col in 0..8 {
                let got = dst[(slice * 4 + row + 2) * 8 + col];
                let expected = ((slice * 4 + row + 1) * 8 + col) as u32;
                assert_eq!(got, expected, "slice {slice} row {row} col {col}");
            }
        }
        assert!(dst[slice * 32..slice * 32 + 16].iter().all(|&v| v == 0));
    }
    Ok(())
}

#[test]
fn memset_fills_byte_range() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    let mut buffer = vec![0u8; 32];

    let op = unsafe { MemsetOperation::new(buffer[8..].as_mut_ptr() as *mut c_void, 0xab, 16) };
    queue.submit_memset(&op, None)?;
    queue.wait()?;

    assert!(buffer[..8].iter().all(|&b| b == 0));
    assert!(buffer[8..24].iter().all(|&b| b == 0xab));
    assert!(buffer[24..].iter().all(|&b| b == 0));
    Ok(())
}

#[test]
fn failed_transfer_submission_is_a_transfer_error() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    let mut buffer = vec![0u8; 4];
    h.driver.fail_next(HostCall::Memset, 1);

    let op = unsafe { MemsetOperation::new(buffer.as_mut_ptr() as *mut c_void, 1, 4) };
    let err = queue.submit_memset(&op, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transfer);
    assert_eq!(err.native_error().map(|n| n.code), Some(1));
    queue.wait()?;
    assert_eq!(buffer, vec![0u8; 4]);
    Ok(())
}

#[test]
fn prefetch_targets_device_or_host() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    let buffer = vec![0u8; 64];

    queue.submit_prefetch(&PrefetchOperation::new(buffer.as_ptr() as *const c_void, 64, DeviceId::musa(0)), None)?;
    queue.submit_prefetch(&PrefetchOperation::new(buffer.as_ptr() as *const c_void, 64, DeviceId::host()), None)?;
    queue.wait()?;
    assert_eq!(h.driver.stats().prefetches, 2);
    Ok(())
}

#[test]
fn prefetch_without_platform_support_is_a_no_op() -> Result<()> {
    let h = Harness::with(HostDriver::new().without_prefetch(), Default::default());
    let queue = h.backend.create_queue(0, 0)?;
    let buffer = vec![0u8; 64];

    let op = PrefetchOperation::new(buffer.as_ptr() as *const c_void, 64, DeviceId::musa(0));
    queue.submit_prefetch(&op, None)?;
    assert_eq!(h.driver.stats().prefetches, 0);
    assert!(h.sink.is_empty());
    Ok(())
}

#[test]
fn query_status_tracks_outstanding_work() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    assert_eq!(queue.query_status()?, QueueStatus::Complete);

    let guard = h.driver.stall(queue.native_stream())?;
    assert_eq!(queue.query_status()?, QueueStatus::Pending);
    drop(guard);

    queue.wait()?;
    assert_eq!(queue.query_status()?, QueueStatus::Complete);
    Ok(())
}

#[test]
fn query_failure_is_a_synchronization_error() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    h.driver.fail_next(HostCall::QueryStream, 400);
    let err = queue.query_status().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Synchronization);
    Ok(())
}

#[test]
fn failed_stream_creation_is_an_allocation_error() {
    let h = Harness::new();
    h.driver.fail_next(HostCall::CreateStream, 2);
    let err = h.backend.create_queue(0, 0).err().expect("queue creation should fail");
    assert_eq!(err.kind(), ErrorKind::Allocation);
    assert_eq!(h.driver.live_streams(), 0);
}

#[test]
fn dropping_queue_destroys_its_stream() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    assert_eq!(h.driver.live_streams(), 1);
    drop(queue);
    assert_eq!(h.driver.live_streams(), 0);
    assert!(h.sink.is_empty());
    Ok(())
}

#[test]
fn execution_hints_produce_timestamps() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    let node = TaskNode::new(ExecutionHints::all());
    let mut buffer = vec![0u8; 256];
    let before = SystemTime::now();

    let op = unsafe { MemsetOperation::new(buffer.as_mut_ptr() as *mut c_void, 7, buffer.len()) };
    queue.submit_memset(&op, Some(node.as_ref()))?;
    queue.wait()?;

    let set = op.instrumentations();
    assert_eq!(set.len(), 3);
    let submitted = set
        .get(InstrumentationKind::SubmissionTimestamp)
        .and_then(|ts| ts.timestamp())
        .expect("submission timestamp");
    let started = set
        .get(InstrumentationKind::ExecutionStartTimestamp)
        .and_then(|ts| ts.timestamp())
        .expect("start timestamp");
    let finished = set
        .get(InstrumentationKind::ExecutionFinishTimestamp)
        .and_then(|ts| ts.timestamp())
        .expect("finish timestamp");

    assert!(submitted >= before);
    assert!(finished >= started);
    Ok(())
}

#[test]
fn operations_without_hints_record_nothing() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    let events_before = h.driver.stats().events_created;
    let mut buffer = vec![0u8; 8];

    let op = unsafe { MemsetOperation::new(buffer.as_mut_ptr() as *mut c_void, 7, 8) };
    let plain = TaskNode::new(ExecutionHints::NONE);
    queue.submit_memset(&op, Some(plain.as_ref()))?;
    queue.wait()?;

    assert!(op.instrumentations().is_empty());
    assert_eq!(h.driver.stats().events_created, events_before);
    Ok(())
}

#[test]
fn elapsed_time_follows_stream_order() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;

    let first = queue.record_event()?;
    let guard = h.driver.stall(queue.native_stream())?;
    let second = queue.record_event()?;
    thread::sleep(Duration::from_millis(30));
    drop(guard);
    queue.wait()?;

    assert!(first.is_complete() && second.is_complete());
    assert!(second.elapsed_since(&first) >= Duration::from_millis(20));
    assert_eq!(first.elapsed_since(&second), Duration::ZERO);
    assert!(h.sink.is_empty());
    Ok(())
}

#[test]
fn failed_status_query_during_elapsed_time_yields_zero() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    let first = queue.record_event()?;
    let second = queue.record_event()?;
    queue.wait()?;

    h.driver.fail_next(HostCall::QueryEvent, 999);
    assert_eq!(second.elapsed_since(&first), Duration::ZERO);

    let errors = h.sink.take();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind(), ErrorKind::Synchronization);
    assert_eq!(errors[0].native_error().map(|n| n.code), Some(999));
    Ok(())
}
