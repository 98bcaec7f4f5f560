mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use common::Harness;
use musa_rt::driver::HostCall;
use musa_rt::instrumentation::ExecutionHints;
use musa_rt::node::NodeEvent;
use musa_rt::{ErrorKind, NodeStatus, TaskNode};

#[test]
fn insert_event_failure_is_registered_not_returned() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    h.driver.fail_next(HostCall::RecordEvent, 400);

    assert!(queue.insert_event().is_none());
    let errors = h.sink.take();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind(), ErrorKind::Synchronization);
    assert!(h.backend.event_pool(0).idle_count() >= 1);

    assert!(queue.insert_event().is_some());
    Ok(())
}

#[test]
fn events_are_recycled_through_the_pool() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    let created = h.driver.stats().events_created;

    for _ in 0..4 {
        let event = queue.record_event()?;
        queue.wait()?;
        assert!(event.is_complete());
    }
    assert_eq!(h.driver.stats().events_created, created + 1);
    Ok(())
}

#[test]
fn queue_waits_on_node_from_another_queue() -> Result<()> {
    let h = Harness::new();
    let producer = h.backend.create_queue(0, 0)?;
    let consumer = h.backend.create_queue(0, 0)?;
    let node = TaskNode::new(ExecutionHints::NONE);

    let guard = h.driver.stall(producer.native_stream())?;
    let marker = producer.mark_completion(&node)?;
    consumer.submit_queue_wait_for(&node)?;
    let after = consumer.record_event()?;

    thread::sleep(Duration::from_millis(10));
    assert!(!marker.is_complete());
    assert!(!after.is_complete());

    drop(guard);
    consumer.wait()?;
    assert!(marker.is_complete());
    assert!(after.is_complete());
    assert!(node.event().is_some_and(|event| event.is_complete()));
    Ok(())
}

#[test]
fn waiting_on_node_without_event_fails() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    let node = TaskNode::new(ExecutionHints::NONE);

    let err = queue.submit_queue_wait_for(&node).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Synchronization);
    Ok(())
}

#[test]
fn external_wait_signals_and_releases_node() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    let node = TaskNode::new(ExecutionHints::NONE);

    let guard = h.driver.stall(queue.native_stream())?;
    queue.submit_external_wait_for(&node)?;
    assert_eq!(Arc::strong_count(&node), 2);
    assert_eq!(node.try_status(), NodeStatus::Pending);

    drop(guard);
    node.wait()?;
    queue.wait()?;
    assert_eq!(node.try_status(), NodeStatus::Complete);
    assert_eq!(Arc::strong_count(&node), 1);
    assert_eq!(h.driver.stats().callbacks_registered, 1);
    Ok(())
}

#[test]
fn device_error_in_callback_fails_the_node() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    let node = TaskNode::new(ExecutionHints::NONE);
    h.driver.fail_next(HostCall::CallbackStatus, 719);

    queue.submit_external_wait_for(&node)?;
    let err = node.wait().unwrap_err();
    queue.wait()?;

    assert_eq!(err.kind(), ErrorKind::Synchronization);
    assert_eq!(err.native_error().map(|n| n.code), Some(719));
    assert_eq!(h.sink.take(), vec![err]);
    assert_eq!(Arc::strong_count(&node), 1);
    Ok(())
}

#[test]
fn rejected_callback_releases_node_immediately() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    let node = TaskNode::new(ExecutionHints::NONE);
    h.driver.fail_next(HostCall::AddCallback, 400);

    let err = queue.submit_external_wait_for(&node).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Synchronization);
    assert_eq!(Arc::strong_count(&node), 1);
    assert_eq!(node.try_status(), NodeStatus::Pending);
    assert!(node.wait_timeout(Duration::from_millis(5)).is_none());
    Ok(())
}

#[test]
fn wait_failure_is_a_synchronization_error() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    h.driver.fail_next(HostCall::SynchronizeStream, 1);
    let err = queue.wait().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Synchronization);
    Ok(())
}

#[test]
fn event_recording_activates_the_device_first() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    let idle = h.backend.event_pool(0).idle_count();

    h.driver.fail_next(HostCall::ActivateDevice, 101);
    let err = queue.record_event().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Synchronization);
    assert_eq!(err.native_error().map(|n| n.code), Some(101));
    assert_eq!(h.backend.event_pool(0).idle_count(), idle);

    h.driver.fail_next(HostCall::ActivateDevice, 102);
    assert!(queue.insert_event().is_none());
    let errors = h.sink.take();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].native_error().map(|n| n.code), Some(102));
    Ok(())
}

#[test]
fn queue_wait_activates_the_device_first() -> Result<()> {
    let h = Harness::new();
    let producer = h.backend.create_queue(0, 0)?;
    let consumer = h.backend.create_queue(0, 0)?;
    let node = TaskNode::new(ExecutionHints::NONE);
    producer.mark_completion(&node)?;

    h.driver.fail_next(HostCall::ActivateDevice, 103);
    let err = consumer.submit_queue_wait_for(&node).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Synchronization);
    assert_eq!(err.native_error().map(|n| n.code), Some(103));

    consumer.submit_queue_wait_for(&node)?;
    consumer.wait()?;
    Ok(())
}

#[test]
fn status_query_activates_the_device_first() -> Result<()> {
    let h = Harness::new();
    let queue = h.backend.create_queue(0, 0)?;
    let activations = h.driver.stats().device_activations;

    assert_eq!(queue.query_status()?, musa_rt::QueueStatus::Complete);
    assert_eq!(h.driver.stats().device_activations, activations + 1);

    h.driver.fail_next(HostCall::ActivateDevice, 104);
    let err = queue.query_status().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Synchronization);
    assert_eq!(err.native_error().map(|n| n.code), Some(104));
    Ok(())
}
