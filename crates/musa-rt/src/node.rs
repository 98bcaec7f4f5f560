//! Task-graph nodes as seen by the queue.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::device::BackendId;
use crate::error::{RuntimeError, RuntimeResult};
use crate::instrumentation::ExecutionHints;

/// Completion marker attached to a node once its work is on a queue.
pub trait NodeEvent: Send + Sync {
    fn backend(&self) -> BackendId;
    fn is_complete(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Complete,
    Failed(RuntimeError),
}

enum NodeSignal {
    Complete,
    Failed(RuntimeError),
}

pub struct TaskNode {
    id: u64,
    hints: ExecutionHints,
    event: Mutex<Option<Arc<dyn NodeEvent>>>,
    signal_tx: Sender<NodeSignal>,
    signal_rx: Receiver<NodeSignal>,
    status: Mutex<NodeStatus>,
}

impl TaskNode {
    pub fn new(hints: ExecutionHints) -> Arc<Self> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let (signal_tx, signal_rx) = unbounded();
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            hints,
            event: Mutex::new(None),
            signal_tx,
            signal_rx,
            status: Mutex::new(NodeStatus::Pending),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn execution_hints(&self) -> ExecutionHints {
        self.hints
    }

    pub fn event(&self) -> Option<Arc<dyn NodeEvent>> {
        self.event.lock().expect("node event poisoned").clone()
    }

    pub fn set_event(&self, event: Arc<dyn NodeEvent>) {
        *self.event.lock().expect("node event poisoned") = Some(event);
    }

    /// Non-blocking view of the completion signal.
    pub fn try_status(&self) -> NodeStatus {
        let mut status = self.status.lock().expect("node status poisoned");
        if *status == NodeStatus::Pending {
            if let Ok(signal) = self.signal_rx.try_recv() {
                *status = signal.into();
            }
        }
        status.clone()
    }

    /// Blocks until the node is signalled.
    pub fn wait(&self) -> RuntimeResult<()> {
        let mut status = self.status.lock().expect("node status poisoned");
        if *status == NodeStatus::Pending {
            // The node owns a sender, so the channel never disconnects.
            if let Ok(signal) = self.signal_rx.recv() {
                *status = signal.into();
            }
        }
        status.outcome()
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning `None`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RuntimeResult<()>> {
        let mut status = self.status.lock().expect("node status poisoned");
        if *status == NodeStatus::Pending {
            match self.signal_rx.recv_timeout(timeout) {
                Ok(signal) => *status = signal.into(),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
        Some(status.outcome())
    }

    fn signal(&self, outcome: RuntimeResult<()>) {
        let signal = match outcome {
            Ok(()) => NodeSignal::Complete,
            Err(err) => NodeSignal::Failed(err),
        };
        let _ = self.signal_tx.send(signal);
    }
}

impl NodeStatus {
    fn outcome(&self) -> RuntimeResult<()> {
        match self {
            NodeStatus::Failed(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }
}

impl From<NodeSignal> for NodeStatus {
    fn from(signal: NodeSignal) -> Self {
        match signal {
            NodeSignal::Complete => NodeStatus::Complete,
            NodeSignal::Failed(err) => NodeStatus::Failed(err),
        }
    }
}

/// Owned handoff that keeps a node alive until a host callback fires.
///
/// Completing consumes the handoff; dropping it without completing releases
/// the node reference without signalling.
pub struct NodeCompletion {
    node: Option<Arc<TaskNode>>,
}

impl NodeCompletion {
    pub fn new(node: Arc<TaskNode>) -> Self {
        Self { node: Some(node) }
    }

    pub fn complete(mut self, outcome: RuntimeResult<()>) {
        if let Some(node) = self.node.take() {
            node.signal(outcome);
        }
    }
}

impl Drop for NodeCompletion {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            log::debug!("node {} released without completion signal", node.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_signals_and_releases() {
        let node = TaskNode::new(ExecutionHints::NONE);
        let handoff = NodeCompletion::new(Arc::clone(&node));
        assert_eq!(Arc::strong_count(&node), 2);
        assert_eq!(node.try_status(), NodeStatus::Pending);

        handoff.complete(Ok(()));
        assert_eq!(Arc::strong_count(&node), 1);
        assert_eq!(node.try_status(), NodeStatus::Complete);
        assert!(node.wait().is_ok());
    }

    #[test]
    fn dropped_handoff_releases_without_signal() {
        let node = TaskNode::new(ExecutionHints::NONE);
        drop(NodeCompletion::new(Arc::clone(&node)));
        assert_eq!(Arc::strong_count(&node), 1);
        assert!(node.wait_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn failure_is_observed_by_waiters() {
        let node = TaskNode::new(ExecutionHints::NONE);
        NodeCompletion::new(Arc::clone(&node))
            .complete(Err(RuntimeError::synchronization("device fault")));
        let err = node.wait().unwrap_err();
        assert_eq!(err.message(), "device fault");
        assert!(matches!(node.try_status(), NodeStatus::Failed(_)));
    }
}
