//! Submission and execution timestamps attached to operations.

use std::fmt;
use std::ops::BitOr;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::event::CompletionEvent;
use crate::node::TaskNode;
use crate::queue::MusaQueue;

/// Which timestamps a node asks the queue to capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ExecutionHints(u8);

impl ExecutionHints {
    pub const NONE: ExecutionHints = ExecutionHints(0);
    pub const SUBMISSION_TIMESTAMP: ExecutionHints = ExecutionHints(1);
    pub const START_TIMESTAMP: ExecutionHints = ExecutionHints(1 << 1);
    pub const FINISH_TIMESTAMP: ExecutionHints = ExecutionHints(1 << 2);

    pub const fn all() -> Self {
        ExecutionHints(0b111)
    }

    pub const fn contains(self, other: ExecutionHints) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl BitOr for ExecutionHints {
    type Output = ExecutionHints;

    fn bitor(self, rhs: Self) -> Self::Output {
        ExecutionHints(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrumentationKind {
    SubmissionTimestamp,
    ExecutionStartTimestamp,
    ExecutionFinishTimestamp,
}

pub trait Timestamp: Send + Sync + fmt::Debug {
    /// Wall-clock time of the measured point, or `None` while the device has
    /// not reached it.
    fn timestamp(&self) -> Option<SystemTime>;
}

/// Anchors device event times to wall-clock time.
///
/// Captured once per queue after the reference event completed.
#[derive(Debug)]
pub struct TimingReference {
    event: Arc<CompletionEvent>,
    host_time: SystemTime,
}

impl TimingReference {
    pub(crate) fn new(event: Arc<CompletionEvent>, host_time: SystemTime) -> Self {
        Self { event, host_time }
    }

    pub fn event(&self) -> &Arc<CompletionEvent> {
        &self.event
    }

    pub fn host_time(&self) -> SystemTime {
        self.host_time
    }

    pub fn resolve(&self, event: &CompletionEvent) -> Option<SystemTime> {
        if !event.is_complete() {
            return None;
        }
        Some(self.host_time + event.elapsed_since(&self.event))
    }
}

#[derive(Debug)]
pub struct SubmissionTimestamp {
    at: SystemTime,
}

impl Timestamp for SubmissionTimestamp {
    fn timestamp(&self) -> Option<SystemTime> {
        Some(self.at)
    }
}

#[derive(Debug)]
pub struct ExecutionStartTimestamp {
    reference: Arc<TimingReference>,
    start: Arc<CompletionEvent>,
}

impl Timestamp for ExecutionStartTimestamp {
    fn timestamp(&self) -> Option<SystemTime> {
        self.reference.resolve(&self.start)
    }
}

#[derive(Debug)]
pub struct ExecutionFinishTimestamp {
    reference: Arc<TimingReference>,
    start: Option<Arc<CompletionEvent>>,
    finish: Arc<CompletionEvent>,
}

impl Timestamp for ExecutionFinishTimestamp {
    fn timestamp(&self) -> Option<SystemTime> {
        match &self.start {
            // Measuring from the start event keeps start and finish consistent.
            Some(start) => {
                let started = self.reference.resolve(start)?;
                if !self.finish.is_complete() {
                    return None;
                }
                Some(started + self.finish.elapsed_since(start))
            }
            None => self.reference.resolve(&self.finish),
        }
    }
}

/// Timestamps collected for one operation.
#[derive(Debug, Default)]
pub struct InstrumentationSet {
    entries: Mutex<Vec<(InstrumentationKind, Arc<dyn Timestamp>)>>,
}

impl InstrumentationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kind: InstrumentationKind, timestamp: Arc<dyn Timestamp>) {
        self.entries
            .lock()
            .expect("instrumentation set poisoned")
            .push((kind, timestamp));
    }

    pub fn get(&self, kind: InstrumentationKind) -> Option<Arc<dyn Timestamp>> {
        self.entries
            .lock()
            .expect("instrumentation set poisoned")
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, ts)| Arc::clone(ts))
    }

    pub fn contains(&self, kind: InstrumentationKind) -> bool {
        self.get(kind).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("instrumentation set poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Brackets one submission with the timestamps its node asked for.
///
/// Construction records the submission time and start event; dropping the
/// guard records the finish event, so the finish point follows the submitted
/// work even on early return.
pub struct InstrumentationGuard<'a> {
    queue: &'a MusaQueue,
    set: &'a InstrumentationSet,
    hints: ExecutionHints,
    start: Option<Arc<CompletionEvent>>,
}

impl<'a> InstrumentationGuard<'a> {
    pub fn new(queue: &'a MusaQueue, set: &'a InstrumentationSet, node: Option<&TaskNode>) -> Self {
        let hints = node.map(TaskNode::execution_hints).unwrap_or_default();

        if hints.contains(ExecutionHints::SUBMISSION_TIMESTAMP) {
            set.add(
                InstrumentationKind::SubmissionTimestamp,
                Arc::new(SubmissionTimestamp {
                    at: SystemTime::now(),
                }),
            );
        }

        let mut start = None;
        if hints.contains(ExecutionHints::START_TIMESTAMP) {
            start = queue.insert_event();
            if let Some(event) = &start {
                set.add(
                    InstrumentationKind::ExecutionStartTimestamp,
                    Arc::new(ExecutionStartTimestamp {
                        reference: Arc::clone(queue.timing_reference()),
                        start: Arc::clone(event),
                    }),
                );
            }
        }

        Self {
            queue,
            set,
            hints,
            start,
        }
    }
}

impl Drop for InstrumentationGuard<'_> {
    fn drop(&mut self) {
        if !self.hints.contains(ExecutionHints::FINISH_TIMESTAMP) {
            return;
        }
        if let Some(finish) = self.queue.insert_event() {
            self.set.add(
                InstrumentationKind::ExecutionFinishTimestamp,
                Arc::new(ExecutionFinishTimestamp {
                    reference: Arc::clone(self.queue.timing_reference()),
                    start: self.start.take(),
                    finish,
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_flags_combine() {
        let hints = ExecutionHints::SUBMISSION_TIMESTAMP | ExecutionHints::FINISH_TIMESTAMP;
        assert!(hints.contains(ExecutionHints::SUBMISSION_TIMESTAMP));
        assert!(hints.contains(ExecutionHints::FINISH_TIMESTAMP));
        assert!(!hints.contains(ExecutionHints::START_TIMESTAMP));
        assert!(!ExecutionHints::NONE.contains(ExecutionHints::NONE));
        assert!(ExecutionHints::all().contains(hints));
    }

    #[test]
    fn set_returns_first_entry_of_kind() {
        let set = InstrumentationSet::new();
        assert!(set.is_empty());
        set.add(
            InstrumentationKind::SubmissionTimestamp,
            Arc::new(SubmissionTimestamp {
                at: SystemTime::UNIX_EPOCH,
            }),
        );
        let ts = set.get(InstrumentationKind::SubmissionTimestamp).unwrap();
        assert_eq!(ts.timestamp(), Some(SystemTime::UNIX_EPOCH));
        assert!(!set.contains(InstrumentationKind::ExecutionFinishTimestamp));
    }
}
