use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::device::{BackendId, DeviceId};
use crate::diagnostics::ErrorSink;
use crate::driver::{Driver, EventHandle, Readiness};
use crate::error::{ErrorKind, RuntimeError};
use crate::event_pool::EventPool;
use crate::node::NodeEvent;

/// A native event recorded on a MUSA stream.
///
/// Dropping the event hands its handle back to the originating pool, or
/// destroys it directly when the pool is already gone.
pub struct CompletionEvent {
    handle: EventHandle,
    device: DeviceId,
    driver: Arc<dyn Driver>,
    pool: Weak<EventPool>,
    sink: Arc<ErrorSink>,
}

impl CompletionEvent {
    pub(crate) fn new(handle: EventHandle, device: DeviceId, pool: &Arc<EventPool>) -> Self {
        Self {
            handle,
            device,
            driver: Arc::clone(pool.driver()),
            pool: Arc::downgrade(pool),
            sink: Arc::clone(pool.error_sink()),
        }
    }

    pub fn native_handle(&self) -> EventHandle {
        self.handle
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// True once the stream passed the record point. Query failures are
    /// registered and reported as incomplete.
    pub fn is_complete(&self) -> bool {
        match self.driver.query_event(self.handle) {
            Ok(Readiness::Ready) => true,
            Ok(Readiness::NotReady) => false,
            Err(err) => {
                self.sink.register(RuntimeError::native(
                    ErrorKind::Synchronization,
                    "completion event: couldn't query event status",
                    err,
                ));
                false
            }
        }
    }

    /// Time from `earlier` to `self`, rounded to whole nanoseconds.
    ///
    /// Both events must be complete; an event the driver reports as not ready
    /// is a caller bug. Native failures, including a failed status query, are
    /// registered and yield zero. The result is never negative.
    pub fn elapsed_since(&self, earlier: &CompletionEvent) -> Duration {
        for event in [earlier, self] {
            match self.driver.query_event(event.handle) {
                Ok(Readiness::Ready) => {}
                Ok(Readiness::NotReady) => panic!("elapsed time requested for incomplete events"),
                Err(err) => {
                    self.sink.register(RuntimeError::native(
                        ErrorKind::Synchronization,
                        "completion event: couldn't query event status",
                        err,
                    ));
                    return Duration::ZERO;
                }
            }
        }
        match self.driver.event_elapsed_ms(earlier.handle, self.handle) {
            Ok(ms) => {
                let nanos = (f64::from(ms) * 1e6).round();
                if nanos > 0.0 {
                    Duration::from_nanos(nanos as u64)
                } else {
                    Duration::ZERO
                }
            }
            Err(err) => {
                self.sink.register(RuntimeError::native(
                    ErrorKind::Synchronization,
                    "completion event: couldn't determine elapsed time between events",
                    err,
                ));
                Duration::ZERO
            }
        }
    }
}

impl fmt::Debug for CompletionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionEvent")
            .field("handle", &self.handle)
            .field("device", &self.device)
            .finish()
    }
}

impl NodeEvent for CompletionEvent {
    fn backend(&self) -> BackendId {
        BackendId::Musa
    }

    fn is_complete(&self) -> bool {
        CompletionEvent::is_complete(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for CompletionEvent {
    fn drop(&mut self) {
        match self.pool.upgrade() {
            Some(pool) => pool.release(self.handle),
            None => {
                if let Err(err) = self.driver.destroy_event(self.handle) {
                    self.sink.register(RuntimeError::native(
                        ErrorKind::Allocation,
                        "completion event: couldn't destroy orphaned event",
                        err,
                    ));
                }
            }
        }
    }
}
