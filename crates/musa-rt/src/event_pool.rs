use std::sync::{Arc, Mutex};

use crate::diagnostics::ErrorSink;
use crate::driver::{Driver, EventHandle};
use crate::error::{ErrorKind, RuntimeError, RuntimeResult};

/// Creates native events on one device, activating it before every call.
pub struct EventFactory {
    driver: Arc<dyn Driver>,
    device: i32,
}

impl EventFactory {
    pub fn new(driver: Arc<dyn Driver>, device: i32) -> Self {
        Self { driver, device }
    }

    pub fn create(&self) -> RuntimeResult<EventHandle> {
        self.driver.activate_device(self.device).map_err(|err| {
            RuntimeError::native(ErrorKind::Allocation, "event factory: couldn't activate device", err)
        })?;
        self.driver.create_event().map_err(|err| {
            RuntimeError::native(ErrorKind::Allocation, "event factory: couldn't create event", err)
        })
    }

    pub fn destroy(&self, event: EventHandle) -> RuntimeResult<()> {
        self.driver.destroy_event(event).map_err(|err| {
            RuntimeError::native(ErrorKind::Allocation, "event factory: couldn't destroy event", err)
        })
    }
}

/// Per-device recycler of native event handles.
///
/// Handles return to the pool when their [`CompletionEvent`](crate::event::CompletionEvent)
/// is dropped; idle handles are destroyed with the pool.
pub struct EventPool {
    factory: EventFactory,
    idle: Mutex<Vec<EventHandle>>,
    sink: Arc<ErrorSink>,
}

impl EventPool {
    pub fn new(driver: Arc<dyn Driver>, device: i32, sink: Arc<ErrorSink>) -> Self {
        Self {
            factory: EventFactory::new(driver, device),
            idle: Mutex::new(Vec::new()),
            sink,
        }
    }

    pub fn device(&self) -> i32 {
        self.factory.device
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.factory.driver
    }

    pub fn error_sink(&self) -> &Arc<ErrorSink> {
        &self.sink
    }

    /// Hands out a recycled handle, or a freshly created one when none is idle.
    pub fn obtain(&self) -> RuntimeResult<EventHandle> {
        if let Some(event) = self.idle.lock().expect("event pool poisoned").pop() {
            return Ok(event);
        }
        self.factory.create()
    }

    pub fn release(&self, event: EventHandle) {
        self.idle.lock().expect("event pool poisoned").push(event);
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().expect("event pool poisoned").len()
    }
}

impl Drop for EventPool {
    fn drop(&mut self) {
        let idle = self.idle.get_mut().map(std::mem::take).unwrap_or_default();
        for event in idle {
            if let Err(err) = self.factory.destroy(event) {
                self.sink.register(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{HostCall, HostDriver};

    #[test]
    fn released_handles_are_reused() {
        let driver = Arc::new(HostDriver::new());
        let pool = EventPool::new(driver.clone(), 0, Arc::new(ErrorSink::new()));

        let first = pool.obtain().unwrap();
        pool.release(first);
        let second = pool.obtain().unwrap();
        assert_eq!(first, second);
        assert_eq!(driver.stats().events_created, 1);
        pool.release(second);
    }

    #[test]
    fn dropping_pool_destroys_idle_handles() {
        let driver = Arc::new(HostDriver::new());
        let pool = EventPool::new(driver.clone(), 0, Arc::new(ErrorSink::new()));
        let a = pool.obtain().unwrap();
        let b = pool.obtain().unwrap();
        pool.release(a);
        pool.release(b);
        assert_eq!(driver.live_events(), 2);

        drop(pool);
        assert_eq!(driver.live_events(), 0);
        assert_eq!(driver.stats().events_destroyed, 2);
    }

    #[test]
    fn creation_failure_is_an_allocation_error() {
        let driver = Arc::new(HostDriver::new());
        let pool = EventPool::new(driver.clone(), 0, Arc::new(ErrorSink::new()));
        driver.fail_next(HostCall::CreateEvent, 2);
        let err = pool.obtain().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Allocation);
        assert_eq!(err.native_error().map(|n| n.code), Some(2));
    }

    #[test]
    fn handles_are_never_shared_under_contention() {
        use std::collections::HashSet;
        use std::sync::Barrier;
        use std::thread;

        let driver = Arc::new(HostDriver::new());
        let pool = Arc::new(EventPool::new(driver.clone(), 0, Arc::new(ErrorSink::new())));
        let held = Arc::new(Mutex::new(HashSet::new()));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (pool, held, barrier) = (pool.clone(), held.clone(), barrier.clone());
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..200 {
                        let event = pool.obtain().unwrap();
                        assert!(held.lock().unwrap().insert(event), "handle {event:?} handed out twice");
                        thread::yield_now();
                        assert!(held.lock().unwrap().remove(&event));
                        pool.release(event);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let created = driver.stats().events_created;
        assert!((1..=8).contains(&created));
        assert_eq!(pool.idle_count(), created);
    }
}
