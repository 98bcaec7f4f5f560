use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use crate::code_object::CodeObject;
use crate::driver::Driver;
use crate::error::{RuntimeError, RuntimeResult};
use crate::kernel_config::ConfigId;

/// Outcome of one build, shared with every caller that joined while it ran.
struct InFlight<V> {
    outcome: Mutex<Option<RuntimeResult<Arc<V>>>>,
    done: Condvar,
}

impl<V> InFlight<V> {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn publish(&self, outcome: RuntimeResult<Arc<V>>) {
        *self.outcome.lock().expect("kernel cache build slot poisoned") = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> RuntimeResult<Arc<V>> {
        let mut outcome = self.outcome.lock().expect("kernel cache build slot poisoned");
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            outcome = self.done.wait(outcome).expect("kernel cache build slot poisoned");
        }
    }
}

/// Map whose builds run at most once per key at a time.
///
/// The first caller for a missing key builds it; callers arriving while that
/// build runs block on its slot and receive the same outcome, error included.
/// The slot is removed when the build finishes, so a failed key is built
/// again by the next request. Different keys never wait on each other.
struct GatedMap<V> {
    entries: Mutex<HashMap<ConfigId, Arc<V>>>,
    in_flight: Mutex<HashMap<ConfigId, Arc<InFlight<V>>>>,
}

enum Lookup<V> {
    Hit(Arc<V>),
    Built(Arc<V>),
}

/// Publishes a failure to joined callers if the builder unwinds.
struct BuildSlot<'a, V> {
    map: &'a GatedMap<V>,
    key: ConfigId,
    slot: Arc<InFlight<V>>,
    finished: bool,
}

impl<V> BuildSlot<'_, V> {
    fn finish(mut self, outcome: RuntimeResult<Arc<V>>) {
        if let Ok(built) = &outcome {
            self.map
                .entries
                .lock()
                .expect("kernel cache poisoned")
                .insert(self.key, Arc::clone(built));
        }
        self.map.release(self.key);
        self.slot.publish(outcome);
        self.finished = true;
    }
}

impl<V> Drop for BuildSlot<'_, V> {
    fn drop(&mut self) {
        if !self.finished {
            self.map.release(self.key);
            self.slot.publish(Err(RuntimeError::configuration(format!(
                "build of {} panicked",
                self.key
            ))));
        }
    }
}

impl<V> GatedMap<V> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: ConfigId) -> Option<Arc<V>> {
        self.entries
            .lock()
            .expect("kernel cache poisoned")
            .get(&key)
            .cloned()
    }

    fn get_or_try_build(&self, key: ConfigId, build: impl FnOnce() -> RuntimeResult<V>) -> RuntimeResult<Lookup<V>> {
        if let Some(found) = self.get(key) {
            return Ok(Lookup::Hit(found));
        }

        let leader = {
            let mut in_flight = self.in_flight.lock().expect("kernel cache builds poisoned");
            // Finished builds insert their entry before leaving `in_flight`.
            if let Some(found) = self.get(key) {
                return Ok(Lookup::Hit(found));
            }
            match in_flight.get(&key) {
                Some(slot) => Err(Arc::clone(slot)),
                None => {
                    let slot = Arc::new(InFlight::new());
                    in_flight.insert(key, Arc::clone(&slot));
                    Ok(BuildSlot {
                        map: self,
                        key,
                        slot,
                        finished: false,
                    })
                }
            }
        };

        match leader {
            Ok(slot) => {
                let outcome = build().map(Arc::new);
                slot.finish(outcome.clone());
                outcome.map(Lookup::Built)
            }
            Err(slot) => slot.wait().map(Lookup::Hit),
        }
    }

    fn release(&self, key: ConfigId) {
        self.in_flight
            .lock()
            .expect("kernel cache builds poisoned")
            .remove(&key);
    }

    fn retain(&self, keep: impl FnMut(&ConfigId, &mut Arc<V>) -> bool) {
        self.entries.lock().expect("kernel cache poisoned").retain(keep);
    }

    fn len(&self) -> usize {
        self.entries.lock().expect("kernel cache poisoned").len()
    }

    fn in_flight_count(&self) -> usize {
        self.in_flight.lock().expect("kernel cache builds poisoned").len()
    }

    fn clear(&self) {
        self.entries.lock().expect("kernel cache poisoned").clear();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Code objects constructed.
    pub builds: u64,
    /// Device images produced by the JIT translator.
    pub compilations: u64,
    pub failures: u64,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
    compilations: AtomicU64,
    failures: AtomicU64,
}

/// Process-wide store of loaded code objects and JIT-compiled images.
///
/// Code objects are keyed by their full configuration including the runtime
/// device. Compiled images are keyed by the device-independent binary
/// configuration, so devices with the same configuration share one compile.
pub struct KernelCache {
    code_objects: GatedMap<CodeObject>,
    images: GatedMap<Vec<u8>>,
    counters: CacheCounters,
}

impl Default for KernelCache {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelCache {
    pub fn new() -> Self {
        Self {
            code_objects: GatedMap::new(),
            images: GatedMap::new(),
            counters: CacheCounters::default(),
        }
    }

    pub fn global() -> Arc<KernelCache> {
        static GLOBAL: OnceLock<Arc<KernelCache>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(KernelCache::new())))
    }

    pub fn get(&self, key: ConfigId) -> Option<Arc<CodeObject>> {
        self.code_objects.get(key)
    }

    /// Returns the code object for `key`, running `build` if none is cached.
    pub fn get_or_construct<F>(&self, key: ConfigId, build: F) -> RuntimeResult<Arc<CodeObject>>
    where
        F: FnOnce() -> RuntimeResult<CodeObject>,
    {
        let lookup = self.code_objects.get_or_try_build(key, || {
            build().inspect_err(|err| {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("code object {key} construction failed: {err}");
            })
        })?;
        Ok(self.account(lookup))
    }

    /// Two-level lookup for JIT kernels: the compiled image is found or made
    /// under `compile_key`, then loaded into a code object under `key`.
    pub fn get_or_construct_jit<C, B>(
        &self,
        key: ConfigId,
        compile_key: ConfigId,
        compile: C,
        build: B,
    ) -> RuntimeResult<Arc<CodeObject>>
    where
        C: FnOnce() -> RuntimeResult<Vec<u8>>,
        B: FnOnce(&[u8]) -> RuntimeResult<CodeObject>,
    {
        self.get_or_construct(key, || {
            let image = match self.images.get_or_try_build(compile_key, compile)? {
                Lookup::Hit(image) => {
                    log::trace!("reusing compiled image {compile_key} for code object {key}");
                    image
                }
                Lookup::Built(image) => {
                    self.counters.compilations.fetch_add(1, Ordering::Relaxed);
                    image
                }
            };
            build(&image)
        })
    }

    pub fn len(&self) -> usize {
        self.code_objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn compiled_image_count(&self) -> usize {
        self.images.len()
    }

    /// Drops every cached entry. Code objects still held by callers stay
    /// loaded until released.
    pub fn clear(&self) {
        self.code_objects.clear();
        self.images.clear();
    }

    /// Drops the code objects loaded through `driver`, leaving entries other
    /// drivers built in place. Returns how many were evicted.
    pub fn evict_driver(&self, driver: &Arc<dyn Driver>) -> usize {
        let mut evicted = 0;
        self.code_objects.retain(|key, object| {
            if object.is_loaded_by(driver) {
                log::trace!("evicting code object {key}");
                evicted += 1;
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Builds currently running across both cache levels.
    pub fn pending_builds(&self) -> usize {
        self.code_objects.in_flight_count() + self.images.in_flight_count()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            builds: c.builds.load(Ordering::Relaxed),
            compilations: c.compilations.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }

    fn account(&self, lookup: Lookup<CodeObject>) -> Arc<CodeObject> {
        match lookup {
            Lookup::Hit(found) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                found
            }
            Lookup::Built(built) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.counters.builds.fetch_add(1, Ordering::Relaxed);
                built
            }
        }
    }
}
