use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::RuntimeConfig;
use crate::device::DeviceProperties;
use crate::diagnostics::ErrorSink;
use crate::driver::{musa_driver, Driver};
use crate::error::{ErrorKind, RuntimeError, RuntimeResult};
use crate::event_pool::EventPool;
use crate::hcf::HcfRegistry;
use crate::jit::{ToolTranslator, Translator};
use crate::kernel_cache::KernelCache;
use crate::queue::MusaQueue;

/// Everything MUSA queues on one process share.
///
/// Teardown releases event pools, then the code objects cached for this
/// backend's driver, then the driver.
/// Queues keep the backend alive, so they are always gone first.
pub struct MusaBackend {
    driver: Arc<dyn Driver>,
    config: RuntimeConfig,
    registry: Arc<HcfRegistry>,
    translator: Arc<dyn Translator>,
    kernel_cache: Arc<KernelCache>,
    sink: Arc<ErrorSink>,
    event_pools: Mutex<HashMap<i32, Arc<EventPool>>>,
    properties: Mutex<HashMap<i32, DeviceProperties>>,
}

pub struct MusaBackendBuilder {
    driver: Arc<dyn Driver>,
    config: RuntimeConfig,
    registry: Option<Arc<HcfRegistry>>,
    translator: Option<Arc<dyn Translator>>,
    kernel_cache: Option<Arc<KernelCache>>,
    sink: Option<Arc<ErrorSink>>,
}

impl MusaBackendBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: Arc<HcfRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn kernel_cache(mut self, cache: Arc<KernelCache>) -> Self {
        self.kernel_cache = Some(cache);
        self
    }

    pub fn error_sink(mut self, sink: Arc<ErrorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Unset collaborators fall back to the process-wide instances.
    pub fn build(self) -> Arc<MusaBackend> {
        let translator = self
            .translator
            .unwrap_or_else(|| Arc::new(ToolTranslator::from_config(&self.config)));
        log::debug!(
            "MUSA backend on {} driver, adaptivity level {}, JIT via {}",
            self.driver.name(),
            self.config.adaptivity_level,
            translator.name()
        );
        Arc::new(MusaBackend {
            driver: self.driver,
            registry: self.registry.unwrap_or_else(HcfRegistry::global),
            translator,
            kernel_cache: self.kernel_cache.unwrap_or_else(KernelCache::global),
            sink: self.sink.unwrap_or_else(ErrorSink::global),
            config: self.config,
            event_pools: Mutex::new(HashMap::new()),
            properties: Mutex::new(HashMap::new()),
        })
    }
}

impl MusaBackend {
    pub fn builder(driver: Arc<dyn Driver>) -> MusaBackendBuilder {
        MusaBackendBuilder {
            driver,
            config: RuntimeConfig::default(),
            registry: None,
            translator: None,
            kernel_cache: None,
            sink: None,
        }
    }

    /// Backend on the vendor libraries, configured from the environment.
    pub fn from_env() -> RuntimeResult<Arc<MusaBackend>> {
        let driver: Arc<dyn Driver> = musa_driver()?;
        Ok(Self::builder(driver).config(RuntimeConfig::from_env()).build())
    }

    pub fn create_queue(self: &Arc<Self>, device: i32, priority: i32) -> RuntimeResult<MusaQueue> {
        MusaQueue::new(Arc::clone(self), device, priority)
    }

    pub fn device_count(&self) -> RuntimeResult<i32> {
        self.driver.device_count().map_err(|err| {
            RuntimeError::native(ErrorKind::Configuration, "couldn't query MUSA device count", err)
        })
    }

    pub fn device_properties(&self, device: i32) -> RuntimeResult<DeviceProperties> {
        let mut cached = self.properties.lock().expect("device properties poisoned");
        if let Some(found) = cached.get(&device) {
            return Ok(found.clone());
        }
        let props = self.driver.device_properties(device).map_err(|err| {
            RuntimeError::native(
                ErrorKind::Configuration,
                format!("couldn't query properties of MUSA device {device}"),
                err,
            )
        })?;
        cached.insert(device, props.clone());
        Ok(props)
    }

    /// Event pool of `device`, created on first use.
    pub fn event_pool(&self, device: i32) -> Arc<EventPool> {
        let mut pools = self.event_pools.lock().expect("event pools poisoned");
        Arc::clone(pools.entry(device).or_insert_with(|| {
            Arc::new(EventPool::new(
                Arc::clone(&self.driver),
                device,
                Arc::clone(&self.sink),
            ))
        }))
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HcfRegistry> {
        &self.registry
    }

    pub fn translator(&self) -> &Arc<dyn Translator> {
        &self.translator
    }

    pub fn kernel_cache(&self) -> &Arc<KernelCache> {
        &self.kernel_cache
    }

    pub fn error_sink(&self) -> &Arc<ErrorSink> {
        &self.sink
    }
}

impl Drop for MusaBackend {
    fn drop(&mut self) {
        if let Ok(pools) = self.event_pools.get_mut() {
            pools.clear();
        }
        let evicted = self.kernel_cache.evict_driver(&self.driver);
        log::debug!("MUSA backend shut down, {evicted} cached code objects released");
    }
}
