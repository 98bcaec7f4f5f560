#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use musa_rt::config::{AdaptivityLevel, RuntimeConfig};
use musa_rt::diagnostics::ErrorSink;
use musa_rt::driver::{Driver, HostDriver};
use musa_rt::hcf::HcfRegistry;
use musa_rt::jit::{TranslationRequest, Translator};
use musa_rt::kernel_cache::KernelCache;
use musa_rt::kernel_config::ConfigId;
use musa_rt::{MusaBackend, RuntimeResult};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Backend with private collaborators so tests never share process-wide state.
pub struct Harness {
    pub driver: Arc<HostDriver>,
    pub backend: Arc<MusaBackend>,
    pub registry: Arc<HcfRegistry>,
    pub cache: Arc<KernelCache>,
    pub sink: Arc<ErrorSink>,
    pub translator: Arc<RecordingTranslator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(HostDriver::new(), AdaptivityLevel::default())
    }

    pub fn with(driver: HostDriver, level: AdaptivityLevel) -> Self {
        init_logging();
        let driver = Arc::new(driver);
        let registry = Arc::new(HcfRegistry::new());
        let cache = Arc::new(KernelCache::new());
        let sink = Arc::new(ErrorSink::new());
        let translator = Arc::new(RecordingTranslator::default());

        let native: Arc<dyn Driver> = driver.clone();
        let backend = MusaBackend::builder(native)
            .config(RuntimeConfig::default().with_adaptivity_level(level))
            .registry(registry.clone())
            .kernel_cache(cache.clone())
            .error_sink(sink.clone())
            .translator(translator.clone())
            .build();

        Self {
            driver,
            backend,
            registry,
            cache,
            sink,
            translator,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedTranslation {
    pub image_name: String,
    pub kernels: Vec<String>,
    pub target_arch: String,
    pub config_id: ConfigId,
}

/// Emits a device image exporting exactly the requested kernels.
#[derive(Default)]
pub struct RecordingTranslator {
    calls: AtomicUsize,
    requests: Mutex<Vec<RecordedTranslation>>,
}

impl RecordingTranslator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedTranslation> {
        self.requests.lock().unwrap().clone()
    }
}

impl Translator for RecordingTranslator {
    fn name(&self) -> &str {
        "recording"
    }

    fn translate(&self, request: &TranslationRequest<'_>) -> RuntimeResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(RecordedTranslation {
            image_name: request.image_name.to_string(),
            kernels: request.kernels.to_vec(),
            target_arch: request.target_arch.to_string(),
            config_id: request.config_id,
        });
        Ok(device_image(request.target_arch, request.kernels))
    }
}

pub fn device_image(arch: &str, kernels: &[String]) -> Vec<u8> {
    let mut image = format!(".version 8.0\n.target {arch}\n");
    for kernel in kernels {
        image.push_str(&format!(".visible .entry {kernel}(\n)\n{{\n    ret;\n}}\n"));
    }
    image.into_bytes()
}
