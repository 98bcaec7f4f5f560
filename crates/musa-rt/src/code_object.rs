use std::fmt;
use std::sync::Arc;

use crate::driver::{Driver, ModuleHandle};
use crate::error::{ErrorKind, RuntimeError, RuntimeResult};
use crate::hcf::HcfObjectId;
use crate::kernel_config::{CompilationFlow, ConfigId};

/// Kernel symbols a device image exports, from its `.entry` directives.
pub fn exported_kernel_names(image: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(image);
    let mut names = Vec::new();
    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token != ".entry" {
                continue;
            }
            if let Some(next) = tokens.next() {
                let name = next.split('(').next().unwrap_or_default();
                if !name.is_empty() && !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
            break;
        }
    }
    names
}

/// Provenance of a code object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeObjectSource {
    pub flow: CompilationFlow,
    pub hcf_object: HcfObjectId,
    pub target_arch: String,
    pub config_id: ConfigId,
}

/// A device image loaded as a module on one device.
///
/// Unloads its module on drop.
pub struct CodeObject {
    driver: Arc<dyn Driver>,
    module: ModuleHandle,
    device: i32,
    kernel_names: Vec<String>,
    source: CodeObjectSource,
}

impl CodeObject {
    /// Loads `image` on `device`. When `kernel_names` is empty the exported
    /// symbols are read from the image.
    pub fn load(
        driver: Arc<dyn Driver>,
        device: i32,
        image: &[u8],
        kernel_names: Vec<String>,
        source: CodeObjectSource,
    ) -> RuntimeResult<Self> {
        driver.activate_device(device).map_err(|err| {
            RuntimeError::native(ErrorKind::Configuration, "code object: couldn't activate device", err)
        })?;
        let module = driver.load_module(image).map_err(|err| {
            RuntimeError::native(
                ErrorKind::Configuration,
                format!("code object: couldn't load {} image for {}", source.flow, source.target_arch),
                err,
            )
        })?;
        let kernel_names = if kernel_names.is_empty() {
            exported_kernel_names(image)
        } else {
            kernel_names
        };
        log::debug!(
            "loaded {} code object for {} on device {device} ({} kernels, config {})",
            source.flow,
            source.target_arch,
            kernel_names.len(),
            source.config_id
        );
        Ok(Self {
            driver,
            module,
            device,
            kernel_names,
            source,
        })
    }

    pub fn module(&self) -> ModuleHandle {
        self.module
    }

    pub fn device(&self) -> i32 {
        self.device
    }

    pub fn source(&self) -> &CodeObjectSource {
        &self.source
    }

    /// Whether this object's module belongs to `driver`.
    pub fn is_loaded_by(&self, driver: &Arc<dyn Driver>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.driver), Arc::as_ptr(driver))
    }

    pub fn supported_backend_kernel_names(&self) -> &[String] {
        &self.kernel_names
    }

    pub fn contains(&self, kernel: &str) -> bool {
        self.kernel_names.iter().any(|k| k == kernel)
    }

    /// First exported kernel whose name contains `fragment`, in export order.
    pub fn find_kernel_by_fragment(&self, fragment: &str) -> Option<&str> {
        self.kernel_names
            .iter()
            .find(|name| name.contains(fragment))
            .map(String::as_str)
    }
}

impl fmt::Debug for CodeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeObject")
            .field("module", &self.module)
            .field("device", &self.device)
            .field("kernels", &self.kernel_names)
            .field("source", &self.source)
            .finish()
    }
}

impl Drop for CodeObject {
    fn drop(&mut self) {
        if let Err(err) = self.driver.unload_module(self.module) {
            log::warn!("code object: couldn't unload module: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::HostDriver;

    const IMAGE: &[u8] = b"\
.version 8.0
.target mp_21
.visible .entry _Z6kernelIiEvPT_(
    .param .u64 p0
)
{
}
.visible .entry _Z6kernelIfEvPT_()
{
}
";

    #[test]
    fn parses_entry_directives() {
        assert_eq!(
            exported_kernel_names(IMAGE),
            vec!["_Z6kernelIiEvPT_", "_Z6kernelIfEvPT_"]
        );
        assert!(exported_kernel_names(b"").is_empty());
    }

    #[test]
    fn fragment_lookup_is_first_in_export_order() {
        let driver = Arc::new(HostDriver::new());
        let source = CodeObjectSource {
            flow: CompilationFlow::ExplicitMultipass,
            hcf_object: HcfObjectId(1),
            target_arch: "mp_21".into(),
            config_id: ConfigId::from_raw(1),
        };
        let obj = CodeObject::load(driver.clone(), 0, IMAGE, Vec::new(), source).unwrap();
        assert_eq!(obj.find_kernel_by_fragment("kernel"), Some("_Z6kernelIiEvPT_"));
        assert_eq!(obj.find_kernel_by_fragment("IfE"), Some("_Z6kernelIfEvPT_"));
        assert_eq!(obj.find_kernel_by_fragment("missing"), None);

        drop(obj);
        assert_eq!(driver.stats().modules_unloaded, 1);
    }
}
