//! Kernel operations and the per-backend launchers they carry.

use std::ffi::c_void;

use crate::device::BackendId;
use crate::error::{RuntimeError, RuntimeResult};
use crate::hcf::HcfObjectId;
use crate::instrumentation::InstrumentationSet;
use crate::kernel_config::KernelConfiguration;
use crate::node::TaskNode;

pub use crate::driver::Dim3;

/// Multipass kernels compiled without a user-provided name carry this in their tag.
pub const UNNAMED_KERNEL_MARKER: &str = "__unnamed_kernel";

/// Picks the name used to look a multipass kernel up in its code object.
pub fn backend_kernel_name<'a>(kernel_name_tag: &'a str, kernel_body_name: &'a str) -> &'a str {
    if kernel_name_tag.contains(UNNAMED_KERNEL_MARKER) {
        kernel_body_name
    } else {
        kernel_name_tag
    }
}

/// Geometry and caller arguments of one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLaunch {
    num_groups: Dim3,
    group_size: Dim3,
    local_mem_bytes: u32,
    args: Vec<usize>,
    arg_sizes: Vec<usize>,
}

impl KernelLaunch {
    /// # Safety
    /// Every `args[i]` must point at `arg_sizes[i]` readable bytes that stay
    /// valid until the launch has been submitted.
    pub unsafe fn new(
        num_groups: Dim3,
        group_size: Dim3,
        local_mem_bytes: u32,
        args: &[*mut c_void],
        arg_sizes: &[usize],
    ) -> Self {
        Self {
            num_groups,
            group_size,
            local_mem_bytes,
            args: args.iter().map(|&p| p as usize).collect(),
            arg_sizes: arg_sizes.to_vec(),
        }
    }

    pub fn num_groups(&self) -> Dim3 {
        self.num_groups
    }

    pub fn group_size(&self) -> Dim3 {
        self.group_size
    }

    pub fn local_mem_bytes(&self) -> u32 {
        self.local_mem_bytes
    }

    pub fn arg_addresses(&self) -> &[usize] {
        &self.args
    }

    pub fn arg_sizes(&self) -> &[usize] {
        &self.arg_sizes
    }

    pub(crate) fn arg_pointers(&self) -> Vec<*mut c_void> {
        self.args.iter().map(|&a| a as *mut c_void).collect()
    }
}

/// Launches code-object kernels compiled ahead of time for a target arch.
pub trait MultipassInvoker {
    fn submit_multipass_kernel(
        &self,
        op: &KernelOperation,
        node: Option<&TaskNode>,
        hcf_object: HcfObjectId,
        backend_kernel_name: &str,
        launch: &KernelLaunch,
    ) -> RuntimeResult<()>;
}

/// Launches kernels JIT-compiled from portable IR.
pub trait SscpInvoker {
    fn submit_sscp_kernel(
        &self,
        op: &KernelOperation,
        node: Option<&TaskNode>,
        hcf_object: HcfObjectId,
        kernel_name: &str,
        launch: &KernelLaunch,
        config: &KernelConfiguration,
    ) -> RuntimeResult<()>;
}

/// What the executing queue can do for a launcher.
#[derive(Default, Clone, Copy)]
pub struct LaunchCapabilities<'a> {
    multipass: Option<&'a dyn MultipassInvoker>,
    sscp: Option<&'a dyn SscpInvoker>,
}

impl<'a> LaunchCapabilities<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_multipass(mut self, invoker: &'a dyn MultipassInvoker) -> Self {
        self.multipass = Some(invoker);
        self
    }

    pub fn with_sscp(mut self, invoker: &'a dyn SscpInvoker) -> Self {
        self.sscp = Some(invoker);
        self
    }

    pub fn multipass_invoker(&self) -> Option<&'a dyn MultipassInvoker> {
        self.multipass
    }

    pub fn sscp_invoker(&self) -> Option<&'a dyn SscpInvoker> {
        self.sscp
    }
}

pub trait BackendKernelLauncher: Send + Sync {
    fn backend(&self) -> BackendId;
    fn invoke(
        &self,
        caps: &LaunchCapabilities<'_>,
        op: &KernelOperation,
        node: Option<&TaskNode>,
    ) -> RuntimeResult<()>;
}

pub struct MultipassLauncher {
    hcf_object: HcfObjectId,
    kernel_name_tag: String,
    kernel_body_name: String,
    launch: KernelLaunch,
}

impl MultipassLauncher {
    pub fn new(
        hcf_object: HcfObjectId,
        kernel_name_tag: impl Into<String>,
        kernel_body_name: impl Into<String>,
        launch: KernelLaunch,
    ) -> Self {
        Self {
            hcf_object,
            kernel_name_tag: kernel_name_tag.into(),
            kernel_body_name: kernel_body_name.into(),
            launch,
        }
    }
}

impl BackendKernelLauncher for MultipassLauncher {
    fn backend(&self) -> BackendId {
        BackendId::Musa
    }

    fn invoke(
        &self,
        caps: &LaunchCapabilities<'_>,
        op: &KernelOperation,
        node: Option<&TaskNode>,
    ) -> RuntimeResult<()> {
        let invoker = caps
            .multipass_invoker()
            .ok_or_else(|| RuntimeError::launch("queue cannot launch multipass kernels"))?;
        let name = backend_kernel_name(&self.kernel_name_tag, &self.kernel_body_name);
        invoker.submit_multipass_kernel(op, node, self.hcf_object, name, &self.launch)
    }
}

pub struct SscpLauncher {
    hcf_object: HcfObjectId,
    kernel_name: String,
    launch: KernelLaunch,
}

impl SscpLauncher {
    pub fn new(hcf_object: HcfObjectId, kernel_name: impl Into<String>, launch: KernelLaunch) -> Self {
        Self {
            hcf_object,
            kernel_name: kernel_name.into(),
            launch,
        }
    }
}

impl BackendKernelLauncher for SscpLauncher {
    fn backend(&self) -> BackendId {
        BackendId::Musa
    }

    fn invoke(
        &self,
        caps: &LaunchCapabilities<'_>,
        op: &KernelOperation,
        node: Option<&TaskNode>,
    ) -> RuntimeResult<()> {
        let invoker = caps
            .sscp_invoker()
            .ok_or_else(|| RuntimeError::launch("queue cannot launch SSCP kernels"))?;
        invoker.submit_sscp_kernel(
            op,
            node,
            self.hcf_object,
            &self.kernel_name,
            &self.launch,
            op.configuration(),
        )
    }
}

#[derive(Default)]
pub struct KernelLauncherSet {
    launchers: Vec<Box<dyn BackendKernelLauncher>>,
}

impl KernelLauncherSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, launcher: impl BackendKernelLauncher + 'static) -> Self {
        self.launchers.push(Box::new(launcher));
        self
    }

    pub fn find(&self, backend: BackendId) -> Option<&dyn BackendKernelLauncher> {
        self.launchers
            .iter()
            .find(|launcher| launcher.backend() == backend)
            .map(Box::as_ref)
    }
}

pub struct KernelOperation {
    launchers: KernelLauncherSet,
    configuration: KernelConfiguration,
    instrumentations: InstrumentationSet,
}

impl KernelOperation {
    pub fn new(launchers: KernelLauncherSet) -> Self {
        Self::with_configuration(launchers, KernelConfiguration::new())
    }

    /// `configuration` seeds the SSCP binary configuration, e.g. with
    /// specialization constants.
    pub fn with_configuration(launchers: KernelLauncherSet, configuration: KernelConfiguration) -> Self {
        Self {
            launchers,
            configuration,
            instrumentations: InstrumentationSet::new(),
        }
    }

    pub fn launchers(&self) -> &KernelLauncherSet {
        &self.launchers
    }

    pub fn configuration(&self) -> &KernelConfiguration {
        &self.configuration
    }

    pub fn instrumentations(&self) -> &InstrumentationSet {
        &self.instrumentations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unnamed_tag_falls_back_to_body_name() {
        assert_eq!(backend_kernel_name("my_kernel", "body"), "my_kernel");
        assert_eq!(
            backend_kernel_name("_Z16__unnamed_kernelIJ3fooEE", "_Z4bodyv"),
            "_Z4bodyv"
        );
    }

    #[test]
    fn launcher_lookup_by_backend() {
        let launch = unsafe { KernelLaunch::new(Dim3::linear(1), Dim3::linear(1), 0, &[], &[]) };
        let set = KernelLauncherSet::new().with(SscpLauncher::new(HcfObjectId(1), "k", launch));
        assert!(set.find(BackendId::Musa).is_some());
        assert!(set.find(BackendId::Cuda).is_none());
    }

    #[test]
    fn missing_capability_is_a_launch_error() {
        let launch = unsafe { KernelLaunch::new(Dim3::linear(1), Dim3::linear(1), 0, &[], &[]) };
        let launcher = MultipassLauncher::new(HcfObjectId(1), "k", "k", launch);
        let op = KernelOperation::new(KernelLauncherSet::new());
        let err = launcher.invoke(&LaunchCapabilities::new(), &op, None).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Launch);
    }
}
