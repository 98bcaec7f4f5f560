//! Image selection and launch-dependent specialization for JIT kernels.

use crate::config::AdaptivityLevel;
use crate::error::{RuntimeError, RuntimeResult};
use crate::hcf::{HcfContainer, HcfKernelInfo, HcfNode, HcfObjectId};
use crate::kernel::KernelLaunch;
use crate::kernel_config::{build_option, ConfigId, KernelConfiguration};

pub const GENERIC_ARCH: &str = "generic";

/// Family prefix of an architecture string: `mp_21` and `mp_22` share `mp`.
pub fn arch_family(arch: &str) -> &str {
    arch.rsplit_once('_').map_or(arch, |(family, _)| family)
}

pub fn is_compatible(image_arch: &str, device_arch: &str) -> bool {
    image_arch.is_empty()
        || image_arch == GENERIC_ARCH
        || image_arch == device_arch
        || arch_family(image_arch) == arch_family(device_arch)
}

/// Exact architecture match first, else the first compatible node in listed order.
pub fn select_target<'a>(candidates: &'a [HcfNode], device_arch: &str) -> Option<&'a HcfNode> {
    candidates
        .iter()
        .find(|node| node.target_arch() == device_arch)
        .or_else(|| {
            candidates
                .iter()
                .find(|node| is_compatible(node.target_arch(), device_arch))
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSelection<'a> {
    pub image: &'a HcfNode,
    pub kernels: Vec<String>,
    /// The object holds only the requested kernel, so its name is part of
    /// the binary configuration.
    pub narrowed: bool,
}

pub struct KernelAdaptivityEngine<'a> {
    hcf_object: HcfObjectId,
    kernel_name: &'a str,
    kernel_info: &'a HcfKernelInfo,
    launch: &'a KernelLaunch,
    level: AdaptivityLevel,
}

impl<'a> KernelAdaptivityEngine<'a> {
    pub fn new(
        hcf_object: HcfObjectId,
        kernel_name: &'a str,
        kernel_info: &'a HcfKernelInfo,
        launch: &'a KernelLaunch,
        level: AdaptivityLevel,
    ) -> Self {
        Self {
            hcf_object,
            kernel_name,
            kernel_info,
            launch,
            level,
        }
    }

    pub fn kernel_info(&self) -> &HcfKernelInfo {
        self.kernel_info
    }

    /// Chooses the image to compile and the kernels to put into the object.
    pub fn select_image_and_kernels<'h>(
        &self,
        hcf: &'h HcfContainer,
        device_arch: &str,
    ) -> RuntimeResult<ImageSelection<'h>> {
        let images = hcf.images();
        let image = select_target(images, device_arch).ok_or_else(|| {
            RuntimeError::configuration(format!(
                "HCF object {} has no image compatible with {device_arch} (available: {})",
                self.hcf_object,
                images
                    .iter()
                    .map(|node| node.target_arch())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;

        let listed = image.kernel_names();
        if !listed.is_empty() && !listed.iter().any(|k| k == self.kernel_name) {
            return Err(RuntimeError::configuration(format!(
                "image {} of HCF object {} does not contain kernel {}",
                image.name, self.hcf_object, self.kernel_name
            )));
        }

        let narrowed = self.level.narrows_kernels() || listed.is_empty();
        let kernels = if narrowed {
            vec![self.kernel_name.to_string()]
        } else {
            listed
        };
        Ok(ImageSelection {
            image,
            kernels,
            narrowed,
        })
    }

    /// Folds launch-dependent choices into `config` and returns its fingerprint.
    pub fn finalize_binary_configuration(
        &self,
        selection: &ImageSelection<'_>,
        config: &mut KernelConfiguration,
    ) -> ConfigId {
        if selection.narrowed {
            config.set_build_option(build_option::SPECIALIZED_KERNEL, self.kernel_name);
        }
        if self.level.specializes_launch() {
            let group = self.launch.group_size();
            config.set_build_option(build_option::KNOWN_GROUP_SIZE_X, group.x);
            config.set_build_option(build_option::KNOWN_GROUP_SIZE_Y, group.y);
            config.set_build_option(build_option::KNOWN_GROUP_SIZE_Z, group.z);
            config.set_build_option(build_option::KNOWN_LOCAL_MEM_SIZE, self.launch.local_mem_bytes());
        }
        config.generate_id()
    }
}
