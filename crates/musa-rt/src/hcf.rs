//! Heterogeneous container format: device images and kernel metadata
//! embedded in the host binary.
//!
//! Explicit-multipass containers list one root subnode per target arch, each
//! carrying a compiled image. SSCP containers carry an `images` subnode whose
//! children hold portable IR with `target-arch` and `kernels` attributes.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{RuntimeError, RuntimeResult};

pub const IMAGES_NODE: &str = "images";
pub const TARGET_ARCH_ATTR: &str = "target-arch";
pub const KERNELS_ATTR: &str = "kernels";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HcfObjectId(pub u64);

impl fmt::Display for HcfObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HcfNode {
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub subnodes: Vec<HcfNode>,
    #[serde(default)]
    pub binary: Option<Vec<u8>>,
}

impl HcfNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_subnode(mut self, node: HcfNode) -> Self {
        self.subnodes.push(node);
        self
    }

    pub fn with_binary(mut self, binary: impl Into<Vec<u8>>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn subnode(&self, name: &str) -> Option<&HcfNode> {
        self.subnodes.iter().find(|node| node.name == name)
    }

    pub fn subnode_names(&self) -> Vec<&str> {
        self.subnodes.iter().map(|node| node.name.as_str()).collect()
    }

    pub fn binary(&self) -> Option<&[u8]> {
        self.binary.as_deref()
    }

    pub fn has_binary_data_attached(&self) -> bool {
        self.binary.is_some()
    }

    /// Architecture this node targets; multipass targets are named after it.
    pub fn target_arch(&self) -> &str {
        self.attribute(TARGET_ARCH_ATTR).unwrap_or(&self.name)
    }

    /// Kernels listed in the whitespace-separated `kernels` attribute.
    pub fn kernel_names(&self) -> Vec<String> {
        self.attribute(KERNELS_ATTR)
            .map(|list| list.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HcfContainer {
    pub object_id: HcfObjectId,
    pub root: HcfNode,
}

impl HcfContainer {
    pub fn new(object_id: HcfObjectId, root: HcfNode) -> Self {
        Self { object_id, root }
    }

    pub fn from_json(text: &str) -> RuntimeResult<Self> {
        serde_json::from_str(text)
            .map_err(|err| RuntimeError::configuration(format!("invalid HCF container: {err}")))
    }

    /// Portable images of an SSCP container, in listed order.
    pub fn images(&self) -> &[HcfNode] {
        self.root
            .subnode(IMAGES_NODE)
            .map(|node| node.subnodes.as_slice())
            .unwrap_or(&[])
    }

    /// Multipass target subnodes, in listed order.
    pub fn targets(&self) -> &[HcfNode] {
        &self.root.subnodes
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelParameter {
    pub original_index: usize,
    pub byte_offset: usize,
    pub byte_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HcfKernelInfo {
    #[serde(default)]
    pub compilation_flags: Vec<String>,
    #[serde(default)]
    pub compilation_options: BTreeMap<String, String>,
    #[serde(default)]
    pub parameters: Vec<KernelParameter>,
}

/// Containers and per-kernel metadata known to the process.
#[derive(Debug, Default)]
pub struct HcfRegistry {
    containers: RwLock<HashMap<HcfObjectId, Arc<HcfContainer>>>,
    kernels: RwLock<HashMap<(HcfObjectId, String), Arc<HcfKernelInfo>>>,
}

impl HcfRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> Arc<HcfRegistry> {
        static GLOBAL: OnceLock<Arc<HcfRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(HcfRegistry::new())))
    }

    pub fn register(&self, container: HcfContainer) -> Arc<HcfContainer> {
        let container = Arc::new(container);
        let previous = self
            .containers
            .write()
            .expect("hcf registry poisoned")
            .insert(container.object_id, Arc::clone(&container));
        if previous.is_some() {
            log::warn!("HCF object {} registered twice; keeping the newer one", container.object_id);
        }
        container
    }

    pub fn register_kernel_info(&self, object: HcfObjectId, kernel: impl Into<String>, info: HcfKernelInfo) {
        self.kernels
            .write()
            .expect("hcf registry poisoned")
            .insert((object, kernel.into()), Arc::new(info));
    }

    pub fn get(&self, object: HcfObjectId) -> Option<Arc<HcfContainer>> {
        self.containers
            .read()
            .expect("hcf registry poisoned")
            .get(&object)
            .cloned()
    }

    pub fn kernel_info(&self, object: HcfObjectId, kernel: &str) -> Option<Arc<HcfKernelInfo>> {
        self.kernels
            .read()
            .expect("hcf registry poisoned")
            .get(&(object, kernel.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sscp_container_from_json() {
        let text = r#"{
            "object_id": 7,
            "root": {
                "name": "root",
                "subnodes": [{
                    "name": "images",
                    "subnodes": [
                        {"name": "llvm-ir.global", "attributes": {"target-arch": "generic", "kernels": "k1  k2"}, "binary": [1, 2, 3]}
                    ]
                }]
            }
        }"#;
        let hcf = HcfContainer::from_json(text).unwrap();
        assert_eq!(hcf.object_id, HcfObjectId(7));
        let images = hcf.images();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].target_arch(), "generic");
        assert_eq!(images[0].kernel_names(), vec!["k1", "k2"]);
        assert_eq!(images[0].binary(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn malformed_json_is_a_configuration_error() {
        let err = HcfContainer::from_json("{").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn registry_lookups() {
        let registry = HcfRegistry::new();
        let id = HcfObjectId(3);
        registry.register(HcfContainer::new(id, HcfNode::new("root").with_subnode(HcfNode::new("mp_21"))));
        registry.register_kernel_info(id, "saxpy", HcfKernelInfo::default());

        assert_eq!(registry.get(id).unwrap().targets()[0].target_arch(), "mp_21");
        assert!(registry.kernel_info(id, "saxpy").is_some());
        assert!(registry.kernel_info(id, "other").is_none());
        assert!(registry.get(HcfObjectId(4)).is_none());
    }
}
