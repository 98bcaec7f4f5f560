use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub(crate) const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

const TAG_BASE: u8 = 1;
const TAG_FLAG: u8 = 2;
const TAG_OPTION: u8 = 3;
const TAG_EXTENSION: u8 = 4;

/// Build options the queue and adaptivity engine set themselves.
pub mod build_option {
    pub const MUSA_TARGET_DEVICE: &str = "musa-target-device";
    pub const SOURCE_IMAGE: &str = "source-image";
    pub const SPECIALIZED_KERNEL: &str = "specialized-kernel";
    pub const KNOWN_GROUP_SIZE_X: &str = "known-group-size-x";
    pub const KNOWN_GROUP_SIZE_Y: &str = "known-group-size-y";
    pub const KNOWN_GROUP_SIZE_Z: &str = "known-group-size-z";
    pub const KNOWN_LOCAL_MEM_SIZE: &str = "known-local-mem-size";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BaseConfigParameter {
    BackendId,
    CompilationFlow,
    HcfObjectId,
    TargetArch,
    RuntimeDevice,
}

impl BaseConfigParameter {
    fn tag(self) -> u8 {
        match self {
            BaseConfigParameter::BackendId => 1,
            BaseConfigParameter::CompilationFlow => 2,
            BaseConfigParameter::HcfObjectId => 3,
            BaseConfigParameter::TargetArch => 4,
            BaseConfigParameter::RuntimeDevice => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompilationFlow {
    ExplicitMultipass,
    Sscp,
}

impl fmt::Display for CompilationFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompilationFlow::ExplicitMultipass => "explicit-multipass",
            CompilationFlow::Sscp => "sscp",
        })
    }
}

/// Stable 64-bit fingerprint of a kernel configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigId(u64);

impl ConfigId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Folds one more parameter into an existing fingerprint.
    pub fn extend(self, param: BaseConfigParameter, value: impl fmt::Display) -> ConfigId {
        let mut hash = fnv1a_bytes(self.0, &[TAG_EXTENSION, param.tag()]);
        hash = fnv1a_field(hash, value.to_string().as_bytes());
        ConfigId(hash)
    }
}

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Everything that influences the produced device binary.
///
/// Entries are kept sorted, so the fingerprint does not depend on the order in
/// which they were added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelConfiguration {
    base: BTreeMap<BaseConfigParameter, String>,
    build_flags: BTreeSet<String>,
    build_options: BTreeMap<String, String>,
}

impl KernelConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_base_configuration(&mut self, param: BaseConfigParameter, value: impl fmt::Display) {
        self.base.insert(param, value.to_string());
    }

    pub fn set_build_flag(&mut self, flag: impl Into<String>) {
        self.build_flags.insert(flag.into());
    }

    pub fn set_build_option(&mut self, key: impl Into<String>, value: impl fmt::Display) {
        self.build_options.insert(key.into(), value.to_string());
    }

    pub fn base_configuration(&self, param: BaseConfigParameter) -> Option<&str> {
        self.base.get(&param).map(String::as_str)
    }

    pub fn has_build_flag(&self, flag: &str) -> bool {
        self.build_flags.contains(flag)
    }

    pub fn build_option(&self, key: &str) -> Option<&str> {
        self.build_options.get(key).map(String::as_str)
    }

    pub fn build_flags(&self) -> impl Iterator<Item = &str> {
        self.build_flags.iter().map(String::as_str)
    }

    pub fn build_options(&self) -> impl Iterator<Item = (&str, &str)> {
        self.build_options.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn generate_id(&self) -> ConfigId {
        let mut hash = FNV1A_OFFSET;
        for (param, value) in &self.base {
            hash = fnv1a_bytes(hash, &[TAG_BASE, param.tag()]);
            hash = fnv1a_field(hash, value.as_bytes());
        }
        for flag in &self.build_flags {
            hash = fnv1a_bytes(hash, &[TAG_FLAG]);
            hash = fnv1a_field(hash, flag.as_bytes());
        }
        for (key, value) in &self.build_options {
            hash = fnv1a_bytes(hash, &[TAG_OPTION]);
            hash = fnv1a_field(hash, key.as_bytes());
            hash = fnv1a_field(hash, value.as_bytes());
        }
        ConfigId(hash)
    }
}

pub(crate) fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

// Length-prefixed so adjacent fields cannot run into each other.
fn fnv1a_field(hash: u64, bytes: &[u8]) -> u64 {
    let hash = fnv1a_bytes(hash, &(bytes.len() as u64).to_le_bytes());
    fnv1a_bytes(hash, bytes)
}
