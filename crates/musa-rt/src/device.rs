use std::fmt;

/// Identifies which runtime backend owns a queue, event or launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendId {
    Musa,
    Cuda,
    Hip,
    LevelZero,
    OpenMp,
}

impl BackendId {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendId::Musa => "musa",
            BackendId::Cuda => "cuda",
            BackendId::Hip => "hip",
            BackendId::LevelZero => "ze",
            BackendId::OpenMp => "omp",
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwarePlatform {
    Cpu,
    Musa,
    Nvidia,
    Amd,
    Intel,
}

/// Programming interface used to reach a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiPlatform {
    Musa,
    Cuda,
    Hip,
    LevelZero,
    OpenMp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendDescriptor {
    pub hw_platform: HardwarePlatform,
    pub sw_platform: ApiPlatform,
}

impl BackendDescriptor {
    pub const HOST: BackendDescriptor = BackendDescriptor {
        hw_platform: HardwarePlatform::Cpu,
        sw_platform: ApiPlatform::OpenMp,
    };

    pub const MUSA: BackendDescriptor = BackendDescriptor {
        hw_platform: HardwarePlatform::Musa,
        sw_platform: ApiPlatform::Musa,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    backend: BackendDescriptor,
    ordinal: i32,
}

impl DeviceId {
    pub const fn new(backend: BackendDescriptor, ordinal: i32) -> Self {
        Self { backend, ordinal }
    }

    pub const fn host() -> Self {
        Self::new(BackendDescriptor::HOST, 0)
    }

    pub const fn musa(ordinal: i32) -> Self {
        Self::new(BackendDescriptor::MUSA, ordinal)
    }

    pub fn backend(&self) -> BackendDescriptor {
        self.backend
    }

    pub fn ordinal(&self) -> i32 {
        self.ordinal
    }

    pub fn is_host(&self) -> bool {
        self.backend.hw_platform == HardwarePlatform::Cpu
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?}:{}",
            self.backend.sw_platform, self.backend.hw_platform, self.ordinal
        )
    }
}

/// Capabilities of a device as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    pub name: String,
    /// Architecture string images are matched against, e.g. `mp_21`.
    pub arch: String,
    pub compute_capability: u32,
}

impl DeviceProperties {
    pub fn new(name: impl Into<String>, arch: impl Into<String>, compute_capability: u32) -> Self {
        Self {
            name: name.into(),
            arch: arch.into(),
            compute_capability,
        }
    }
}
