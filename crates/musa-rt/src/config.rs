use std::fmt;
use std::path::{Path, PathBuf};

const DEFAULT_JIT_CACHE_DIR: &str = ".cache/musa-rt";

/// How aggressively SSCP launches specialize device images for a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum AdaptivityLevel {
    /// Every kernel of the selected image is compiled into one object.
    None = 0,
    /// Only the requested kernel is compiled.
    #[default]
    NarrowKernels = 1,
    /// Narrowing plus launch geometry folded into the binary configuration.
    Specialize = 2,
}

impl AdaptivityLevel {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(AdaptivityLevel::None),
            1 => Some(AdaptivityLevel::NarrowKernels),
            2 => Some(AdaptivityLevel::Specialize),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn narrows_kernels(self) -> bool {
        self >= AdaptivityLevel::NarrowKernels
    }

    pub fn specializes_launch(self) -> bool {
        self >= AdaptivityLevel::Specialize
    }
}

impl fmt::Display for AdaptivityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub driver_library: Option<PathBuf>,
    pub runtime_library: Option<PathBuf>,
    pub jit_compiler: Option<PathBuf>,
    pub jit_cache_dir: PathBuf,
    pub adaptivity_level: AdaptivityLevel,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            driver_library: None,
            runtime_library: None,
            jit_compiler: None,
            jit_cache_dir: PathBuf::from(DEFAULT_JIT_CACHE_DIR),
            adaptivity_level: AdaptivityLevel::default(),
        }
    }
}

impl RuntimeConfig {
    /// Reads `MUSART_*` variables; unset or blank values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let value = |key: &str| {
            lookup(key)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        let mut config = RuntimeConfig::default();
        config.driver_library = value("MUSART_DRIVER_LIB").map(PathBuf::from);
        config.runtime_library = value("MUSART_RUNTIME_LIB").map(PathBuf::from);
        config.jit_compiler = value("MUSART_JITC").map(PathBuf::from);
        if let Some(dir) = value("MUSART_JIT_CACHE_DIR") {
            config.jit_cache_dir = PathBuf::from(dir);
        }
        if let Some(raw) = value("MUSART_ADAPTIVITY_LEVEL") {
            match raw.parse::<u8>().ok().and_then(AdaptivityLevel::from_level) {
                Some(level) => config.adaptivity_level = level,
                None => log::warn!(
                    "ignoring MUSART_ADAPTIVITY_LEVEL={raw:?}; expected 0, 1 or 2, using {}",
                    config.adaptivity_level
                ),
            }
        }
        config
    }

    pub fn with_driver_library(mut self, path: impl AsRef<Path>) -> Self {
        self.driver_library = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_runtime_library(mut self, path: impl AsRef<Path>) -> Self {
        self.runtime_library = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_jit_compiler(mut self, path: impl AsRef<Path>) -> Self {
        self.jit_compiler = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_jit_cache_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.jit_cache_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_adaptivity_level(mut self, level: AdaptivityLevel) -> Self {
        self.adaptivity_level = level;
        self
    }
}
