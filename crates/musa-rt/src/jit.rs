use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::kernel_config::{fnv1a_bytes, ConfigId, KernelConfiguration, FNV1A_OFFSET};

/// Input for one translation of portable IR to a device image.
#[derive(Debug, Clone, Copy)]
pub struct TranslationRequest<'a> {
    pub image_name: &'a str,
    pub ir: &'a [u8],
    pub kernels: &'a [String],
    pub target_arch: &'a str,
    pub compute_capability: u32,
    pub config_id: ConfigId,
    pub config: &'a KernelConfiguration,
}

pub trait Translator: Send + Sync {
    fn name(&self) -> &str;
    fn translate(&self, request: &TranslationRequest<'_>) -> RuntimeResult<Vec<u8>>;
}

/// Translates through the external `musajitc` tool, keeping its outputs in an
/// on-disk cache keyed by the binary configuration.
pub struct ToolTranslator {
    compiler: String,
    cache_dir: PathBuf,
}

impl ToolTranslator {
    pub fn new(compiler: impl Into<String>, cache_dir: impl AsRef<Path>) -> Self {
        Self {
            compiler: compiler.into(),
            cache_dir: cache_dir.as_ref().to_path_buf(),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        let compiler = config
            .jit_compiler
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(musajitc_binary);
        Self::new(compiler, &config.jit_cache_dir)
    }

    pub fn compiler(&self) -> &str {
        &self.compiler
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Where the IR, device image and metadata for `request` live on disk.
    pub fn artifact_paths(&self, request: &TranslationRequest<'_>) -> JitArtifacts {
        // The IR digest keeps stale outputs from a rebuilt binary out of reach.
        let stem = format!(
            "image_{}_{:016x}",
            request.config_id,
            fnv1a_bytes(FNV1A_OFFSET, request.ir)
        );
        let arch = request.target_arch;
        JitArtifacts {
            ir: self.cache_dir.join(format!("{stem}.ir")),
            image: self.cache_dir.join(format!("{stem}_{arch}.musa")),
            meta: self.cache_dir.join(format!("{stem}_{arch}.meta.json")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitArtifacts {
    pub ir: PathBuf,
    pub image: PathBuf,
    pub meta: PathBuf,
}

#[derive(Debug, Deserialize)]
struct MusaJitcMeta {
    kernel_symbols: Vec<String>,
}

impl Translator for ToolTranslator {
    fn name(&self) -> &str {
        "musajitc"
    }

    fn translate(&self, request: &TranslationRequest<'_>) -> RuntimeResult<Vec<u8>> {
        let id = request.config_id;
        std::fs::create_dir_all(&self.cache_dir).map_err(|err| io_error("create JIT cache dir", err))?;
        let paths = self.artifact_paths(request);

        if !paths.image.exists() || !paths.meta.exists() {
            log::debug!("JIT disk miss for {} ({id}), running {}", request.image_name, self.compiler);
            std::fs::write(&paths.ir, request.ir).map_err(|err| io_error("write IR", err))?;
            run_musajitc_compile(&self.compiler, request, &paths)?;
        } else {
            log::debug!("JIT disk hit for {} ({id})", request.image_name);
        }

        let image = std::fs::read(&paths.image).map_err(|err| io_error("read device image", err))?;
        let meta = std::fs::read_to_string(&paths.meta).map_err(|err| io_error("read JIT metadata", err))?;
        let parsed: MusaJitcMeta = serde_json::from_str(&meta)
            .map_err(|err| RuntimeError::configuration(format!("invalid musajitc metadata: {err}")))?;

        if let Some(missing) = request
            .kernels
            .iter()
            .find(|kernel| !parsed.kernel_symbols.contains(*kernel))
        {
            return Err(RuntimeError::configuration(format!(
                "musajitc output for {} does not export kernel {missing}",
                request.image_name
            )));
        }
        Ok(image)
    }
}

fn run_musajitc_compile(
    compiler: &str,
    request: &TranslationRequest<'_>,
    paths: &JitArtifacts,
) -> RuntimeResult<()> {
    let mut command = Command::new(compiler);
    command
        .arg("compile")
        .arg("--arch")
        .arg(request.target_arch)
        .arg("--in")
        .arg(&paths.ir)
        .arg("--out")
        .arg(&paths.image)
        .arg("--meta")
        .arg(&paths.meta);
    if !request.kernels.is_empty() {
        command.arg("--kernels").arg(request.kernels.join(","));
    }
    for flag in request.config.build_flags() {
        command.arg("--flag").arg(flag);
    }
    for (key, value) in request.config.build_options() {
        command.arg("--opt").arg(format!("{key}={value}"));
    }

    let output = command
        .output()
        .map_err(|err| RuntimeError::configuration(format!("failed to run {compiler}: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        return Err(RuntimeError::configuration(format!(
            "musajitc compile failed (status={}): stdout='{}' stderr='{}'",
            output.status,
            stdout.trim(),
            stderr.trim()
        )));
    }

    Ok(())
}

fn musajitc_binary() -> String {
    let candidates = [
        PathBuf::from("tools/musajitc/target/debug/musajitc"),
        PathBuf::from("tools/musajitc/target/release/musajitc"),
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../tools/musajitc/target/debug/musajitc"),
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../tools/musajitc/target/release/musajitc"),
    ];

    for candidate in candidates {
        if candidate.exists() {
            return candidate.display().to_string();
        }
    }

    "musajitc".to_string()
}

fn io_error(what: &str, err: std::io::Error) -> RuntimeError {
    RuntimeError::configuration(format!("JIT cache: failed to {what}: {err}"))
}
