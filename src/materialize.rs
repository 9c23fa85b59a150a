//! Writes the in-memory kernel configuration tree to disk.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::supervisor::error::KernelError;

/// File name of the generated kernel config inside `generated_dir`.
pub const GENERATED_FILE_NAME: &str = "config.gen.json";

/// The full kernel configuration document (`inbounds`, `outbounds`, ...).
pub type ConfigTree = Value;

/// Serialize `tree` to `path`, replacing any previous file.
///
/// The document goes to a temp file in the same directory first and is then
/// renamed over the target, so the kernel never reads a half-written config.
pub fn materialize(tree: &ConfigTree, path: &Path) -> Result<PathBuf, KernelError> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;

    let content = serde_json::to_string_pretty(tree)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| KernelError::Io(e.error))?;

    tracing::debug!("Materialized kernel config to {} ({} bytes)", path.display(), content.len());
    Ok(path.to_path_buf())
}

/// Read back a materialized config.
pub fn load_materialized(path: &Path) -> Result<ConfigTree, KernelError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
