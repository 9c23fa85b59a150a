//! Kernel installation checks.
//!
//! - `validate_kernel`: executable presence/readability, required asset files
//!   and a `--version` probe.
//! - `config_test::validate_config`: dry-run of a materialized config in the
//!   kernel's test mode.


use std::fs::File;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::supervisor::error::KernelError;
use crate::utils::{apply_creation_flags, split_lines};

pub const GEOIP_FILE: &str = "geoip.dat";
pub const GEOSITE_FILE: &str = "geosite.dat";

/// `Ok(version line)` or the reason the kernel cannot be used.
pub type ValidationResult = Result<String, KernelError>;

/// Check that `exec_path` is a usable kernel and `assets_path` holds its data
/// files, then ask the kernel for its version.
///
/// Spawns at most one short-lived process, bounded by `timeout`.
pub async fn validate_kernel(exec_path: &Path, assets_path: &Path, timeout: Duration) -> ValidationResult {
    check_executable(exec_path)?;
    check_assets(assets_path)?;

    let mut cmd = Command::new(exec_path);
    cmd.arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    apply_creation_flags(&mut cmd);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| KernelError::Timeout {
            operation: "kernel version query",
            secs: timeout.as_secs(),
        })?
        .map_err(|e| KernelError::SpawnFailed(format!("{}: {}", exec_path.display(), e)))?;

    if !output.status.success() {
        return Err(KernelError::VersionCheckFailed(output.status.code()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines = split_lines(&stdout);
    tracing::info!("Kernel output: {}", lines.join(";"));

    lines
        .first()
        .map(|l| l.trim().to_string())
        .ok_or(KernelError::EmptyVersionOutput)
}

/// Opening the file rejects a directory that happens to carry the kernel's name.
fn check_executable(exec_path: &Path) -> Result<(), KernelError> {
    if !exec_path.exists() {
        return Err(KernelError::NotFound(exec_path.to_path_buf()));
    }

    let readable = File::open(exec_path)
        .and_then(|f| f.metadata())
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !readable {
        return Err(KernelError::NotReadable(exec_path.to_path_buf()));
    }
    Ok(())
}

fn check_assets(assets_path: &Path) -> Result<(), KernelError> {
    let has_geoip = assets_path.join(GEOIP_FILE).is_file();
    let has_geosite = assets_path.join(GEOSITE_FILE).is_file();

    match (has_geoip, has_geosite) {
        (false, false) => Err(KernelError::MissingAssets(assets_path.to_path_buf())),
        (false, true) => Err(KernelError::MissingGeoIp),
        (true, false) => Err(KernelError::MissingGeoSite),
        (true, true) => Ok(()),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{write_executable, FakeKernel};
    use std::fs;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_missing_executable_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = validate_kernel(&dir.path().join("nope"), dir.path(), TIMEOUT).await;
        assert!(matches!(result, Err(KernelError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_directory_is_not_readable() {
        let dir = tempfile::tempdir().unwrap();
        let fake_exec = dir.path().join("v2ray");
        fs::create_dir(&fake_exec).unwrap();

        let result = validate_kernel(&fake_exec, dir.path(), TIMEOUT).await;
        assert!(matches!(result, Err(KernelError::NotReadable(_))));
    }

    #[tokio::test]
    async fn test_asset_checks_name_the_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let exec = FakeKernel::default().install(dir.path());

        fs::remove_file(dir.path().join(GEOIP_FILE)).unwrap();
        let result = validate_kernel(&exec, dir.path(), TIMEOUT).await;
        assert!(matches!(result, Err(KernelError::MissingGeoIp)));

        fs::write(dir.path().join(GEOIP_FILE), b"x").unwrap();
        fs::remove_file(dir.path().join(GEOSITE_FILE)).unwrap();
        let result = validate_kernel(&exec, dir.path(), TIMEOUT).await;
        assert!(matches!(result, Err(KernelError::MissingGeoSite)));

        fs::remove_file(dir.path().join(GEOIP_FILE)).unwrap();
        let result = validate_kernel(&exec, dir.path(), TIMEOUT).await;
        assert!(matches!(result, Err(KernelError::MissingAssets(_))));
    }

    #[tokio::test]
    async fn test_version_is_first_output_line() {
        let dir = tempfile::tempdir().unwrap();
        let exec = FakeKernel::default().install(dir.path());

        let version = validate_kernel(&exec, dir.path(), TIMEOUT).await.unwrap();
        assert!(version.starts_with("V2Ray 5.4.1"), "unexpected version: {}", version);
    }

    #[tokio::test]
    async fn test_non_zero_exit_reports_code() {
        let dir = tempfile::tempdir().unwrap();
        let exec = FakeKernel { version_exit: 3, ..Default::default() }.install(dir.path());

        let result = validate_kernel(&exec, dir.path(), TIMEOUT).await;
        assert!(matches!(result, Err(KernelError::VersionCheckFailed(Some(3)))));
    }

    #[tokio::test]
    async fn test_empty_output_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let exec = FakeKernel::default().install(dir.path());
        write_executable(&exec, "#!/bin/sh\nexit 0\n");

        let result = validate_kernel(&exec, dir.path(), TIMEOUT).await;
        assert!(matches!(result, Err(KernelError::EmptyVersionOutput)));
    }

    #[tokio::test]
    async fn test_hanging_version_query_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let exec = FakeKernel::default().install(dir.path());
        write_executable(&exec, "#!/bin/sh\n[ \"$1\" = --version ] && exec sleep 30\nexit 0\n");

        let result = validate_kernel(&exec, dir.path(), Duration::from_millis(300)).await;
        assert!(matches!(result, Err(KernelError::Timeout { .. })));
    }
}
