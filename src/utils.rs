//! Shared process helpers.

use std::path::Path;

use tokio::process::Command;

/// Environment variable the kernel reads to locate `geoip.dat` / `geosite.dat`.
pub const ASSET_LOCATION_ENV: &str = "v2ray.location.asset";

/// Apply platform-specific flags to hide the console window on Windows.
/// On non-Windows platforms, this is a no-op.
#[cfg(target_os = "windows")]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd
}

/// Kernel invocation with the asset location exported and stdio piped.
pub fn kernel_command(kernel_path: &Path, assets_path: &Path) -> Command {
    let mut cmd = Command::new(kernel_path);
    cmd.env(ASSET_LOCATION_ENV, assets_path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    apply_creation_flags(&mut cmd);
    cmd
}

/// Split kernel output into non-empty lines.
pub fn split_lines(output: &str) -> Vec<&str> {
    output
        .split(['\r', '\n'])
        .filter(|l| !l.trim().is_empty())
        .collect()
}
