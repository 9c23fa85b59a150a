//! Fake kernel executables shared by unit and integration tests.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use nix::errno::Errno;

pub const V2FLY_BANNER: &str = "V2Ray 5.4.1 (V2Fly, a community-driven edition of V2Ray.) Custom (go1.20.4 linux/amd64)\nA unified platform for anti-censorship.";
pub const XRAY_BANNER: &str = "Xray 1.8.1 (Xray, Penetrates Everything.) Custom (go1.20.4 linux/amd64)\nA unified platform for anti-censorship.";

/// Line printed by a `trap_term` kernel when it receives SIGTERM.
pub const SHUTDOWN_MARKER: &str = "[Info] core: shutting down";

/// Exit code of a fake kernel invoked without `-config <existing file>` or
/// without the asset location pointing at its install dir.
pub const BAD_INVOCATION_EXIT: i32 = 64;

const INVOCATION_LOG: &str = "invocations.log";

/// Shell-script stand-in for the kernel binary.
///
/// `-test` and run invocations are appended to `invocations.log` in the
/// install dir as `<args>|<v2ray.location.asset>`.
pub struct FakeKernel {
    pub banner: &'static str,
    pub version_exit: i32,
    pub test_exit: i32,
    pub test_error: &'static str,
    /// `None` keeps the kernel alive until it is signalled
    pub run_secs: Option<u32>,
    /// Print `SHUTDOWN_MARKER` on SIGTERM and exit a second later
    pub trap_term: bool,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self {
            banner: V2FLY_BANNER,
            version_exit: 0,
            test_exit: 0,
            test_error: "",
            run_secs: None,
            trap_term: false,
        }
    }
}

impl FakeKernel {
    pub fn script(&self, dir: &Path) -> String {
        let run = if self.trap_term {
            format!(
                "echo '[Info] core: started'\n    \
                 trap 'echo \"{SHUTDOWN_MARKER}\"; kill $child; sleep 1; exit 0' TERM\n    \
                 sleep 300 &\n    \
                 child=$!\n    \
                 wait $child"
            )
        } else {
            match self.run_secs {
                Some(secs) => format!("echo '[Info] core: started'\n    sleep {secs}\n    exit 0"),
                None => "echo '[Info] core: started'\n    exec sleep 300".to_string(),
            }
        };
        format!(
            r#"#!/bin/bash
log_invocation() {{
    printf '%s|%s\n' "$*" "$(printenv v2ray.location.asset)" >> "{log}"
}}
check_invocation() {{
    if [ "$(printenv v2ray.location.asset)" != "{assets}" ] || [ "$1" != -config ] || [ ! -f "$2" ]; then
        echo "unexpected invocation: $*" >&2
        exit {bad_exit}
    fi
}}
case "$1" in
  --version)
    printf '%s\n' "{banner}"
    exit {version_exit}
    ;;
  -test)
    log_invocation "$@"
    shift
    check_invocation "$@"
    printf '%s\n' "{banner}"
    printf '%s\n' "{test_error}"
    exit {test_exit}
    ;;
  *)
    log_invocation "$@"
    check_invocation "$@"
    {run}
    ;;
esac
"#,
            log = dir.join(INVOCATION_LOG).display(),
            assets = dir.display(),
            bad_exit = BAD_INVOCATION_EXIT,
            banner = self.banner,
            version_exit = self.version_exit,
            test_error = self.test_error,
            test_exit = self.test_exit,
            run = run,
        )
    }

    /// Write the script plus both asset files into `dir`.
    pub fn install(&self, dir: &Path) -> PathBuf {
        let path = dir.join("v2ray");
        write_executable(&path, &self.script(dir));
        fs::write(dir.join("geoip.dat"), b"geoip").unwrap();
        fs::write(dir.join("geosite.dat"), b"geosite").unwrap();
        path
    }

    /// Logged `-test` and run invocations of the kernel installed in `dir`.
    pub fn invocations(dir: &Path) -> Vec<String> {
        fs::read_to_string(dir.join(INVOCATION_LOG))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

pub fn write_executable(path: &Path, content: &str) {
    use std::os::unix::fs::PermissionsExt;

    fs::write(path, content).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();

    // A concurrently forked test process may briefly hold the write fd; wait
    // until exec no longer fails with ETXTBSY.
    for _ in 0..100 {
        let spawned = std::process::Command::new(path)
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();
        match spawned {
            Err(e) if e.raw_os_error() == Some(Errno::ETXTBSY as i32) => {
                std::thread::sleep(std::time::Duration::from_millis(20));
            }
            Ok(mut child) => {
                let _ = child.kill();
                let _ = child.wait();
                break;
            }
            Err(_) => break,
        }
    }
}
