use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Default config file, overridable with `WARDEN_CONFIG`.
pub const DEFAULT_CONFIG_PATH: &str = "config/warden.toml";

/// Environment flag that lets an Xray build pass the config test.
pub const ALLOW_XRAY_ENV: &str = "WARDEN_ALLOW_XRAY_CORE";

/// Environment flag equivalent to `--no-api`.
pub const NO_API_ENV: &str = "WARDEN_NO_API";

pub const DEFAULT_IPC_LISTEN: &str = "127.0.0.1:15491";

#[derive(Deserialize, Debug, Clone)]
pub struct GlobalConfig {
    #[serde(default)]
    pub kernel: KernelConfig,
    pub ipc_listen: Option<String>,
}

/// Everything the supervisor needs to know about the kernel installation.
/// Fixed for the lifetime of a supervisor.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub kernel_path: PathBuf,
    pub assets_path: PathBuf,
    /// Where `config.gen.json` is written before every start
    pub generated_dir: PathBuf,
    pub enable_api: bool,
    /// Stats endpoint served by the running kernel
    pub api_endpoint: String,
    pub use_outbound_stats: bool,
    pub stats_interval_ms: u64,
    pub version_timeout_secs: u64,
    pub test_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    /// Size of the kernel output ring buffer
    pub output_buffer_size: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            kernel_path: PathBuf::from("./core/v2ray"),
            assets_path: PathBuf::from("./core"),
            generated_dir: PathBuf::from("./generated"),
            enable_api: true,
            api_endpoint: "http://127.0.0.1:15490/debug/vars".to_string(),
            use_outbound_stats: false,
            stats_interval_ms: 1000,
            version_timeout_secs: 10,
            test_timeout_secs: 30,
            stop_timeout_secs: 10,
            output_buffer_size: 2_000,
        }
    }
}

impl KernelConfig {
    pub fn new(kernel_path: impl Into<PathBuf>, assets_path: impl Into<PathBuf>) -> Self {
        Self {
            kernel_path: kernel_path.into(),
            assets_path: assets_path.into(),
            ..Self::default()
        }
    }

    pub fn generated_config_path(&self) -> PathBuf {
        self.generated_dir.join(crate::materialize::GENERATED_FILE_NAME)
    }

    pub fn version_timeout(&self) -> Duration {
        Duration::from_secs(self.version_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(1))
    }
}

/// Process-wide switches decided once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupFlags {
    /// Disable the stats poller regardless of `enable_api`
    pub no_api: bool,
    /// Accept an Xray kernel during the config test
    pub allow_xray_variant: bool,
}

impl StartupFlags {
    /// Build flags from command line arguments and the environment.
    pub fn from_args_and_env<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let no_api_arg = args.into_iter().any(|a| a.as_ref() == "--no-api");
        Self {
            no_api: no_api_arg || std::env::var_os(NO_API_ENV).is_some(),
            allow_xray_variant: std::env::var_os(ALLOW_XRAY_ENV).is_some(),
        }
    }
}

impl GlobalConfig {
    /// Load from `WARDEN_CONFIG` or the default path. A missing or broken
    /// file falls back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("WARDEN_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let s = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => {
                tracing::info!("No config at {} ({}), using defaults", path.display(), e);
                String::new()
            }
        };
        let cfg: Self = toml::from_str(&s).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse {}: {}, using defaults", path.display(), e);
            Self::default()
        });
        Ok(cfg)
    }

    pub fn ipc_listen(&self) -> &str {
        self.ipc_listen.as_deref().unwrap_or(DEFAULT_IPC_LISTEN)
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            kernel: KernelConfig::default(),
            ipc_listen: None,
        }
    }
}
