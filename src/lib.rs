pub mod supervisor;
pub mod validator;
pub mod materialize;
pub mod stats;
pub mod ipc;
pub mod config;
pub mod utils;

#[cfg(all(test, unix))]
pub(crate) mod test_support;

pub use config::{GlobalConfig, KernelConfig, StartupFlags};
pub use stats::StatsSample;
pub use supervisor::error::KernelError;
pub use supervisor::tags::{Direction, TagProtocolMap};
pub use supervisor::{KernelEvent, KernelStatus, KernelSupervisor};
