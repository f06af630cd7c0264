//! Twinrule common library
//!
//! Process-level plumbing shared by the twinrule binaries:
//! - logging setup (console plus daily rolling files)
//! - graceful shutdown signals
//! - configuration value fallbacks

pub mod config_loader;
pub mod logging;
pub mod shutdown;

pub use config_loader::{get_config_value, get_string_config};
pub use logging::LogConfig;
pub use shutdown::{cancel_on_shutdown, wait_for_shutdown};
