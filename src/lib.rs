//! Entry points and host-process wiring for the browser agent control
//! plane: CLI surface, configuration loading, and the tab resolver the
//! session controller is wired against.

pub mod cli;
pub mod config;
pub mod metrics;
pub mod resolver;

pub use config::{AppConfig, LoadedConfig};
