//! lockbox-core - Shared functionality for the lockbox tools
//!
//! Standard locations on disk and the layered configuration that resolves
//! which filestore, keyring and key the secret store works with.

pub mod config;
pub mod paths;

pub use config::{Backend, Config, ConfigError, Overrides, Settings};
pub use paths::Paths;
