//! Standard paths used by lockbox

use std::path::PathBuf;

/// Name of the filestore created in the home directory
pub const DEFAULT_FILESTORE: &str = ".lockbox";

/// Standard lockbox paths
pub struct Paths {
    /// Home directory
    pub home: PathBuf,
    /// Data directory (~/.local/share/lockbox)
    pub data: PathBuf,
    /// Config directory (~/.config/lockbox)
    pub config: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));

        let data = dirs::data_dir()
            .unwrap_or_else(|| home.join(".local/share"))
            .join("lockbox");

        let config = dirs::config_dir()
            .unwrap_or_else(|| home.join(".config"))
            .join("lockbox");

        Self { home, data, config }
    }

    /// Default encrypted filestore (~/.lockbox)
    pub fn filestore(&self) -> PathBuf {
        self.home.join(DEFAULT_FILESTORE)
    }

    /// Default keyring directory for the age backend
    pub fn age_keyring(&self) -> PathBuf {
        self.data.join("keys")
    }

    /// Default GnuPG home, honouring GNUPGHOME
    pub fn gpg_home(&self) -> PathBuf {
        match std::env::var_os("GNUPGHOME") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => self.home.join(".gnupg"),
        }
    }

    /// Default configuration file
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.yaml")
    }
}

/// Expand a leading `~` to the home directory
pub fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
