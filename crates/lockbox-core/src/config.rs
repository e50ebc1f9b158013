//! Configuration management
//!
//! Settings are resolved in layers, highest priority first:
//! - command line flags and LOCKBOX_* environment variables
//! - ~/.config/lockbox/config.yaml
//! - built-in defaults from [`Paths`]

use crate::paths::{expand, Paths};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config from {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config from {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Which encryption engine protects the filestore
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process age encryption (X25519)
    #[default]
    Age,
    /// The installed `gpg` binary
    Gpg,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Age => write!(f, "age"),
            Backend::Gpg => write!(f, "gpg"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "age" => Ok(Backend::Age),
            "gpg" | "gnupg" => Ok(Backend::Gpg),
            other => Err(format!("unknown backend '{}' (expected age or gpg)", other)),
        }
    }
}

/// Contents of config.yaml. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Filestore path, `~` allowed
    #[serde(default)]
    pub file: Option<String>,

    /// Keyring directory, `~` allowed
    #[serde(default)]
    pub keyring: Option<String>,

    /// Key selector (fingerprint, long or short key id, age recipient)
    #[serde(default)]
    pub keyid: Option<String>,

    /// Encryption engine
    #[serde(default)]
    pub backend: Option<Backend>,
}

/// Values supplied on the command line or through the environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub file: Option<PathBuf>,
    pub keyring: Option<PathBuf>,
    pub keyid: Option<String>,
    pub backend: Option<Backend>,
}

/// Fully resolved settings for one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub file: PathBuf,
    pub keyring: PathBuf,
    pub keyid: Option<String>,
    pub backend: Backend,
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Paths::new().config_file())
    }

    /// Load configuration from a specific path. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Merge overrides, this config and the defaults into final settings
    pub fn resolve(&self, overrides: Overrides, paths: &Paths) -> Settings {
        let backend = overrides.backend.or(self.backend).unwrap_or_default();

        let file = overrides
            .file
            .or_else(|| self.file.as_deref().map(expand))
            .unwrap_or_else(|| paths.filestore());

        let keyring = overrides
            .keyring
            .or_else(|| self.keyring.as_deref().map(expand))
            .unwrap_or_else(|| match backend {
                Backend::Age => paths.age_keyring(),
                Backend::Gpg => paths.gpg_home(),
            });

        // An exported but empty LOCKBOX_KEYID means "no selector"
        let keyid = overrides
            .keyid
            .or_else(|| self.keyid.clone())
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        Settings {
            file,
            keyring,
            keyid,
            backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_paths() -> Paths {
        Paths {
            home: PathBuf::from("/home/test"),
            data: PathBuf::from("/home/test/.local/share/lockbox"),
            config: PathBuf::from("/home/test/.config/lockbox"),
        }
    }

    #[test]
    fn test_missing_file_is_default() {
        let temp = TempDir::new().unwrap();
        let config = Config::load_from(&temp.path().join("config.yaml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_yaml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(
            &path,
            "file: /srv/secrets/store\nkeyid: ABCD1234\nbackend: gpg\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.file.as_deref(), Some("/srv/secrets/store"));
        assert_eq!(config.keyid.as_deref(), Some("ABCD1234"));
        assert_eq!(config.backend, Some(Backend::Gpg));
        assert_eq!(config.keyring, None);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(&path, "filestore: /tmp/x\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_defaults_follow_backend() {
        let paths = test_paths();

        let settings = Config::default().resolve(Overrides::default(), &paths);
        assert_eq!(settings.backend, Backend::Age);
        assert_eq!(settings.file, PathBuf::from("/home/test/.lockbox"));
        assert_eq!(settings.keyring, paths.age_keyring());
        assert_eq!(settings.keyid, None);

        let config = Config {
            backend: Some(Backend::Gpg),
            ..Default::default()
        };
        let settings = config.resolve(Overrides::default(), &paths);
        assert_eq!(settings.keyring, paths.gpg_home());
    }

    #[test]
    fn test_overrides_win_over_config() {
        let config = Config {
            file: Some("/from/config".to_string()),
            keyring: Some("/keys/config".to_string()),
            keyid: Some("CONFIGKEY".to_string()),
            backend: Some(Backend::Gpg),
        };
        let overrides = Overrides {
            file: Some(PathBuf::from("/from/flag")),
            keyring: None,
            keyid: Some("FLAGKEY".to_string()),
            backend: Some(Backend::Age),
        };

        let settings = config.resolve(overrides, &test_paths());
        assert_eq!(settings.file, PathBuf::from("/from/flag"));
        assert_eq!(settings.keyring, PathBuf::from("/keys/config"));
        assert_eq!(settings.keyid.as_deref(), Some("FLAGKEY"));
        assert_eq!(settings.backend, Backend::Age);
    }

    #[test]
    fn test_blank_keyid_is_ignored() {
        let overrides = Overrides {
            keyid: Some("  ".to_string()),
            ..Default::default()
        };
        let settings = Config::default().resolve(overrides, &test_paths());
        assert_eq!(settings.keyid, None);
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("age".parse::<Backend>().unwrap(), Backend::Age);
        assert_eq!("GPG".parse::<Backend>().unwrap(), Backend::Gpg);
        assert!("pgp".parse::<Backend>().is_err());
    }
}
