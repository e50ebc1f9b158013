//! Cipher adapter
//!
//! The filestore never talks to an encryption engine directly. It goes through
//! [`Cipher`], which hands raw bytes to a [`CipherEngine`] and frames the
//! resulting binary blob as base64 so the filestore stays a plain text file.
//!
//! Two engines are provided: [`AgeEngine`] (in-process, X25519) and
//! [`GpgEngine`] (shells out to the installed `gpg` binary).

pub mod age;
pub mod gpg;

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

pub use self::age::AgeEngine;
pub use self::gpg::GpgEngine;
pub use ::age::secrecy::{ExposeSecret, SecretString};

/// Failures inside the encryption boundary
#[derive(Error, Debug)]
pub enum CipherError {
    #[error("keyring {} does not exist", .0.display())]
    KeyringMissing(PathBuf),

    #[error("no usable keys in {}", .0.display())]
    NoKeys(PathBuf),

    #[error("no key matches selector {0}")]
    KeyNotFound(String),

    #[error("{} keys match, set a key id to choose one: {}", .candidates.len(), .candidates.join(", "))]
    AmbiguousKey { candidates: Vec<String> },

    #[error("passphrase: {0}")]
    Passphrase(String),

    #[error("{engine}: {message}")]
    Engine {
        engine: &'static str,
        message: String,
    },

    #[error("ciphertext is not valid base64")]
    Transport(#[from] base64::DecodeError),

    #[error("reading {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CipherError {
    pub(crate) fn engine(engine: &'static str) -> impl Fn(String) -> Self {
        move |message| CipherError::Engine { engine, message }
    }
}

/// An external encryption capability working on raw binary.
///
/// Engines carry their own keyring location and key selector; the adapter
/// only ever asks them to encrypt or decrypt a whole buffer.
pub trait CipherEngine {
    /// Human-readable name of this engine (e.g. "age", "gpg").
    fn name(&self) -> &'static str;

    /// Encrypt `plaintext` to the selected recipient.
    fn encrypt(&self, plaintext: &[u8]) -> std::result::Result<Vec<u8>, CipherError>;

    /// Decrypt `ciphertext` with the selected private key.
    fn decrypt(&self, ciphertext: &[u8]) -> std::result::Result<Vec<u8>, CipherError>;

    /// Fail with [`CipherError::KeyringMissing`] unless both keyrings exist.
    fn check_keyring(&self) -> std::result::Result<(), CipherError>;

    /// How to create a keypair for this engine.
    fn keygen_hint(&self) -> &'static str;
}

/// Source of passphrases for protected private keys.
///
/// Called at most once per decryption; a wrong answer is an error, never a
/// re-prompt.
pub trait PassphrasePrompt {
    fn passphrase(&self, description: &str) -> std::result::Result<SecretString, CipherError>;
}

/// Prompts on the controlling terminal with echo disabled
pub struct TerminalPrompt;

impl PassphrasePrompt for TerminalPrompt {
    fn passphrase(&self, description: &str) -> std::result::Result<SecretString, CipherError> {
        let answer = rpassword::prompt_password(format!("{}: ", description))
            .map_err(|e| CipherError::Passphrase(e.to_string()))?;
        Ok(SecretString::new(answer))
    }
}

/// The two-operation contract the filestore depends on
pub struct Cipher {
    engine: Box<dyn CipherEngine>,
}

impl Cipher {
    pub fn new(engine: Box<dyn CipherEngine>) -> Self {
        Self { engine }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Encrypt and base64-encode
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let blob = self.engine.encrypt(plaintext).map_err(Error::Encryption)?;
        debug!(engine = self.engine.name(), bytes = blob.len(), "encrypted payload");
        Ok(STANDARD.encode(blob).into_bytes())
    }

    /// Base64-decode and decrypt
    pub fn decrypt(&self, stored: &[u8]) -> Result<Vec<u8>> {
        let blob = STANDARD
            .decode(trim_ascii(stored))
            .map_err(|e| Error::Decryption(e.into()))?;
        debug!(engine = self.engine.name(), bytes = blob.len(), "decrypting payload");
        self.engine.decrypt(&blob).map_err(Error::Decryption)
    }

    /// Startup precondition: both keyrings must be present
    pub fn check_keyring(&self) -> Result<()> {
        self.engine.check_keyring().map_err(|e| {
            Error::Configuration(format!(
                "{}.\nHave you generated a keypair? {}",
                e,
                self.engine.keygen_hint()
            ))
        })
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Pick exactly one key out of `candidates`.
///
/// With a selector, the candidate id must end with it (case-insensitive, an
/// optional `0x` prefix is ignored), which covers full fingerprints, long and
/// short key ids. Without a selector the keyring must hold a single key.
pub(crate) fn select_key<'a, T>(
    candidates: &'a [T],
    selector: Option<&str>,
    id: impl Fn(&T) -> String,
) -> std::result::Result<&'a T, CipherError> {
    let matches: Vec<&T> = match selector {
        Some(selector) => {
            let wanted = selector.trim();
            let wanted = wanted
                .strip_prefix("0x")
                .or_else(|| wanted.strip_prefix("0X"))
                .unwrap_or(wanted)
                .to_ascii_lowercase();
            candidates
                .iter()
                .filter(|c| id(*c).to_ascii_lowercase().ends_with(&wanted))
                .collect()
        }
        None => candidates.iter().collect(),
    };

    match matches.as_slice() {
        [only] => Ok(*only),
        [] => Err(CipherError::KeyNotFound(
            selector.unwrap_or("(none)").to_string(),
        )),
        many => Err(CipherError::AmbiguousKey {
            candidates: many.iter().map(|c| id(*c)).collect(),
        }),
    }
}
