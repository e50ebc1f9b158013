//! lockbox - Local file-based secret store
//!
//! Passwords, API keys, recovery codes: a flat name to value mapping kept in
//! a single file that is encrypted as a whole to your own key. Every command
//! decrypts the file, applies at most one change and encrypts it again.
//!
//! Encryption is pluggable: age (in-process, X25519 + ChaCha20-Poly1305) or
//! the installed gpg binary.

pub mod cipher;
pub mod clipboard;
pub mod display;
pub mod error;
pub mod filestore;
pub mod store;

pub use cipher::{AgeEngine, Cipher, CipherEngine, CipherError, GpgEngine, PassphrasePrompt};
pub use error::{Error, Result};
pub use filestore::Filestore;
pub use store::{SecretStore, SetOutcome};
