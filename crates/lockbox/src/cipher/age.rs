//! In-process age engine
//!
//! Keyring directory layout:
//! - `recipients` - public keyring, one `age1...` recipient per line
//! - `identity.key` - private keyring, one `AGE-SECRET-KEY-1...` per line,
//!   optionally wrapped in passphrase encryption (armored or binary)
//!
//! Blank lines and `#` comments are ignored in both files.

use super::{select_key, CipherEngine, CipherError, ExposeSecret, PassphrasePrompt, SecretString};
use ::age::armor::{ArmoredReader, ArmoredWriter, Format};
use ::age::x25519;
use std::fs::{self, File, Permissions};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const RECIPIENTS_FILE: &str = "recipients";
pub const IDENTITY_FILE: &str = "identity.key";

const ENGINE: &str = "age";

/// age encryption against a keyring directory
pub struct AgeEngine {
    keyring: PathBuf,
    selector: Option<String>,
    prompt: Box<dyn PassphrasePrompt>,
}

impl AgeEngine {
    pub fn new(
        keyring: impl Into<PathBuf>,
        selector: Option<String>,
        prompt: Box<dyn PassphrasePrompt>,
    ) -> Self {
        Self {
            keyring: keyring.into(),
            selector,
            prompt,
        }
    }

    pub fn public_keyring(&self) -> PathBuf {
        self.keyring.join(RECIPIENTS_FILE)
    }

    pub fn private_keyring(&self) -> PathBuf {
        self.keyring.join(IDENTITY_FILE)
    }

    /// Generate a keypair in `keyring`, returning the public recipient.
    ///
    /// With a passphrase the identity file is stored passphrase-encrypted and
    /// ASCII armored. An existing identity is never overwritten.
    pub fn generate(
        keyring: &Path,
        passphrase: Option<SecretString>,
    ) -> Result<x25519::Recipient, CipherError> {
        let identity_path = keyring.join(IDENTITY_FILE);
        if identity_path.exists() {
            return Err(CipherError::engine(ENGINE)(format!(
                "{} already exists, refusing to overwrite it",
                identity_path.display()
            )));
        }

        fs::create_dir_all(keyring).map_err(io_error(keyring))?;
        fs::set_permissions(keyring, Permissions::from_mode(0o700)).map_err(io_error(keyring))?;

        let identity = x25519::Identity::generate();
        let recipient = identity.to_public();

        let mut plain = format!(
            "# created: {}\n# public key: {}\n",
            chrono::Utc::now().to_rfc3339(),
            recipient
        );
        plain.push_str(identity.to_string().expose_secret());
        plain.push('\n');

        let contents = match passphrase {
            Some(passphrase) => protect(plain.as_bytes(), passphrase)?,
            None => plain.into_bytes(),
        };

        let mut file = File::create(&identity_path).map_err(io_error(&identity_path))?;
        fs::set_permissions(&identity_path, Permissions::from_mode(0o600))
            .map_err(io_error(&identity_path))?;
        file.write_all(&contents).map_err(io_error(&identity_path))?;

        let recipients_path = keyring.join(RECIPIENTS_FILE);
        let mut recipients = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&recipients_path)
            .map_err(io_error(&recipients_path))?;
        writeln!(recipients, "{}", recipient).map_err(io_error(&recipients_path))?;

        debug!(keyring = %keyring.display(), "generated age identity");
        Ok(recipient)
    }

    fn recipients(&self) -> Result<Vec<x25519::Recipient>, CipherError> {
        let path = self.public_keyring();
        let content = read_keyring(&path)?;

        let recipients = key_lines(&content)
            .map(|line| {
                line.parse::<x25519::Recipient>().map_err(|e| {
                    CipherError::engine(ENGINE)(format!(
                        "invalid recipient in {}: {}",
                        path.display(),
                        e
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if recipients.is_empty() {
            return Err(CipherError::NoKeys(path));
        }
        Ok(recipients)
    }

    fn identities(&self) -> Result<Vec<x25519::Identity>, CipherError> {
        let path = self.private_keyring();
        let raw = fs::read(&path).map_err(io_error(&path))?;

        let content = if is_passphrase_protected(&raw) {
            debug!(keyring = %path.display(), "identity file is passphrase protected");
            let passphrase = self
                .prompt
                .passphrase(&format!("Passphrase for {}", path.display()))?;
            unprotect(&raw, &passphrase)?
        } else {
            raw
        };

        let content = String::from_utf8(content).map_err(|_| {
            CipherError::engine(ENGINE)(format!("{} is not valid UTF-8", path.display()))
        })?;

        let identities = key_lines(&content)
            .map(|line| {
                line.parse::<x25519::Identity>().map_err(|e| {
                    CipherError::engine(ENGINE)(format!(
                        "invalid identity in {}: {}",
                        path.display(),
                        e
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if identities.is_empty() {
            return Err(CipherError::NoKeys(path));
        }
        Ok(identities)
    }
}

impl CipherEngine for AgeEngine {
    fn name(&self) -> &'static str {
        ENGINE
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let recipients = self.recipients()?;
        let recipient = select_key(&recipients, self.selector.as_deref(), |r| r.to_string())?;

        let encryptor = ::age::Encryptor::with_recipients(vec![Box::new(recipient.clone())])
            .ok_or_else(|| CipherError::engine(ENGINE)("no recipients".to_string()))?;

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| CipherError::engine(ENGINE)(e.to_string()))?;
        writer
            .write_all(plaintext)
            .map_err(|e| CipherError::engine(ENGINE)(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| CipherError::engine(ENGINE)(e.to_string()))?;

        Ok(encrypted)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let identities = self.identities()?;
        let identity = select_key(&identities, self.selector.as_deref(), |i| {
            i.to_public().to_string()
        })?;

        let decryptor = match ::age::Decryptor::new(ciphertext)
            .map_err(|e| CipherError::engine(ENGINE)(e.to_string()))?
        {
            ::age::Decryptor::Recipients(d) => d,
            _ => {
                return Err(CipherError::engine(ENGINE)(
                    "filestore is passphrase encrypted, expected a recipient".to_string(),
                ))
            }
        };

        let mut reader = decryptor
            .decrypt(std::iter::once(identity as &dyn ::age::Identity))
            .map_err(|e| CipherError::engine(ENGINE)(e.to_string()))?;

        let mut decrypted = vec![];
        reader
            .read_to_end(&mut decrypted)
            .map_err(|e| CipherError::engine(ENGINE)(e.to_string()))?;

        Ok(decrypted)
    }

    fn check_keyring(&self) -> Result<(), CipherError> {
        for path in [self.public_keyring(), self.private_keyring()] {
            if !path.exists() {
                return Err(CipherError::KeyringMissing(path));
            }
        }
        Ok(())
    }

    fn keygen_hint(&self) -> &'static str {
        "You can do so with `lockbox init`."
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CipherError {
    let path = path.to_path_buf();
    move |source| CipherError::Io { path, source }
}

fn read_keyring(path: &Path) -> Result<String, CipherError> {
    fs::read_to_string(path).map_err(io_error(path))
}

fn key_lines(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

fn is_passphrase_protected(raw: &[u8]) -> bool {
    raw.starts_with(b"age-encryption.org/") || raw.starts_with(b"-----BEGIN AGE ENCRYPTED FILE-----")
}

fn protect(plain: &[u8], passphrase: SecretString) -> Result<Vec<u8>, CipherError> {
    let fail = |e: std::io::Error| CipherError::engine(ENGINE)(e.to_string());

    let encryptor = ::age::Encryptor::with_user_passphrase(passphrase);
    let mut out = vec![];
    let armored = ArmoredWriter::wrap_output(&mut out, Format::AsciiArmor).map_err(fail)?;
    let mut writer = encryptor.wrap_output(armored).map_err(|e| CipherError::engine(ENGINE)(e.to_string()))?;
    writer.write_all(plain).map_err(fail)?;
    writer.finish().and_then(|armored| armored.finish()).map_err(fail)?;

    Ok(out)
}

fn unprotect(raw: &[u8], passphrase: &SecretString) -> Result<Vec<u8>, CipherError> {
    let decryptor = match ::age::Decryptor::new(ArmoredReader::new(raw))
        .map_err(|e| CipherError::engine(ENGINE)(e.to_string()))?
    {
        ::age::Decryptor::Passphrase(d) => d,
        _ => {
            return Err(CipherError::engine(ENGINE)(
                "identity file is encrypted to a recipient, expected a passphrase".to_string(),
            ))
        }
    };

    let mut reader = decryptor
        .decrypt(passphrase, None)
        .map_err(|e| CipherError::Passphrase(e.to_string()))?;

    let mut plain = vec![];
    reader
        .read_to_end(&mut plain)
        .map_err(|e| CipherError::engine(ENGINE)(e.to_string()))?;
    Ok(plain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::tests::FixedPrompt;
    use crate::cipher::TerminalPrompt;
    use tempfile::TempDir;

    fn engine(dir: &Path, selector: Option<&str>) -> AgeEngine {
        AgeEngine::new(dir, selector.map(String::from), Box::new(TerminalPrompt))
    }

    #[test]
    fn test_generate_and_round_trip() {
        let temp = TempDir::new().unwrap();
        let recipient = AgeEngine::generate(temp.path(), None).unwrap();
        assert!(recipient.to_string().starts_with("age1"));

        let engine = engine(temp.path(), None);
        engine.check_keyring().unwrap();

        let plaintext = "{\"secrets\":{\"pin\":\"ünïcødé\"}}".as_bytes();
        let encrypted = engine.encrypt(plaintext).unwrap();
        assert_ne!(encrypted, plaintext);
        assert_eq!(engine.decrypt(&encrypted).unwrap(), plaintext);
    }

    #[test]
    fn test_generate_refuses_to_overwrite() {
        let temp = TempDir::new().unwrap();
        AgeEngine::generate(temp.path(), None).unwrap();
        assert!(AgeEngine::generate(temp.path(), None).is_err());
    }

    #[test]
    fn test_generated_files_are_private() {
        let temp = TempDir::new().unwrap();
        let keys = temp.path().join("keys");
        AgeEngine::generate(&keys, None).unwrap();

        let mode = fs::metadata(keys.join(IDENTITY_FILE)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let mode = fs::metadata(&keys).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_missing_keyring() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path(), None);

        let err = engine.check_keyring().unwrap_err();
        assert!(matches!(err, CipherError::KeyringMissing(p) if p.ends_with(RECIPIENTS_FILE)));
        assert!(matches!(engine.encrypt(b"x"), Err(CipherError::Io { .. })));
    }

    #[test]
    fn test_foreign_key_cannot_decrypt() {
        let ours = TempDir::new().unwrap();
        let theirs = TempDir::new().unwrap();
        AgeEngine::generate(ours.path(), None).unwrap();
        AgeEngine::generate(theirs.path(), None).unwrap();

        let encrypted = engine(theirs.path(), None).encrypt(b"secret").unwrap();
        let err = engine(ours.path(), None).decrypt(&encrypted).unwrap_err();
        assert!(matches!(err, CipherError::Engine { engine: "age", .. }));
    }

    #[test]
    fn test_multiple_identities_need_selector() {
        let temp = TempDir::new().unwrap();
        let first = x25519::Identity::generate();
        let second = x25519::Identity::generate();
        fs::write(
            temp.path().join(IDENTITY_FILE),
            format!(
                "# two keys\n{}\n\n{}\n",
                first.to_string().expose_secret(),
                second.to_string().expose_secret()
            ),
        )
        .unwrap();
        fs::write(
            temp.path().join(RECIPIENTS_FILE),
            format!("{}\n{}\n", first.to_public(), second.to_public()),
        )
        .unwrap();

        let unselected = engine(temp.path(), None);
        assert!(matches!(
            unselected.encrypt(b"x"),
            Err(CipherError::AmbiguousKey { candidates }) if candidates.len() == 2
        ));

        let second_public = second.to_public().to_string();
        let suffix = &second_public[second_public.len() - 12..];
        let selected = engine(temp.path(), Some(suffix));
        let encrypted = selected.encrypt(b"picked").unwrap();
        assert_eq!(selected.decrypt(&encrypted).unwrap(), b"picked");

        // encrypted to the second key only
        let first_public = first.to_public().to_string();
        let other = engine(temp.path(), Some(first_public.as_str()));
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_passphrase_protected_identity() {
        let temp = TempDir::new().unwrap();
        AgeEngine::generate(temp.path(), Some(SecretString::new("hunter2".to_string()))).unwrap();

        let raw = fs::read(temp.path().join(IDENTITY_FILE)).unwrap();
        assert!(is_passphrase_protected(&raw));

        let prompt = FixedPrompt::new("hunter2");
        let engine = AgeEngine::new(temp.path(), None, Box::new(prompt.clone()));

        // encryption only needs the public keyring
        let encrypted = engine.encrypt(b"locked").unwrap();
        assert_eq!(prompt.calls(), 0);

        assert_eq!(engine.decrypt(&encrypted).unwrap(), b"locked");
        assert_eq!(prompt.calls(), 1);
    }

    #[test]
    fn test_wrong_passphrase_prompts_once() {
        let temp = TempDir::new().unwrap();
        AgeEngine::generate(temp.path(), Some(SecretString::new("right".to_string()))).unwrap();

        let prompt = FixedPrompt::new("wrong");
        let engine = AgeEngine::new(temp.path(), None, Box::new(prompt.clone()));
        let encrypted = engine.encrypt(b"locked").unwrap();

        let err = engine.decrypt(&encrypted).unwrap_err();
        assert!(matches!(err, CipherError::Passphrase(_)));
        assert_eq!(prompt.calls(), 1);
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let temp = TempDir::new().unwrap();
        AgeEngine::generate(temp.path(), None).unwrap();
        let engine = engine(temp.path(), None);

        let encrypted = engine.encrypt(b"some longer payload").unwrap();
        let truncated = &encrypted[..encrypted.len() - 10];
        assert!(engine.decrypt(truncated).is_err());
    }
}
