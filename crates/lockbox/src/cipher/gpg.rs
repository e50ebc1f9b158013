//! GnuPG engine
//!
//! Drives the installed `gpg` binary over stdin/stdout so no plaintext or
//! intermediate ciphertext ever touches the disk. Passphrase entry for
//! protected secret keys is left to gpg-agent and its pinentry.

use super::{select_key, CipherEngine, CipherError};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use tracing::debug;
use zeroize::Zeroize;

const ENGINE: &str = "gpg";

/// Public keyring candidates, newest format first
const PUBLIC_KEYRINGS: &[&str] = &["pubring.kbx", "pubring.gpg"];

/// Private keyring candidates, newest format first
const PRIVATE_KEYRINGS: &[&str] = &["private-keys-v1.d", "secring.gpg"];

/// Which keyring to list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyKind {
    Public,
    Secret,
}

/// gpg encryption against a GnuPG home directory
pub struct GpgEngine {
    home: PathBuf,
    selector: Option<String>,
    program: PathBuf,
}

impl GpgEngine {
    pub fn new(home: impl Into<PathBuf>, selector: Option<String>) -> Self {
        Self {
            home: home.into(),
            selector,
            program: PathBuf::from("gpg"),
        }
    }

    /// Use a specific gpg executable instead of the one on PATH
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--homedir").arg(&self.home).arg("--quiet");
        cmd
    }

    /// Primary key fingerprints in the public or secret keyring
    fn fingerprints(&self, kind: KeyKind) -> Result<Vec<String>, CipherError> {
        let list = match kind {
            KeyKind::Public => "--list-keys",
            KeyKind::Secret => "--list-secret-keys",
        };

        let output = self
            .command()
            .args(["--batch", "--with-colons", "--fingerprint", list])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| CipherError::engine(ENGINE)(format!("failed to run gpg: {}", e)))?;

        if !output.status.success() {
            return Err(CipherError::engine(ENGINE)(format!(
                "listing keys failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let fingerprints = parse_fingerprints(&String::from_utf8_lossy(&output.stdout), kind);
        if fingerprints.is_empty() {
            return Err(CipherError::NoKeys(self.home.clone()));
        }
        Ok(fingerprints)
    }

    fn selected(&self, kind: KeyKind) -> Result<String, CipherError> {
        let fingerprints = self.fingerprints(kind)?;
        let fingerprint = select_key(&fingerprints, self.selector.as_deref(), |f| f.clone())?;
        debug!(fingerprint = %fingerprint, ?kind, "selected gpg key");
        Ok(fingerprint.clone())
    }

    /// Run gpg with `input` on stdin and return its output
    fn pipe(&self, mut cmd: Command, input: &[u8]) -> Result<Output, CipherError> {
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CipherError::engine(ENGINE)(format!("failed to run gpg: {}", e)))?;

        // Feed stdin from a separate thread so a full stdout pipe cannot deadlock us
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CipherError::engine(ENGINE)("gpg stdin unavailable".to_string()))?;
        let input = input.to_vec();
        let writer = std::thread::spawn(move || stdin.write_all(&input));

        let output = child
            .wait_with_output()
            .map_err(|e| CipherError::engine(ENGINE)(e.to_string()))?;

        let written = writer
            .join()
            .map_err(|_| CipherError::engine(ENGINE)("stdin writer panicked".to_string()))?;

        if !output.status.success() {
            return Err(CipherError::engine(ENGINE)(format!(
                "gpg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        written.map_err(|e| CipherError::engine(ENGINE)(e.to_string()))?;

        Ok(output)
    }
}

impl CipherEngine for GpgEngine {
    fn name(&self) -> &'static str {
        ENGINE
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let recipient = self.selected(KeyKind::Public)?;

        let mut cmd = self.command();
        cmd.args(["--batch", "--yes", "--trust-model", "always", "--encrypt"])
            .arg("--recipient")
            .arg(&recipient);

        Ok(self.pipe(cmd, plaintext)?.stdout)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let key = self.selected(KeyKind::Secret)?;

        // No --batch here, pinentry may need to ask for the passphrase.
        // --try-secret-key does not restrict gpg to that key, so the status
        // output is checked for the key that was actually used.
        let mut cmd = self.command();
        cmd.args(["--status-fd", "2", "--try-secret-key"])
            .arg(&key)
            .arg("--decrypt");

        let mut output = self.pipe(cmd, ciphertext)?;
        let status = String::from_utf8_lossy(&output.stderr);
        let used = parse_decryption_key(&status);
        if !used.is_some_and(|fpr| fpr.eq_ignore_ascii_case(&key)) {
            output.stdout.zeroize();
            debug!(expected = %key, used = ?used, "gpg decrypted with another key");
            return Err(CipherError::KeyNotFound(key));
        }

        Ok(output.stdout)
    }

    fn check_keyring(&self) -> Result<(), CipherError> {
        for candidates in [PUBLIC_KEYRINGS, PRIVATE_KEYRINGS] {
            if !candidates.iter().any(|name| self.home.join(name).exists()) {
                return Err(CipherError::KeyringMissing(self.home.join(candidates[0])));
            }
        }
        Ok(())
    }

    fn keygen_hint(&self) -> &'static str {
        "You can do so with `gpg --gen-key`."
    }
}

/// Extract primary key fingerprints from `gpg --with-colons` output.
///
/// A `pub`/`sec` record starts a key; the `fpr` record right after it is the
/// primary fingerprint. Subkey fingerprints (after `sub`/`ssb`) are skipped.
fn parse_fingerprints(listing: &str, kind: KeyKind) -> Vec<String> {
    let primary = match kind {
        KeyKind::Public => "pub",
        KeyKind::Secret => "sec",
    };

    let mut fingerprints = vec![];
    let mut want_fpr = false;

    for line in listing.lines() {
        let mut fields = line.split(':');
        match fields.next() {
            Some(record) if record == primary => want_fpr = true,
            Some("sub") | Some("ssb") => want_fpr = false,
            Some("fpr") if want_fpr => {
                if let Some(fpr) = fields.nth(8).filter(|f| !f.is_empty()) {
                    fingerprints.push(fpr.to_string());
                }
                want_fpr = false;
            }
            _ => {}
        }
    }

    fingerprints
}

/// Primary fingerprint from the `DECRYPTION_KEY` status line.
///
/// Format: `[GNUPG:] DECRYPTION_KEY <subkey-fpr> <primary-fpr> <trust>`.
fn parse_decryption_key(status: &str) -> Option<&str> {
    status.lines().find_map(|line| {
        let mut fields = line
            .strip_prefix("[GNUPG:] DECRYPTION_KEY ")?
            .split_whitespace();
        let subkey = fields.next()?;
        Some(fields.next().unwrap_or(subkey))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LISTING: &str = "\
tru::1:1700000000:0:3:1:5
pub:u:255:22:1111222233334444:1700000000:::u:::scESC:::::ed25519:::0:
fpr:::::::::AAAABBBBCCCCDDDDEEEEFFFF1111222233334444:
uid:u::::1700000000::HASH::Alice <alice@example.com>::::::::::0:
sub:u:255:18:5555666677778888:1700000000::::::e:::::cv25519::
fpr:::::::::99990000AAAABBBBCCCCDDDD5555666677778888:
pub:u:255:22:9999888877776666:1700000000:::u:::scESC:::::ed25519:::0:
fpr:::::::::0000111122223333444455559999888877776666:
uid:u::::1700000000::HASH::Bob <bob@example.com>::::::::::0:
";

    #[test]
    fn test_parse_primary_fingerprints() {
        let fprs = parse_fingerprints(LISTING, KeyKind::Public);
        assert_eq!(
            fprs,
            vec![
                "AAAABBBBCCCCDDDDEEEEFFFF1111222233334444".to_string(),
                "0000111122223333444455559999888877776666".to_string(),
            ]
        );
    }

    #[test]
    fn test_parse_secret_listing_ignores_public_records() {
        assert!(parse_fingerprints(LISTING, KeyKind::Secret).is_empty());

        let secret = LISTING.replace("pub:", "sec:").replace("sub:", "ssb:");
        assert_eq!(parse_fingerprints(&secret, KeyKind::Secret).len(), 2);
    }

    #[test]
    fn test_selectors_against_listing() {
        let fprs = parse_fingerprints(LISTING, KeyKind::Public);

        // long key id
        let picked = select_key(&fprs, Some("1111222233334444"), |f| f.clone()).unwrap();
        assert_eq!(picked, &fprs[0]);
        // short key id
        let picked = select_key(&fprs, Some("77776666"), |f| f.clone()).unwrap();
        assert_eq!(picked, &fprs[1]);
        // no selector with two identities
        assert!(matches!(
            select_key(&fprs, None, |f| f.clone()),
            Err(CipherError::AmbiguousKey { .. })
        ));
    }

    #[test]
    fn test_parse_decryption_key() {
        let status = "\
gpg: encrypted with cv25519 key, ID 5555666677778888, created 2023-11-14
[GNUPG:] ENC_TO 5555666677778888 18 0
[GNUPG:] KEY_CONSIDERED AAAABBBBCCCCDDDDEEEEFFFF1111222233334444 0
[GNUPG:] DECRYPTION_KEY 99990000AAAABBBBCCCCDDDD5555666677778888 AAAABBBBCCCCDDDDEEEEFFFF1111222233334444 u
[GNUPG:] BEGIN_DECRYPTION
[GNUPG:] DECRYPTION_OKAY
";
        assert_eq!(
            parse_decryption_key(status),
            Some("AAAABBBBCCCCDDDDEEEEFFFF1111222233334444")
        );

        assert_eq!(parse_decryption_key("gpg: decryption failed\n"), None);
        assert_eq!(parse_decryption_key(""), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_decrypt_with_other_key_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        // Stand-in gpg: lists key A as the only secret key, then "decrypts"
        // with key B like a multi-key GnuPG home would
        let temp = TempDir::new().unwrap();
        let script = temp.path().join("fake-gpg");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
case \"$*\" in\n\
  *--list-secret-keys*)\n\
    echo 'sec:u:255:22:1111222233334444:1700000000:::u:::scESC:::::ed25519:::0:'\n\
    echo 'fpr:::::::::AAAABBBBCCCCDDDDEEEEFFFF1111222233334444:' ;;\n\
  *--decrypt*)\n\
    cat >/dev/null\n\
    echo '[GNUPG:] DECRYPTION_KEY 99990000AAAABBBBCCCCDDDD5555666677778888 0000111122223333444455559999888877776666 u' >&2\n\
    printf plaintext ;;\n\
esac\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let engine = GpgEngine::new(temp.path(), None).with_program(&script);
        let err = engine.decrypt(b"ciphertext").unwrap_err();
        assert!(matches!(err, CipherError::KeyNotFound(k) if k.ends_with("1111222233334444")));
    }

    #[test]
    fn test_check_keyring() {
        let temp = TempDir::new().unwrap();
        let engine = GpgEngine::new(temp.path(), None);

        let err = engine.check_keyring().unwrap_err();
        assert!(matches!(err, CipherError::KeyringMissing(p) if p.ends_with("pubring.kbx")));

        std::fs::write(temp.path().join("pubring.gpg"), b"").unwrap();
        let err = engine.check_keyring().unwrap_err();
        assert!(matches!(err, CipherError::KeyringMissing(p) if p.ends_with("private-keys-v1.d")));

        std::fs::write(temp.path().join("secring.gpg"), b"").unwrap();
        engine.check_keyring().unwrap();
    }

    #[test]
    fn test_missing_binary_is_engine_error() {
        let temp = TempDir::new().unwrap();
        let engine = GpgEngine::new(temp.path(), None).with_program("/nonexistent/gpg-binary");

        let err = engine.encrypt(b"payload").unwrap_err();
        assert!(matches!(err, CipherError::Engine { engine: "gpg", .. }));
    }
}
