//! lockbox - Local file-based secret store
//!
//! Passwords, API keys and recovery codes in one encrypted file.
//!
//! Commands:
//! - init: Generate an age keypair in the keyring directory
//! - create <KEY> [VALUE]: Store a secret (prompts if no value)
//! - update <KEY> [VALUE]: Overwrite a secret
//! - get <KEY>: Print a secret, optionally copy it to the clipboard
//! - ls: List secrets as a table
//! - rm <KEY>: Delete a secret

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lockbox::cipher::{SecretString, TerminalPrompt};
use lockbox::{
    clipboard, display, AgeEngine, Cipher, CipherEngine, Filestore, GpgEngine, SetOutcome,
};
use lockbox_core::{Backend, Config, Overrides, Paths, Settings};
use regex::Regex;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "lockbox")]
#[command(about = "Local file-based password, API key, secret and recovery code store backed by age or GPG")]
#[command(version)]
#[command(after_help = r#"CONFIGURATION:
    Flags override LOCKBOX_* environment variables, which override
    ~/.config/lockbox/config.yaml:

        file: ~/.lockbox
        keyring: ~/.local/share/lockbox/keys
        keyid: age1...
        backend: age

SECURITY:
    - The whole secrets file is encrypted to your key and stored as base64
    - Writes replace the file atomically, concurrent runs take a lock
    - With several keys in the keyring, --keyid is required"#)]
struct Cli {
    /// File to use for saving encrypted secrets
    #[arg(short = 'f', long = "file", env = "LOCKBOX_FILE", value_name = "PATH")]
    file: Option<PathBuf>,

    /// Keyring directory (age keys, or the GnuPG home for --backend gpg)
    #[arg(long, env = "LOCKBOX_KEYRING", value_name = "DIR")]
    keyring: Option<PathBuf>,

    /// Key to encrypt and decrypt with: fingerprint, long/short key id, or age recipient
    #[arg(long, env = "LOCKBOX_KEYID")]
    keyid: Option<String>,

    /// Encryption backend: age or gpg
    #[arg(long, env = "LOCKBOX_BACKEND")]
    backend: Option<Backend>,

    /// Config file (default ~/.config/lockbox/config.yaml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an age keypair in the keyring directory
    Init {
        /// Protect the private key with a passphrase
        #[arg(long)]
        passphrase: bool,
    },

    /// Create a secret
    #[command(visible_alias = "add")]
    Create {
        /// Force overwrite of an existing value
        #[arg(short, long)]
        force: bool,
        /// Secret key name
        key: String,
        /// Secret value (omit for secure hidden prompt)
        value: Option<String>,
    },

    /// Overwrite a secret, creating it if needed
    Update {
        /// Secret key name
        key: String,
        /// Secret value (omit for secure hidden prompt)
        value: Option<String>,
    },

    /// Get details for a secret
    Get {
        /// Copy the value to the clipboard
        #[arg(long)]
        copy: bool,
        /// Don't print trailing newline (useful for piping)
        #[arg(short = 'n')]
        no_newline: bool,
        /// Secret key name
        key: String,
    },

    /// List secrets
    #[command(name = "ls", visible_alias = "list")]
    Ls {
        /// Filter secret keys by a regular expression
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Delete a secret
    #[command(name = "rm", visible_alias = "delete")]
    Rm {
        /// Secret key name
        key: String,
    },
}

fn main() -> Result<()> {
    let Cli {
        file,
        keyring,
        keyid,
        backend,
        config,
        debug,
        command,
    } = Cli::parse();

    init_logging(debug);

    let paths = Paths::new();
    let config = match config {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };
    let settings = config.resolve(
        Overrides {
            file,
            keyring,
            keyid,
            backend,
        },
        &paths,
    );
    debug!(
        file = %settings.file.display(),
        keyring = %settings.keyring.display(),
        backend = %settings.backend,
        keyid = ?settings.keyid,
        "resolved settings"
    );

    match command {
        Commands::Init { passphrase } => cmd_init(&settings, passphrase),
        Commands::Create { force, key, value } => {
            cmd_create(&open(&settings)?, &key, value, force)
        }
        Commands::Update { key, value } => cmd_create(&open(&settings)?, &key, value, true),
        Commands::Get {
            copy,
            no_newline,
            key,
        } => cmd_get(&open(&settings)?, &key, copy, no_newline),
        Commands::Ls { filter } => cmd_list(&open(&settings)?, filter.as_deref()),
        Commands::Rm { key } => cmd_remove(&open(&settings)?, &key),
    }
}

/// Logs go to stderr; --debug wins over RUST_LOG
fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Filestore for the configured backend; both keyrings must already exist
fn open(settings: &Settings) -> Result<Filestore> {
    let engine: Box<dyn CipherEngine> = match settings.backend {
        Backend::Age => Box::new(AgeEngine::new(
            &settings.keyring,
            settings.keyid.clone(),
            Box::new(TerminalPrompt),
        )),
        Backend::Gpg => Box::new(GpgEngine::new(&settings.keyring, settings.keyid.clone())),
    };

    let cipher = Cipher::new(engine);
    cipher.check_keyring()?;
    debug!(engine = cipher.engine_name(), "keyring present");

    Ok(Filestore::new(&settings.file, cipher))
}

/// Generate a keypair for the age backend
fn cmd_init(settings: &Settings, passphrase: bool) -> Result<()> {
    if settings.backend == Backend::Gpg {
        bail!("The gpg backend uses your GnuPG keyring. Create a key with `gpg --gen-key`.");
    }

    let passphrase = if passphrase {
        let first = rpassword::prompt_password("Enter passphrase: ")
            .context("Failed to read passphrase")?;
        let second = rpassword::prompt_password("Confirm passphrase: ")
            .context("Failed to read passphrase")?;
        if first.is_empty() {
            bail!("Empty passphrase not allowed");
        }
        if first != second {
            bail!("Passphrases do not match");
        }
        Some(SecretString::new(first))
    } else {
        None
    };

    let recipient = AgeEngine::generate(&settings.keyring, passphrase)
        .with_context(|| format!("Failed to initialize keyring {}", settings.keyring.display()))?;

    println!("success: Keypair created in {}", settings.keyring.display());
    println!();
    println!("Your public key:");
    println!("  {}", recipient);
    println!();
    println!("Store secrets with: lockbox create <key> <value>");

    Ok(())
}

/// Store a secret
fn cmd_create(filestore: &Filestore, key: &str, value: Option<String>, force: bool) -> Result<()> {
    let value = match value {
        Some(v) => Zeroizing::new(v),
        None => {
            let entered = Zeroizing::new(
                rpassword::prompt_password("Enter secret value: ")
                    .context("Failed to read secret value")?,
            );
            if entered.is_empty() {
                bail!("Empty value not allowed");
            }
            entered
        }
    };

    let outcome = filestore.update(|store| store.set(key, &value, force))?;
    let verb = match outcome {
        SetOutcome::Inserted => "Added",
        SetOutcome::Updated => "Updated",
    };

    println!("{} {} to secrets", verb, key);
    Ok(())
}

/// Print a secret
fn cmd_get(filestore: &Filestore, key: &str, copy: bool, no_newline: bool) -> Result<()> {
    let value = Zeroizing::new(filestore.read(|store| store.get(key).map(String::from))?);

    if no_newline {
        print!("{}", value.as_str());
    } else {
        println!("{}", value.as_str());
    }

    if copy {
        clipboard::copy(&value)?;
        eprintln!("Copied to clipboard!");
    }

    Ok(())
}

/// Print the secrets table
fn cmd_list(filestore: &Filestore, filter: Option<&str>) -> Result<()> {
    let filter = filter
        .map(Regex::new)
        .transpose()
        .map_err(lockbox::Error::from)?;

    let table = Zeroizing::new(filestore.read(|store| Ok(display::table(store.list(filter.as_ref()))))?);
    print!("{}", table.as_str());

    Ok(())
}

/// Delete a secret
fn cmd_remove(filestore: &Filestore, key: &str) -> Result<()> {
    filestore.update(|store| store.delete(key))?;
    println!("Deleted secret key {}", key);
    Ok(())
}
