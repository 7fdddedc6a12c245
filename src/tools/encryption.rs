//! Type-safe arguments for `cryptsetup`, plus keyfile handling.
//!
//! - `LuksFormatArgs` for `cryptsetup luksFormat`
//! - `LuksOpenArgs` for `cryptsetup open`
//! - `LuksCloseArgs` for `cryptsetup close`
//!
//! # Security Model
//!
//! **CRITICAL**: Passphrases are NEVER passed via CLI arguments (visible in `ps aux`).
//! They are written to a 0600 keyfile in a RAM-backed temp directory and the
//! keyfile path is passed with `--key-file`. [`SecretFile`] zeroes and removes
//! the keyfile when dropped, even if the tool failed.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::error::{LnosError, Result};
use crate::tool_traits::ToolArgs;

/// Environment variable consulted for the LUKS passphrase.
pub const PASSPHRASE_ENV: &str = "LNOS_PASSPHRASE";

// ============================================================================
// Passphrase
// ============================================================================

/// LUKS passphrase held in memory.
///
/// Never printed: `Debug` is redacted and there is no `Display`. The buffer is
/// zeroed on drop.
pub struct Passphrase(Vec<u8>);

impl Passphrase {
    /// Wrap a passphrase, rejecting an empty one.
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        let bytes = secret.into().into_bytes();
        if bytes.is_empty() {
            return Err(LnosError::MissingPassphrase);
        }
        Ok(Self(bytes))
    }

    /// Read a passphrase from a file, dropping one trailing newline.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut contents = fs::read_to_string(path)?;
        if contents.ends_with('\n') {
            contents.pop();
            if contents.ends_with('\r') {
                contents.pop();
            }
        }
        Self::new(contents)
    }

    /// Read the passphrase from [`PASSPHRASE_ENV`], if set and non-empty.
    pub fn from_env() -> Option<Self> {
        std::env::var(PASSPHRASE_ENV)
            .ok()
            .and_then(|value| Self::new(value).ok())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Passphrase(<redacted, {} bytes>)", self.0.len())
    }
}

impl Drop for Passphrase {
    fn drop(&mut self) {
        self.0.fill(0);
    }
}

// ============================================================================
// SecretFile - RAII Wrapper for Secure Keyfile Management
// ============================================================================

/// RAII wrapper for secure temporary keyfile management.
///
/// # Security Guarantees
///
/// 1. **Restricted permissions**: Created with mode 0600 (owner read/write only)
/// 2. **Exclusive**: `create_new` fails if the path already exists
/// 3. **Secure deletion**: Overwritten with zeros before unlinking
/// 4. **Panic-safe**: Drop trait ensures cleanup on unwinding
#[derive(Debug)]
pub struct SecretFile {
    path: PathBuf,
    size: usize,
}

impl SecretFile {
    /// Create a keyfile in `dir` (the system temp directory, tmpfs on the live ISO, by default).
    pub fn new_in(dir: &Path, secret: &Passphrase) -> std::io::Result<Self> {
        let random_suffix: u64 = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
            ^ std::process::id() as u64;

        let path = dir.join(format!(".lnos_keyfile_{:016x}", random_suffix));

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;

        file.write_all(secret.as_bytes())?;
        file.sync_all()?;

        log::debug!("SecretFile created: {:?} ({} bytes)", path, secret.len());

        Ok(Self {
            path,
            size: secret.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn secure_wipe(&self) {
        if let Ok(mut file) = OpenOptions::new().write(true).open(&self.path) {
            let zeros = vec![0u8; self.size];
            let _ = file.write_all(&zeros);
            let _ = file.sync_all();
        }

        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Failed to remove keyfile {:?}: {}", self.path, e);
        } else {
            log::debug!("SecretFile securely wiped: {:?}", self.path);
        }
    }
}

impl Drop for SecretFile {
    fn drop(&mut self) {
        self.secure_wipe();
    }
}

// ============================================================================
// cryptsetup invocations
// ============================================================================

/// `cryptsetup luksFormat --type luks2 --batch-mode --key-file <f> <device>`
///
/// LUKS2 defaults apply: aes-xts-plain64, argon2id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuksFormatArgs {
    pub device: PathBuf,
    pub key_file: PathBuf,
}

impl ToolArgs for LuksFormatArgs {
    fn program(&self) -> &'static str {
        "cryptsetup"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "luksFormat".to_string(),
            "--type".to_string(),
            "luks2".to_string(),
            "--batch-mode".to_string(),
            "--key-file".to_string(),
            self.key_file.display().to_string(),
            self.device.display().to_string(),
        ]
    }

    fn step(&self) -> &'static str {
        "luks-format"
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

/// `cryptsetup open --key-file <f> <device> <mapper_name>`
///
/// The unlocked device appears at `/dev/mapper/<mapper_name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuksOpenArgs {
    pub device: PathBuf,
    pub mapper_name: String,
    pub key_file: PathBuf,
}

impl ToolArgs for LuksOpenArgs {
    fn program(&self) -> &'static str {
        "cryptsetup"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "open".to_string(),
            "--key-file".to_string(),
            self.key_file.display().to_string(),
            self.device.display().to_string(),
            self.mapper_name.clone(),
        ]
    }

    fn step(&self) -> &'static str {
        "luks-open"
    }
}

/// `cryptsetup close <mapper_name>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuksCloseArgs {
    pub mapper_name: String,
}

impl ToolArgs for LuksCloseArgs {
    fn program(&self) -> &'static str {
        "cryptsetup"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["close".to_string(), self.mapper_name.clone()]
    }

    fn step(&self) -> &'static str {
        "luks-close"
    }
}
