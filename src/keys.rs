//! Local SSH key pair
//!
//! The key that ends up in the host's `authorized_keys`. Generated as an
//! Ed25519 OpenSSH key when it does not exist yet.

use std::io::Write;
use std::path::{Path, PathBuf};

use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use tracing::{info, warn};

use crate::error::{Result, SetupError};

/// Paths of the local key pair
#[derive(Debug, Clone)]
pub struct LocalKeyPair {
    private_path: PathBuf,
    public_path: PathBuf,
}

impl LocalKeyPair {
    /// Key pair at `private_path`, public key at `<private_path>.pub`
    pub fn new(private_path: impl Into<PathBuf>) -> Self {
        let private_path = private_path.into();
        let mut public = private_path.clone().into_os_string();
        public.push(".pub");
        Self {
            private_path,
            public_path: PathBuf::from(public),
        }
    }

    pub fn private_path(&self) -> &Path {
        &self.private_path
    }

    pub fn public_path(&self) -> &Path {
        &self.public_path
    }

    /// Make sure both key files exist.
    ///
    /// A missing public key is rebuilt from the private key. A new pair is
    /// generated only when the private key is absent, and existing files are
    /// never overwritten. Returns `true` when a new pair was written.
    pub fn ensure(&self) -> Result<bool> {
        if self.private_path.is_file() {
            if !self.public_path.is_file() {
                self.restore_public_key()?;
            }
            return Ok(false);
        }
        if self.public_path.exists() {
            return Err(SetupError::ssh_key(format!(
                "{} exists without its private key {}",
                self.public_path.display(),
                self.private_path.display()
            )));
        }

        info!("Generating Ed25519 key pair at {}", self.private_path.display());
        if let Some(parent) = self.private_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                set_permissions(parent, 0o700)?;
            }
        }

        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|e| SetupError::ssh_key(format!("key generation failed: {}", e)))?;
        let private_pem = key
            .to_openssh(LineEnding::LF)
            .map_err(|e| SetupError::ssh_key(format!("key encoding failed: {}", e)))?;
        let public_line = public_line_of(&key)?;

        write_new(&self.private_path, private_pem.as_bytes(), 0o600)?;
        write_new(&self.public_path, format!("{}\n", public_line).as_bytes(), 0o644)?;

        Ok(true)
    }

    /// Write `<private>.pub` from the existing private key
    fn restore_public_key(&self) -> Result<()> {
        warn!(
            "{} is missing, deriving it from {}",
            self.public_path.display(),
            self.private_path.display()
        );
        let data = std::fs::read_to_string(&self.private_path)?;
        let key = PrivateKey::from_openssh(data.as_bytes()).map_err(|e| {
            SetupError::ssh_key(format!(
                "cannot read {}: {}",
                self.private_path.display(),
                e
            ))
        })?;
        let public_line = public_line_of(&key)?;
        write_new(&self.public_path, format!("{}\n", public_line).as_bytes(), 0o644)
    }

    /// The single `authorized_keys` line for the public key
    pub fn public_key_line(&self) -> Result<String> {
        let data = std::fs::read_to_string(&self.public_path)?;
        let line = data
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| {
                SetupError::ssh_key(format!("{} is empty", self.public_path.display()))
            })?;

        if line.contains('\'') || line.split_whitespace().count() < 2 {
            return Err(SetupError::ssh_key(format!(
                "{} does not hold an OpenSSH public key",
                self.public_path.display()
            )));
        }
        Ok(line.to_string())
    }

    /// Parse the private key for authentication
    pub fn load_private(&self) -> Result<russh::keys::PrivateKey> {
        let data = std::fs::read_to_string(&self.private_path)?;
        let key = russh::keys::PrivateKey::from_openssh(data.as_bytes())
            .map_err(|e| SetupError::ssh_key(format!("Failed to parse private key: {}", e)))?;
        if key.is_encrypted() {
            return Err(SetupError::ssh_key(format!(
                "{} is passphrase protected",
                self.private_path.display()
            )));
        }
        Ok(key)
    }

    /// Parse the private key, or `None` with a warning if it is unusable
    pub fn load_private_or_warn(&self) -> Option<russh::keys::PrivateKey> {
        match self.load_private() {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("Key authentication disabled: {}", e);
                None
            }
        }
    }
}

fn public_line_of(key: &PrivateKey) -> Result<String> {
    key.public_key()
        .to_openssh()
        .map_err(|e| SetupError::ssh_key(format!("public key encoding failed: {}", e)))
}

/// Create `path` with `contents`; fails if it already exists
fn write_new(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    set_permissions(path, mode)
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
