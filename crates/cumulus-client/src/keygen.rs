//! Key file generation.
//!
//! ```text
//! <out>/<name>.key   base64 X25519 private key (keep private)
//! <out>/<name>.pub   base64 X25519 public key (copy to the controller's keys_dir)
//! <out>/hmac.key     base64 integrity key shared by controller and nodes
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use cumulus_common::IdentityKey;
use cumulus_common::keys::{generate_integrity_key, is_valid_identity};

/// Files written by one run
#[derive(Debug)]
pub struct Generated {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
    pub integrity_key: Option<PathBuf>,
    pub public_base64: String,
}

/// Write a fresh identity key pair for `name`, plus an integrity key on request
pub fn generate(out: &Path, name: &str, integrity: bool, force: bool) -> Result<Generated> {
    if !is_valid_identity(name) {
        anyhow::bail!("name {:?} must use only letters, digits, or '_'", name);
    }
    std::fs::create_dir_all(out)
        .with_context(|| format!("Failed to create {}", out.display()))?;

    let identity = IdentityKey::generate();
    let private_key = out.join(format!("{}.key", name));
    let public_key = out.join(format!("{}.pub", name));
    let public_base64 = identity.public().to_base64();

    write_new(&private_key, &identity.to_base64(), force)?;
    restrict_permissions(&private_key)?;
    write_new(&public_key, &public_base64, force)?;

    let integrity_key = if integrity {
        let path = out.join("hmac.key");
        write_new(&path, &generate_integrity_key(), force)?;
        restrict_permissions(&path)?;
        Some(path)
    } else {
        None
    };

    Ok(Generated {
        private_key,
        public_key,
        integrity_key,
        public_base64,
    })
}

fn write_new(path: &Path, contents: &str, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    std::fs::write(path, format!("{}\n", contents))
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to restrict permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
