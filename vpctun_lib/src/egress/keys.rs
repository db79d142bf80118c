//! Key material for the egress hop: prefer an existing user key, fall back
//! to an ephemeral RSA-2048 pair that lives and dies with the session.

use std::fs;
use std::io;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::debug;
use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::{LineEnding, PrivateKey};
use tempfile::TempDir;

pub struct ProvisionedKey {
    pub private_key_path: PathBuf,
    pub public_key: String,
    // dropping the TempDir deletes the ephemeral material
    ephemeral_dir: Option<TempDir>,
}

impl ProvisionedKey {
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_dir.is_some()
    }
}

/// Returns a usable key pair: an existing key under `~/.ssh` when one is
/// present with its public half, otherwise a freshly generated ephemeral
/// pair in a 0600 temp directory.
pub fn provision() -> io::Result<ProvisionedKey> {
    if let Some(home) = std::env::var_os("HOME") {
        if let Some(key) = find_existing_key(Path::new(&home)) {
            debug!("using existing key {}", key.private_key_path.display());
            return Ok(key);
        }
    }
    generate_ephemeral()
}

pub(crate) fn find_existing_key(home: &Path) -> Option<ProvisionedKey> {
    for name in ["id_rsa", "id_ed25519", "id_ecdsa"] {
        let private = home.join(".ssh").join(name);
        if !private.exists() {
            continue;
        }
        let public = private.with_extension("pub");
        if let Ok(public_key) = fs::read_to_string(&public) {
            return Some(ProvisionedKey {
                private_key_path: private,
                public_key: public_key.trim().to_string(),
                ephemeral_dir: None,
            });
        }
    }
    None
}

fn generate_ephemeral() -> io::Result<ProvisionedKey> {
    let dir = tempfile::Builder::new().prefix("vpctun-ssh-").tempdir()?;

    let keypair = RsaKeypair::random(&mut rand::rngs::OsRng, 2048).map_err(key_err)?;
    let private = PrivateKey::new(KeypairData::Rsa(keypair), "vpctun-ephemeral").map_err(key_err)?;
    let encoded = private.to_openssh(LineEnding::LF).map_err(key_err)?;

    let path = dir.path().join("id_rsa");
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)?;
    file.write_all(encoded.as_bytes())?;

    let public_key = private.public_key().to_openssh().map_err(key_err)?;
    debug!("generated ephemeral rsa key in {}", dir.path().display());

    Ok(ProvisionedKey {
        private_key_path: path,
        public_key,
        ephemeral_dir: Some(dir),
    })
}

fn key_err(e: ssh_key::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}
