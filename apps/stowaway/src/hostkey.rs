use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Size of freshly generated host key material.
pub const HOST_KEY_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum HostKeyError {
    #[error("failed to read host key {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("host key {path:?} is empty")]
    Empty { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyOrigin {
    File(PathBuf),
    Generated,
}

/// Key material the injector-facing transport presents to connecting peers.
#[derive(Clone)]
pub struct HostKey {
    material: Arc<[u8]>,
    origin: HostKeyOrigin,
}

impl HostKey {
    pub fn load(path: &Path) -> Result<Self, HostKeyError> {
        let material = std::fs::read(path).map_err(|source| HostKeyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if material.is_empty() {
            return Err(HostKeyError::Empty {
                path: path.to_path_buf(),
            });
        }
        Ok(Self {
            material: material.into(),
            origin: HostKeyOrigin::File(path.to_path_buf()),
        })
    }

    pub fn generate() -> Self {
        let mut material = vec![0u8; HOST_KEY_BITS / 8];
        rand::thread_rng().fill_bytes(&mut material);
        Self {
            material: material.into(),
            origin: HostKeyOrigin::Generated,
        }
    }

    /// Loads the operator's key when one is configured, otherwise generates a
    /// key for this session only.
    pub fn resolve(path: Option<&Path>) -> Result<Self, HostKeyError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::generate()),
        }
    }

    pub fn material(&self) -> &[u8] {
        &self.material
    }

    pub fn origin(&self) -> &HostKeyOrigin {
        &self.origin
    }

    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.material);
        format!("SHA256:{}", hex::encode(digest))
    }
}

impl fmt::Debug for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKey")
            .field("origin", &self.origin)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}
