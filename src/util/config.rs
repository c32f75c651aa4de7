// Copyright (C) 2026 adbhost contributors
// Licensed under the MIT license. See LICENSE file for details.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::auth::KeyStore;
use crate::error::{Error, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredKeyPair {
    private_jwk: String,
    public_jwk: String,
}

fn config_path() -> PathBuf {
    if let Some(dir) = dirs_next::config_dir() {
        return dir.join("adbhost").join("adbkey.json");
    }
    PathBuf::from(".adbhost_key.json")
}

/// Default on-disk [`KeyStore`], persisting the host RSA key pair as a
/// JSON document holding its private/public JWK forms (teacher's
/// `load_state`/`save_state` pattern, repurposed from the MD5-override
/// state it originally carried).
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new() -> Self {
        Self {
            path: config_path(),
        }
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Default for FileKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for FileKeyStore {
    fn load_key(&self) -> Result<Option<(String, String)>> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::internal(anyhow::anyhow!(
                    "reading {}: {e}",
                    self.path.display()
                )))
            }
        };
        let stored: StoredKeyPair = serde_json::from_slice(&bytes)
            .map_err(|e| Error::internal(anyhow::anyhow!("parsing {}: {e}", self.path.display())))?;
        Ok(Some((stored.private_jwk, stored.public_jwk)))
    }

    fn store_key(&self, private_jwk: &str, public_jwk: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).ok();
        }
        let stored = StoredKeyPair {
            private_jwk: private_jwk.to_string(),
            public_jwk: public_jwk.to_string(),
        };
        let bytes = serde_json::to_vec_pretty(&stored)
            .map_err(|e| Error::internal(anyhow::anyhow!("serializing key pair: {e}")))?;
        fs::write(&self.path, bytes)
            .map_err(|e| Error::internal(anyhow::anyhow!("writing {}: {e}", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_key_pair_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::at(dir.path().join("adbkey.json"));
        assert!(store.load_key().unwrap().is_none());

        store.store_key("{\"priv\":true}", "{\"pub\":true}").unwrap();
        let (priv_jwk, pub_jwk) = store.load_key().unwrap().unwrap();
        assert_eq!(priv_jwk, "{\"priv\":true}");
        assert_eq!(pub_jwk, "{\"pub\":true}");
    }
}
