//! Local at-rest encryption for the broker API password. Not an external
//! vault (out of scope per the specification) — just the minimum so the
//! password never sits on disk in clear text between process restarts.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{Context, Result};
use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Argon2, PasswordHasher,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize)]
struct EncryptedSecret {
    ciphertext: String,
    nonce: String,
    salt: String,
}

pub struct SecretStore {
    path: PathBuf,
}

impl SecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn cipher_for(master_password: &str, salt: &SaltString) -> Result<Aes256Gcm> {
        let argon2 = Argon2::default();
        let hash = argon2
            .hash_password(master_password.as_bytes(), salt)
            .map_err(|e| anyhow::anyhow!("key derivation failed: {e}"))?;
        let derived = hash
            .hash
            .context("argon2 produced no output hash")?
            .as_bytes()
            .to_vec();
        let key = Key::<Aes256Gcm>::from_slice(&derived[..32]);
        Ok(Aes256Gcm::new(key))
    }

    /// Encrypts `plaintext` with a freshly generated salt and nonce and
    /// writes it to `self.path` with owner-only permissions on unix.
    pub fn seal(&self, master_password: &str, plaintext: &str) -> Result<()> {
        let salt = SaltString::generate(&mut OsRng);
        let cipher = Self::cipher_for(master_password, &salt)?;

        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("encryption failed: {e:?}"))?;

        let record = EncryptedSecret {
            ciphertext: BASE64.encode(ciphertext),
            nonce: BASE64.encode(nonce_bytes),
            salt: salt.as_str().to_string(),
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&record)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&self.path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms)?;
        }
        Ok(())
    }

    /// Decrypts the secret at `self.path`. Called exactly once, at
    /// Supervisor startup; the plaintext is held only in memory afterward.
    pub fn unseal(&self, master_password: &str) -> Result<String> {
        let data = fs::read_to_string(&self.path)
            .with_context(|| format!("reading secret file {}", self.path.display()))?;
        let record: EncryptedSecret = serde_json::from_str(&data)?;

        let salt = SaltString::from_b64(&record.salt)
            .map_err(|e| anyhow::anyhow!("invalid stored salt: {e}"))?;
        let cipher = Self::cipher_for(master_password, &salt)?;

        let ciphertext = BASE64.decode(&record.ciphertext)?;
        let nonce_bytes = BASE64.decode(&record.nonce)?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|e| anyhow::anyhow!("decryption failed, wrong master password?: {e:?}"))?;
        Ok(String::from_utf8(plaintext)?)
    }

    pub fn exists(&self) -> bool {
        Path::new(&self.path).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn seal_then_unseal_round_trips() {
        let dir = tempdir().unwrap();
        let store = SecretStore::new(dir.path().join("secret.enc"));
        store.seal("correct horse", "s3cr3t-api-password").unwrap();
        let plaintext = store.unseal("correct horse").unwrap();
        assert_eq!(plaintext, "s3cr3t-api-password");
    }

    #[test]
    fn wrong_password_fails_to_decrypt() {
        let dir = tempdir().unwrap();
        let store = SecretStore::new(dir.path().join("secret.enc"));
        store.seal("correct horse", "s3cr3t-api-password").unwrap();
        assert!(store.unseal("wrong password").is_err());
    }
}
