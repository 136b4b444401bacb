//! Encryption of stored credentials.
//!
//! Job credentials are sealed with ChaCha20-Poly1305 before they reach the
//! state database. The 32-byte key comes from `GP2I_SECRET_KEY` (base64) or
//! from a key file in the data directory, generated on first use.

use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use thiserror::Error;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Invalid secret key: {0}")]
    InvalidKey(String),

    #[error("Secret key file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to encrypt secret")]
    Encrypt,

    /// Wrong key or tampered ciphertext.
    #[error("Failed to decrypt secret: {0}")]
    Decrypt(String),
}

/// Seals and opens secrets with one key.
#[derive(Clone)]
pub struct SecretBox {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretBox(..)")
    }
}

impl SecretBox {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    /// A box with a fresh random key, for throwaway stores.
    pub fn generate() -> Self {
        Self::new(random_key())
    }

    /// Load the key from `env_key` if set, else from `key_path`, creating
    /// that file with a new key when it does not exist.
    pub fn load(env_key: Option<&str>, key_path: &Path) -> Result<Self, SecretError> {
        if let Some(encoded) = env_key {
            return Ok(Self::new(decode_key(encoded)?));
        }
        match std::fs::read_to_string(key_path) {
            Ok(encoded) => Ok(Self::new(decode_key(&encoded)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = random_key();
                write_key_file(key_path, &key)?;
                tracing::info!(path = %key_path.display(), "Generated new secret key");
                Ok(Self::new(key))
            }
            Err(e) => Err(SecretError::Io {
                path: key_path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Encrypt `plaintext` to base64 of nonce followed by ciphertext.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, SecretError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| SecretError::Encrypt)?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, SecretError> {
        let raw = BASE64
            .decode(sealed.trim())
            .map_err(|e| SecretError::Decrypt(e.to_string()))?;
        if raw.len() < NONCE_LEN {
            return Err(SecretError::Decrypt("sealed value too short".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecretError::Decrypt("authentication failed".into()))
    }
}

fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&ChaCha20Poly1305::generate_key(&mut OsRng));
    key
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], SecretError> {
    let raw = BASE64
        .decode(encoded.trim())
        .map_err(|e| SecretError::InvalidKey(e.to_string()))?;
    <[u8; KEY_LEN]>::try_from(raw.as_slice()).map_err(|_| {
        SecretError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, raw.len()))
    })
}

fn write_key_file(path: &Path, key: &[u8; KEY_LEN]) -> Result<(), SecretError> {
    let io_err = |source| SecretError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(io_err)?;
    file.write_all(BASE64.encode(key).as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let secrets = SecretBox::generate();
        let sealed = secrets.seal(b"api-key-123").unwrap();
        assert!(!sealed.contains("api-key-123"));
        assert_eq!(secrets.open(&sealed).unwrap(), b"api-key-123");
        // Fresh nonce per seal.
        assert_ne!(secrets.seal(b"api-key-123").unwrap(), sealed);
    }

    #[test]
    fn test_wrong_key_or_tampering_fails() {
        let sealed = SecretBox::generate().seal(b"secret").unwrap();
        assert!(matches!(
            SecretBox::generate().open(&sealed),
            Err(SecretError::Decrypt(_))
        ));

        let secrets = SecretBox::new([7u8; KEY_LEN]);
        let mut raw = BASE64.decode(secrets.seal(b"secret").unwrap()).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 1;
        assert!(secrets.open(&BASE64.encode(raw)).is_err());
        assert!(secrets.open("not base64!").is_err());
    }

    #[test]
    fn test_load_creates_then_reuses_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.key");
        let first = SecretBox::load(None, &path).unwrap();
        assert!(path.exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        let sealed = first.seal(b"token").unwrap();
        let second = SecretBox::load(None, &path).unwrap();
        assert_eq!(second.open(&sealed).unwrap(), b"token");
    }

    #[test]
    fn test_load_prefers_env_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.key");
        let encoded = BASE64.encode([9u8; KEY_LEN]);
        let secrets = SecretBox::load(Some(&encoded), &path).unwrap();
        assert!(!path.exists());
        let sealed = secrets.seal(b"x").unwrap();
        assert_eq!(SecretBox::new([9u8; KEY_LEN]).open(&sealed).unwrap(), b"x");
    }

    #[test]
    fn test_bad_key_rejected() {
        assert!(matches!(
            SecretBox::load(Some("c2hvcnQ="), Path::new("/nonexistent")),
            Err(SecretError::InvalidKey(_))
        ));
    }
}
