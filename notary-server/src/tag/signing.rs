//! Signing of verified ciphertexts with the long-lived tag-signing key.

use eyre::{eyre, Context, Result};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use p256::SecretKey;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::SystemTime;
use tracing::info;

use crate::keys::pubkey_to_pem;

pub struct TagSigningManager {
    signing_key: SigningKey,
    public_key_pem: Vec<u8>,
    last_modified: SystemTime,
}

impl TagSigningManager {
    /// Loads the SEC1 EC private key PEM from `path`. Missing or malformed
    /// keys are fatal at startup.
    pub fn new(path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let secret = SecretKey::from_sec1_pem(&pem)
            .map_err(|e| eyre!("failed to parse {}: {e}", path.display()))?;
        let signing_key = SigningKey::from(secret);
        let public_key_pem = pubkey_to_pem(signing_key.verifying_key())?;

        info!("Loaded {} tag signing key (curve P-256)", path.display());

        Ok(Self {
            signing_key,
            public_key_pem,
            last_modified: SystemTime::now(),
        })
    }

    /// Returns an ASN.1-encoded ECDSA-SHA256 signature over the ciphertext
    /// given as decimal byte strings.
    pub fn sign(&self, ciphertext: &[String]) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(ciphertext.len());
        for byte_string in ciphertext {
            match byte_string.parse::<u8>() {
                Ok(b) => bytes.push(b),
                Err(_) => continue,
            }
        }
        if bytes.len() != ciphertext.len() {
            return Err(eyre!("signing invalid ciphertext failed"));
        }
        let digest = Sha256::digest(&bytes);
        let signature: Signature = self
            .signing_key
            .sign_prehash(&digest)
            .map_err(|e| eyre!("ecdsa signing failed: {e}"))?;
        Ok(signature.to_der().as_bytes().to_vec())
    }

    pub fn public_key_pem(&self) -> &[u8] {
        &self.public_key_pem
    }

    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::hazmat::PrehashVerifier;
    use p256::pkcs8::LineEnding;

    fn write_test_key(dir: &Path) -> std::path::PathBuf {
        let secret = SecretKey::random(&mut rand::thread_rng());
        // sec1 pem
        let pem = secret.to_sec1_pem(LineEnding::LF).unwrap();
        let path = dir.join("signing.key");
        std::fs::write(&path, pem.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_sign_verified_ciphertext() {
        let dir = std::env::temp_dir().join(format!("tagsign-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_test_key(&dir);

        let manager = TagSigningManager::new(&path).unwrap();
        let ciphertext: Vec<String> = vec!["1".into(), "2".into(), "255".into()];
        let der = manager.sign(&ciphertext).unwrap();

        let digest = Sha256::digest([1u8, 2, 255]);
        let signature = Signature::from_der(&der).unwrap();
        manager
            .signing_key
            .verifying_key()
            .verify_prehash(&digest, &signature)
            .unwrap();

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_sign_rejects_invalid_bytes() {
        let dir = std::env::temp_dir().join(format!("tagsign-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_test_key(&dir);

        let manager = TagSigningManager::new(&path).unwrap();
        assert!(manager.sign(&["1".into(), "256".into()]).is_err());
        assert!(manager.sign(&["1".into(), "abc".into()]).is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
