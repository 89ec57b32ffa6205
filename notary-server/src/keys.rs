//! Signing keys: the notary's long-lived master key and the ephemeral
//! per-session keys whose public halves are handed to clients at `init`.

use eyre::{eyre, Result};
use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::pkcs8::{EncodePublicKey, LineEnding};
use rand::thread_rng;

pub struct KeyManager {
    master_pub_pem: Vec<u8>,
}

impl KeyManager {
    /// Generates the master keypair for this process run. Only the public
    /// half is ever served; the private half has no signing duty here, so
    /// it is not retained.
    pub fn new() -> Result<Self> {
        let master = SigningKey::random(&mut thread_rng());
        let master_pub_pem = pubkey_to_pem(master.verifying_key())?;
        Ok(Self { master_pub_pem })
    }

    /// The PEM of the master public key, served on /getPubKey.
    pub fn master_pub_key_pem(&self) -> &[u8] {
        &self.master_pub_pem
    }

    /// Issues a fresh per-session signing key and the key data sent to the
    /// client in the `init` reply: the session public key as PKIX PEM.
    pub fn issue_session_key(&self) -> Result<(SigningKey, Vec<u8>)> {
        let key = SigningKey::random(&mut thread_rng());
        let key_data = pubkey_to_pem(key.verifying_key())?;
        Ok((key, key_data))
    }
}

/// Encodes an ECDSA public key as PKIX DER in a PEM block.
pub fn pubkey_to_pem(key: &VerifyingKey) -> Result<Vec<u8>> {
    let pem = key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| eyre!("failed to encode public key: {e}"))?;
    Ok(pem.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::pkcs8::DecodePublicKey;

    #[test]
    fn test_issue_session_key_pem_parses() {
        let km = KeyManager::new().unwrap();
        let (key, key_data) = km.issue_session_key().unwrap();
        let pem = String::from_utf8(key_data).unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        let parsed = VerifyingKey::from_public_key_pem(&pem).unwrap();
        assert_eq!(&parsed, key.verifying_key());
    }

    #[test]
    fn test_session_keys_are_distinct() {
        let km = KeyManager::new().unwrap();
        let (a, _) = km.issue_session_key().unwrap();
        let (b, _) = km.issue_session_key().unwrap();
        assert_ne!(a.to_bytes(), b.to_bytes());
    }
}
