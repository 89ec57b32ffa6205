//! SHA-256 midstate capture and resumption.
//!
//! The TLS PRF steps hand the notary a captured compression-function state
//! (the outer hash of an HMAC) rather than a key. Finishing a hash from
//! such a state lets the notary compute HMAC outputs without ever holding
//! the full secret.

use core::slice::from_ref;
use digest::{
    block_buffer::{BlockBuffer, Eager},
    generic_array::GenericArray,
    typenum::U64,
};
use sha2::compress256;

/// Absorbs `input` (whole 64-byte blocks only) into a fresh SHA-256 state
/// and returns the raw compression state.
pub fn partial_sha256_digest(input: &[u8]) -> [u32; 8] {
    assert!(input.len() % 64 == 0, "input length must be a multiple of 64");
    let mut state = [
        0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab,
        0x5be0cd19,
    ];
    for b in input.chunks_exact(64) {
        let mut block = GenericArray::<u8, U64>::default();
        block[..].copy_from_slice(b);
        compress256(&mut state, &[block]);
    }
    state
}

/// Resumes a SHA-256 computation from a captured state and finishes it with
/// `input`. `pos` is the number of bytes absorbed before the state was
/// captured.
pub fn finalize_sha256_digest(mut state: [u32; 8], pos: usize, input: &[u8]) -> [u8; 32] {
    let mut buffer = BlockBuffer::<U64, Eager>::default();
    buffer.digest_blocks(input, |b| compress256(&mut state, b));
    buffer.digest_pad(
        0x80,
        &(((input.len() + pos) * 8) as u64).to_be_bytes(),
        |b| compress256(&mut state, from_ref(b)),
    );

    let mut out: [u8; 32] = [0; 32];
    for (chunk, v) in out.chunks_exact_mut(4).zip(state.iter()) {
        chunk.copy_from_slice(&v.to_be_bytes());
    }
    out
}

/// Finishes a hash from a 32-byte captured state that sits after one
/// 64-byte block, which is where every HMAC outer state lives.
pub fn finish_hash(outer_state: &[u8; 32], data: &[u8]) -> [u8; 32] {
    finalize_sha256_digest(bytes_to_state(outer_state), 64, data)
}

/// Unpacks a 32-byte serialized state into compression words.
pub fn bytes_to_state(bytes: &[u8; 32]) -> [u32; 8] {
    let mut state = [0u32; 8];
    for (word, chunk) in state.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_be_bytes(chunk.try_into().unwrap());
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    #[test]
    fn test_sha2_initial_state() {
        let s = b"test string";
        let state = [
            0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab,
            0x5be0cd19,
        ];
        let digest = finalize_sha256_digest(state, 0, s);

        let mut hasher = Sha256::new();
        hasher.update(s);
        assert_eq!(digest, hasher.finalize().as_slice());
    }

    #[test]
    fn test_sha2_resume_state() {
        let s = b"test string test string test string test string test string test";
        let state = partial_sha256_digest(s);

        let s2 = b"additional data ";
        let digest = finalize_sha256_digest(state, s.len(), s2);

        let mut hasher = Sha256::new();
        hasher.update(s);
        hasher.update(s2);
        assert_eq!(digest, hasher.finalize().as_slice());
    }

    #[test]
    fn test_finish_hash_from_serialized_state() {
        let block = [0x5c; 64];
        let state = partial_sha256_digest(&block);
        let mut serialized = [0u8; 32];
        for (chunk, v) in serialized.chunks_exact_mut(4).zip(state.iter()) {
            chunk.copy_from_slice(&v.to_be_bytes());
        }

        let data = b"inner hash bytes";
        let mut hasher = Sha256::new();
        hasher.update(block);
        hasher.update(data);
        assert_eq!(
            finish_hash(&serialized, data),
            hasher.finalize().as_slice()
        );
    }
}
