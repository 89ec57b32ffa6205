//! Bit/byte conversions shared by the protocol modules.
//!
//! Two distinct conventions are in play and must not be mixed up:
//!
//! * Circuit input values are decomposed with [`bytes_to_bits`], which treats
//!   the byte slice as one big-endian integer and emits the least significant
//!   bit first. This is the order the circuit files expect their input wires
//!   in.
//! * OT choice bits are packed with [`boolvec_to_u8vec`], which packs bits
//!   little-endian within each byte, in sequence order.

/// Decomposes bytes into bits, treating the slice as a big-endian integer
/// and emitting the least significant bit at index 0.
pub fn bytes_to_bits(bytes: &[u8]) -> Vec<bool> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);
    for byte in bytes.iter().rev() {
        for i in 0..8 {
            bits.push((byte >> i) & 1 == 1);
        }
    }
    bits
}

/// Packs bits (least significant at index 0) back into big-endian bytes.
/// The most significant bits of the leading byte are zero-padded when the
/// bit count is not a multiple of 8.
pub fn bits_to_bytes(bits: &[bool]) -> Vec<u8> {
    let len = (bits.len() + 7) / 8;
    let mut bytes = vec![0u8; len];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            bytes[len - 1 - i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Packs a bit sequence into bytes, little-endian within each byte.
#[inline]
pub fn boolvec_to_u8vec(bv: &[bool]) -> Vec<u8> {
    let offset = usize::from(bv.len() % 8 != 0);
    let mut v = vec![0u8; bv.len() / 8 + offset];
    for (i, b) in bv.iter().enumerate() {
        v[i / 8] |= (*b as u8) << (i % 8);
    }
    v
}

/// Unpacks bytes into a bit sequence, little-endian within each byte.
#[inline]
pub fn u8vec_to_boolvec(v: &[u8]) -> Vec<bool> {
    let mut bv = Vec::with_capacity(v.len() * 8);
    for byte in v.iter() {
        for i in 0..8 {
            bv.push((1 << i) & byte != 0);
        }
    }
    bv
}

/// XORs two equal-length byte slices into a new vector.
pub fn xor_bytes(a: &[u8], b: &[u8]) -> Vec<u8> {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha12Rng;

    #[test]
    fn test_bytes_to_bits_roundtrip() {
        let mut rng = ChaCha12Rng::from_entropy();
        let bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
        assert_eq!(bits_to_bytes(&bytes_to_bits(&bytes)), bytes);
    }

    #[test]
    fn test_bits_to_bytes_pads_msb() {
        // 9 bits with the high bit set: re-encoding keeps the bit sequence
        // and pads the leading byte
        let mut bits = vec![false; 9];
        bits[8] = true;
        let bytes = bits_to_bytes(&bits);
        assert_eq!(bytes, vec![0x01, 0x00]);
        assert_eq!(bytes_to_bits(&bytes)[..9], bits[..]);
    }

    #[test]
    fn test_bytes_to_bits_order() {
        // 0x0200 as a big-endian integer has bit 9 set
        let bits = bytes_to_bits(&[0x02, 0x00]);
        assert!(bits[9]);
        assert_eq!(bits.iter().filter(|b| **b).count(), 1);
    }

    #[test]
    fn test_boolvec_roundtrip() {
        let v: Vec<bool> = (0..128).map(|_| rand::random::<bool>()).collect();
        assert_eq!(u8vec_to_boolvec(&boolvec_to_u8vec(&v)), v);
    }

    #[test]
    fn test_xor_bytes_involution() {
        let mut rng = ChaCha12Rng::from_entropy();
        let a: Vec<u8> = (0..64).map(|_| rng.gen()).collect();
        let b: Vec<u8> = (0..64).map(|_| rng.gen()).collect();
        assert_eq!(xor_bytes(&xor_bytes(&a, &b), &b), a);
    }
}
