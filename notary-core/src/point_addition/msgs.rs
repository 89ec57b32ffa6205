//! Fixed-width big-endian serialization of the point-addition blobs.

use super::{PointAdditionError, CIPHERTEXT_LEN, MOD_P_LEN};
use curv::arithmetic::Converter;
use curv::BigInt;
use paillier::EncryptionKey;

/// Appends `value` to `out`, left-padded with zeros to exactly `len` bytes.
pub(crate) fn put(out: &mut Vec<u8>, value: &BigInt, len: usize) {
    let bytes = value.to_bytes();
    assert!(bytes.len() <= len, "value does not fit its blob field");
    out.extend(std::iter::repeat(0u8).take(len - bytes.len()));
    out.extend_from_slice(&bytes);
}

/// Sequential reader over a blob with range checks on every field.
pub struct BlobReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BlobReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Reads a fixed-width big-endian integer.
    pub fn read(&mut self, len: usize) -> Result<BigInt, PointAdditionError> {
        if self.pos + len > self.buf.len() {
            return Err(PointAdditionError::MalformedBlob);
        }
        let value = BigInt::from_bytes(&self.buf[self.pos..self.pos + len]);
        self.pos += len;
        Ok(value)
    }

    /// Reads a value which must be smaller than the P-256 prime.
    pub fn read_mod_p(&mut self, p: &BigInt) -> Result<BigInt, PointAdditionError> {
        let value = self.read(MOD_P_LEN)?;
        if &value >= p {
            return Err(PointAdditionError::ValueOutOfRange);
        }
        Ok(value)
    }

    /// Reads a Paillier ciphertext, which must be nonzero and smaller
    /// than N^2.
    pub fn read_ciphertext(
        &mut self,
        key: &EncryptionKey,
    ) -> Result<BigInt, PointAdditionError> {
        let value = self.read(CIPHERTEXT_LEN)?;
        if value == BigInt::from(0) || value >= key.nn {
            return Err(PointAdditionError::ValueOutOfRange);
        }
        Ok(value)
    }

    /// Fails unless the whole blob was consumed.
    pub fn finish(&self) -> Result<(), PointAdditionError> {
        if self.pos != self.buf.len() {
            return Err(PointAdditionError::MalformedBlob);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_pads_and_roundtrips() {
        let v = BigInt::from(0x0102u16);
        let mut out = Vec::new();
        put(&mut out, &v, 8);
        assert_eq!(out, vec![0, 0, 0, 0, 0, 0, 1, 2]);
        let mut r = BlobReader::new(&out);
        assert_eq!(r.read(8).unwrap(), v);
        assert!(r.finish().is_ok());
    }

    #[test]
    fn test_reader_rejects_short_and_trailing() {
        let buf = vec![0u8; 8];
        let mut r = BlobReader::new(&buf);
        assert!(r.read(16).is_err());
        r.read(4).unwrap();
        assert!(r.finish().is_err());
    }
}
