//! EC point addition in 2PC using the Paillier cryptosystem.
//!
//! The notary and the client each hold a secret point on P-256 (their ECDH
//! products with the Webserver's ephemeral key) whose sum is the TLS
//! pre-master secret point. The four rounds below give each party an
//! additive share of the sum's x-coordinate without revealing either
//! point. The notary owns the Paillier keypair and plays the encrypting
//! role; every round consumes one opaque blob from the client and produces
//! the next.

mod msgs;

pub use msgs::BlobReader;

use curv::arithmetic::{Converter, Modulo};
use curv::BigInt;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, NonZeroScalar, PublicKey};
use paillier::{Decrypt, DecryptionKey, Encrypt, EncryptionKey, KeyGeneration, Paillier, RawCiphertext, RawPlaintext};
use rand::thread_rng;

/// NIST P-256 prime.
pub const P: &str = "ffffffff00000001000000000000000000000000ffffffffffffffffffffffff";

/// Byte widths of the fixed-width blob fields: values mod p, the Paillier
/// modulus N and ciphertexts mod N^2.
pub const MOD_P_LEN: usize = 32;
pub const MODULUS_LEN: usize = 256;
pub const CIPHERTEXT_LEN: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum PointAdditionError {
    #[error("invalid webserver public key")]
    InvalidPoint,
    #[error("step received out of order")]
    OutOfOrder,
    #[error("malformed blob")]
    MalformedBlob,
    #[error("blob value out of range")]
    ValueOutOfRange,
    #[error("protocol produced an invalid P-256 share")]
    InvalidShare,
}

enum State {
    Initialized,
    S1,
    S2 { a_masked_mod_p: BigInt },
    S3,
    Complete,
}

/// The notary's side of the four-round Paillier point-addition protocol.
pub struct Paillier2Pc {
    state: State,
    /// NIST P-256 prime.
    p: BigInt,
    enc_key: EncryptionKey,
    dec_key: DecryptionKey,
}

impl Paillier2Pc {
    /// Generates a fresh Paillier keypair for this session.
    pub fn new() -> Self {
        let (enc_key, dec_key) = Paillier::keypair().keys();
        Self {
            state: State::Initialized,
            p: BigInt::from_hex(P).unwrap(),
            enc_key,
            dec_key,
        }
    }

    /// First round. The blob carries the Webserver's ephemeral public key
    /// as a 65-byte uncompressed SEC1 point. The notary multiplies it by a
    /// fresh scalar to obtain its secret point (x_q, y_q), and replies with
    /// its Paillier modulus and the encryptions E(x_q), E(-x_q), E(y_q^2),
    /// E(-2y_q). Returns the server public key bytes (retained for the
    /// final signature) and the reply blob.
    pub fn step1(&mut self, body: &[u8]) -> Result<(Vec<u8>, Vec<u8>), PointAdditionError> {
        let d = NonZeroScalar::random(&mut thread_rng());
        self.step1_with_scalar(body, d)
    }

    fn step1_with_scalar(
        &mut self,
        body: &[u8],
        d: NonZeroScalar,
    ) -> Result<(Vec<u8>, Vec<u8>), PointAdditionError> {
        if !matches!(self.state, State::Initialized) {
            return Err(PointAdditionError::OutOfOrder);
        }
        if body.len() != 65 {
            return Err(PointAdditionError::MalformedBlob);
        }
        let point =
            EncodedPoint::from_bytes(body).map_err(|_| PointAdditionError::InvalidPoint)?;
        let server_pk = Option::<PublicKey>::from(PublicKey::from_encoded_point(&point))
            .ok_or(PointAdditionError::InvalidPoint)?;

        // the notary's secret point: d * server_pubkey
        let q = (server_pk.to_projective() * *d)
            .to_affine()
            .to_encoded_point(false);
        let x = BigInt::from_bytes(q.x().ok_or(PointAdditionError::InvalidPoint)?);
        let y = BigInt::from_bytes(q.y().ok_or(PointAdditionError::InvalidPoint)?);

        let e_x_q = self.encrypt(&x);
        let e_neg_x_q = self.encrypt(&BigInt::mod_sub(&self.p, &x, &self.p));
        let e_y_q_pow_2 = self.encrypt(&BigInt::mod_pow(&y, &BigInt::from(2u16), &self.p));
        let e_neg_2_y_q = self.encrypt(&BigInt::mod_sub(&self.p, &(2 * &y), &self.p));

        let mut reply = Vec::with_capacity(MODULUS_LEN + 4 * CIPHERTEXT_LEN);
        msgs::put(&mut reply, &self.enc_key.n, MODULUS_LEN);
        msgs::put(&mut reply, &e_x_q, CIPHERTEXT_LEN);
        msgs::put(&mut reply, &e_neg_x_q, CIPHERTEXT_LEN);
        msgs::put(&mut reply, &e_y_q_pow_2, CIPHERTEXT_LEN);
        msgs::put(&mut reply, &e_neg_2_y_q, CIPHERTEXT_LEN);

        self.state = State::S1;
        Ok((body.to_vec(), reply))
    }

    /// Second round: decrypts the masked A and T values and replies with
    /// E((T * M_T)^(p-3) mod p).
    pub fn step2(&mut self, body: &[u8]) -> Result<Vec<u8>, PointAdditionError> {
        if !matches!(self.state, State::S1) {
            return Err(PointAdditionError::OutOfOrder);
        }
        let mut r = BlobReader::new(body);
        let n_a_mod_p = r.read_mod_p(&self.p)?;
        let n_t_mod_p = r.read_mod_p(&self.p)?;
        let e_a_masked = r.read_ciphertext(&self.enc_key)?;
        let e_t_masked = r.read_ciphertext(&self.enc_key)?;
        r.finish()?;

        // A * M_A mod p
        let a_masked: BigInt =
            Paillier::decrypt(&self.dec_key, RawCiphertext::from(e_a_masked)).into();
        let a_masked_mod_p = BigInt::mod_sub(&a_masked, &n_a_mod_p, &self.p);

        // T * M_T mod p
        let t_masked: BigInt =
            Paillier::decrypt(&self.dec_key, RawCiphertext::from(e_t_masked)).into();
        let t_masked_mod_p = BigInt::mod_sub(&t_masked, &n_t_mod_p, &self.p);

        // E((T * M_T)^(p-3) mod p)
        let t_mod_pow = BigInt::mod_pow(&t_masked_mod_p, &(&self.p - 3), &self.p);
        let e_t_mod_pow = self.encrypt(&t_mod_pow);

        let mut reply = Vec::with_capacity(CIPHERTEXT_LEN);
        msgs::put(&mut reply, &e_t_mod_pow, CIPHERTEXT_LEN);

        self.state = State::S2 { a_masked_mod_p };
        Ok(reply)
    }

    /// Third round: decrypts the masked B value and replies with
    /// E(A * M_A * B * M_B).
    pub fn step3(&mut self, body: &[u8]) -> Result<Vec<u8>, PointAdditionError> {
        let a_masked_mod_p = match &self.state {
            State::S2 { a_masked_mod_p } => a_masked_mod_p.clone(),
            _ => return Err(PointAdditionError::OutOfOrder),
        };
        let mut r = BlobReader::new(body);
        let n_b_mod_p = r.read_mod_p(&self.p)?;
        let e_b_masked = r.read_ciphertext(&self.enc_key)?;
        r.finish()?;

        // B * M_B mod p
        let b_masked: BigInt =
            Paillier::decrypt(&self.dec_key, RawCiphertext::from(e_b_masked)).into();
        let b_masked_mod_p = BigInt::mod_sub(&b_masked, &n_b_mod_p, &self.p);

        let e_ab_masked = self.encrypt(&BigInt::mod_mul(
            &b_masked_mod_p,
            &a_masked_mod_p,
            &self.p,
        ));

        let mut reply = Vec::with_capacity(CIPHERTEXT_LEN);
        msgs::put(&mut reply, &e_ab_masked, CIPHERTEXT_LEN);

        self.state = State::S3;
        Ok(reply)
    }

    /// Fourth round: decrypts the masked PMS and reduces it mod p into the
    /// notary's 32-byte additive share of the pre-master secret.
    pub fn step4(&mut self, body: &[u8]) -> Result<[u8; 32], PointAdditionError> {
        if !matches!(self.state, State::S3) {
            return Err(PointAdditionError::OutOfOrder);
        }
        let mut r = BlobReader::new(body);
        let e_pms_masked = r.read_ciphertext(&self.enc_key)?;
        r.finish()?;

        let pms_masked: BigInt =
            Paillier::decrypt(&self.dec_key, RawCiphertext::from(e_pms_masked)).into();
        let share = pms_masked % &self.p;

        let bytes = share.to_bytes();
        if bytes.len() > 32 {
            return Err(PointAdditionError::InvalidShare);
        }
        let mut out = [0u8; 32];
        out[32 - bytes.len()..].copy_from_slice(&bytes);

        self.state = State::Complete;
        Ok(out)
    }

    fn encrypt(&self, plaintext: &BigInt) -> BigInt {
        Paillier::encrypt(&self.enc_key, RawPlaintext::from(plaintext)).into()
    }
}

impl Default for Paillier2Pc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curv::arithmetic::{Converter, Modulo, Samplable};
    use curv::BigInt;
    use p256::elliptic_curve::sec1::ToEncodedPoint;
    use p256::{EncodedPoint, NonZeroScalar, SecretKey};
    use paillier::{Add, Encrypt, EncryptionKey, Mul, Paillier, RawCiphertext, RawPlaintext};
    use rand::thread_rng;

    /// The client side of the protocol, mirroring the round structure with
    /// the roles reversed: the client holds its own secret point and masks
    /// and works under the notary's encryption key.
    struct TestClient {
        p: BigInt,
        x: BigInt,
        y: BigInt,
        secret: BigInt,
        n_a: BigInt,
        n_t: BigInt,
        n_b: BigInt,
        m_a: BigInt,
        m_t: BigInt,
        m_b: BigInt,
        enc_key: Option<EncryptionKey>,
        e_neg_x_q: Option<BigInt>,
        e_neg_x_p: Option<BigInt>,
    }

    impl TestClient {
        fn new(point: &EncodedPoint) -> Self {
            Self {
                p: BigInt::from_hex(P).unwrap(),
                x: BigInt::from_bytes(point.x().unwrap()),
                y: BigInt::from_bytes(point.y().unwrap()),
                secret: BigInt::sample(1027),
                n_a: BigInt::sample(1024),
                n_t: BigInt::sample(512),
                n_b: BigInt::sample(1024),
                m_a: BigInt::sample(512),
                m_t: BigInt::sample(256),
                m_b: BigInt::sample(512),
                enc_key: None,
                e_neg_x_q: None,
                e_neg_x_p: None,
            }
        }

        fn key(&self) -> &EncryptionKey {
            self.enc_key.as_ref().unwrap()
        }

        fn encrypt(&self, pt: &BigInt) -> BigInt {
            Paillier::encrypt(self.key(), RawPlaintext::from(pt)).into()
        }

        fn add(&self, a: &BigInt, b: &BigInt) -> BigInt {
            Paillier::add(
                self.key(),
                RawCiphertext::from(a),
                RawCiphertext::from(b),
            )
            .into()
        }

        fn mul(&self, c: &BigInt, pt: &BigInt) -> BigInt {
            Paillier::mul(
                self.key(),
                RawCiphertext::from(c),
                RawPlaintext::from(pt),
            )
            .into()
        }

        fn round1(&mut self, reply: &[u8]) -> Vec<u8> {
            let mut r = BlobReader::new(reply);
            let n = r.read(MODULUS_LEN).unwrap();
            self.enc_key = Some(EncryptionKey::from(&n));
            let e_x_q = r.read(CIPHERTEXT_LEN).unwrap();
            let e_neg_x_q = r.read(CIPHERTEXT_LEN).unwrap();
            let e_y_q_pow_2 = r.read(CIPHERTEXT_LEN).unwrap();
            let e_neg_2_y_q = r.read(CIPHERTEXT_LEN).unwrap();
            r.finish().unwrap();

            // E(T) = E(x_q - x_p)
            let e_neg_x_p = self.encrypt(&BigInt::mod_sub(&self.p, &self.x, &self.p));
            let e_t = self.add(&e_x_q, &e_neg_x_p);
            // E(T * M_T + N_T)
            let e_t_masked = self.add(&self.mul(&e_t, &self.m_t), &self.encrypt(&self.n_t));
            // E(A) = E(y_p^2) + E(y_q^2) + E(-2y_q)*y_p
            let e_y_p_pow_2 =
                self.encrypt(&BigInt::mod_pow(&self.y, &BigInt::from(2u16), &self.p));
            let e_a = self.add(
                &self.add(&e_y_p_pow_2, &e_y_q_pow_2),
                &self.mul(&e_neg_2_y_q, &self.y),
            );
            // E(A * M_A + N_A)
            let e_a_masked = self.add(&self.mul(&e_a, &self.m_a), &self.encrypt(&self.n_a));

            self.e_neg_x_q = Some(e_neg_x_q);
            self.e_neg_x_p = Some(e_neg_x_p);

            let mut out = Vec::new();
            super::msgs::put(&mut out, &(&self.n_a % &self.p), MOD_P_LEN);
            super::msgs::put(&mut out, &(&self.n_t % &self.p), MOD_P_LEN);
            super::msgs::put(&mut out, &e_a_masked, CIPHERTEXT_LEN);
            super::msgs::put(&mut out, &e_t_masked, CIPHERTEXT_LEN);
            out
        }

        fn round2(&mut self, reply: &[u8]) -> Vec<u8> {
            let mut r = BlobReader::new(reply);
            let e_t_mod_pow = r.read(CIPHERTEXT_LEN).unwrap();
            r.finish().unwrap();

            // E(B) = E((T*M_T)^(p-3)) * (M_T^(p-3))^-1
            let inv = BigInt::mod_inv(
                &BigInt::mod_pow(&self.m_t, &(&self.p - 3), &self.p),
                &self.p,
            )
            .unwrap();
            let e_b = self.mul(&e_t_mod_pow, &inv);
            // E(B * M_B + N_B)
            let e_b_masked = self.add(&self.mul(&e_b, &self.m_b), &self.encrypt(&self.n_b));

            let mut out = Vec::new();
            super::msgs::put(&mut out, &(&self.n_b % &self.p), MOD_P_LEN);
            super::msgs::put(&mut out, &e_b_masked, CIPHERTEXT_LEN);
            out
        }

        fn round3(&mut self, reply: &[u8]) -> Vec<u8> {
            let mut r = BlobReader::new(reply);
            let e_ab_masked = r.read(CIPHERTEXT_LEN).unwrap();
            r.finish().unwrap();

            // E(A * B)
            let inv = BigInt::mod_inv(&BigInt::mod_mul(&self.m_a, &self.m_b, &self.p), &self.p)
                .unwrap();
            let e_a_b = self.mul(&e_ab_masked, &inv);
            // E(PMS + S_q)
            let e_pms = self.add(
                &self.add(&e_a_b, self.e_neg_x_q.as_ref().unwrap()),
                self.e_neg_x_p.as_ref().unwrap(),
            );
            let e_pms_masked = self.add(&e_pms, &self.encrypt(&self.secret));

            let mut out = Vec::new();
            super::msgs::put(&mut out, &e_pms_masked, CIPHERTEXT_LEN);
            out
        }

        fn share(&self) -> BigInt {
            &self.p - (&self.secret % &self.p)
        }
    }

    #[test]
    fn test_point_addition_shares_sum_to_x() {
        let mut rng = thread_rng();

        let server_secret = SecretKey::random(&mut rng);
        let server_pk = server_secret.public_key();
        let server_point = server_pk.to_encoded_point(false);

        // secret scalars of both parties
        let notary_scalar = NonZeroScalar::random(&mut rng);
        let client_secret = SecretKey::random(&mut rng);
        let client_point = (server_pk.to_projective() * *client_secret.to_nonzero_scalar())
            .to_affine()
            .to_encoded_point(false);

        let mut notary = Paillier2Pc::new();
        let (retained_pk, reply1) = notary
            .step1_with_scalar(server_point.as_bytes(), notary_scalar)
            .unwrap();
        assert_eq!(retained_pk, server_point.as_bytes());

        let mut client = TestClient::new(&client_point);
        let blob2 = client.round1(&reply1);
        let reply2 = notary.step2(&blob2).unwrap();
        let blob3 = client.round2(&reply2);
        let reply3 = notary.step3(&blob3).unwrap();
        let blob4 = client.round3(&reply3);
        let notary_share = notary.step4(&blob4).unwrap();

        // the expected PMS point is (d_n + d_c) * server_pubkey
        let pms_point = (server_pk.to_projective() * *notary_scalar
            + server_pk.to_projective() * *client_secret.to_nonzero_scalar())
        .to_affine()
        .to_encoded_point(false);
        let expected_x = BigInt::from_bytes(pms_point.x().unwrap());

        let p = BigInt::from_hex(P).unwrap();
        let sum = (BigInt::from_bytes(&notary_share) + client.share()) % &p;
        assert_eq!(sum, expected_x);
    }

    #[test]
    fn test_steps_reject_out_of_order() {
        let mut notary = Paillier2Pc::new();
        assert!(matches!(
            notary.step2(&vec![0u8; MOD_P_LEN * 2 + CIPHERTEXT_LEN * 2]),
            Err(PointAdditionError::OutOfOrder)
        ));
        assert!(matches!(
            notary.step4(&vec![0u8; CIPHERTEXT_LEN]),
            Err(PointAdditionError::OutOfOrder)
        ));
    }

    #[test]
    fn test_step1_rejects_bad_point() {
        let mut notary = Paillier2Pc::new();
        assert!(notary.step1(&[0u8; 65]).is_err());
        assert!(notary.step1(&[0u8; 10]).is_err());
    }
}
