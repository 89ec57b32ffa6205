use aes::cipher::{generic_array::GenericArray, BlockEncrypt};
use aes::Aes128;
use core::ops::{BitAnd, BitXor};
use rand::{CryptoRng, Rng};

/// A 16-byte block, the unit of wire labels and GF(2^128) elements.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Block(u128);

impl Block {
    pub const LEN: usize = 16;
    pub const ZERO: Self = Self(0);
    pub const ONES: Self = Self(u128::MAX);
    /// Used to select between two blocks based on a wire's permute bit.
    pub const SELECT_MASK: [Self; 2] = [Self::ZERO, Self::ONES];

    #[inline]
    pub fn new(b: u128) -> Self {
        Self(b)
    }

    #[inline]
    pub fn inner(&self) -> u128 {
        self.0
    }

    #[inline]
    pub fn random<R: Rng + CryptoRng + ?Sized>(rng: &mut R) -> Self {
        Self(rng.gen())
    }

    #[inline]
    pub fn random_vec<R: Rng + CryptoRng + ?Sized>(rng: &mut R, n: usize) -> Vec<Self> {
        let mut blocks = vec![0u128; n];
        rng.fill(blocks.as_mut_slice());
        blocks.into_iter().map(Self::new).collect()
    }

    /// Tweakable correlation-robust hash from a fixed-key cipher, following
    /// GKWY20 section 7.4: instead of Hash(x, i) compute
    /// C(C(x) xor i) xor C(x).
    pub fn hash_tweak(&self, c: &Aes128, tweak: usize) -> Self {
        let gid: [u8; 16] = (tweak as u128).to_be_bytes();

        let mut h1 = GenericArray::from(self.to_be_bytes());
        c.encrypt_block(&mut h1);

        let mut h2 = GenericArray::from(h1);
        h2.iter_mut().zip(gid).for_each(|(a, b)| *a ^= b);
        c.encrypt_block(&mut h2);

        h2.iter_mut().zip(h1).for_each(|(a, b)| *a ^= b);
        let b: [u8; 16] = h2.into();
        Self(u128::from_be_bytes(b))
    }

    #[inline]
    pub fn set_lsb(&mut self) {
        self.0 |= 1;
    }

    /// Returns the permute-and-point bit of the label.
    #[inline]
    pub fn lsb(&self) -> usize {
        (self.0 & 1) as usize
    }

    #[inline]
    pub fn to_be_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    #[inline]
    pub fn from_be_bytes(b: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(b))
    }
}

impl From<[u8; 16]> for Block {
    fn from(b: [u8; 16]) -> Self {
        Self::from_be_bytes(b)
    }
}

impl From<Block> for [u8; 16] {
    fn from(b: Block) -> Self {
        b.to_be_bytes()
    }
}

impl BitXor for Block {
    type Output = Self;

    #[inline]
    fn bitxor(self, other: Self) -> Self {
        Self(self.0 ^ other.0)
    }
}

impl BitAnd for Block {
    type Output = Self;

    #[inline]
    fn bitand(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }
}
