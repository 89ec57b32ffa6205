//! Half-gates garbling and evaluation.
//!
//! Wire labels are 16-byte blocks; the two labels of a wire differ by a
//! global delta whose LSB is set, so the label's LSB doubles as the
//! permute-and-point color bit. AND gates cost two ciphertexts, XOR gates
//! are free, and INV gates are folded into the labels by swapping the pair.
//!
//! The decoding table of a garbling is the color bit of each output wire's
//! low label; an evaluated output label decodes to
//! `label.lsb() ^ decoding_bit`.

mod evaluator;
mod generator;

pub use evaluator::evaluate;
pub use generator::garble;

use crate::block::Block;
use aes::cipher::{generic_array::GenericArray, KeyInit};
use aes::Aes128;
use rand::{CryptoRng, Rng};
use std::ops::Deref;

/// Fixed key of the tweakable gate-hashing cipher. Both parties garble with
/// the same cipher so that either can evaluate the other's circuit.
const FIXED_KEY: [u8; 16] = [
    0x1b, 0x7e, 0x0a, 0x63, 0x4e, 0x2d, 0x7d, 0x18, 0x5a, 0x92, 0x4f, 0x1c, 0x33, 0xc0, 0xd5,
    0x46,
];

/// Returns the fixed-key cipher used for gate hashing.
pub fn gate_cipher() -> Aes128 {
    Aes128::new(&GenericArray::from(FIXED_KEY))
}

#[derive(Debug, thiserror::Error)]
pub enum GarbleError {
    #[error("encountered uninitialized label on wire {0}")]
    UninitializedLabel(usize),
    #[error("truth table has {0} encrypted gates, circuit needs {1}")]
    GateCountMismatch(usize, usize),
    #[error("expected {0} input labels, got {1}")]
    InputCountMismatch(usize, usize),
}

/// Global binary offset of the Free-XOR technique: W_1 = W_0 ^ delta.
/// The LSB is set so the color bits of a pair always differ.
#[derive(Debug, Clone, Copy)]
pub struct Delta(Block);

impl Delta {
    pub fn random<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        let mut block = Block::random(rng);
        block.set_lsb();
        Self(block)
    }
}

impl Deref for Delta {
    type Target = Block;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The two ciphertexts of a garbled AND gate.
#[derive(Debug, Clone, Copy)]
pub struct EncryptedGate([Block; 2]);

impl EncryptedGate {
    pub(crate) fn new(inner: [Block; 2]) -> Self {
        Self(inner)
    }

    pub fn inner(&self) -> &[Block; 2] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[..16].copy_from_slice(&self.0[0].to_be_bytes());
        out[16..].copy_from_slice(&self.0[1].to_be_bytes());
        out
    }

    pub fn from_bytes(b: &[u8; 32]) -> Self {
        Self([
            Block::from_be_bytes(b[..16].try_into().unwrap()),
            Block::from_be_bytes(b[16..].try_into().unwrap()),
        ])
    }
}

/// Serializes encrypted gates into a truth-table blob, 32 bytes per AND gate.
pub fn gates_to_blob(gates: &[EncryptedGate]) -> Vec<u8> {
    let mut out = Vec::with_capacity(gates.len() * 32);
    for gate in gates {
        out.extend_from_slice(&gate.to_bytes());
    }
    out
}

/// Deserializes a truth-table blob.
pub fn blob_to_gates(blob: &[u8]) -> Result<Vec<EncryptedGate>, GarbleError> {
    if blob.len() % 32 != 0 {
        return Err(GarbleError::GateCountMismatch(blob.len() / 32, 0));
    }
    Ok(blob
        .chunks_exact(32)
        .map(|c| EncryptedGate::from_bytes(c.try_into().unwrap()))
        .collect())
}

/// A complete garbling of one circuit: the input label pairs, the encrypted
/// AND gates and the packed output decoding bits.
#[derive(Debug, Clone)]
pub struct GarbledCircuit {
    pub input_labels: Vec<[Block; 2]>,
    pub encrypted_gates: Vec<EncryptedGate>,
    /// Color bit of the low label of each output wire.
    pub decoding: Vec<bool>,
}

/// Extracts the color bits of evaluated output labels.
pub fn output_colors(labels: &[Block]) -> Vec<bool> {
    labels.iter().map(|l| l.lsb() == 1).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::test_circuits::{parse, NAND, XOR_AND};
    use crate::utils::{bits_to_bytes, xor_bytes};
    use rand::thread_rng;

    #[test]
    fn test_garble_evaluate_matches_plaintext() {
        let mut rng = thread_rng();
        for text in [XOR_AND, NAND] {
            let circ = parse(text);
            let garbled = garble(&mut rng, &circ).unwrap();
            for inputs in [[false, false], [false, true], [true, false], [true, true]] {
                let active: Vec<Block> = garbled
                    .input_labels
                    .iter()
                    .zip(inputs)
                    .map(|(pair, bit)| pair[bit as usize])
                    .collect();
                let out_labels =
                    evaluate(&circ, &active, &garbled.encrypted_gates).unwrap();
                let decoded: Vec<bool> = output_colors(&out_labels)
                    .iter()
                    .zip(&garbled.decoding)
                    .map(|(c, d)| c ^ d)
                    .collect();
                assert_eq!(decoded, circ.evaluate(&inputs).unwrap());
            }
        }
    }

    #[test]
    fn test_dual_execution_outputs_agree() {
        // Both parties garble independently; each evaluates the other's
        // circuit. The packed color bits XORed with the counterparty's
        // decoding table must agree on the plaintext.
        let mut rng = thread_rng();
        let circ = parse(XOR_AND);
        let mine = garble(&mut rng, &circ).unwrap();
        let his = garble(&mut rng, &circ).unwrap();
        let inputs = [true, false];

        let my_active: Vec<Block> = his
            .input_labels
            .iter()
            .zip(inputs)
            .map(|(pair, bit)| pair[bit as usize])
            .collect();
        let his_active: Vec<Block> = mine
            .input_labels
            .iter()
            .zip(inputs)
            .map(|(pair, bit)| pair[bit as usize])
            .collect();

        let my_encoded = bits_to_bytes(&output_colors(
            &evaluate(&circ, &my_active, &his.encrypted_gates).unwrap(),
        ));
        let his_encoded = bits_to_bytes(&output_colors(
            &evaluate(&circ, &his_active, &mine.encrypted_gates).unwrap(),
        ));
        let my_decoding = bits_to_bytes(&mine.decoding);
        let his_decoding = bits_to_bytes(&his.decoding);

        assert_eq!(
            xor_bytes(&my_encoded, &his_decoding),
            xor_bytes(&his_encoded, &my_decoding)
        );
    }

    #[test]
    fn test_tampered_gate_corrupts_output() {
        let mut rng = thread_rng();
        let circ = parse(NAND);
        let garbled = garble(&mut rng, &circ).unwrap();
        let inputs = [true, true];
        let active: Vec<Block> = garbled
            .input_labels
            .iter()
            .zip(inputs)
            .map(|(pair, bit)| pair[bit as usize])
            .collect();

        let mut gates = garbled.encrypted_gates.clone();
        let mut bytes = gates[0].to_bytes();
        bytes[3] ^= 0xff;
        gates[0] = EncryptedGate::from_bytes(&bytes);

        let good = evaluate(&circ, &active, &garbled.encrypted_gates).unwrap();
        let bad = evaluate(&circ, &active, &gates).unwrap();
        assert_ne!(good, bad);
    }
}
