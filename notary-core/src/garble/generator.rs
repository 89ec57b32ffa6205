use aes::Aes128;
use rand::{CryptoRng, Rng};

use super::{gate_cipher, Delta, EncryptedGate, GarbleError, GarbledCircuit};
use crate::block::Block;
use crate::circuit::{Circuit, Gate};

/// Computes a garbled AND gate with the half-gates construction.
#[inline]
pub(crate) fn and_gate(
    c: &Aes128,
    x: &[Block; 2],
    y: &[Block; 2],
    delta: &Block,
    gid: usize,
) -> ([Block; 2], [Block; 2]) {
    let p_a = x[0].lsb();
    let p_b = y[0].lsb();
    let j = gid;
    let k = gid + 1;

    let hx_0 = x[0].hash_tweak(c, j);
    let hy_0 = y[0].hash_tweak(c, k);

    // Garbled row of the generator half-gate
    let t_g = hx_0 ^ x[1].hash_tweak(c, j) ^ (Block::SELECT_MASK[p_b] & *delta);
    let w_g = hx_0 ^ (Block::SELECT_MASK[p_a] & t_g);

    // Garbled row of the evaluator half-gate
    let t_e = hy_0 ^ y[1].hash_tweak(c, k) ^ x[0];
    let w_e = hy_0 ^ (Block::SELECT_MASK[p_b] & (t_e ^ x[0]));

    let z_0 = w_g ^ w_e;
    let z = [z_0, z_0 ^ *delta];

    (z, [t_g, t_e])
}

/// Computes a garbled XOR gate (Free-XOR).
#[inline]
pub(crate) fn xor_gate(x: &[Block; 2], y: &[Block; 2], delta: &Block) -> [Block; 2] {
    let z_0 = x[0] ^ y[0];
    [z_0, z_0 ^ *delta]
}

/// Computes a garbled INV gate by swapping the label pair; the evaluator
/// passes the active label through unchanged.
#[inline]
pub(crate) fn inv_gate(x: &[Block; 2]) -> [Block; 2] {
    [x[1], x[0]]
}

/// Garbles a circuit with fresh random input labels, returning the input
/// label pairs, the encrypted AND gates and the output decoding bits.
pub fn garble<R: Rng + CryptoRng>(
    rng: &mut R,
    circ: &Circuit,
) -> Result<GarbledCircuit, GarbleError> {
    let cipher = gate_cipher();
    let delta = Delta::random(rng);

    let input_labels: Vec<[Block; 2]> = Block::random_vec(rng, circ.ninput_wires)
        .into_iter()
        .map(|low| [low, low ^ *delta])
        .collect();

    let mut encrypted_gates: Vec<EncryptedGate> = Vec::with_capacity(circ.nand);
    let mut labels: Vec<Option<[Block; 2]>> = vec![None; circ.nwires];
    for (slot, pair) in labels.iter_mut().zip(input_labels.iter()) {
        *slot = Some(*pair);
    }

    let mut gid = 1;
    for gate in circ.gates.iter() {
        match *gate {
            Gate::Inv { xref, zref } => {
                let x = labels[xref].ok_or(GarbleError::UninitializedLabel(xref))?;
                labels[zref] = Some(inv_gate(&x));
            }
            Gate::Xor { xref, yref, zref } => {
                let x = labels[xref].ok_or(GarbleError::UninitializedLabel(xref))?;
                let y = labels[yref].ok_or(GarbleError::UninitializedLabel(yref))?;
                labels[zref] = Some(xor_gate(&x, &y, &delta));
            }
            Gate::And { xref, yref, zref } => {
                let x = labels[xref].ok_or(GarbleError::UninitializedLabel(xref))?;
                let y = labels[yref].ok_or(GarbleError::UninitializedLabel(yref))?;
                let (z, t) = and_gate(&cipher, &x, &y, &delta, gid);
                encrypted_gates.push(EncryptedGate::new(t));
                labels[zref] = Some(z);
                gid += 2;
            }
        }
    }

    let decoding = labels[circ.nwires - circ.noutput_wires..]
        .iter()
        .map(|pair| {
            pair.map(|p| p[0].lsb() == 1)
                .ok_or(GarbleError::UninitializedLabel(0))
        })
        .collect::<Result<Vec<bool>, _>>()?;

    Ok(GarbledCircuit {
        input_labels,
        encrypted_gates,
        decoding,
    })
}
