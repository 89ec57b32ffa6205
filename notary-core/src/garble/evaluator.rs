use aes::Aes128;

use super::{gate_cipher, EncryptedGate, GarbleError};
use crate::block::Block;
use crate::circuit::{Circuit, Gate};

/// Evaluates a garbled AND gate.
#[inline]
pub(crate) fn and_gate(
    cipher: &Aes128,
    x: &Block,
    y: &Block,
    encrypted_gate: &[Block; 2],
    gid: usize,
) -> Block {
    let s_a = x.lsb();
    let s_b = y.lsb();

    let j = gid;
    let k = gid + 1;

    let hx = x.hash_tweak(cipher, j);
    let hy = y.hash_tweak(cipher, k);

    let w_g = hx ^ (encrypted_gate[0] & Block::SELECT_MASK[s_a]);
    let w_e = hy ^ (Block::SELECT_MASK[s_b] & (encrypted_gate[1] ^ *x));

    w_g ^ w_e
}

/// Evaluates a garbled circuit: takes one active label per input wire and
/// the circuit's encrypted gates, returns the active output labels. No
/// decoding table is needed at this stage.
pub fn evaluate(
    circ: &Circuit,
    input_labels: &[Block],
    encrypted_gates: &[EncryptedGate],
) -> Result<Vec<Block>, GarbleError> {
    if input_labels.len() != circ.ninput_wires {
        return Err(GarbleError::InputCountMismatch(
            circ.ninput_wires,
            input_labels.len(),
        ));
    }
    if encrypted_gates.len() != circ.nand {
        return Err(GarbleError::GateCountMismatch(
            encrypted_gates.len(),
            circ.nand,
        ));
    }

    let cipher = gate_cipher();
    let mut labels: Vec<Option<Block>> = vec![None; circ.nwires];
    for (slot, label) in labels.iter_mut().zip(input_labels) {
        *slot = Some(*label);
    }

    let mut tid = 0;
    let mut gid = 1;
    for gate in circ.gates.iter() {
        match *gate {
            Gate::Inv { xref, zref } => {
                let x = labels[xref].ok_or(GarbleError::UninitializedLabel(xref))?;
                // logical NOT lives in the label pair ordering
                labels[zref] = Some(x);
            }
            Gate::Xor { xref, yref, zref } => {
                let x = labels[xref].ok_or(GarbleError::UninitializedLabel(xref))?;
                let y = labels[yref].ok_or(GarbleError::UninitializedLabel(yref))?;
                labels[zref] = Some(x ^ y);
            }
            Gate::And { xref, yref, zref } => {
                let x = labels[xref].ok_or(GarbleError::UninitializedLabel(xref))?;
                let y = labels[yref].ok_or(GarbleError::UninitializedLabel(yref))?;
                let z = and_gate(&cipher, &x, &y, encrypted_gates[tid].inner(), gid);
                labels[zref] = Some(z);
                tid += 1;
                gid += 2;
            }
        }
    }

    labels[circ.nwires - circ.noutput_wires..]
        .iter()
        .map(|l| l.ok_or(GarbleError::UninitializedLabel(0)))
        .collect()
}
