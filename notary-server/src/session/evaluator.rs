//! Evaluation of the client's garbled circuits.
//!
//! The notary is the evaluator of the dual execution's reciprocal
//! direction: the client's truth tables were uploaded via setBlob, the
//! client's active labels arrive in the clear and the notary's own active
//! labels arrive through OT. The result is the packed color-bit encoding
//! of the output, one byte-padded bit string per execution.

use super::SessionError;
use notary_core::block::Block;
use notary_core::circuit::CircuitMeta;
use notary_core::garble::{blob_to_gates, evaluate, output_colors};
use notary_core::utils::bits_to_bytes;

pub fn evaluate_circuit(
    meta: &CircuitMeta,
    executions: usize,
    notary_labels: &[u8],
    client_labels: &[u8],
    tt_blob: &[u8],
) -> Result<Vec<u8>, SessionError> {
    let spec = meta.spec;
    let client_chunk = spec.client_input_size * 16;
    let notary_chunk = spec.notary_input_size * 16;
    let tt_chunk = meta.tt_size();

    if notary_labels.len() != notary_chunk * executions
        || client_labels.len() != client_chunk * executions
        || tt_blob.len() != tt_chunk * executions
    {
        return Err(SessionError::BadLength);
    }

    let mut out = Vec::with_capacity(meta.output_bytes() * executions);
    for j in 0..executions {
        let mut inputs: Vec<Block> = Vec::with_capacity(meta.circuit.ninput_wires);
        for chunk in client_labels[j * client_chunk..(j + 1) * client_chunk].chunks_exact(16) {
            inputs.push(Block::from_be_bytes(chunk.try_into().unwrap()));
        }
        for chunk in notary_labels[j * notary_chunk..(j + 1) * notary_chunk].chunks_exact(16) {
            inputs.push(Block::from_be_bytes(chunk.try_into().unwrap()));
        }
        let gates = blob_to_gates(&tt_blob[j * tt_chunk..(j + 1) * tt_chunk])?;
        let output_labels = evaluate(&meta.circuit, &inputs, &gates)?;
        out.extend(bits_to_bytes(&output_colors(&output_labels)));
    }
    Ok(out)
}
