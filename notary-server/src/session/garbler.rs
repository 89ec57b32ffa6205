//! The notary's half of each circuit within a session: the pre-garbled
//! blobs drawn from the pool, the notary's private input bits and the
//! random masks that become its key/H/GCTR shares.

use crate::pool::PoolBlob;
use notary_core::circuit::{CircuitMeta, C6_KEY_INPUT_BITS};
use notary_core::utils::bytes_to_bits;
use rand::{CryptoRng, Rng};
use std::path::PathBuf;
use std::sync::Arc;

struct CircuitState {
    meta: Arc<CircuitMeta>,
    /// One garbling per execution (circuit 6 runs `c6_count` times).
    blobs: Vec<PoolBlob>,
    /// The notary's input bits, concatenated across executions.
    input_bits: Vec<bool>,
    /// Random masks, generated once per session.
    masks: Vec<Vec<u8>>,
}

pub struct Garbler {
    circuits: Vec<CircuitState>,
    c6_count: usize,
}

impl Garbler {
    /// Builds the session garbler from the pool draw. `blobs` is indexed by
    /// circuit number minus one, holding `c6_count` entries for circuit 6
    /// and one entry otherwise.
    pub fn new<R: Rng + CryptoRng>(
        metas: &[Arc<CircuitMeta>],
        blobs: Vec<Vec<PoolBlob>>,
        c6_count: usize,
        rng: &mut R,
    ) -> Self {
        let circuits = metas
            .iter()
            .zip(blobs)
            .map(|(meta, blobs)| {
                let masks = meta
                    .spec
                    .masks_sizes
                    .iter()
                    .map(|size| {
                        let mut mask = vec![0u8; *size];
                        rng.fill(mask.as_mut_slice());
                        mask
                    })
                    .collect();
                CircuitState {
                    meta: meta.clone(),
                    blobs,
                    input_bits: Vec::new(),
                    masks,
                }
            })
            .collect();
        Self { circuits, c6_count }
    }

    fn state(&self, c: usize) -> &CircuitState {
        &self.circuits[c - 1]
    }

    pub fn meta(&self, c: usize) -> &Arc<CircuitMeta> {
        &self.state(c).meta
    }

    pub fn c6_count(&self) -> usize {
        self.c6_count
    }

    /// How many times circuit `c` executes in this session.
    pub fn executions(&self, c: usize) -> usize {
        if self.state(c).meta.spec.id == 6 {
            self.c6_count
        } else {
            1
        }
    }

    /// The notary's random mask number `k` (1-based) for circuit `c`.
    pub fn mask(&self, c: usize, k: usize) -> Vec<u8> {
        self.state(c).masks[k - 1].clone()
    }

    /// Appends the little-bit-endian decomposition of each input value to
    /// the circuit's input bits, in order.
    pub fn set_inputs(&mut self, c: usize, inputs: &[&[u8]]) {
        let state = &mut self.circuits[c - 1];
        for input in inputs {
            state.input_bits.extend(bytes_to_bits(input));
        }
    }

    pub fn input_bits(&self, c: usize) -> &[bool] {
        &self.state(c).input_bits
    }

    /// Active labels of the notary's own garbling for the notary's input
    /// bits, concatenated across executions. These go to the client in the
    /// clear, since the client evaluates the notary's circuit.
    pub fn notary_labels(&self, c: usize) -> Vec<u8> {
        let state = self.state(c);
        let spec = state.meta.spec;
        let mut out =
            Vec::with_capacity(state.blobs.len() * spec.notary_input_size * 16);
        for (j, blob) in state.blobs.iter().enumerate() {
            let bits =
                &state.input_bits[j * spec.notary_input_size..(j + 1) * spec.notary_input_size];
            for (i, bit) in bits.iter().enumerate() {
                let pair = &blob.input_labels[spec.client_input_size + i];
                out.extend_from_slice(&pair[*bit as usize].to_be_bytes());
            }
        }
        out
    }

    /// Both labels for every client input wire, concatenated across
    /// executions. This is the OT sender payload: the client's choice bits
    /// select its active labels without the notary learning them.
    pub fn client_labels(&self, c: usize) -> Vec<u8> {
        let state = self.state(c);
        let spec = state.meta.spec;
        let mut out =
            Vec::with_capacity(state.blobs.len() * spec.client_input_size * 32);
        for blob in state.blobs.iter() {
            for pair in blob.input_labels[..spec.client_input_size].iter() {
                out.extend_from_slice(&pair[0].to_be_bytes());
                out.extend_from_slice(&pair[1].to_be_bytes());
            }
        }
        out
    }

    /// Both labels for the key/IV input wires (bits 0..160) of every
    /// execution of circuit 6. These are delivered with circuit 4's OT so
    /// that the client's AES key share is bound across all blocks.
    pub fn c6_key_labels(&self) -> Vec<u8> {
        let state = self.state(6);
        let mut out = Vec::with_capacity(state.blobs.len() * C6_KEY_INPUT_BITS * 32);
        for blob in state.blobs.iter() {
            for pair in blob.input_labels[..C6_KEY_INPUT_BITS].iter() {
                out.extend_from_slice(&pair[0].to_be_bytes());
                out.extend_from_slice(&pair[1].to_be_bytes());
            }
        }
        out
    }

    /// Circuit 6's client labels with the key/IV positions left out: the
    /// client already holds those active labels from circuit 4's OT.
    pub fn c6_client_labels_without_keys(&self) -> Vec<u8> {
        let state = self.state(6);
        let spec = state.meta.spec;
        let mut out = Vec::with_capacity(
            state.blobs.len() * (spec.client_input_size - C6_KEY_INPUT_BITS) * 32,
        );
        for blob in state.blobs.iter() {
            for pair in blob.input_labels[C6_KEY_INPUT_BITS..spec.client_input_size].iter() {
                out.extend_from_slice(&pair[0].to_be_bytes());
                out.extend_from_slice(&pair[1].to_be_bytes());
            }
        }
        out
    }

    /// The packed decoding tables of all executions of circuit `c`.
    pub fn decoding_tables(&self, c: usize) -> Vec<u8> {
        let state = self.state(c);
        let mut out = Vec::new();
        for blob in state.blobs.iter() {
            out.extend_from_slice(&blob.decoding);
        }
        out
    }

    /// Truth-table files of every garbling, in circuit order, for getBlob.
    pub fn tt_paths(&self) -> Vec<PathBuf> {
        self.circuits
            .iter()
            .flat_map(|state| state.blobs.iter().map(|b| b.tt_path.clone()))
            .collect()
    }

    /// Offset and size of circuit `c`'s truth tables inside the client's
    /// uploaded blob, which concatenates the circuits in order.
    pub fn blob_offset(&self, c: usize) -> (usize, usize) {
        let mut offset = 0;
        let mut size = 0;
        for i in 1..=self.circuits.len() {
            offset += size;
            size = self.state(i).meta.tt_size() * self.executions(i);
            if i == c {
                break;
            }
        }
        (offset, size)
    }
}
