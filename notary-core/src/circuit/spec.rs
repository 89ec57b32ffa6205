//! Static descriptors of the seven protocol circuits.
//!
//! Wire layout convention: the client's input wires come first
//! (`0..client_input_size`), followed by the notary's. For circuit 6 the
//! client's wires 0..159 carry its client_write_key and client_write_iv
//! shares, which is what allows their labels to be bound once in circuit 4
//! and reused across all executions.
//!
//! All sizes are in bits except `masks_sizes`, which lists the byte widths
//! of the random masks the notary feeds the circuit as private inputs.

/// Number of protocol circuits. Indexing is 1-based in the protocol; the
/// descriptor array is 0-based.
pub const CIRCUIT_COUNT: usize = 7;

#[derive(Debug, PartialEq)]
pub struct CircuitSpec {
    /// Protocol circuit number, 1..=7.
    pub id: usize,
    pub file_name: &'static str,
    /// Client input width in bits, per execution.
    pub client_input_size: usize,
    /// Notary input width in bits, per execution.
    pub notary_input_size: usize,
    /// Total output width in bits, per execution.
    pub output_size: usize,
    /// Output field widths in bits, in file order.
    pub outputs_sizes: &'static [usize],
    /// Byte widths of the notary's random masks, in input order.
    pub masks_sizes: &'static [usize],
}

pub const CIRCUIT_SPECS: [CircuitSpec; CIRCUIT_COUNT] = [
    // c1: PRF(PMS) -> MS outer/inner hash states. Notary inputs its PMS
    // share and a 32-byte output mask.
    CircuitSpec {
        id: 1,
        file_name: "c1.out",
        client_input_size: 512,
        notary_input_size: 512,
        output_size: 512,
        outputs_sizes: &[256, 256],
        masks_sizes: &[32],
    },
    // c2: PRF(MS) -> verify_data inner hashes and the MS outer state.
    CircuitSpec {
        id: 2,
        file_name: "c2.out",
        client_input_size: 512,
        notary_input_size: 512,
        output_size: 512,
        outputs_sizes: &[256, 256],
        masks_sizes: &[32],
    },
    // c3: session key expansion. The notary's four masks become its XOR
    // shares of swk/cwk/siv/civ; the client receives its masked shares.
    CircuitSpec {
        id: 3,
        file_name: "c3.out",
        client_input_size: 576,
        notary_input_size: 576,
        output_size: 320,
        outputs_sizes: &[128, 128, 32, 32],
        masks_sizes: &[16, 16, 4, 4],
    },
    // c4: Client-Finished H and GCTR block. Masks become the notary's
    // shares of H^1 and of the GCTR block.
    CircuitSpec {
        id: 4,
        file_name: "c4.out",
        client_input_size: 576,
        notary_input_size: 576,
        output_size: 256,
        outputs_sizes: &[128, 128],
        masks_sizes: &[16, 16],
    },
    // c5: Server-Finished H and GCTR block.
    CircuitSpec {
        id: 5,
        file_name: "c5.out",
        client_input_size: 672,
        notary_input_size: 672,
        output_size: 256,
        outputs_sizes: &[128, 128],
        masks_sizes: &[16, 16],
    },
    // c6: one AES-CTR block of the client's request; executed c6_count
    // times. The client's wires 0..159 are its cwk/civ shares.
    CircuitSpec {
        id: 6,
        file_name: "c6.out",
        client_input_size: 288,
        notary_input_size: 160,
        output_size: 128,
        outputs_sizes: &[128],
        masks_sizes: &[],
    },
    // c7: the GCTR block for the request tag. The mask becomes the
    // notary's share of the GCTR block.
    CircuitSpec {
        id: 7,
        file_name: "c7.out",
        client_input_size: 288,
        notary_input_size: 288,
        output_size: 128,
        outputs_sizes: &[128],
        masks_sizes: &[16],
    },
];

/// Width in bits of the circuit-6 client inputs whose labels are bound in
/// circuit 4 (cwk share + civ share).
pub const C6_KEY_INPUT_BITS: usize = 160;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specs_are_consistent() {
        for (i, spec) in CIRCUIT_SPECS.iter().enumerate() {
            assert_eq!(spec.id, i + 1);
            assert_eq!(spec.output_size, spec.outputs_sizes.iter().sum::<usize>());
            // every mask is part of the notary's input
            let mask_bits: usize = spec.masks_sizes.iter().map(|m| m * 8).sum();
            assert!(mask_bits <= spec.notary_input_size);
        }
        // circuit 5's notary input is 84 bytes: ms outer state, swk, siv
        // and the two masks
        assert_eq!(CIRCUIT_SPECS[4].notary_input_size / 8, 84);
        // circuit 6's client key/iv share occupies the first 160 wires
        assert!(C6_KEY_INPUT_BITS <= CIRCUIT_SPECS[5].client_input_size);
    }
}
