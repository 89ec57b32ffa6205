//! Boolean circuits in Bristol-fashion encoding and the static descriptors
//! of the seven protocol circuits.

mod parse;
mod spec;

pub use spec::{CircuitSpec, C6_KEY_INPUT_BITS, CIRCUIT_COUNT, CIRCUIT_SPECS};

use std::path::Path;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
    #[error("could not parse line: {0}")]
    ParseLine(String),
    #[error("could not parse gate: {0}")]
    ParseGate(String),
    #[error("uninitialized wire {0}")]
    UninitializedWire(usize),
    #[error("invalid input length {0}, circuit expects {1}")]
    InvalidInputLength(usize, usize),
    #[error("circuit {0} does not match its descriptor: {1}")]
    SpecMismatch(usize, String),
}

/// A logic gate. Wire references index the shared wire numbering of the
/// circuit file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gate {
    Xor { xref: usize, yref: usize, zref: usize },
    And { xref: usize, yref: usize, zref: usize },
    Inv { xref: usize, zref: usize },
}

/// A parsed Bristol-fashion circuit.
#[derive(Debug, Clone)]
pub struct Circuit {
    pub ngates: usize,
    pub nwires: usize,
    pub ninput_wires: usize,
    pub noutput_wires: usize,
    pub input_nwires: Vec<usize>,
    pub output_nwires: Vec<usize>,
    pub nand: usize,
    pub nxor: usize,
    pub gates: Vec<Gate>,
}

impl Circuit {
    /// Evaluates the circuit in plaintext. Input bits follow the wire
    /// numbering; the returned bits are the values of the output wires.
    pub fn evaluate(&self, inputs: &[bool]) -> Result<Vec<bool>, CircuitError> {
        if inputs.len() != self.ninput_wires {
            return Err(CircuitError::InvalidInputLength(
                inputs.len(),
                self.ninput_wires,
            ));
        }
        let mut wires: Vec<Option<bool>> = vec![None; self.nwires];
        for (wire, input) in wires.iter_mut().zip(inputs) {
            *wire = Some(*input);
        }
        for gate in self.gates.iter() {
            match *gate {
                Gate::Xor { xref, yref, zref } => {
                    let x = wires[xref].ok_or(CircuitError::UninitializedWire(xref))?;
                    let y = wires[yref].ok_or(CircuitError::UninitializedWire(yref))?;
                    wires[zref] = Some(x ^ y);
                }
                Gate::And { xref, yref, zref } => {
                    let x = wires[xref].ok_or(CircuitError::UninitializedWire(xref))?;
                    let y = wires[yref].ok_or(CircuitError::UninitializedWire(yref))?;
                    wires[zref] = Some(x & y);
                }
                Gate::Inv { xref, zref } => {
                    let x = wires[xref].ok_or(CircuitError::UninitializedWire(xref))?;
                    wires[zref] = Some(!x);
                }
            }
        }
        wires[self.nwires - self.noutput_wires..]
            .iter()
            .map(|w| w.ok_or(CircuitError::UninitializedWire(0)))
            .collect()
    }
}

/// A protocol circuit: the parsed gates together with its static descriptor.
#[derive(Debug)]
pub struct CircuitMeta {
    pub spec: &'static CircuitSpec,
    pub circuit: Circuit,
}

impl CircuitMeta {
    /// Number of AND gates, which determines the truth-table blob size.
    pub fn and_count(&self) -> usize {
        self.circuit.nand
    }

    /// Size in bytes of one execution's truth-table blob: two 16-byte
    /// ciphertexts per AND gate.
    pub fn tt_size(&self) -> usize {
        self.circuit.nand * 32
    }

    /// Size in bytes of one execution's packed output color bits.
    pub fn output_bytes(&self) -> usize {
        (self.spec.output_size + 7) / 8
    }

    /// Loads and validates the seven protocol circuits from `dir`, where
    /// they are stored as `c1.out`..`c7.out`.
    pub fn load_all(dir: &Path) -> Result<Vec<Arc<CircuitMeta>>, CircuitError> {
        let mut out = Vec::with_capacity(CIRCUIT_SPECS.len());
        for spec in CIRCUIT_SPECS.iter() {
            let circuit = Circuit::load(&dir.join(spec.file_name))?;
            if circuit.ninput_wires != spec.client_input_size + spec.notary_input_size {
                return Err(CircuitError::SpecMismatch(
                    spec.id,
                    format!(
                        "input wires {} != client {} + notary {}",
                        circuit.ninput_wires, spec.client_input_size, spec.notary_input_size
                    ),
                ));
            }
            if circuit.noutput_wires != spec.output_size {
                return Err(CircuitError::SpecMismatch(
                    spec.id,
                    format!(
                        "output wires {} != {}",
                        circuit.noutput_wires, spec.output_size
                    ),
                ));
            }
            out.push(Arc::new(CircuitMeta { spec, circuit }));
        }
        Ok(out)
    }
}


#[cfg(test)]
mod tests {
    use super::test_circuits::*;

    #[test]
    fn test_evaluate_xor_and() {
        let circ = parse(XOR_AND);
        assert_eq!(circ.nand, 1);
        assert_eq!(circ.nxor, 1);
        for (a, b) in [(false, false), (false, true), (true, false), (true, true)] {
            let out = circ.evaluate(&[a, b]).unwrap();
            assert_eq!(out, vec![a ^ b, a & b]);
        }
    }

    #[test]
    fn test_evaluate_nand() {
        let circ = parse(NAND);
        for (a, b) in [(false, false), (false, true), (true, false), (true, true)] {
            let out = circ.evaluate(&[a, b]).unwrap();
            assert_eq!(out, vec![!(a & b)]);
        }
    }
}
