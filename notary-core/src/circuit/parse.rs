//! Parser for circuit files in Bristol-fashion format as specified at
//! `https://homes.esat.kuleuven.be/~nsmart/MPC/`.

use super::{Circuit, CircuitError, Gate};
use regex::Regex;
use std::{
    fs::File,
    io::{BufRead, BufReader, Read},
    path::Path,
};

/// Collects the regex captures of one header line.
fn line2vec<'a>(re: &Regex, line: &'a str) -> Vec<&'a str> {
    re.captures_iter(line)
        .map(|cap| cap.get(1).unwrap().as_str())
        .collect()
}

impl Circuit {
    /// Parses a circuit from a file on disk.
    pub fn load(path: &Path) -> Result<Self, CircuitError> {
        let f = File::open(path)?;
        Self::from_reader(BufReader::new(f))
    }

    /// Parses a circuit from any reader.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, CircuitError> {
        let mut reader = BufReader::new(reader);

        // First line: ngates nwires
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let re = Regex::new(r"(\d+)\s*")?;
        let line_1 = line2vec(&re, &line);
        if line_1.len() != 2 {
            return Err(CircuitError::ParseLine(line));
        }
        let ngates: usize = line_1[0].parse().map_err(|_| CircuitError::ParseLine(line.clone()))?;
        let nwires: usize = line_1[1].parse().map_err(|_| CircuitError::ParseLine(line.clone()))?;

        // Second line: ninputs input_0_nwires input_1_nwires...
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line_2 = line2vec(&re, &line);
        if line_2.is_empty() {
            return Err(CircuitError::ParseLine(line));
        }
        let ninputs: usize = line_2[0].parse().map_err(|_| CircuitError::ParseLine(line.clone()))?;
        let input_nwires: Vec<usize> = line_2[1..]
            .iter()
            .map(|n| n.parse().map_err(|_| CircuitError::ParseLine(line.clone())))
            .collect::<Result<_, _>>()?;
        if input_nwires.len() != ninputs {
            return Err(CircuitError::ParseLine(line));
        }
        let ninput_wires: usize = input_nwires.iter().sum();

        // Third line: noutputs output_0_nwires output_1_nwires...
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line_3 = line2vec(&re, &line);
        if line_3.is_empty() {
            return Err(CircuitError::ParseLine(line));
        }
        let noutputs: usize = line_3[0].parse().map_err(|_| CircuitError::ParseLine(line.clone()))?;
        let output_nwires: Vec<usize> = line_3[1..]
            .iter()
            .map(|n| n.parse().map_err(|_| CircuitError::ParseLine(line.clone())))
            .collect::<Result<_, _>>()?;
        if output_nwires.len() != noutputs {
            return Err(CircuitError::ParseLine(line));
        }
        let noutput_wires: usize = output_nwires.iter().sum();

        let mut circ = Circuit {
            ngates,
            nwires,
            ninput_wires,
            noutput_wires,
            input_nwires,
            output_nwires,
            nand: 0,
            nxor: 0,
            gates: Vec::with_capacity(ngates),
        };

        let re = Regex::new(r"(\d+|\S+)\s*")?;
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let gate_vals = line2vec(&re, &line);
            let typ = *gate_vals.last().ok_or_else(|| CircuitError::ParseGate(line.clone()))?;
            let gate = match typ {
                "INV" => {
                    let xref: usize = parse_ref(gate_vals[2], &line)?;
                    let zref: usize = parse_ref(gate_vals[3], &line)?;
                    Gate::Inv { xref, zref }
                }
                "AND" => {
                    let xref: usize = parse_ref(gate_vals[2], &line)?;
                    let yref: usize = parse_ref(gate_vals[3], &line)?;
                    let zref: usize = parse_ref(gate_vals[4], &line)?;
                    circ.nand += 1;
                    Gate::And { xref, yref, zref }
                }
                "XOR" => {
                    let xref: usize = parse_ref(gate_vals[2], &line)?;
                    let yref: usize = parse_ref(gate_vals[3], &line)?;
                    let zref: usize = parse_ref(gate_vals[4], &line)?;
                    circ.nxor += 1;
                    Gate::Xor { xref, yref, zref }
                }
                _ => return Err(CircuitError::ParseGate(line)),
            };
            circ.gates.push(gate);
        }
        if circ.gates.len() != ngates {
            return Err(CircuitError::ParseGate(format!(
                "expecting {} gates, parsed {}",
                ngates,
                circ.gates.len()
            )));
        }
        Ok(circ)
    }
}

fn parse_ref(s: &str, line: &str) -> Result<usize, CircuitError> {
    s.parse().map_err(|_| CircuitError::ParseGate(line.to_string()))
}

#[cfg(test)]
mod tests {
    use super::super::Circuit;
    use std::io::Cursor;

    #[test]
    fn test_parse_header_and_gates() {
        let text = "3 6\n2 2 2\n1 2\n2 1 0 2 4 XOR\n2 1 1 3 5 AND\n1 1 4 4 INV\n";
        let circ = Circuit::from_reader(Cursor::new(text)).unwrap();
        assert_eq!(circ.ngates, 3);
        assert_eq!(circ.nwires, 6);
        assert_eq!(circ.ninput_wires, 4);
        assert_eq!(circ.noutput_wires, 2);
        assert_eq!(circ.nand, 1);
        assert_eq!(circ.nxor, 1);
    }

    #[test]
    fn test_parse_rejects_gate_count_mismatch() {
        let text = "2 4\n2 1 1\n1 1\n2 1 0 1 2 AND\n";
        assert!(Circuit::from_reader(Cursor::new(text)).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_gate() {
        let text = "1 3\n2 1 1\n1 1\n2 1 0 1 2 NOR\n";
        assert!(Circuit::from_reader(Cursor::new(text)).is_err());
    }
}
