//! The notary's side of the 2PC GHASH computation.
//!
//! Both parties hold additive shares of the powers of H (the GHASH key);
//! the GHASH output itself is never materialized by either party alone. The
//! notary acts as the OT sender throughout: shares of new odd powers are
//! produced by sending masked x-tables of existing power shares, even powers
//! come from free squaring, and any block whose power share is still missing
//! is covered by block aggregation.
//!
//! To obtain a share of H^3 from shares of H^1 and H^2, expand
//! (H1_n + H1_c)(H2_n + H2_c) into four cross-terms: the notary computes
//! H1_n*H2_n locally, the client computes H1_c*H2_c locally, and the two
//! cross products are computed obliviously with the client's share bits
//! selecting from the notary's masked x-tables. The same expansion drives
//! every higher odd power via the round strategies below.

use crate::gf2_128::{
    block_aggregation, block_aggregation_mxtables, block_mult, find_max_odd_power, free_square,
    masked_xtable, multiply_powers_and_blocks, square_all, MXTableFull,
};
use rand::{CryptoRng, Rng};
use std::collections::BTreeMap;

/// AAD block of a TLS 1.2 Finished record:
/// seq 0, type 22 (handshake), version 3.3, length 16.
pub const FINISHED_AAD: u128 = u128::from_be_bytes([0, 0, 0, 0, 0, 0, 0, 0, 22, 3, 3, 0, 16, 0, 0, 0]);

/// GHASH length block of a Finished record: len(AAD) = 104 bits,
/// len(ciphertext) = 128 bits.
pub const FINISHED_LEN_BLOCK: u128 =
    u128::from_be_bytes([0, 0, 0, 0, 0, 0, 0, 104, 0, 0, 0, 0, 0, 0, 0, 128]);

#[derive(Debug, thiserror::Error)]
pub enum GhashError {
    #[error("maximum GHASH power {0} exceeds the 16 KiB record bound")]
    MaxPowerOutOfRange(usize),
    #[error("GHASH step received out of order")]
    OutOfOrder,
    #[error("block count {0} does not match the expected power count {1}")]
    BlockCountMismatch(usize, usize),
}

/// The result of the Finished-message MAC round: the notary's share of the
/// tag, the OT payload carrying the masked x-tables for both cross products
/// (H^2 table first, then H^1, matching the client's ascending bit order),
/// and the notary's resulting shares of H^1..H^3.
pub struct FinishedMac {
    pub tag_share: u128,
    pub ot_payload: Vec<MXTableFull>,
    pub h1: u128,
    pub h2: u128,
    pub h3: u128,
}

/// Computes the notary's share of the MAC for a Client/Server-Finished
/// record. `h1_share` is the notary's share of H (a circuit mask),
/// `gctr_share` its share of the GCTR block, `enc_finished` the encrypted
/// Finished message block.
pub fn finished_mac<R: Rng + CryptoRng>(
    rng: &mut R,
    h1_share: u128,
    gctr_share: u128,
    enc_finished: u128,
) -> FinishedMac {
    let h2 = free_square(h1_share);
    let h1h2 = block_mult(h1_share, h2);

    let (table1, mask_sum1) = masked_xtable(rng, h1_share);
    let (table2, mask_sum2) = masked_xtable(rng, h2);

    // The client's H^1 bits select from our H^2 table and vice versa.
    let h3 = mask_sum1 ^ mask_sum2 ^ h1h2;

    // X[0] is multiplied by H^3, X[1] by H^2, X[2] by H^1
    let s1 = block_mult(FINISHED_AAD, h3);
    let s2 = block_mult(enc_finished, h2);
    let s3 = block_mult(FINISHED_LEN_BLOCK, h1_share);
    let tag_share = s1 ^ s2 ^ s3 ^ gctr_share;

    FinishedMac {
        tag_share,
        ot_payload: vec![table2, table1],
        h1: h1_share,
        h2,
        h3,
    }
}

/// The notary's GHASH power-share engine for the client's request tag.
pub struct GhashCore {
    /// Shares of the powers of H; key 1 holds the share of H^1.
    powers: BTreeMap<u16, u128>,
    max_power_needed: usize,
    max_odd_power: u8,
    /// Which existing power shares are multiplied pairwise to obtain each
    /// new odd power share, per OT round.
    strategies: [BTreeMap<u8, [u8; 2]>; 2],
}

impl Default for GhashCore {
    fn default() -> Self {
        Self::new()
    }
}

impl GhashCore {
    pub fn new() -> Self {
        // The maximum sequential odd share obtainable in the first round is
        // 19, given shares of H^1..H^3 from the Finished message and their
        // squares. "Sequential" matters: without 21, having 25 or 33 leaves
        // a gap that block aggregation cannot bridge.
        let strategy1: BTreeMap<u8, [u8; 2]> = BTreeMap::from([
            (5, [4, 1]),
            (7, [4, 3]),
            (9, [8, 1]),
            (11, [8, 3]),
            (13, [12, 1]),
            (15, [12, 3]),
            (17, [16, 1]),
            (19, [16, 3]),
        ]);
        let strategy2: BTreeMap<u8, [u8; 2]> = BTreeMap::from([
            (21, [17, 4]),
            (23, [17, 6]),
            (25, [17, 8]),
            (27, [19, 8]),
            (29, [17, 12]),
            (31, [19, 12]),
            (33, [17, 16]),
            (35, [19, 16]),
        ]);
        Self {
            powers: BTreeMap::new(),
            max_power_needed: 0,
            max_odd_power: 0,
            strategies: [strategy1, strategy2],
        }
    }

    /// Stores the shares of H^1..H^3 obtained during the Client-Finished
    /// round. Higher powers are derived once the request length is known.
    pub fn absorb_finished_shares(&mut self, h1: u128, h2: u128, h3: u128) {
        self.powers.insert(1, h1);
        self.powers.insert(2, h2);
        self.powers.insert(3, h3);
    }

    /// Sets the number of GHASH blocks of the client's request
    /// (AAD + ciphertext + length block).
    pub fn set_max_power_needed(&mut self, n: usize) -> Result<(), GhashError> {
        // at least AAD + one ciphertext block + the length block
        if n < 3 || n > 1026 {
            return Err(GhashError::MaxPowerOutOfRange(n));
        }
        self.max_power_needed = n;
        self.max_odd_power = find_max_odd_power(n as u16);
        Ok(())
    }

    pub fn max_power_needed(&self) -> usize {
        self.max_power_needed
    }

    pub fn max_odd_power_needed(&self) -> u8 {
        self.max_odd_power
    }

    /// First OT round: derives shares of the odd powers 5..=19 (as far as
    /// needed) from pairwise products of existing shares. Returns the masked
    /// x-tables to send through OT; empty when the powers from the Finished
    /// message already suffice, in which case free squaring completes the
    /// table.
    pub fn step1<R: Rng + CryptoRng>(&mut self, rng: &mut R) -> Vec<MXTableFull> {
        if self.max_odd_power == 3 {
            self.powers = square_all(&self.powers, self.max_power_needed as u16);
            return Vec::new();
        }
        self.round_mxtables(rng, 0)
    }

    /// Second OT round, only needed when the request is long enough to
    /// require odd powers beyond 19.
    pub fn step2<R: Rng + CryptoRng>(&mut self, rng: &mut R) -> Vec<MXTableFull> {
        self.round_mxtables(rng, 1)
    }

    /// Final stage: multiplies the input blocks with the power shares and
    /// covers blocks with missing power shares by block aggregation.
    /// Returns the notary's share of the GHASH output, the masked x-tables
    /// for the aggregated products (empty when aggregation is unnecessary)
    /// and the number of aggregated multiplications.
    pub fn step3<R: Rng + CryptoRng>(
        &mut self,
        rng: &mut R,
        blocks: &[u128],
    ) -> Result<(u128, Vec<MXTableFull>, usize), GhashError> {
        if blocks.len() != self.max_power_needed {
            return Err(GhashError::BlockCountMismatch(
                blocks.len(),
                self.max_power_needed,
            ));
        }
        let share1 = multiply_powers_and_blocks(&self.powers, blocks);
        let (aggregated, share2) = block_aggregation(&self.powers, blocks);
        let (mxtables, share3) = block_aggregation_mxtables(rng, &self.powers, &aggregated);
        let mult_count = mxtables.len();
        Ok((share1 ^ share2 ^ share3, mxtables, mult_count))
    }

    /// Produces the masked x-tables of one odd-power round and inserts the
    /// notary's resulting shares, then squares everything up to the target.
    fn round_mxtables<R: Rng + CryptoRng>(
        &mut self,
        rng: &mut R,
        round: usize,
    ) -> Vec<MXTableFull> {
        let mut all_mxtables: Vec<MXTableFull> = Vec::new();
        for (key, value) in self.strategies[round].clone().iter() {
            if *key > self.max_odd_power {
                break;
            }
            // The client sends bits in ascending order (factor1 bits, then
            // factor2 bits), so the tables go out in descending order.
            let factor1 = self.powers[&(value[0] as u16)];
            let factor2 = self.powers[&(value[1] as u16)];
            let (mxtable1, sum1) = masked_xtable(rng, factor1);
            let (mxtable2, sum2) = masked_xtable(rng, factor2);
            all_mxtables.push(mxtable2);
            all_mxtables.push(mxtable1);

            // our share of power <key> is the local term plus the mask sums
            // of both cross-terms
            let local_term = block_mult(factor1, factor2);
            self.powers.insert(*key as u16, local_term ^ sum1 ^ sum2);
        }
        self.powers = square_all(&self.powers, self.max_power_needed as u16);
        all_mxtables
    }

    #[cfg(test)]
    pub(crate) fn powers(&self) -> &BTreeMap<u16, u128> {
        &self.powers
    }
}

/// Flattens masked x-tables into the OT response payload: for each of the
/// 128 entries of each table, the two 16-byte messages back to back.
pub fn mxtables_to_ot_payload(tables: &[MXTableFull]) -> Vec<u8> {
    let mut out = Vec::with_capacity(tables.len() * 128 * 32);
    for table in tables {
        for entry in table {
            out.extend_from_slice(&entry[0].to_be_bytes());
            out.extend_from_slice(&entry[1].to_be_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gf2_128::{
        block_aggregation, block_mult, free_square, multiply_powers_and_blocks, square_all,
        MXTableFull,
    };
    use crate::utils::u8vec_to_boolvec;
    use ghash_rc::universal_hash::{KeyInit, UniversalHash};
    use ghash_rc::GHash;
    use rand::{thread_rng, Rng};

    fn rust_crypto_ghash(h: u128, blocks: &[u128]) -> u128 {
        let mut ghash = GHash::new(&h.to_be_bytes().into());
        for block in blocks.iter() {
            ghash.update(&[block.to_be_bytes().into()]);
        }
        u128::from_be_bytes(ghash.finalize().into())
    }

    // The client's side of one masked-xtable multiplication: select one of
    // the two messages per entry with the bits of y (most significant first).
    fn ot_select(table: &MXTableFull, y: u128) -> u128 {
        let bits = u8vec_to_boolvec(&y.to_be_bytes());
        let mut share = 0u128;
        for i in 0..128 {
            share ^= table[i][bits[i] as usize];
        }
        share
    }

    // A reference client for the engine: tracks the client's power shares
    // and answers every OT round.
    struct TestClient {
        powers: std::collections::BTreeMap<u16, u128>,
        max: u16,
    }

    impl TestClient {
        fn consume_round(&mut self, tables: &[MXTableFull], strategy: &[(u8, [u8; 2])]) {
            let mut t = 0;
            for (key, value) in strategy {
                if t >= tables.len() {
                    break;
                }
                let factor1 = self.powers[&(value[0] as u16)];
                let factor2 = self.powers[&(value[1] as u16)];
                // tables arrive in descending order: factor2's table first
                let cross1 = ot_select(&tables[t], factor1);
                let cross2 = ot_select(&tables[t + 1], factor2);
                t += 2;
                let local = block_mult(factor1, factor2);
                self.powers.insert(*key as u16, local ^ cross1 ^ cross2);
            }
            self.powers = square_all(&self.powers, self.max);
        }
    }

    #[test]
    fn test_finished_mac_share_completes() {
        let mut rng = thread_rng();
        let h: u128 = rng.gen();
        let h1_n: u128 = rng.gen();
        let h1_c = h ^ h1_n;
        let gctr: u128 = rng.gen();
        let gctr_n: u128 = rng.gen();
        let gctr_c = gctr ^ gctr_n;
        let enc_finished: u128 = rng.gen();

        let mac = finished_mac(&mut rng, h1_n, gctr_n, enc_finished);

        // client side
        let h2_c = free_square(h1_c);
        let cross1 = ot_select(&mac.ot_payload[0], h1_c); // our H^2 table, client's H^1 bits
        let cross2 = ot_select(&mac.ot_payload[1], h2_c); // our H^1 table, client's H^2 bits
        let h3_c = block_mult(h1_c, h2_c) ^ cross1 ^ cross2;

        assert_eq!(mac.h3 ^ h3_c, block_mult(h, free_square(h)));

        let client_tag = block_mult(FINISHED_AAD, h3_c)
            ^ block_mult(enc_finished, h2_c)
            ^ block_mult(FINISHED_LEN_BLOCK, h1_c)
            ^ gctr_c;
        let expected =
            rust_crypto_ghash(h, &[FINISHED_AAD, enc_finished, FINISHED_LEN_BLOCK]) ^ gctr;
        assert_eq!(mac.tag_share ^ client_tag, expected);
    }

    #[test]
    fn test_request_tag_small_no_ot() {
        // up to 19 blocks the Finished powers suffice and step1 is empty
        run_request_tag(10);
    }

    #[test]
    fn test_request_tag_round1() {
        run_request_tag(30);
    }

    #[test]
    fn test_request_tag_round2() {
        run_request_tag(450);
    }

    fn run_request_tag(block_count: usize) {
        let mut rng = thread_rng();
        let h: u128 = rng.gen();
        let h1_n: u128 = rng.gen();
        let h1_c = h ^ h1_n;

        // both sides absorb their Finished-round shares of H^1..H^3
        let mac = finished_mac(&mut rng, h1_n, 0, 0);
        let h2_c = free_square(h1_c);
        let h3_c = block_mult(h1_c, h2_c)
            ^ ot_select(&mac.ot_payload[0], h1_c)
            ^ ot_select(&mac.ot_payload[1], h2_c);

        let mut core = GhashCore::new();
        core.absorb_finished_shares(mac.h1, mac.h2, mac.h3);
        core.set_max_power_needed(block_count).unwrap();

        let mut client = TestClient {
            powers: square_all(
                &std::collections::BTreeMap::from([(1u16, h1_c), (2, h2_c), (3, h3_c)]),
                block_count as u16,
            ),
            max: block_count as u16,
        };

        let strategy1: Vec<(u8, [u8; 2])> = vec![
            (5, [4, 1]),
            (7, [4, 3]),
            (9, [8, 1]),
            (11, [8, 3]),
            (13, [12, 1]),
            (15, [12, 3]),
            (17, [16, 1]),
            (19, [16, 3]),
        ];
        let strategy2: Vec<(u8, [u8; 2])> = vec![
            (21, [17, 4]),
            (23, [17, 6]),
            (25, [17, 8]),
            (27, [19, 8]),
            (29, [17, 12]),
            (31, [19, 12]),
            (33, [17, 16]),
            (35, [19, 16]),
        ];

        let tables = core.step1(&mut rng);
        let max_odd = core.max_odd_power_needed();
        if max_odd > 3 {
            let s1: Vec<(u8, [u8; 2])> = strategy1
                .iter()
                .filter(|(k, _)| *k <= max_odd)
                .cloned()
                .collect();
            client.consume_round(&tables, &s1);
        }
        if max_odd > 19 {
            let tables = core.step2(&mut rng);
            let s2: Vec<(u8, [u8; 2])> = strategy2
                .iter()
                .filter(|(k, _)| *k <= max_odd)
                .cloned()
                .collect();
            client.consume_round(&tables, &s2);
        }

        let blocks: Vec<u128> = (0..block_count).map(|_| rng.gen()).collect();
        let (notary_share, tables, _mults) = core.step3(&mut rng, &blocks).unwrap();

        // the client completes the aggregated products obliviously
        let client_direct = multiply_powers_and_blocks(&client.powers, &blocks);
        let (aggregated, aggr_share) = block_aggregation(&client.powers, &blocks);
        let mut t = 0;
        let mut client_ot = 0u128;
        for (power, value) in aggregated.iter() {
            // our bits select from the notary's aggregated-value table,
            // then from its power table
            client_ot ^= ot_select(&tables[t], client.powers[power]);
            client_ot ^= ot_select(&tables[t + 1], *value);
            t += 2;
        }
        let client_share = client_direct ^ aggr_share ^ client_ot;

        assert_eq!(notary_share ^ client_share, rust_crypto_ghash(h, &blocks));
    }
}
