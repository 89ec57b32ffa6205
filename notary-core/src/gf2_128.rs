//! Arithmetic over GF(2^128) with the GCM reduction polynomial
//! `x^128 + x^7 + x^2 + x + 1`, plus the masked x-table construction used to
//! multiply a secret block by a counterparty-held 128-bit scalar over
//! 1-of-2 Oblivious Transfer.

use rand::{CryptoRng, Rng};
use std::collections::BTreeMap;

/// The sender's full OT input for one block multiplication: for each of the
/// 128 bit positions a pair (mask, mask ^ (x << i)).
pub type MXTableFull = Vec<[u128; 2]>;

/// R is the GCM polynomial in little-endian. In hex: "E1000000000000000000000000000000"
const R: u128 = 299076299051606071403356588563077529600;

/// Galois field multiplication of two 128-bit blocks reduced by the GCM polynomial.
pub fn block_mult(mut x: u128, y: u128) -> u128 {
    let mut result: u128 = 0;
    for i in (0..128).rev() {
        result ^= x * ((y >> i) & 1);
        x = (x >> 1) ^ ((x & 1) * R);
    }
    result
}

/// Returns the squared value. It is called "free" because squaring is a
/// linear (XOR-only) map over GF(2^128) and each party can apply it to its
/// additive share locally, without any 2PC.
pub fn free_square(x: u128) -> u128 {
    block_mult(x, x)
}

/// Squares every odd power in `powers` up to and including the maximum
/// power `max` and returns the updated map. Squaring cascades, e.g. with
/// power 1 present and `max` 22, power 1 yields 2, then 4, 8, 16. Powers
/// which are already present are kept.
pub fn square_all(powers: &BTreeMap<u16, u128>, max: u16) -> BTreeMap<u16, u128> {
    let mut new_powers: BTreeMap<u16, u128> = BTreeMap::new();
    for (power, value) in powers.iter() {
        // Having computed more powers than will ever be needed is a logic
        // error upstream.
        assert!(*power <= max);
        new_powers.insert(*power, *value);
        if power % 2 == 0 {
            continue;
        }
        let mut existing_power = *power;
        while existing_power * 2 <= max {
            let squared_value = match powers.get(&(existing_power * 2)) {
                Some(v) => *v,
                None => free_square(*new_powers.get(&existing_power).unwrap()),
            };
            new_powers.insert(existing_power * 2, squared_value);
            existing_power *= 2;
        }
    }
    new_powers
}

/// Finds 2 non-equal keys of `summands` which add up to `sum_needed`, with
/// the first returned summand as small as possible. E.g. for keys
/// 1,2,3,5,6 and sum 8 the result is (2, 6).
pub fn find_sum(summands: &BTreeMap<u16, u128>, sum_needed: u16) -> (u16, u16) {
    for (i, _) in summands.iter() {
        for (j, _) in summands.iter() {
            if *j == *i {
                continue;
            }
            if *i + *j == sum_needed {
                return (*i, *j);
            }
        }
    }
    // find_sum is only called when the summands are known to exist
    panic!("summands were not found")
}

/// Returns the maximum odd power needed to cover `max` GHASH blocks with
/// block aggregation. The table value at a key shows how many blocks can be
/// processed when all sequential shares 1..=key are present; a 16 KiB TLS
/// record needs 1026 blocks.
pub fn find_max_odd_power(max: u16) -> u8 {
    assert!(max <= 1026);
    let max_htable: BTreeMap<u8, u16> = BTreeMap::from([
        (0, 0),
        (3, 19),
        (5, 29),
        (7, 71),
        (9, 89),
        (11, 107),
        (13, 125),
        (15, 271),
        (17, 305),
        (19, 339),
        (21, 373),
        (23, 407),
        (25, 441),
        (27, 475),
        (29, 509),
        (31, 1023),
        (33, 1025),
        (35, 1027),
    ]);
    let mut out = 0u8;
    for (key, value) in max_htable.iter() {
        if *value >= max {
            out = *key;
            break;
        }
    }
    out
}

/// Multiplies GHASH blocks by the corresponding shares of powers of H and
/// returns the XOR-sum of all products. Blocks whose power share is absent
/// are skipped here and handled by block aggregation.
pub fn multiply_powers_and_blocks(powers: &BTreeMap<u16, u128>, blocks: &[u128]) -> u128 {
    let last_key = *powers.iter().last().unwrap().0;
    assert!(last_key as usize <= blocks.len());
    let mut sum = 0u128;
    for (power, value) in powers.iter() {
        // H^1 multiplies the last block, H^2 the second to last, etc.
        sum ^= block_mult(*value, blocks[blocks.len() - (*power as usize)]);
    }
    sum
}

/// The block aggregation method: every block whose power share is missing
/// is rewritten via H^i = H^small * H^big. Returns the per-small-power
/// aggregated values (which still need one OT multiplication each) and the
/// locally-computable part of the share.
pub fn block_aggregation(
    powers: &BTreeMap<u16, u128>,
    blocks: &[u128],
) -> (BTreeMap<u16, u128>, u128) {
    let mut ghash_share = 0u128;
    let mut aggregated: BTreeMap<u16, u128> = BTreeMap::new();
    for i in 1..blocks.len() + 1 {
        if powers.contains_key(&(i as u16)) {
            // already covered by multiply_powers_and_blocks()
            continue;
        }
        let (small, big) = find_sum(powers, i as u16);
        let block = blocks[blocks.len() - i];
        ghash_share ^= block_mult(
            block_mult(*powers.get(&small).unwrap(), *powers.get(&big).unwrap()),
            block,
        );
        let old_value = aggregated.get(&small).copied().unwrap_or(0);
        aggregated.insert(
            small,
            old_value ^ block_mult(*powers.get(&big).unwrap(), block),
        );
    }
    (aggregated, ghash_share)
}

/// Returns the masked x-tables the OT sender needs to complete block
/// aggregation, and the sender's share of the aggregated products.
pub fn block_aggregation_mxtables<R: Rng + CryptoRng>(
    rng: &mut R,
    powers: &BTreeMap<u16, u128>,
    aggregated: &BTreeMap<u16, u128>,
) -> (Vec<MXTableFull>, u128) {
    let mut all_mxtables: Vec<MXTableFull> = Vec::new();
    let mut sum = 0u128;
    for (power, value) in aggregated.iter() {
        // first the masked x-table of the aggregated value, then of the power
        let (mxtable1, sum1) = masked_xtable(rng, *value);
        let (mxtable2, sum2) = masked_xtable(rng, *powers.get(power).unwrap());
        sum ^= sum1 ^ sum2;
        all_mxtables.push(mxtable1);
        all_mxtables.push(mxtable2);
    }
    (all_mxtables, sum)
}

/// Returns the value of x after each of the 128 reduction rounds of
/// block_mult(), i.e. x << i in the field for i in 0..128.
fn xtable(mut x: u128) -> Vec<u128> {
    let mut x_table: Vec<u128> = vec![0u128; 128];
    for entry in x_table.iter_mut() {
        *entry = x;
        x = (x >> 1) ^ ((x & 1) * R);
    }
    x_table
}

/// Returns the masked x-table from which an OT response is built, and the
/// XOR-sum of all masks, which is the sender's share of the product.
/// For each x-table entry the masked table holds a fresh random mask and
/// the entry XORed with that mask; the receiver's selected values XORed
/// together are the receiver's share.
pub fn masked_xtable<R: Rng + CryptoRng>(rng: &mut R, x: u128) -> (MXTableFull, u128) {
    let x_table = xtable(x);
    let mut mask_sum: u128 = 0;
    let mut masked: MXTableFull = vec![[0u128; 2]; 128];
    for i in 0..128 {
        let mask: u128 = rng.gen();
        mask_sum ^= mask;
        masked[i][0] = mask;
        masked[i][1] = x_table[i] ^ mask;
    }
    (masked, mask_sum)
}

/// XOR-sum of all elements.
pub fn xor_sum(values: &[u128]) -> u128 {
    values.iter().fold(0u128, |acc, x| acc ^ x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::u8vec_to_boolvec;
    use ghash_rc::universal_hash::{KeyInit, UniversalHash};
    use ghash_rc::GHash;
    use rand::{thread_rng, Rng};

    // compute GHASH over the blocks using RustCrypto's implementation
    fn rust_crypto_ghash(h: u128, blocks: &[u128]) -> u128 {
        let mut ghash = GHash::new(&h.to_be_bytes().into());
        for block in blocks.iter() {
            ghash.update(&[block.to_be_bytes().into()]);
        }
        let b = ghash.finalize();
        u128::from_be_bytes(b.into())
    }

    fn product_from_shares(x: u128, y: u128) -> u128 {
        let (masked_xtable, my_product_share) = masked_xtable(&mut thread_rng(), x);

        // The party holding y receives one of the two values for each table
        // entry via OT, depending on the bits of y. Simulated here.
        let mut his_product_share = 0u128;
        let bits = u8vec_to_boolvec(&y.to_be_bytes());
        for i in 0..128 {
            // the first x-table entry corresponds to the highest bit of y
            his_product_share ^= masked_xtable[i][bits[i] as usize];
        }
        my_product_share ^ his_product_share
    }

    #[test]
    fn test_block_mult_against_reference() {
        let mut rng = thread_rng();
        let x: u128 = rng.gen();
        let y: u128 = rng.gen();
        assert_eq!(block_mult(x, y), rust_crypto_ghash(x, &[y]));
    }

    #[test]
    fn test_block_mult_commutes() {
        let mut rng = thread_rng();
        let x: u128 = rng.gen();
        let y: u128 = rng.gen();
        assert_eq!(block_mult(x, y), block_mult(y, x));
    }

    #[test]
    fn test_block_mult_distributes() {
        let mut rng = thread_rng();
        let a: u128 = rng.gen();
        let b: u128 = rng.gen();
        assert_eq!(
            block_mult(a, a ^ b),
            block_mult(a, a) ^ block_mult(a, b)
        );
    }

    #[test]
    fn test_free_square() {
        let mut rng = thread_rng();
        let x: u128 = rng.gen();
        assert_eq!(free_square(x), rust_crypto_ghash(x, &[x]));
    }

    #[test]
    fn test_square_all_cascades() {
        let h: u128 = thread_rng().gen();
        let mut powers = BTreeMap::from([(1u16, h)]);
        powers = square_all(&powers, 8);
        let keys: Vec<u16> = powers.keys().cloned().collect();
        assert_eq!(keys, vec![1, 2, 4, 8]);
        assert_eq!(powers[&2], free_square(h));
        assert_eq!(powers[&4], free_square(powers[&2]));
        assert_eq!(powers[&8], free_square(powers[&4]));
    }

    #[test]
    #[should_panic]
    fn test_square_all_rejects_excess_powers() {
        let powers = BTreeMap::from([(1u16, 1u128), (9, 2)]);
        // power 9 with max 8 is a logic error
        square_all(&powers, 8);
    }

    #[test]
    fn test_find_sum() {
        let mut summands: BTreeMap<u16, u128> = BTreeMap::new();
        for key in [1u16, 3, 5, 6, 8, 9, 12, 15] {
            summands.insert(key, 0);
        }
        assert_eq!(find_sum(&summands, 8), (3, 5));
        assert_eq!(find_sum(&summands, 14), (5, 9));
        assert_eq!(find_sum(&summands, 21), (6, 15));
    }

    #[test]
    fn test_find_max_odd_power() {
        assert_eq!(find_max_odd_power(1), 3);
        assert_eq!(find_max_odd_power(20), 5);
        assert_eq!(find_max_odd_power(100), 11);
        assert_eq!(find_max_odd_power(1000), 31);
        assert_eq!(find_max_odd_power(1026), 35);
    }

    #[test]
    fn test_multiply_powers_and_blocks() {
        let mut rng = thread_rng();
        let h: u128 = rng.gen();
        let block_count = 10usize;
        let mut powers: BTreeMap<u16, u128> = BTreeMap::new();
        let mut blocks: Vec<u128> = Vec::new();
        let mut power = h;
        for i in 0..block_count {
            powers.insert(i as u16 + 1, power);
            power = block_mult(power, h);
            blocks.push(rng.gen());
        }
        assert_eq!(
            multiply_powers_and_blocks(&powers, &blocks),
            rust_crypto_ghash(h, &blocks)
        );
    }

    #[test]
    fn test_block_aggregation_covers_missing_powers() {
        let mut rng = thread_rng();
        let h: u128 = rng.gen();
        let block_count = 10usize;
        let mut powers: BTreeMap<u16, u128> = BTreeMap::new();
        let mut blocks: Vec<u128> = Vec::new();
        let mut power = h;
        for i in 0..block_count {
            powers.insert(i as u16 + 1, power);
            power = block_mult(power, h);
            blocks.push(rng.gen());
        }
        // with every power present nothing aggregates
        assert_eq!(block_aggregation(&powers, &blocks), (BTreeMap::new(), 0));

        // split every power into two additive shares and remove 5 and 7
        // from both parties: aggregation must rebuild them from the
        // retained powers
        let mut powers_a: BTreeMap<u16, u128> = BTreeMap::new();
        let mut powers_b: BTreeMap<u16, u128> = BTreeMap::new();
        for (key, value) in powers.iter() {
            let share: u128 = rng.gen();
            powers_a.insert(*key, share);
            powers_b.insert(*key, value ^ share);
        }
        powers_a.remove(&5);
        powers_a.remove(&7);
        powers_b.remove(&5);
        powers_b.remove(&7);

        let direct_a = multiply_powers_and_blocks(&powers_a, &blocks);
        let direct_b = multiply_powers_and_blocks(&powers_b, &blocks);
        let (aggregated_a, local_a) = block_aggregation(&powers_a, &blocks);
        let (aggregated_b, local_b) = block_aggregation(&powers_b, &blocks);
        assert!(!aggregated_a.is_empty());
        assert_eq!(
            aggregated_a.keys().collect::<Vec<_>>(),
            aggregated_b.keys().collect::<Vec<_>>()
        );

        // the cross terms which the real protocol computes through OT
        let mut cross = 0u128;
        for (small, value_b) in aggregated_b.iter() {
            cross ^= block_mult(*powers_a.get(small).unwrap(), *value_b);
            cross ^= block_mult(*powers_b.get(small).unwrap(), aggregated_a[small]);
        }

        assert_eq!(
            direct_a ^ direct_b ^ local_a ^ local_b ^ cross,
            rust_crypto_ghash(h, &blocks)
        );
    }

    #[test]
    fn test_masked_xtable_product() {
        let mut rng = thread_rng();
        let x: u128 = rng.gen();
        let y: u128 = rng.gen();
        let expected = block_mult(x, y);
        assert_eq!(expected, product_from_shares(x, y));

        // corrupting bits of y must corrupt the product
        let mut bad_bytes = y.to_be_bytes();
        bad_bytes[5] = bad_bytes[5].wrapping_add(1);
        bad_bytes[15] = bad_bytes[15].wrapping_add(1);
        let bad = u128::from_be_bytes(bad_bytes);
        assert_ne!(expected, product_from_shares(x, bad));
    }

    #[test]
    fn test_xor_sum() {
        let mut rng = thread_rng();
        let mut summands: Vec<u128> = Vec::new();
        for _ in 0..300 {
            let rand = rng.gen();
            summands.push(rand);
            summands.push(rand);
        }
        assert_eq!(xor_sum(&summands), 0);
        summands.push(123456);
        assert_eq!(xor_sum(&summands), 123456);
    }
}
