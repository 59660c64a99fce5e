//! Compact encodings used by the UTXO set and the spend journal.
//!
//! Integers use a base-128 VLQ, most significant group first, where each
//! continuation group is offset by one so every value has exactly one encoding.
//! Amounts are folded on their trailing decimal zeros, and the common script
//! templates collapse to a one-byte tag plus their hash or key.

use btcnode_script::secp::{decompress_public_key, is_valid_public_key};

use crate::error::DeserializeError;

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_DATA_20: u8 = 0x14;
const OP_DATA_33: u8 = 0x21;
const OP_DATA_65: u8 = 0x41;

const CST_PAY_TO_PUBKEY_HASH: u64 = 0;
const CST_PAY_TO_SCRIPT_HASH: u64 = 1;
const CST_PAY_TO_PUBKEY_COMP2: u64 = 2;
const CST_PAY_TO_PUBKEY_COMP3: u64 = 3;
const CST_PAY_TO_PUBKEY_UNCOMP4: u64 = 4;
const CST_PAY_TO_PUBKEY_UNCOMP5: u64 = 5;

/// Tags below this value are template scripts; larger values carry `len + NUM_SPECIAL_SCRIPTS`.
pub const NUM_SPECIAL_SCRIPTS: u64 = 6;

pub fn serialize_size_vlq(mut n: u64) -> usize {
    let mut size = 1;
    while n > 0x7f {
        size += 1;
        n = (n >> 7) - 1;
    }
    size
}

/// Writes `n` into the front of `target` and returns the number of bytes used.
///
/// `target` must hold at least `serialize_size_vlq(n)` bytes.
pub fn put_vlq(target: &mut [u8], mut n: u64) -> usize {
    let mut offset = 0;
    loop {
        let high_bit = if offset == 0 { 0x00 } else { 0x80 };
        target[offset] = (n & 0x7f) as u8 | high_bit;
        if n <= 0x7f {
            break;
        }
        n = (n >> 7) - 1;
        offset += 1;
    }
    target[..=offset].reverse();
    offset + 1
}

pub fn append_vlq(out: &mut Vec<u8>, n: u64) {
    let mut buf = [0u8; 10];
    let len = put_vlq(&mut buf, n);
    out.extend_from_slice(&buf[..len]);
}

/// Returns the decoded value and the number of bytes consumed.
///
/// A zero byte count means `bytes` was empty. Running out of bytes before the
/// terminating group returns what was read so far; callers compare the count
/// against the remaining length.
pub fn deserialize_vlq(bytes: &[u8]) -> (u64, usize) {
    let mut n: u64 = 0;
    let mut size = 0;
    for &byte in bytes {
        size += 1;
        n = (n << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 != 0x80 {
            break;
        }
        n = n.wrapping_add(1);
    }
    (n, size)
}

fn is_pubkey_hash(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == OP_DATA_20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

fn is_script_hash(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == OP_DATA_20 && script[22] == OP_EQUAL
}

/// The serialized key of a pay-to-pubkey script that compresses to 33 bytes.
fn pubkey_of(script: &[u8]) -> Option<&[u8]> {
    if script.len() == 35
        && script[0] == OP_DATA_33
        && script[34] == OP_CHECKSIG
        && matches!(script[1], 0x02 | 0x03)
    {
        return Some(&script[1..34]);
    }
    if script.len() == 67 && script[0] == OP_DATA_65 && script[66] == OP_CHECKSIG && script[1] == 0x04
    {
        let key = &script[1..66];
        if is_valid_public_key(key) {
            return Some(key);
        }
    }
    None
}

pub fn compressed_script_size(script: &[u8]) -> usize {
    if is_pubkey_hash(script) || is_script_hash(script) {
        return 21;
    }
    if pubkey_of(script).is_some() {
        return 33;
    }
    serialize_size_vlq(script.len() as u64 + NUM_SPECIAL_SCRIPTS) + script.len()
}

/// Size of the compressed script at the front of `bytes`, read from its tag.
pub fn decode_compressed_script_size(bytes: &[u8]) -> usize {
    let (tag, read) = deserialize_vlq(bytes);
    if read == 0 {
        return 0;
    }
    match tag {
        CST_PAY_TO_PUBKEY_HASH | CST_PAY_TO_SCRIPT_HASH => 21,
        CST_PAY_TO_PUBKEY_COMP2..=CST_PAY_TO_PUBKEY_UNCOMP5 => 33,
        _ => ((tag - NUM_SPECIAL_SCRIPTS) as usize).saturating_add(read),
    }
}

pub fn write_compressed_script(out: &mut Vec<u8>, script: &[u8]) {
    if is_pubkey_hash(script) {
        out.push(CST_PAY_TO_PUBKEY_HASH as u8);
        out.extend_from_slice(&script[3..23]);
        return;
    }
    if is_script_hash(script) {
        out.push(CST_PAY_TO_SCRIPT_HASH as u8);
        out.extend_from_slice(&script[2..22]);
        return;
    }
    if let Some(key) = pubkey_of(script) {
        match key[0] {
            0x02 | 0x03 => out.push(key[0]),
            // The y parity folds into the tag.
            _ => out.push(CST_PAY_TO_PUBKEY_UNCOMP4 as u8 | (key[64] & 0x01)),
        }
        out.extend_from_slice(&key[1..33]);
        return;
    }
    append_vlq(out, script.len() as u64 + NUM_SPECIAL_SCRIPTS);
    out.extend_from_slice(script);
}

pub fn decompress_script(bytes: &[u8]) -> Result<Vec<u8>, DeserializeError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let (tag, read) = deserialize_vlq(bytes);
    let payload = &bytes[read..];
    let take = |len: usize| {
        payload
            .get(..len)
            .ok_or_else(|| DeserializeError::new("unexpected end of compressed script"))
    };
    let script = match tag {
        CST_PAY_TO_PUBKEY_HASH => {
            let mut script = Vec::with_capacity(25);
            script.extend_from_slice(&[OP_DUP, OP_HASH160, OP_DATA_20]);
            script.extend_from_slice(take(20)?);
            script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
            script
        }
        CST_PAY_TO_SCRIPT_HASH => {
            let mut script = Vec::with_capacity(23);
            script.extend_from_slice(&[OP_HASH160, OP_DATA_20]);
            script.extend_from_slice(take(20)?);
            script.push(OP_EQUAL);
            script
        }
        CST_PAY_TO_PUBKEY_COMP2 | CST_PAY_TO_PUBKEY_COMP3 => {
            let mut script = Vec::with_capacity(35);
            script.extend_from_slice(&[OP_DATA_33, tag as u8]);
            script.extend_from_slice(take(32)?);
            script.push(OP_CHECKSIG);
            script
        }
        CST_PAY_TO_PUBKEY_UNCOMP4 | CST_PAY_TO_PUBKEY_UNCOMP5 => {
            let mut compressed = [0u8; 33];
            compressed[0] = (tag - 2) as u8;
            compressed[1..].copy_from_slice(take(32)?);
            let key = decompress_public_key(&compressed)
                .ok_or_else(|| DeserializeError::new("malformed compressed public key"))?;
            let mut script = Vec::with_capacity(67);
            script.push(OP_DATA_65);
            script.extend_from_slice(&key);
            script.push(OP_CHECKSIG);
            script
        }
        _ => take((tag - NUM_SPECIAL_SCRIPTS) as usize)?.to_vec(),
    };
    Ok(script)
}

pub fn compress_amount(mut amount: u64) -> u64 {
    if amount == 0 {
        return 0;
    }
    let mut exponent = 0u64;
    while amount % 10 == 0 && exponent < 9 {
        amount /= 10;
        exponent += 1;
    }
    if exponent < 9 {
        let last_digit = amount % 10;
        amount /= 10;
        return 1u64
            .wrapping_add(10u64.wrapping_mul(9u64.wrapping_mul(amount) + last_digit - 1))
            .wrapping_add(exponent);
    }
    10u64.wrapping_add(10u64.wrapping_mul(amount - 1))
}

pub fn decompress_amount(mut compressed: u64) -> u64 {
    if compressed == 0 {
        return 0;
    }
    compressed -= 1;
    let mut exponent = compressed % 10;
    compressed /= 10;
    let mut amount = if exponent < 9 {
        let last_digit = compressed % 9 + 1;
        compressed /= 9;
        compressed.wrapping_mul(10).wrapping_add(last_digit)
    } else {
        compressed + 1
    };
    while exponent > 0 {
        amount = amount.wrapping_mul(10);
        exponent -= 1;
    }
    amount
}

pub fn compressed_txout_size(amount: u64, script: &[u8]) -> usize {
    serialize_size_vlq(compress_amount(amount)) + compressed_script_size(script)
}

pub fn write_compressed_txout(out: &mut Vec<u8>, amount: u64, script: &[u8]) {
    append_vlq(out, compress_amount(amount));
    write_compressed_script(out, script);
}

/// Decodes an amount and script, returning them with the bytes consumed.
pub fn decode_compressed_txout(bytes: &[u8]) -> Result<(u64, Vec<u8>, usize), DeserializeError> {
    let (compressed_amount, offset) = deserialize_vlq(bytes);
    if offset >= bytes.len() {
        return Err(DeserializeError::new(
            "unexpected end of data after compressed amount",
        ));
    }
    let script_size = decode_compressed_script_size(&bytes[offset..]);
    if bytes.len() - offset < script_size {
        return Err(DeserializeError::new("unexpected end of data after script size"));
    }
    let script = decompress_script(&bytes[offset..offset + script_size])?;
    Ok((
        decompress_amount(compressed_amount),
        script,
        offset + script_size,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use btcnode_primitives::hex::hex_to_bytes;

    fn vlq(n: u64) -> Vec<u8> {
        let mut out = Vec::new();
        append_vlq(&mut out, n);
        out
    }

    #[test]
    fn vlq_vectors() {
        let cases: [(u64, &[u8]); 6] = [
            (0, &[0x00]),
            (127, &[0x7f]),
            (128, &[0x80, 0x00]),
            (16511, &[0xff, 0x7f]),
            (16512, &[0x80, 0x80, 0x00]),
            (
                u64::MAX,
                &[0x80, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0x7f],
            ),
        ];
        for (n, expected) in cases {
            assert_eq!(vlq(n), expected, "encoding {n}");
            assert_eq!(serialize_size_vlq(n), expected.len());
            assert_eq!(deserialize_vlq(expected), (n, expected.len()));
        }
    }

    #[test]
    fn vlq_sweep() {
        let mut state = 0x2545_f491_4f6c_dd1du64;
        for _ in 0..2000 {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let n = state >> (state % 64);
            let encoded = vlq(n);
            assert_eq!(encoded.len(), serialize_size_vlq(n));
            assert_eq!(deserialize_vlq(&encoded), (n, encoded.len()));
        }
    }

    #[test]
    fn truncated_vlq_reports_consumed_bytes() {
        assert_eq!(deserialize_vlq(&[]), (0, 0));
        let (_, read) = deserialize_vlq(&[0x80, 0x80]);
        assert_eq!(read, 2);
    }

    #[test]
    fn amount_vectors() {
        let cases = [
            (0u64, 0u64),
            (1, 1),
            (10_000_000, 8),
            (100_000_000, 9),
            (5_000_000_000, 50),
            (2_100_000_000_000_000, 21_000_000),
            (546, 4911),
            (123_456_789, 1_111_111_101),
        ];
        for (amount, compressed) in cases {
            assert_eq!(compress_amount(amount), compressed, "compress {amount}");
            assert_eq!(decompress_amount(compressed), amount, "decompress {compressed}");
        }
    }

    #[test]
    fn amount_sweep() {
        let mut state = 7u64;
        for _ in 0..5000 {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let amount = (state >> 11) % 2_100_000_000_000_001;
            let rounded = amount - amount % 10u64.pow((state % 9) as u32);
            for value in [amount, rounded] {
                assert_eq!(decompress_amount(compress_amount(value)), value);
            }
        }
    }

    fn roundtrip(script: &[u8]) -> usize {
        let mut out = Vec::new();
        write_compressed_script(&mut out, script);
        assert_eq!(out.len(), compressed_script_size(script));
        assert_eq!(decode_compressed_script_size(&out), out.len());
        assert_eq!(decompress_script(&out).expect("decompress"), script);
        out.len()
    }

    #[test]
    fn template_scripts_compress() {
        let mut p2pkh = vec![OP_DUP, OP_HASH160, OP_DATA_20];
        p2pkh.extend_from_slice(&[0x11; 20]);
        p2pkh.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        assert_eq!(roundtrip(&p2pkh), 21);

        let mut p2sh = vec![OP_HASH160, OP_DATA_20];
        p2sh.extend_from_slice(&[0x22; 20]);
        p2sh.push(OP_EQUAL);
        assert_eq!(roundtrip(&p2sh), 21);

        // Satoshi's key from the genesis coinbase, uncompressed and compressed.
        let uncompressed = hex_to_bytes(
            "04678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb6\
             49f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5f",
        )
        .expect("hex");
        let mut p2pk = vec![OP_DATA_65];
        p2pk.extend_from_slice(&uncompressed);
        p2pk.push(OP_CHECKSIG);
        assert_eq!(roundtrip(&p2pk), 33);

        let mut compressed = vec![0x02 | (uncompressed[64] & 1)];
        compressed.extend_from_slice(&uncompressed[1..33]);
        let mut p2pk = vec![OP_DATA_33];
        p2pk.extend_from_slice(&compressed);
        p2pk.push(OP_CHECKSIG);
        assert_eq!(roundtrip(&p2pk), 33);
    }

    #[test]
    fn other_scripts_are_stored_raw() {
        assert_eq!(roundtrip(&[0x51]), 2);
        assert_eq!(roundtrip(&[]), 1);
        let long = vec![0x6a; 300];
        assert_eq!(roundtrip(&long), 302);

        // An off-curve uncompressed key is not a template.
        let mut p2pk = vec![OP_DATA_65, 0x04];
        p2pk.extend_from_slice(&[0x01; 64]);
        p2pk.push(OP_CHECKSIG);
        assert_eq!(roundtrip(&p2pk), 68);
    }

    #[test]
    fn bad_uncompressed_key_fails_to_decompress() {
        let mut bytes = vec![CST_PAY_TO_PUBKEY_UNCOMP4 as u8];
        bytes.extend_from_slice(&[0xff; 32]);
        assert!(decompress_script(&bytes).is_err());
    }

    #[test]
    fn txout_roundtrip() {
        let script = vec![0x51, 0x52];
        let mut out = Vec::new();
        write_compressed_txout(&mut out, 50 * 100_000_000, &script);
        assert_eq!(out.len(), compressed_txout_size(50 * 100_000_000, &script));
        out.push(0xee);
        let (amount, decoded, read) = decode_compressed_txout(&out).expect("decode");
        assert_eq!(amount, 5_000_000_000);
        assert_eq!(decoded, script);
        assert_eq!(read, out.len() - 1);

        assert!(decode_compressed_txout(&[0x32]).is_err());
        assert!(decode_compressed_txout(&[0x32, 0x09, 0x51]).is_err());
    }
}
