//! Standard script classification utilities.

use crate::interpreter::MAX_SCRIPT_SIZE;
use crate::opcodes::{
    decode_op_n, OP_0, OP_CHECKMULTISIG, OP_CHECKSIG, OP_DUP, OP_EQUAL,
    OP_EQUALVERIFY, OP_HASH160, OP_RETURN,
};
use crate::parse::{is_push_only, parse_script, Instruction};
use crate::secp::is_compressed_or_uncompressed_pubkey;

/// Largest data push accepted in a standard null-data output.
pub const MAX_DATA_CARRIER_PUSH: usize = 80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    NonStandard,
    PubKey,
    PubKeyHash,
    ScriptHash,
    MultiSig,
    NullData,
    WitnessV0PubKeyHash,
    WitnessV0ScriptHash,
}

impl ScriptType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptType::NonStandard => "nonstandard",
            ScriptType::PubKey => "pubkey",
            ScriptType::PubKeyHash => "pubkeyhash",
            ScriptType::ScriptHash => "scripthash",
            ScriptType::MultiSig => "multisig",
            ScriptType::NullData => "nulldata",
            ScriptType::WitnessV0PubKeyHash => "witness_v0_keyhash",
            ScriptType::WitnessV0ScriptHash => "witness_v0_scripthash",
        }
    }
}

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    if is_p2pkh(script) {
        ScriptType::PubKeyHash
    } else if is_p2sh(script) {
        ScriptType::ScriptHash
    } else if is_p2wpkh(script) {
        ScriptType::WitnessV0PubKeyHash
    } else if is_p2wsh(script) {
        ScriptType::WitnessV0ScriptHash
    } else if is_p2pk(script) {
        ScriptType::PubKey
    } else if is_multisig(script) {
        ScriptType::MultiSig
    } else if is_null_data(script) {
        ScriptType::NullData
    } else {
        ScriptType::NonStandard
    }
}

pub fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

pub fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

pub fn is_p2wpkh(script: &[u8]) -> bool {
    script.len() == 22 && script[0] == OP_0 && script[1] == 0x14
}

pub fn is_p2wsh(script: &[u8]) -> bool {
    script.len() == 34 && script[0] == OP_0 && script[1] == 0x20
}

fn is_p2pk(script: &[u8]) -> bool {
    let key_len = match script.first().copied() {
        Some(len @ 33) => len,
        Some(len @ 65) => len,
        _ => return false,
    };

    let expected_len = key_len as usize + 2;
    script.len() == expected_len
        && script[script.len() - 1] == OP_CHECKSIG
        && is_compressed_or_uncompressed_pubkey(&script[1..expected_len - 1])
}

/// `OP_m <pubkey>... OP_n OP_CHECKMULTISIG` with `1 <= m <= n`.
fn is_multisig(script: &[u8]) -> bool {
    let Ok(ops) = parse_script(script) else {
        return false;
    };
    if ops.len() < 4 || ops[ops.len() - 1].opcode != OP_CHECKMULTISIG {
        return false;
    }
    let Some(required) = small_int(&ops[0]) else {
        return false;
    };
    let Some(keys) = small_int(&ops[ops.len() - 2]) else {
        return false;
    };
    let pubkeys = &ops[1..ops.len() - 2];
    if required == 0 || required > keys || pubkeys.len() != keys as usize {
        return false;
    }
    pubkeys
        .iter()
        .all(|op| is_compressed_or_uncompressed_pubkey(op.data))
}

fn small_int(op: &Instruction<'_>) -> Option<u8> {
    decode_op_n(op.opcode)
}

fn is_null_data(script: &[u8]) -> bool {
    if script.first() != Some(&OP_RETURN) {
        return false;
    }
    let rest = &script[1..];
    let Ok(ops) = parse_script(rest) else {
        return false;
    };
    match ops.as_slice() {
        [] => true,
        [op] => is_push_only(rest) && op.data.len() <= MAX_DATA_CARRIER_PUSH,
        _ => false,
    }
}

/// Outputs that can never be spent and so never enter the UTXO set.
pub fn is_unspendable(script: &[u8]) -> bool {
    script.len() > MAX_SCRIPT_SIZE
        || script.first() == Some(&OP_RETURN)
        || parse_script(script).is_err()
}

/// Returns the witness version and program of a native witness script.
pub fn extract_witness_program(script: &[u8]) -> Option<(u8, &[u8])> {
    if script.len() < 4 || script.len() > 42 {
        return None;
    }
    let version = decode_op_n(script[0])?;
    if script[1] as usize + 2 != script.len() {
        return None;
    }
    Some((version, &script[2..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::OP_1;

    #[test]
    fn witness_program_bounds() {
        let mut script = vec![OP_0, 0x02, 0xaa, 0xbb];
        assert_eq!(extract_witness_program(&script), Some((0, &[0xaa, 0xbb][..])));
        script[1] = 0x03;
        assert_eq!(extract_witness_program(&script), None);

        let mut v1 = vec![OP_1, 40];
        v1.extend([7u8; 40]);
        assert_eq!(extract_witness_program(&v1).map(|(v, p)| (v, p.len())), Some((1, 40)));
        v1.push(0);
        v1[1] = 41;
        assert_eq!(extract_witness_program(&v1), None);
    }

    #[test]
    fn unspendable_scripts() {
        assert!(is_unspendable(&[OP_RETURN, 0x01, 0x00]));
        assert!(is_unspendable(&[0x05, 0x01]));
        assert!(is_unspendable(&vec![OP_0; MAX_SCRIPT_SIZE + 1]));
        assert!(!is_unspendable(&[OP_1]));
        assert!(!is_unspendable(&[]));
    }
}
