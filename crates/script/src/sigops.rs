//! Signature operation counting.

use crate::interpreter::{
    ScriptFlags, MAX_PUBKEYS_PER_MULTISIG, SCRIPT_VERIFY_P2SH, SCRIPT_VERIFY_WITNESS,
};
use crate::opcodes::{
    decode_op_n, OP_1, OP_16, OP_CHECKMULTISIG, OP_CHECKMULTISIGVERIFY, OP_CHECKSIG,
    OP_CHECKSIGVERIFY,
};
use crate::parse::Instructions;
use crate::standard::{extract_witness_program, is_p2sh};

/// Counts signature operations, stopping quietly at the first malformed push.
///
/// With `accurate` set, a multisig preceded by `OP_1`..`OP_16` counts that many
/// keys; otherwise every multisig is charged the maximum.
pub fn sig_op_count(script: &[u8], accurate: bool) -> usize {
    let mut count = 0usize;
    let mut last_opcode = None;
    for instruction in Instructions::new(script) {
        let Ok(instruction) = instruction else {
            break;
        };
        match instruction.opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += match last_opcode {
                    Some(op @ OP_1..=OP_16) if accurate => {
                        decode_op_n(op).unwrap_or_default() as usize
                    }
                    _ => MAX_PUBKEYS_PER_MULTISIG as usize,
                };
            }
            _ => {}
        }
        last_opcode = Some(instruction.opcode);
    }
    count
}

/// Last data push of a push-only signature script, the P2SH redeem script.
fn redeem_script(script_sig: &[u8]) -> Option<&[u8]> {
    let mut last = None;
    for instruction in Instructions::new(script_sig) {
        let instruction = instruction.ok()?;
        if instruction.opcode > OP_16 {
            return None;
        }
        last = Some(instruction.data);
    }
    last
}

/// Accurate sigop count of the redeem script carried by `script_sig`.
pub fn p2sh_sig_op_count(script_sig: &[u8]) -> usize {
    redeem_script(script_sig)
        .map(|script| sig_op_count(script, true))
        .unwrap_or(0)
}

/// Precise count for a spend of `script_pubkey`, looking through P2SH.
pub fn precise_sig_op_count(script_sig: &[u8], script_pubkey: &[u8], bip16: bool) -> usize {
    if bip16 && is_p2sh(script_pubkey) {
        p2sh_sig_op_count(script_sig)
    } else {
        sig_op_count(script_pubkey, true)
    }
}

fn witness_sig_ops(version: u8, program: &[u8], witness: &[Vec<u8>]) -> usize {
    if version != 0 {
        return 0;
    }
    match program.len() {
        20 => 1,
        32 => witness
            .last()
            .map(|script| sig_op_count(script, true))
            .unwrap_or(0),
        _ => 0,
    }
}

/// Sigops executed by witness programs, native or nested in P2SH.
pub fn witness_sig_op_count(
    script_sig: &[u8],
    script_pubkey: &[u8],
    witness: &[Vec<u8>],
    flags: ScriptFlags,
) -> usize {
    if (flags & SCRIPT_VERIFY_WITNESS) == 0 {
        return 0;
    }
    if let Some((version, program)) = extract_witness_program(script_pubkey) {
        return witness_sig_ops(version, program, witness);
    }
    if (flags & SCRIPT_VERIFY_P2SH) != 0 && is_p2sh(script_pubkey) {
        if let Some((version, program)) =
            redeem_script(script_sig).and_then(extract_witness_program)
        {
            return witness_sig_ops(version, program, witness);
        }
    }
    0
}
