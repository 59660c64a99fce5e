//! Script interpreter and validation.

use btcnode_consensus::constants::{
    LOCKTIME_THRESHOLD, SEQUENCE_FINAL, SEQUENCE_LOCK_TIME_DISABLED, SEQUENCE_LOCK_TIME_IS_SECONDS,
    SEQUENCE_LOCK_TIME_MASK,
};
use btcnode_primitives::hash::{hash160, sha256, sha256d};
use btcnode_primitives::hex::bytes_to_hex;
use btcnode_primitives::transaction::Transaction;
use ripemd::{Digest, Ripemd160};
use secp256k1::{ecdsa::Signature, Message, PublicKey};
use sha1::Sha1;

use crate::num::{cast_to_bool, decode_num, encode_num, DEFAULT_MAX_NUM_SIZE, LOCKTIME_MAX_NUM_SIZE};
use crate::opcodes::*;
use crate::parse::{
    find_and_delete, is_minimal_push, is_push_only, push_data_script, read_instruction,
};
use crate::secp::{is_compressed_or_uncompressed_pubkey, is_compressed_pubkey, secp256k1_verify};
use crate::sighash::{signature_hash, SighashCache, SighashType, SigVersion};
use crate::standard::{extract_witness_program, is_p2sh};

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
pub const SCRIPT_VERIFY_P2SH: ScriptFlags = 1 << 0;
pub const SCRIPT_VERIFY_STRICTENC: ScriptFlags = 1 << 1;
pub const SCRIPT_VERIFY_DERSIG: ScriptFlags = 1 << 2;
pub const SCRIPT_VERIFY_LOW_S: ScriptFlags = 1 << 3;
pub const SCRIPT_VERIFY_NULLDUMMY: ScriptFlags = 1 << 4;
pub const SCRIPT_VERIFY_SIGPUSHONLY: ScriptFlags = 1 << 5;
pub const SCRIPT_VERIFY_MINIMALDATA: ScriptFlags = 1 << 6;
pub const SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS: ScriptFlags = 1 << 7;
pub const SCRIPT_VERIFY_CLEANSTACK: ScriptFlags = 1 << 8;
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: ScriptFlags = 1 << 9;
pub const SCRIPT_VERIFY_CHECKSEQUENCEVERIFY: ScriptFlags = 1 << 10;
pub const SCRIPT_VERIFY_WITNESS: ScriptFlags = 1 << 11;
pub const SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM: ScriptFlags = 1 << 12;
pub const SCRIPT_VERIFY_MINIMALIF: ScriptFlags = 1 << 13;
pub const SCRIPT_VERIFY_NULLFAIL: ScriptFlags = 1 << 14;
pub const SCRIPT_VERIFY_WITNESS_PUBKEYTYPE: ScriptFlags = 1 << 15;

pub const MANDATORY_SCRIPT_VERIFY_FLAGS: ScriptFlags = SCRIPT_VERIFY_P2SH;
pub const STANDARD_SCRIPT_VERIFY_FLAGS: ScriptFlags = MANDATORY_SCRIPT_VERIFY_FLAGS
    | SCRIPT_VERIFY_DERSIG
    | SCRIPT_VERIFY_STRICTENC
    | SCRIPT_VERIFY_MINIMALDATA
    | SCRIPT_VERIFY_NULLDUMMY
    | SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | SCRIPT_VERIFY_CLEANSTACK
    | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY
    | SCRIPT_VERIFY_CHECKSEQUENCEVERIFY
    | SCRIPT_VERIFY_LOW_S
    | SCRIPT_VERIFY_WITNESS
    | SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM
    | SCRIPT_VERIFY_MINIMALIF
    | SCRIPT_VERIFY_NULLFAIL
    | SCRIPT_VERIFY_WITNESS_PUBKEYTYPE;

pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;
pub const MAX_OPS_PER_SCRIPT: usize = 201;
pub const MAX_PUBKEYS_PER_MULTISIG: i64 = 20;
pub const MAX_STACK_SIZE: usize = 1000;
pub const MAX_SCRIPT_SIZE: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptError {
    EvalFalse,
    OpReturn,
    ScriptSize,
    PushSize,
    OpCount,
    StackSize,
    SigCount,
    PubkeyCount,
    Verify,
    EqualVerify,
    CheckMultisigVerify,
    CheckSigVerify,
    NumEqualVerify,
    BadOpcode,
    DisabledOpcode,
    InvalidStackOperation,
    InvalidAltstackOperation,
    UnbalancedConditional,
    NegativeLocktime,
    UnsatisfiedLocktime,
    SigHashType,
    SigDer,
    MinimalData,
    SigPushOnly,
    SigHighS,
    SigNullDummy,
    PubkeyType,
    CleanStack,
    MinimalIf,
    SigNullFail,
    DiscourageUpgradableNops,
    DiscourageUpgradableWitnessProgram,
    WitnessProgramWrongLength,
    WitnessProgramWitnessEmpty,
    WitnessProgramMismatch,
    WitnessMalleated,
    WitnessMalleatedP2sh,
    WitnessUnexpected,
    WitnessPubkeyType,
    NumOverflow,
    NumNotMinimal,
}

impl ScriptError {
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptError::EvalFalse => "script evaluated without error but finished with a false/empty top stack element",
            ScriptError::OpReturn => "OP_RETURN was encountered",
            ScriptError::ScriptSize => "script is too big",
            ScriptError::PushSize => "push value size limit exceeded",
            ScriptError::OpCount => "operation limit exceeded",
            ScriptError::StackSize => "stack size limit exceeded",
            ScriptError::SigCount => "signature count negative or greater than pubkey count",
            ScriptError::PubkeyCount => "pubkey count negative or limit exceeded",
            ScriptError::Verify => "script failed an OP_VERIFY operation",
            ScriptError::EqualVerify => "script failed an OP_EQUALVERIFY operation",
            ScriptError::CheckMultisigVerify => "script failed an OP_CHECKMULTISIGVERIFY operation",
            ScriptError::CheckSigVerify => "script failed an OP_CHECKSIGVERIFY operation",
            ScriptError::NumEqualVerify => "script failed an OP_NUMEQUALVERIFY operation",
            ScriptError::BadOpcode => "opcode missing or not understood",
            ScriptError::DisabledOpcode => "attempted to use a disabled opcode",
            ScriptError::InvalidStackOperation => "operation not valid with the current stack size",
            ScriptError::InvalidAltstackOperation => {
                "operation not valid with the current altstack size"
            }
            ScriptError::UnbalancedConditional => "invalid OP_IF construction",
            ScriptError::NegativeLocktime => "negative locktime",
            ScriptError::UnsatisfiedLocktime => "locktime requirement not satisfied",
            ScriptError::SigHashType => "signature hash type missing or not understood",
            ScriptError::SigDer => "non-canonical DER signature",
            ScriptError::MinimalData => "data push larger than necessary",
            ScriptError::SigPushOnly => "only push operators allowed in signatures",
            ScriptError::SigHighS => "non-canonical signature: S value is unnecessarily high",
            ScriptError::SigNullDummy => "dummy CHECKMULTISIG argument must be zero",
            ScriptError::PubkeyType => "public key is neither compressed or uncompressed",
            ScriptError::CleanStack => "stack size must be exactly one after execution",
            ScriptError::MinimalIf => "OP_IF/NOTIF argument must be minimal",
            ScriptError::SigNullFail => "signature must be zero for failed CHECK(MULTI)SIG operation",
            ScriptError::DiscourageUpgradableNops => "NOPx reserved for soft-fork upgrades",
            ScriptError::DiscourageUpgradableWitnessProgram => {
                "witness version reserved for soft-fork upgrades"
            }
            ScriptError::WitnessProgramWrongLength => "witness program has incorrect length",
            ScriptError::WitnessProgramWitnessEmpty => "witness program was passed an empty witness",
            ScriptError::WitnessProgramMismatch => "witness program hash mismatch",
            ScriptError::WitnessMalleated => "witness requires empty scriptSig",
            ScriptError::WitnessMalleatedP2sh => "witness requires only-redeemscript scriptSig",
            ScriptError::WitnessUnexpected => "witness provided for non-witness script",
            ScriptError::WitnessPubkeyType => "using non-compressed keys in segwit",
            ScriptError::NumOverflow => "script number overflow",
            ScriptError::NumNotMinimal => "non-minimally encoded script number",
        }
    }
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ScriptError {}

/// Signature, lock-time and sequence checks against one input of a transaction.
pub struct TransactionSignatureChecker<'a> {
    tx: &'a Transaction,
    input_index: usize,
    amount: i64,
    cache: Option<&'a SighashCache>,
}

impl<'a> TransactionSignatureChecker<'a> {
    pub fn new(tx: &'a Transaction, input_index: usize, amount: i64) -> Self {
        Self {
            tx,
            input_index,
            amount,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: &'a SighashCache) -> Self {
        self.cache = Some(cache);
        self
    }

    fn check_sig(
        &self,
        sig_bytes: &[u8],
        pubkey_bytes: &[u8],
        script_code: &[u8],
        sigversion: SigVersion,
    ) -> bool {
        let Ok(pubkey) = PublicKey::from_slice(pubkey_bytes) else {
            return false;
        };
        let Some((&hash_type, der)) = sig_bytes.split_last() else {
            return false;
        };
        let Ok(mut sig) = Signature::from_der_lax(der) else {
            btcnode_log::log_trace!(
                "unparseable signature (len {}): {}",
                sig_bytes.len(),
                bytes_to_hex(sig_bytes)
            );
            return false;
        };
        // libsecp256k1 only accepts low-S signatures.
        sig.normalize_s();

        let sighash = signature_hash(
            self.tx,
            self.input_index,
            script_code,
            self.amount,
            SighashType(hash_type as u32),
            sigversion,
            self.cache,
        );
        let msg = Message::from_digest(sighash);
        secp256k1_verify().verify_ecdsa(&msg, &sig, &pubkey).is_ok()
    }

    fn check_lock_time(&self, lock_time: i64) -> bool {
        let threshold = LOCKTIME_THRESHOLD as i64;
        let tx_lock_time = self.tx.lock_time as i64;
        if !((tx_lock_time < threshold && lock_time < threshold)
            || (tx_lock_time >= threshold && lock_time >= threshold))
        {
            return false;
        }
        if lock_time > tx_lock_time {
            return false;
        }
        // A final input would bypass the lock time entirely.
        self.tx.vin[self.input_index].sequence != SEQUENCE_FINAL
    }

    fn check_sequence(&self, sequence: i64) -> bool {
        let tx_sequence = self.tx.vin[self.input_index].sequence as i64;
        if self.tx.version < 2 {
            return false;
        }
        if tx_sequence & SEQUENCE_LOCK_TIME_DISABLED as i64 != 0 {
            return false;
        }
        let mask = (SEQUENCE_LOCK_TIME_IS_SECONDS | SEQUENCE_LOCK_TIME_MASK) as i64;
        let type_flag = SEQUENCE_LOCK_TIME_IS_SECONDS as i64;
        let tx_masked = tx_sequence & mask;
        let masked = sequence & mask;
        if !((tx_masked < type_flag && masked < type_flag)
            || (tx_masked >= type_flag && masked >= type_flag))
        {
            return false;
        }
        masked <= tx_masked
    }
}

pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    witness: &[Vec<u8>],
    flags: ScriptFlags,
    checker: &TransactionSignatureChecker<'_>,
) -> Result<(), ScriptError> {
    if (flags & SCRIPT_VERIFY_SIGPUSHONLY) != 0 && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let mut stack = Vec::new();
    eval_script(&mut stack, script_sig, flags, checker, SigVersion::Base)?;
    let stack_copy = if (flags & SCRIPT_VERIFY_P2SH) != 0 {
        stack.clone()
    } else {
        Vec::new()
    };
    eval_script(&mut stack, script_pubkey, flags, checker, SigVersion::Base)?;
    if !stack.last().is_some_and(|top| cast_to_bool(top)) {
        return Err(ScriptError::EvalFalse);
    }

    let mut had_witness = false;
    if (flags & SCRIPT_VERIFY_WITNESS) != 0 {
        if let Some((version, program)) = extract_witness_program(script_pubkey) {
            had_witness = true;
            if !script_sig.is_empty() {
                return Err(ScriptError::WitnessMalleated);
            }
            verify_witness_program(witness, version, program, flags, checker)?;
            // Witness execution already enforced a clean stack.
            stack.truncate(1);
        }
    }

    if (flags & SCRIPT_VERIFY_P2SH) != 0 && is_p2sh(script_pubkey) {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        stack = stack_copy;
        let redeem_script = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
        eval_script(&mut stack, &redeem_script, flags, checker, SigVersion::Base)?;
        if !stack.last().is_some_and(|top| cast_to_bool(top)) {
            return Err(ScriptError::EvalFalse);
        }

        if (flags & SCRIPT_VERIFY_WITNESS) != 0 {
            if let Some((version, program)) = extract_witness_program(&redeem_script) {
                had_witness = true;
                if script_sig != push_data_script(&redeem_script).as_slice() {
                    return Err(ScriptError::WitnessMalleatedP2sh);
                }
                verify_witness_program(witness, version, program, flags, checker)?;
                stack.truncate(1);
            }
        }
    }

    if (flags & SCRIPT_VERIFY_CLEANSTACK) != 0 && stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }

    if (flags & SCRIPT_VERIFY_WITNESS) != 0 && !had_witness && !witness.is_empty() {
        return Err(ScriptError::WitnessUnexpected);
    }

    Ok(())
}

fn verify_witness_program(
    witness: &[Vec<u8>],
    version: u8,
    program: &[u8],
    flags: ScriptFlags,
    checker: &TransactionSignatureChecker<'_>,
) -> Result<(), ScriptError> {
    if version != 0 {
        if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM) != 0 {
            return Err(ScriptError::DiscourageUpgradableWitnessProgram);
        }
        return Ok(());
    }

    let (mut stack, script) = match program.len() {
        32 => {
            let (witness_script, rest) = witness
                .split_last()
                .ok_or(ScriptError::WitnessProgramWitnessEmpty)?;
            if sha256(witness_script).as_slice() != program {
                return Err(ScriptError::WitnessProgramMismatch);
            }
            (rest.to_vec(), witness_script.clone())
        }
        20 => {
            if witness.len() != 2 {
                return Err(ScriptError::WitnessProgramMismatch);
            }
            let mut script = Vec::with_capacity(25);
            script.extend_from_slice(&[OP_DUP, OP_HASH160, 0x14]);
            script.extend_from_slice(program);
            script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
            (witness.to_vec(), script)
        }
        _ => return Err(ScriptError::WitnessProgramWrongLength),
    };

    if stack.iter().any(|item| item.len() > MAX_SCRIPT_ELEMENT_SIZE) {
        return Err(ScriptError::PushSize);
    }

    eval_script(&mut stack, &script, flags, checker, SigVersion::WitnessV0)?;
    if stack.len() != 1 || !cast_to_bool(&stack[0]) {
        return Err(ScriptError::EvalFalse);
    }
    Ok(())
}

fn is_valid_signature_encoding(sig: &[u8]) -> bool {
    // Format: 0x30 [total-length] 0x02 [R-length] [R] 0x02 [S-length] [S] [sighash]
    if sig.len() < 9 || sig.len() > 73 {
        return false;
    }
    if sig[0] != 0x30 || sig[1] as usize != sig.len() - 3 {
        return false;
    }
    let len_r = sig[3] as usize;
    if 5 + len_r >= sig.len() {
        return false;
    }
    let len_s = sig[5 + len_r] as usize;
    if len_r + len_s + 7 != sig.len() {
        return false;
    }
    if sig[2] != 0x02 || len_r == 0 || (sig[4] & 0x80) != 0 {
        return false;
    }
    if len_r > 1 && sig[4] == 0x00 && (sig[5] & 0x80) == 0 {
        return false;
    }
    if sig[len_r + 4] != 0x02 || len_s == 0 || (sig[len_r + 6] & 0x80) != 0 {
        return false;
    }
    if len_s > 1 && sig[len_r + 6] == 0x00 && (sig[len_r + 7] & 0x80) == 0 {
        return false;
    }
    true
}

fn is_low_der_signature(sig: &[u8]) -> bool {
    let der = &sig[..sig.len() - 1];
    match Signature::from_der_lax(der) {
        Ok(parsed) => {
            let mut normalized = parsed;
            normalized.normalize_s();
            normalized == parsed
        }
        Err(_) => false,
    }
}

fn check_signature_encoding(sig: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    // An empty signature is a compact way to provide an invalid one.
    if sig.is_empty() {
        return Ok(());
    }
    if (flags & (SCRIPT_VERIFY_DERSIG | SCRIPT_VERIFY_LOW_S | SCRIPT_VERIFY_STRICTENC)) != 0
        && !is_valid_signature_encoding(sig)
    {
        return Err(ScriptError::SigDer);
    }
    if (flags & SCRIPT_VERIFY_LOW_S) != 0 && !is_low_der_signature(sig) {
        return Err(ScriptError::SigHighS);
    }
    if (flags & SCRIPT_VERIFY_STRICTENC) != 0 {
        let hash_type = SighashType(sig[sig.len() - 1] as u32);
        if !hash_type.is_defined() {
            return Err(ScriptError::SigHashType);
        }
    }
    Ok(())
}

fn check_pubkey_encoding(
    pubkey: &[u8],
    flags: ScriptFlags,
    sigversion: SigVersion,
) -> Result<(), ScriptError> {
    if (flags & SCRIPT_VERIFY_STRICTENC) != 0 && !is_compressed_or_uncompressed_pubkey(pubkey) {
        return Err(ScriptError::PubkeyType);
    }
    if (flags & SCRIPT_VERIFY_WITNESS_PUBKEYTYPE) != 0
        && sigversion == SigVersion::WitnessV0
        && !is_compressed_pubkey(pubkey)
    {
        return Err(ScriptError::WitnessPubkeyType);
    }
    Ok(())
}

type Stack = Vec<Vec<u8>>;

fn top(stack: &Stack, depth: usize) -> Result<&Vec<u8>, ScriptError> {
    if depth == 0 || stack.len() < depth {
        return Err(ScriptError::InvalidStackOperation);
    }
    Ok(&stack[stack.len() - depth])
}

fn pop(stack: &mut Stack) -> Result<Vec<u8>, ScriptError> {
    stack.pop().ok_or(ScriptError::InvalidStackOperation)
}

fn require(stack: &Stack, depth: usize) -> Result<(), ScriptError> {
    if stack.len() < depth {
        return Err(ScriptError::InvalidStackOperation);
    }
    Ok(())
}

fn bool_to_vec(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

pub fn eval_script(
    stack: &mut Stack,
    script: &[u8],
    flags: ScriptFlags,
    checker: &TransactionSignatureChecker<'_>,
    sigversion: SigVersion,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }
    let require_minimal = (flags & SCRIPT_VERIFY_MINIMALDATA) != 0;
    let mut pc = 0usize;
    let mut code_start = 0usize;
    let mut exec_stack: Vec<bool> = Vec::new();
    let mut alt_stack: Stack = Vec::new();
    let mut op_count = 0usize;

    while pc < script.len() {
        let exec = !exec_stack.contains(&false);
        let instruction =
            read_instruction(script, &mut pc).map_err(|_| ScriptError::BadOpcode)?;
        let opcode = instruction.opcode;
        let data = instruction.data;

        if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
            return Err(ScriptError::PushSize);
        }
        if opcode > OP_16 {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }
        }
        // Disabled opcodes fail even in an unexecuted branch.
        if is_disabled(opcode) {
            return Err(ScriptError::DisabledOpcode);
        }

        if exec && opcode <= OP_PUSHDATA4 {
            if require_minimal && !is_minimal_push(data, opcode) {
                return Err(ScriptError::MinimalData);
            }
            stack.push(data.to_vec());
        } else if exec || (OP_IF..=OP_ENDIF).contains(&opcode) {
            match opcode {
                OP_1NEGATE | OP_1..=OP_16 => {
                    let value = if opcode == OP_1NEGATE {
                        -1
                    } else {
                        (opcode - OP_1 + 1) as i64
                    };
                    stack.push(encode_num(value));
                }

                OP_NOP => {}

                OP_CHECKLOCKTIMEVERIFY => {
                    if (flags & SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY) == 0 {
                        if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 {
                            return Err(ScriptError::DiscourageUpgradableNops);
                        }
                    } else {
                        let lock_time =
                            decode_num(top(stack, 1)?, require_minimal, LOCKTIME_MAX_NUM_SIZE)?;
                        if lock_time < 0 {
                            return Err(ScriptError::NegativeLocktime);
                        }
                        if !checker.check_lock_time(lock_time) {
                            return Err(ScriptError::UnsatisfiedLocktime);
                        }
                    }
                }

                OP_CHECKSEQUENCEVERIFY => {
                    if (flags & SCRIPT_VERIFY_CHECKSEQUENCEVERIFY) == 0 {
                        if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 {
                            return Err(ScriptError::DiscourageUpgradableNops);
                        }
                    } else {
                        let sequence =
                            decode_num(top(stack, 1)?, require_minimal, LOCKTIME_MAX_NUM_SIZE)?;
                        if sequence < 0 {
                            return Err(ScriptError::NegativeLocktime);
                        }
                        if sequence & SEQUENCE_LOCK_TIME_DISABLED as i64 == 0
                            && !checker.check_sequence(sequence)
                        {
                            return Err(ScriptError::UnsatisfiedLocktime);
                        }
                    }
                }

                OP_NOP1 | OP_NOP4..=OP_NOP10 => {
                    if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 {
                        return Err(ScriptError::DiscourageUpgradableNops);
                    }
                }

                OP_IF | OP_NOTIF => {
                    let mut value = false;
                    if exec {
                        let condition = top(stack, 1)
                            .map_err(|_| ScriptError::UnbalancedConditional)?;
                        if sigversion == SigVersion::WitnessV0
                            && (flags & SCRIPT_VERIFY_MINIMALIF) != 0
                            && (condition.len() > 1
                                || (condition.len() == 1 && condition[0] != 1))
                        {
                            return Err(ScriptError::MinimalIf);
                        }
                        value = cast_to_bool(condition);
                        if opcode == OP_NOTIF {
                            value = !value;
                        }
                        stack.pop();
                    }
                    exec_stack.push(value);
                }

                OP_ELSE => {
                    let last = exec_stack
                        .last_mut()
                        .ok_or(ScriptError::UnbalancedConditional)?;
                    *last = !*last;
                }

                OP_ENDIF => {
                    exec_stack
                        .pop()
                        .ok_or(ScriptError::UnbalancedConditional)?;
                }

                OP_VERIFY => {
                    if !cast_to_bool(top(stack, 1)?) {
                        return Err(ScriptError::Verify);
                    }
                    stack.pop();
                }

                OP_RETURN => return Err(ScriptError::OpReturn),

                OP_TOALTSTACK => {
                    let item = pop(stack)?;
                    alt_stack.push(item);
                }

                OP_FROMALTSTACK => {
                    let item = alt_stack
                        .pop()
                        .ok_or(ScriptError::InvalidAltstackOperation)?;
                    stack.push(item);
                }

                OP_2DROP => {
                    require(stack, 2)?;
                    stack.truncate(stack.len() - 2);
                }

                OP_2DUP => {
                    let a = top(stack, 2)?.clone();
                    let b = top(stack, 1)?.clone();
                    stack.push(a);
                    stack.push(b);
                }

                OP_3DUP => {
                    let a = top(stack, 3)?.clone();
                    let b = top(stack, 2)?.clone();
                    let c = top(stack, 1)?.clone();
                    stack.push(a);
                    stack.push(b);
                    stack.push(c);
                }

                OP_2OVER => {
                    let a = top(stack, 4)?.clone();
                    let b = top(stack, 3)?.clone();
                    stack.push(a);
                    stack.push(b);
                }

                OP_2ROT => {
                    require(stack, 6)?;
                    let start = stack.len() - 6;
                    let moved: Stack = stack.drain(start..start + 2).collect();
                    stack.extend(moved);
                }

                OP_2SWAP => {
                    require(stack, 4)?;
                    let len = stack.len();
                    stack.swap(len - 4, len - 2);
                    stack.swap(len - 3, len - 1);
                }

                OP_IFDUP => {
                    let item = top(stack, 1)?;
                    if cast_to_bool(item) {
                        let item = item.clone();
                        stack.push(item);
                    }
                }

                OP_DEPTH => {
                    let depth = stack.len() as i64;
                    stack.push(encode_num(depth));
                }

                OP_DROP => {
                    pop(stack)?;
                }

                OP_DUP => {
                    let item = top(stack, 1)?.clone();
                    stack.push(item);
                }

                OP_NIP => {
                    require(stack, 2)?;
                    let index = stack.len() - 2;
                    stack.remove(index);
                }

                OP_OVER => {
                    let item = top(stack, 2)?.clone();
                    stack.push(item);
                }

                OP_PICK | OP_ROLL => {
                    let n = decode_num(top(stack, 1)?, require_minimal, DEFAULT_MAX_NUM_SIZE)?;
                    stack.pop();
                    if n < 0 || n as usize >= stack.len() {
                        return Err(ScriptError::InvalidStackOperation);
                    }
                    let index = stack.len() - 1 - n as usize;
                    let item = if opcode == OP_ROLL {
                        stack.remove(index)
                    } else {
                        stack[index].clone()
                    };
                    stack.push(item);
                }

                OP_ROT => {
                    require(stack, 3)?;
                    let index = stack.len() - 3;
                    let item = stack.remove(index);
                    stack.push(item);
                }

                OP_SWAP => {
                    require(stack, 2)?;
                    let len = stack.len();
                    stack.swap(len - 2, len - 1);
                }

                OP_TUCK => {
                    require(stack, 2)?;
                    let item = top(stack, 1)?.clone();
                    let index = stack.len() - 2;
                    stack.insert(index, item);
                }

                OP_SIZE => {
                    let len = top(stack, 1)?.len() as i64;
                    stack.push(encode_num(len));
                }

                OP_EQUAL | OP_EQUALVERIFY => {
                    require(stack, 2)?;
                    let a = pop(stack)?;
                    let b = pop(stack)?;
                    let equal = a == b;
                    if opcode == OP_EQUALVERIFY {
                        if !equal {
                            return Err(ScriptError::EqualVerify);
                        }
                    } else {
                        stack.push(bool_to_vec(equal));
                    }
                }

                OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                    let n = decode_num(top(stack, 1)?, require_minimal, DEFAULT_MAX_NUM_SIZE)?;
                    let result = match opcode {
                        OP_1ADD => n + 1,
                        OP_1SUB => n - 1,
                        OP_NEGATE => -n,
                        OP_ABS => n.abs(),
                        OP_NOT => (n == 0) as i64,
                        _ => (n != 0) as i64,
                    };
                    stack.pop();
                    stack.push(encode_num(result));
                }

                OP_ADD | OP_SUB | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL | OP_NUMEQUALVERIFY
                | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN | OP_LESSTHANOREQUAL
                | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                    let a = decode_num(top(stack, 2)?, require_minimal, DEFAULT_MAX_NUM_SIZE)?;
                    let b = decode_num(top(stack, 1)?, require_minimal, DEFAULT_MAX_NUM_SIZE)?;
                    let result = match opcode {
                        OP_ADD => a + b,
                        OP_SUB => a - b,
                        OP_BOOLAND => (a != 0 && b != 0) as i64,
                        OP_BOOLOR => (a != 0 || b != 0) as i64,
                        OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                        OP_NUMNOTEQUAL => (a != b) as i64,
                        OP_LESSTHAN => (a < b) as i64,
                        OP_GREATERTHAN => (a > b) as i64,
                        OP_LESSTHANOREQUAL => (a <= b) as i64,
                        OP_GREATERTHANOREQUAL => (a >= b) as i64,
                        OP_MIN => a.min(b),
                        _ => a.max(b),
                    };
                    stack.truncate(stack.len() - 2);
                    if opcode == OP_NUMEQUALVERIFY {
                        if result == 0 {
                            return Err(ScriptError::NumEqualVerify);
                        }
                    } else {
                        stack.push(encode_num(result));
                    }
                }

                OP_WITHIN => {
                    let x = decode_num(top(stack, 3)?, require_minimal, DEFAULT_MAX_NUM_SIZE)?;
                    let min = decode_num(top(stack, 2)?, require_minimal, DEFAULT_MAX_NUM_SIZE)?;
                    let max = decode_num(top(stack, 1)?, require_minimal, DEFAULT_MAX_NUM_SIZE)?;
                    stack.truncate(stack.len() - 3);
                    stack.push(bool_to_vec(min <= x && x < max));
                }

                OP_RIPEMD160 | OP_SHA1 | OP_SHA256 | OP_HASH160 | OP_HASH256 => {
                    let item = pop(stack)?;
                    let digest = match opcode {
                        OP_RIPEMD160 => Ripemd160::digest(&item).to_vec(),
                        OP_SHA1 => Sha1::digest(&item).to_vec(),
                        OP_SHA256 => sha256(&item).to_vec(),
                        OP_HASH160 => hash160(&item).to_vec(),
                        _ => sha256d(&item).to_vec(),
                    };
                    stack.push(digest);
                }

                OP_CODESEPARATOR => {
                    code_start = pc;
                }

                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    require(stack, 2)?;
                    let sig = top(stack, 2)?.clone();
                    let pubkey = top(stack, 1)?.clone();

                    let mut script_code = script[code_start..].to_vec();
                    if sigversion == SigVersion::Base {
                        script_code = find_and_delete(&script_code, &push_data_script(&sig));
                    }
                    check_signature_encoding(&sig, flags)?;
                    check_pubkey_encoding(&pubkey, flags, sigversion)?;
                    let success = checker.check_sig(&sig, &pubkey, &script_code, sigversion);
                    if !success && (flags & SCRIPT_VERIFY_NULLFAIL) != 0 && !sig.is_empty() {
                        return Err(ScriptError::SigNullFail);
                    }

                    stack.truncate(stack.len() - 2);
                    if opcode == OP_CHECKSIGVERIFY {
                        if !success {
                            return Err(ScriptError::CheckSigVerify);
                        }
                    } else {
                        stack.push(bool_to_vec(success));
                    }
                }

                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    let mut i = 1usize;
                    let mut keys_count =
                        decode_num(top(stack, i)?, require_minimal, DEFAULT_MAX_NUM_SIZE)?;
                    if !(0..=MAX_PUBKEYS_PER_MULTISIG).contains(&keys_count) {
                        return Err(ScriptError::PubkeyCount);
                    }
                    op_count += keys_count as usize;
                    if op_count > MAX_OPS_PER_SCRIPT {
                        return Err(ScriptError::OpCount);
                    }
                    i += 1;
                    let mut key_index = i;
                    // Non-signature stack items to leave untouched by NULLFAIL.
                    let mut key_cleanup = keys_count as usize + 2;
                    i += keys_count as usize;
                    require(stack, i)?;

                    let mut sigs_count =
                        decode_num(top(stack, i)?, require_minimal, DEFAULT_MAX_NUM_SIZE)?;
                    if sigs_count < 0 || sigs_count > keys_count {
                        return Err(ScriptError::SigCount);
                    }
                    i += 1;
                    let mut sig_index = i;
                    i += sigs_count as usize;
                    require(stack, i)?;

                    let mut script_code = script[code_start..].to_vec();
                    if sigversion == SigVersion::Base {
                        for k in 0..sigs_count as usize {
                            let sig = top(stack, sig_index + k)?;
                            script_code = find_and_delete(&script_code, &push_data_script(sig));
                        }
                    }

                    let mut success = true;
                    while success && sigs_count > 0 {
                        let sig = top(stack, sig_index)?;
                        let pubkey = top(stack, key_index)?;
                        check_signature_encoding(sig, flags)?;
                        check_pubkey_encoding(pubkey, flags, sigversion)?;
                        if checker.check_sig(sig, pubkey, &script_code, sigversion) {
                            sig_index += 1;
                            sigs_count -= 1;
                        }
                        key_index += 1;
                        keys_count -= 1;
                        // More signatures left than keys means failure.
                        if sigs_count > keys_count {
                            success = false;
                        }
                    }

                    while i > 1 {
                        i -= 1;
                        if !success
                            && (flags & SCRIPT_VERIFY_NULLFAIL) != 0
                            && key_cleanup == 0
                            && !top(stack, 1)?.is_empty()
                        {
                            return Err(ScriptError::SigNullFail);
                        }
                        key_cleanup = key_cleanup.saturating_sub(1);
                        stack.pop();
                    }

                    // Historical off-by-one: one extra element is consumed.
                    let dummy = top(stack, 1)?;
                    if (flags & SCRIPT_VERIFY_NULLDUMMY) != 0 && !dummy.is_empty() {
                        return Err(ScriptError::SigNullDummy);
                    }
                    stack.pop();

                    if opcode == OP_CHECKMULTISIGVERIFY {
                        if !success {
                            return Err(ScriptError::CheckMultisigVerify);
                        }
                    } else {
                        stack.push(bool_to_vec(success));
                    }
                }

                _ => return Err(ScriptError::BadOpcode),
            }
        }

        if stack.len() + alt_stack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use btcnode_primitives::outpoint::OutPoint;
    use btcnode_primitives::transaction::{TxIn, TxOut};

    fn dummy_tx() -> Transaction {
        Transaction {
            version: 2,
            vin: vec![TxIn::new(OutPoint::new([3u8; 32], 0), Vec::new(), 10)],
            vout: vec![TxOut {
                value: 0,
                script_pubkey: Vec::new(),
            }],
            lock_time: 100,
        }
    }

    fn run(script: &[u8], flags: ScriptFlags) -> Result<Stack, ScriptError> {
        let tx = dummy_tx();
        let checker = TransactionSignatureChecker::new(&tx, 0, 0);
        let mut stack = Vec::new();
        eval_script(&mut stack, script, flags, &checker, SigVersion::Base)?;
        Ok(stack)
    }

    #[test]
    fn arithmetic_and_comparison() {
        let stack = run(&[OP_2, OP_16, OP_ADD, 0x01, 18, OP_NUMEQUAL], 0).expect("eval");
        assert_eq!(stack, vec![vec![1]]);
        let stack = run(&[OP_1, OP_2, OP_16, OP_WITHIN], 0).expect("eval");
        assert_eq!(stack, vec![Vec::<u8>::new()]);
        let stack = run(&[OP_1NEGATE, OP_ABS, OP_1, OP_EQUAL], 0).expect("eval");
        assert_eq!(stack, vec![vec![1]]);
    }

    #[test]
    fn stack_shuffles() {
        let stack = run(&[OP_1, OP_2, OP_3, OP_ROT], 0).expect("eval");
        assert_eq!(stack, vec![vec![2], vec![3], vec![1]]);
        let stack = run(&[OP_1, OP_2, OP_3, OP_2, OP_PICK], 0).expect("eval");
        assert_eq!(stack, vec![vec![1], vec![2], vec![3], vec![1]]);
        let stack = run(&[OP_1, OP_2, OP_3, OP_2, OP_ROLL], 0).expect("eval");
        assert_eq!(stack, vec![vec![2], vec![3], vec![1]]);
        let stack = run(&[OP_1, OP_2, OP_TUCK], 0).expect("eval");
        assert_eq!(stack, vec![vec![2], vec![1], vec![2]]);
        assert_eq!(run(&[OP_DROP], 0), Err(ScriptError::InvalidStackOperation));
        assert_eq!(
            run(&[OP_FROMALTSTACK], 0),
            Err(ScriptError::InvalidAltstackOperation)
        );
    }

    #[test]
    fn conditionals() {
        let stack = run(&[OP_0, OP_IF, OP_2, OP_ELSE, OP_1, OP_ENDIF], 0).expect("eval");
        assert_eq!(stack, vec![vec![1]]);
        assert_eq!(run(&[OP_1, OP_IF], 0), Err(ScriptError::UnbalancedConditional));
        assert_eq!(run(&[OP_ENDIF], 0), Err(ScriptError::UnbalancedConditional));
        // Unexecuted branches still reject disabled opcodes and OP_VERIF.
        assert_eq!(
            run(&[OP_0, OP_IF, OP_CAT, OP_ENDIF], 0),
            Err(ScriptError::DisabledOpcode)
        );
        assert_eq!(
            run(&[OP_0, OP_IF, OP_VERIF, OP_ENDIF], 0),
            Err(ScriptError::BadOpcode)
        );
        // ...but not OP_RETURN or reserved opcodes.
        run(&[OP_0, OP_IF, OP_RETURN, OP_RESERVED, OP_ENDIF], 0).expect("skipped");
    }

    #[test]
    fn op_return_and_verify() {
        assert_eq!(run(&[OP_RETURN], 0), Err(ScriptError::OpReturn));
        assert_eq!(run(&[OP_0, OP_VERIFY], 0), Err(ScriptError::Verify));
        assert_eq!(run(&[OP_1, OP_2, OP_EQUALVERIFY], 0), Err(ScriptError::EqualVerify));
    }

    #[test]
    fn minimal_data_is_enforced_by_flag() {
        let script = [0x01, 0x05];
        run(&script, 0).expect("lenient");
        assert_eq!(
            run(&script, SCRIPT_VERIFY_MINIMALDATA),
            Err(ScriptError::MinimalData)
        );
    }

    #[test]
    fn op_count_limit() {
        let mut script = vec![OP_1];
        script.extend(std::iter::repeat(OP_NOP).take(MAX_OPS_PER_SCRIPT));
        run(&script, 0).expect("at limit");
        script.push(OP_NOP);
        assert_eq!(run(&script, 0), Err(ScriptError::OpCount));
    }

    #[test]
    fn lock_time_checks() {
        // tx lock time is 100 with a non-final sequence.
        run(&[0x01, 100, OP_CHECKLOCKTIMEVERIFY], SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY)
            .expect("satisfied");
        assert_eq!(
            run(&[0x01, 101, OP_CHECKLOCKTIMEVERIFY], SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY),
            Err(ScriptError::UnsatisfiedLocktime)
        );
        assert_eq!(
            run(&[OP_1NEGATE, OP_CHECKLOCKTIMEVERIFY], SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY),
            Err(ScriptError::NegativeLocktime)
        );
        // Without the flag it is a NOP.
        run(&[0x01, 101, OP_CHECKLOCKTIMEVERIFY], 0).expect("nop");
        assert_eq!(
            run(
                &[OP_1, OP_CHECKLOCKTIMEVERIFY],
                SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS
            ),
            Err(ScriptError::DiscourageUpgradableNops)
        );
        // Sequence 10 on the input, relative height lock of 10 is satisfied.
        run(&[0x01, 10, OP_CHECKSEQUENCEVERIFY], SCRIPT_VERIFY_CHECKSEQUENCEVERIFY)
            .expect("sequence satisfied");
        assert_eq!(
            run(&[0x01, 11, OP_CHECKSEQUENCEVERIFY], SCRIPT_VERIFY_CHECKSEQUENCEVERIFY),
            Err(ScriptError::UnsatisfiedLocktime)
        );
    }

    #[test]
    fn der_encoding_rules() {
        let mut sig = vec![0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x01, 0x01];
        assert!(is_valid_signature_encoding(&sig));
        // Negative R.
        sig[4] = 0x81;
        assert!(!is_valid_signature_encoding(&sig));
        // Wrong total length.
        let bad = vec![0x30, 0x07, 0x02, 0x01, 0x01, 0x02, 0x01, 0x01, 0x01];
        assert!(!is_valid_signature_encoding(&bad));
    }
}
