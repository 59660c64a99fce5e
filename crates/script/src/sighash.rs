//! Signature hashing: the original algorithm and the BIP143 witness v0 digest.

use btcnode_consensus::Hash256;
use btcnode_primitives::encoding::{Encodable, Encoder};
use btcnode_primitives::hash::sha256d;
use btcnode_primitives::transaction::{Transaction, TxOut};

use crate::parse::strip_code_separators;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SighashType(pub u32);

impl SighashType {
    pub fn base_type(self) -> u32 {
        self.0 & 0x1f
    }

    pub fn has_anyone_can_pay(self) -> bool {
        (self.0 & SIGHASH_ANYONECANPAY) != 0
    }

    /// Whether the type is one of the six defined combinations.
    pub fn is_defined(self) -> bool {
        let base = self.0 & !SIGHASH_ANYONECANPAY;
        (SIGHASH_ALL..=SIGHASH_SINGLE).contains(&base)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SigVersion {
    Base,
    WitnessV0,
}

/// Digest returned by the original algorithm for out-of-range inputs.
pub const SIGHASH_ONE: Hash256 = {
    let mut one = [0u8; 32];
    one[0] = 1;
    one
};

/// Per-transaction BIP143 midstate, shared by every input of one transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SighashCache {
    pub hash_prevouts: Hash256,
    pub hash_sequence: Hash256,
    pub hash_outputs: Hash256,
}

impl SighashCache {
    pub fn new(tx: &Transaction) -> Self {
        Self {
            hash_prevouts: hash_prevouts(tx),
            hash_sequence: hash_sequence(tx),
            hash_outputs: hash_outputs(&tx.vout),
        }
    }
}

fn hash_prevouts(tx: &Transaction) -> Hash256 {
    let mut encoder = Encoder::with_capacity(tx.vin.len() * 36);
    for input in &tx.vin {
        input.prevout.consensus_encode(&mut encoder);
    }
    sha256d(&encoder.into_inner())
}

fn hash_sequence(tx: &Transaction) -> Hash256 {
    let mut encoder = Encoder::with_capacity(tx.vin.len() * 4);
    for input in &tx.vin {
        encoder.write_u32_le(input.sequence);
    }
    sha256d(&encoder.into_inner())
}

fn hash_outputs(outputs: &[TxOut]) -> Hash256 {
    let mut encoder = Encoder::new();
    for output in outputs {
        output.consensus_encode(&mut encoder);
    }
    sha256d(&encoder.into_inner())
}

pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    amount: i64,
    sighash_type: SighashType,
    sigversion: SigVersion,
    cache: Option<&SighashCache>,
) -> Hash256 {
    match sigversion {
        SigVersion::Base => legacy_signature_hash(tx, input_index, script_code, sighash_type),
        SigVersion::WitnessV0 => {
            witness_v0_signature_hash(tx, input_index, script_code, amount, sighash_type, cache)
        }
    }
}

pub fn legacy_signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    sighash_type: SighashType,
) -> Hash256 {
    if input_index >= tx.vin.len() {
        return SIGHASH_ONE;
    }
    let hash_single = sighash_type.base_type() == SIGHASH_SINGLE;
    let hash_none = sighash_type.base_type() == SIGHASH_NONE;
    if hash_single && input_index >= tx.vout.len() {
        return SIGHASH_ONE;
    }
    let anyone_can_pay = sighash_type.has_anyone_can_pay();
    let script_code = strip_code_separators(script_code);

    let mut encoder = Encoder::with_capacity(tx.stripped_size() + script_code.len() + 4);
    encoder.write_i32_le(tx.version);

    let inputs: Vec<usize> = if anyone_can_pay {
        vec![input_index]
    } else {
        (0..tx.vin.len()).collect()
    };
    encoder.write_varint(inputs.len() as u64);
    for idx in inputs {
        let input = &tx.vin[idx];
        input.prevout.consensus_encode(&mut encoder);
        let is_signing = idx == input_index;
        if is_signing {
            encoder.write_var_bytes(&script_code);
        } else {
            encoder.write_varint(0);
        }
        if !is_signing && (hash_single || hash_none) {
            encoder.write_u32_le(0);
        } else {
            encoder.write_u32_le(input.sequence);
        }
    }

    let output_count = if hash_none {
        0
    } else if hash_single {
        input_index + 1
    } else {
        tx.vout.len()
    };
    encoder.write_varint(output_count as u64);
    for idx in 0..output_count {
        if hash_single && idx != input_index {
            encoder.write_i64_le(-1);
            encoder.write_varint(0);
        } else {
            tx.vout[idx].consensus_encode(&mut encoder);
        }
    }

    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(sighash_type.0);
    sha256d(&encoder.into_inner())
}

pub fn witness_v0_signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    amount: i64,
    sighash_type: SighashType,
    cache: Option<&SighashCache>,
) -> Hash256 {
    let Some(input) = tx.vin.get(input_index) else {
        return SIGHASH_ONE;
    };
    let anyone_can_pay = sighash_type.has_anyone_can_pay();
    let base = sighash_type.base_type();
    let owned;
    let cache = match cache {
        Some(cache) => cache,
        None => {
            owned = SighashCache::new(tx);
            &owned
        }
    };

    let zero = [0u8; 32];
    let prevouts = if anyone_can_pay {
        zero
    } else {
        cache.hash_prevouts
    };
    let sequence = if anyone_can_pay || base == SIGHASH_SINGLE || base == SIGHASH_NONE {
        zero
    } else {
        cache.hash_sequence
    };
    let outputs = if base != SIGHASH_SINGLE && base != SIGHASH_NONE {
        cache.hash_outputs
    } else if base == SIGHASH_SINGLE && input_index < tx.vout.len() {
        hash_outputs(&tx.vout[input_index..=input_index])
    } else {
        zero
    };

    let mut encoder = Encoder::with_capacity(156 + script_code.len());
    encoder.write_i32_le(tx.version);
    encoder.write_bytes(&prevouts);
    encoder.write_bytes(&sequence);
    input.prevout.consensus_encode(&mut encoder);
    encoder.write_var_bytes(script_code);
    encoder.write_i64_le(amount);
    encoder.write_u32_le(input.sequence);
    encoder.write_bytes(&outputs);
    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(sighash_type.0);
    sha256d(&encoder.into_inner())
}
