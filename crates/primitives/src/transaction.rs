//! Transaction types and serialization (BIP144 witness aware).

use btcnode_consensus::Hash256;

use crate::encoding::{varint_len, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

const WITNESS_MARKER: u8 = 0x00;
const WITNESS_FLAG: u8 = 0x01;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    /// Witness stack; serialized separately from the input itself.
    pub witness: Vec<Vec<u8>>,
}

impl TxIn {
    pub fn new(prevout: OutPoint, script_sig: Vec<u8>, sequence: u32) -> Self {
        Self {
            prevout,
            script_sig,
            sequence,
            witness: Vec::new(),
        }
    }

    fn serialized_size(&self) -> usize {
        OutPoint::SIZE + varint_len(self.script_sig.len() as u64) + self.script_sig.len() + 4
    }

    fn witness_size(&self) -> usize {
        varint_len(self.witness.len() as u64)
            + self
                .witness
                .iter()
                .map(|item| varint_len(item.len() as u64) + item.len())
                .sum::<usize>()
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
            witness: Vec::new(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn serialized_size(&self) -> usize {
        8 + varint_len(self.script_pubkey.len() as u64) + self.script_pubkey.len()
    }
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn has_witness(&self) -> bool {
        self.vin.iter().any(|input| !input.witness.is_empty())
    }

    /// Hash of the witness-stripped serialization.
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.encode_stripped())
    }

    /// Hash of the full serialization; equals `txid` without witness data.
    pub fn wtxid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.serialized_size());
        self.encode_into(&mut encoder, self.has_witness());
        encoder.into_inner()
    }

    pub fn encode_stripped(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.stripped_size());
        self.encode_into(&mut encoder, false);
        encoder.into_inner()
    }

    pub fn encode_into(&self, encoder: &mut Encoder, include_witness: bool) {
        encoder.write_i32_le(self.version);
        if include_witness {
            encoder.write_u8(WITNESS_MARKER);
            encoder.write_u8(WITNESS_FLAG);
        }
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(encoder);
        }
        if include_witness {
            for input in &self.vin {
                encoder.write_varint(input.witness.len() as u64);
                for item in &input.witness {
                    encoder.write_var_bytes(item);
                }
            }
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn stripped_size(&self) -> usize {
        4 + varint_len(self.vin.len() as u64)
            + self.vin.iter().map(TxIn::serialized_size).sum::<usize>()
            + varint_len(self.vout.len() as u64)
            + self.vout.iter().map(TxOut::serialized_size).sum::<usize>()
            + 4
    }

    pub fn serialized_size(&self) -> usize {
        let mut size = self.stripped_size();
        if self.has_witness() {
            size += 2 + self.vin.iter().map(TxIn::witness_size).sum::<usize>();
        }
        size
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, TransactionDecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(TransactionDecodeError::Decode(DecodeError::TrailingBytes));
        }
        Ok(tx)
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, TransactionDecodeError> {
        let version = decoder.read_i32_le()?;
        let mut input_count = decoder.read_varint()?;
        let mut has_witness = false;
        if input_count == 0 {
            // Either an empty input list or the segwit marker.
            let flag = decoder.read_u8()?;
            if flag != WITNESS_FLAG {
                return Err(TransactionDecodeError::InvalidTransactionFormat(
                    "unknown witness flag",
                ));
            }
            has_witness = true;
            input_count = decoder.read_varint()?;
        }

        let input_count = usize::try_from(input_count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut vin = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            vin.push(TxIn::consensus_decode(decoder)?);
        }
        let output_count = decoder.read_count()?;
        let mut vout = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            vout.push(TxOut::consensus_decode(decoder)?);
        }

        if has_witness {
            for input in vin.iter_mut() {
                let items = decoder.read_count()?;
                let mut witness = Vec::with_capacity(items.min(64));
                for _ in 0..items {
                    witness.push(decoder.read_var_bytes()?);
                }
                input.witness = witness;
            }
            if vin.iter().all(|input| input.witness.is_empty()) {
                return Err(TransactionDecodeError::InvalidTransactionFormat(
                    "superfluous witness record",
                ));
            }
        }

        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}

#[derive(Debug)]
pub enum TransactionDecodeError {
    Decode(DecodeError),
    InvalidTransactionFormat(&'static str),
}

impl From<DecodeError> for TransactionDecodeError {
    fn from(error: DecodeError) -> Self {
        TransactionDecodeError::Decode(error)
    }
}

impl std::fmt::Display for TransactionDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionDecodeError::Decode(error) => write!(f, "{error}"),
            TransactionDecodeError::InvalidTransactionFormat(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for TransactionDecodeError {}
