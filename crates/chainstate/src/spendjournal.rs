//! Per-block record of spent outputs, used to restore the UTXO set on disconnect.

use btcnode_primitives::block::Block;

use crate::compress::{
    append_vlq, compressed_txout_size, decode_compressed_txout, deserialize_vlq,
    serialize_size_vlq, write_compressed_txout,
};
use crate::error::DeserializeError;

/// Snapshot of an output taken at the moment a block spent it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpentTxOut {
    pub amount: i64,
    pub pk_script: Vec<u8>,
    pub height: i32,
    pub is_coinbase: bool,
}

impl SpentTxOut {
    fn header_code(&self) -> u64 {
        let mut code = (self.height as u64) << 1;
        if self.is_coinbase {
            code |= 0x01;
        }
        code
    }

    /// Serialized size including the reserved field written for non-zero heights.
    pub fn serialized_size(&self) -> usize {
        let mut size = serialize_size_vlq(self.header_code());
        if self.height > 0 {
            size += serialize_size_vlq(0);
        }
        size + compressed_txout_size(self.amount as u64, &self.pk_script)
    }

    fn write(&self, out: &mut Vec<u8>) {
        append_vlq(out, self.header_code());
        if self.height > 0 {
            // Legacy version field, always zero.
            append_vlq(out, 0);
        }
        write_compressed_txout(out, self.amount as u64, &self.pk_script);
    }

    fn decode(bytes: &[u8]) -> Result<(Self, usize), DeserializeError> {
        if bytes.is_empty() {
            return Err(DeserializeError::new("no serialized bytes"));
        }
        let (code, mut offset) = deserialize_vlq(bytes);
        if offset >= bytes.len() {
            return Err(DeserializeError::new(
                "unexpected end of data after header code",
            ));
        }
        let is_coinbase = code & 0x01 != 0;
        let height = (code >> 1) as i32;
        if height > 0 {
            let (_, read) = deserialize_vlq(&bytes[offset..]);
            offset += read;
            if offset >= bytes.len() {
                return Err(DeserializeError::new(
                    "unexpected end of data after reserved",
                ));
            }
        }
        let (amount, pk_script, read) = decode_compressed_txout(&bytes[offset..])
            .map_err(|err| DeserializeError::new(format!("unable to decode txout: {err}")))?;
        Ok((
            SpentTxOut {
                amount: amount as i64,
                pk_script,
                height,
                is_coinbase,
            },
            offset + read,
        ))
    }
}

/// Inputs spent by the block, which is every input outside the coinbase.
pub fn count_spent_outputs(block: &Block) -> usize {
    block
        .transactions
        .iter()
        .skip(1)
        .map(|tx| tx.vin.len())
        .sum()
}

/// Writes the records newest spend first, so disconnecting can pop them in order.
pub fn serialize_spend_journal_entry(stxos: &[SpentTxOut]) -> Vec<u8> {
    if stxos.is_empty() {
        return Vec::new();
    }
    let size = stxos.iter().map(SpentTxOut::serialized_size).sum();
    let mut out = Vec::with_capacity(size);
    for stxo in stxos.iter().rev() {
        stxo.write(&mut out);
    }
    out
}

/// Rebuilds the spent outputs in block order. The format is not self-describing;
/// the block supplies how many records exist and what they belong to.
pub fn deserialize_spend_journal_entry(
    bytes: &[u8],
    block: &Block,
) -> Result<Vec<SpentTxOut>, DeserializeError> {
    let count = count_spent_outputs(block);
    if bytes.is_empty() {
        if count != 0 {
            return Err(DeserializeError::new(format!(
                "missing spend journal data for a block with {count} spends"
            )));
        }
        return Ok(Vec::new());
    }

    let mut reversed = Vec::with_capacity(count);
    let mut offset = 0usize;
    for tx in block.transactions.iter().skip(1).rev() {
        for input in tx.vin.iter().rev() {
            let remaining = bytes.get(offset..).unwrap_or_default();
            let (stxo, read) = SpentTxOut::decode(remaining).map_err(|err| {
                DeserializeError::new(format!("unable to decode stxo for {}: {err}", input.prevout))
            })?;
            offset += read;
            reversed.push(stxo);
        }
    }
    reversed.reverse();
    Ok(reversed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use btcnode_primitives::block::BlockHeader;
    use btcnode_primitives::outpoint::OutPoint;
    use btcnode_primitives::transaction::{Transaction, TxIn, TxOut};

    fn p2pkh(tag: u8) -> Vec<u8> {
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&[tag; 20]);
        script.extend_from_slice(&[0x88, 0xac]);
        script
    }

    fn spending(inputs: &[(u8, u32)]) -> Transaction {
        Transaction {
            version: 1,
            vin: inputs
                .iter()
                .map(|(tag, index)| TxIn::new(OutPoint::new([*tag; 32], *index), Vec::new(), u32::MAX))
                .collect(),
            vout: vec![TxOut {
                value: 1,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn block(txs: Vec<Transaction>) -> Block {
        let coinbase = Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::null(), vec![0x51, 0x51], u32::MAX)],
            vout: vec![TxOut {
                value: 50,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };
        let mut transactions = vec![coinbase];
        transactions.extend(txs);
        Block {
            header: BlockHeader {
                version: 1,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                time: 0,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            transactions,
        }
    }

    #[test]
    fn journal_restores_block_order() {
        let block = block(vec![spending(&[(1, 0), (2, 3)]), spending(&[(3, 1)])]);
        let stxos = vec![
            SpentTxOut {
                amount: 5_000_000_000,
                pk_script: p2pkh(1),
                height: 9,
                is_coinbase: true,
            },
            SpentTxOut {
                amount: 1_234,
                pk_script: vec![0x6a, 0x01, 0x02],
                height: 0,
                is_coinbase: false,
            },
            SpentTxOut {
                amount: 0,
                pk_script: p2pkh(3),
                height: 120_000,
                is_coinbase: false,
            },
        ];
        let bytes = serialize_spend_journal_entry(&stxos);
        assert_eq!(
            bytes.len(),
            stxos.iter().map(SpentTxOut::serialized_size).sum::<usize>()
        );
        let decoded = deserialize_spend_journal_entry(&bytes, &block).expect("decode");
        assert_eq!(decoded, stxos);
    }

    #[test]
    fn journal_is_written_newest_first() {
        let block = block(vec![spending(&[(1, 0)]), spending(&[(2, 0)])]);
        let first = SpentTxOut {
            amount: 1,
            pk_script: vec![0x51],
            height: 1,
            is_coinbase: false,
        };
        let second = SpentTxOut {
            amount: 2,
            pk_script: vec![0x52],
            height: 2,
            is_coinbase: false,
        };
        let bytes = serialize_spend_journal_entry(&[first.clone(), second.clone()]);
        // Header code 2 << 1 = 4, then the reserved zero.
        assert_eq!(&bytes[..2], &[0x04, 0x00]);
        let decoded = deserialize_spend_journal_entry(&bytes, &block).expect("decode");
        assert_eq!(decoded, vec![first, second]);
    }

    #[test]
    fn empty_journal_needs_a_block_without_spends() {
        let coinbase_only = block(Vec::new());
        assert!(deserialize_spend_journal_entry(&[], &coinbase_only)
            .expect("empty")
            .is_empty());
        assert!(serialize_spend_journal_entry(&[]).is_empty());

        let with_spend = block(vec![spending(&[(1, 0)])]);
        assert!(deserialize_spend_journal_entry(&[], &with_spend).is_err());
    }

    #[test]
    fn truncated_journal_is_rejected() {
        let block = block(vec![spending(&[(1, 0), (2, 0)])]);
        let stxo = SpentTxOut {
            amount: 100,
            pk_script: p2pkh(7),
            height: 3,
            is_coinbase: false,
        };
        let bytes = serialize_spend_journal_entry(&[stxo.clone(), stxo]);
        let err = deserialize_spend_journal_entry(&bytes[..bytes.len() - 1], &block)
            .expect_err("truncated");
        assert!(err.to_string().contains("unable to decode stxo"));
        // Header code with nothing after it.
        assert!(SpentTxOut::decode(&[0x06]).is_err());
        assert!(SpentTxOut::decode(&[]).is_err());
    }
}
