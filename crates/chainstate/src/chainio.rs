//! Record layouts of the chain-state columns and the reads and writes over them.

use btcnode_consensus::{hash256_to_hex, Hash256};
use btcnode_pow::U256;
use btcnode_primitives::block::{Block, BlockHeader, HEADER_SIZE};
use btcnode_primitives::outpoint::OutPoint;
use btcnode_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::blockindex::decode_block_index_value;
use crate::blocknode::BlockStatus;
use crate::compress::{
    append_vlq, compressed_txout_size, decode_compressed_txout, deserialize_vlq,
    serialize_size_vlq, write_compressed_txout,
};
use crate::error::{corruption, ChainError, DeserializeError};
use crate::spendjournal::{
    deserialize_spend_journal_entry, serialize_spend_journal_entry, SpentTxOut,
};
use crate::utxoviewpoint::{UtxoEntry, UtxoViewpoint};

/// Layout version of the store. Bumped whenever a record format changes.
pub const DB_VERSION: u32 = 1;

const META_CHAIN_STATE_KEY: &[u8] = b"chainstate";
const META_DB_VERSION_KEY: &[u8] = b"dbversion";

/// hash + height + total txns + work length, before the work bytes.
const BEST_CHAIN_STATE_MIN_LEN: usize = 32 + 4 + 8 + 4;

pub fn outpoint_key(outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + serialize_size_vlq(u64::from(outpoint.index)));
    key.extend_from_slice(&outpoint.hash);
    append_vlq(&mut key, u64::from(outpoint.index));
    key
}

fn utxo_header_code(entry: &UtxoEntry) -> u64 {
    let mut code = (entry.block_height() as u64) << 1;
    if entry.is_coinbase() {
        code |= 0x01;
    }
    code
}

/// Spent entries have no stored form.
pub fn serialize_utxo_entry(entry: &UtxoEntry) -> Option<Vec<u8>> {
    if entry.is_spent() {
        return None;
    }
    let code = utxo_header_code(entry);
    let mut out = Vec::with_capacity(
        serialize_size_vlq(code) + compressed_txout_size(entry.amount() as u64, entry.pk_script()),
    );
    append_vlq(&mut out, code);
    write_compressed_txout(&mut out, entry.amount() as u64, entry.pk_script());
    Some(out)
}

pub fn deserialize_utxo_entry(bytes: &[u8]) -> Result<UtxoEntry, DeserializeError> {
    let (code, offset) = deserialize_vlq(bytes);
    if offset >= bytes.len() {
        return Err(DeserializeError::new("unexpected end of data after header"));
    }
    let is_coinbase = code & 0x01 != 0;
    let height = (code >> 1) as i32;
    let (amount, pk_script, _) = decode_compressed_txout(&bytes[offset..])
        .map_err(|err| DeserializeError::new(format!("unable to decode utxo: {err}")))?;
    Ok(UtxoEntry::new(amount as i64, pk_script, height, is_coinbase))
}

pub fn fetch_utxo_entry<S: KeyValueStore + ?Sized>(
    store: &S,
    outpoint: &OutPoint,
) -> Result<Option<UtxoEntry>, ChainError> {
    let Some(bytes) = store.get(Column::Utxo, &outpoint_key(outpoint))? else {
        return Ok(None);
    };
    deserialize_utxo_entry(&bytes)
        .map(Some)
        .map_err(|err| corruption(format!("corrupt utxo entry for {outpoint}"), err))
}

/// Stages every modified entry of the view: spent ones are deleted, the rest rewritten.
pub fn put_utxo_view(batch: &mut WriteBatch, view: &UtxoViewpoint) {
    for (outpoint, entry) in view.entries() {
        let Some(entry) = entry else {
            continue;
        };
        if !entry.is_modified() {
            continue;
        }
        let key = outpoint_key(outpoint);
        match serialize_utxo_entry(entry) {
            Some(value) => batch.put(Column::Utxo, key, value),
            None => batch.delete(Column::Utxo, key),
        }
    }
}

pub fn put_spend_journal(batch: &mut WriteBatch, block_hash: &Hash256, stxos: &[SpentTxOut]) {
    batch.put(
        Column::SpendJournal,
        block_hash,
        serialize_spend_journal_entry(stxos),
    );
}

pub fn remove_spend_journal(batch: &mut WriteBatch, block_hash: &Hash256) {
    batch.delete(Column::SpendJournal, block_hash);
}

pub fn fetch_spend_journal<S: KeyValueStore + ?Sized>(
    store: &S,
    block: &Block,
) -> Result<Vec<SpentTxOut>, ChainError> {
    let hash = block.hash();
    let bytes = store
        .get(Column::SpendJournal, &hash)?
        .unwrap_or_default();
    deserialize_spend_journal_entry(&bytes, block).map_err(|err| {
        corruption(
            format!("corrupt spend information for block {}", hash256_to_hex(&hash)),
            err,
        )
    })
}

pub fn put_main_chain_index(batch: &mut WriteBatch, hash: &Hash256, height: i32) {
    let height_key = (height as u32).to_le_bytes();
    batch.put(Column::HashIndex, hash, height_key);
    batch.put(Column::HeightIndex, height_key, hash);
}

pub fn remove_main_chain_index(batch: &mut WriteBatch, hash: &Hash256, height: i32) {
    batch.delete(Column::HashIndex, hash);
    batch.delete(Column::HeightIndex, (height as u32).to_le_bytes());
}

pub fn fetch_height_by_hash<S: KeyValueStore + ?Sized>(
    store: &S,
    hash: &Hash256,
) -> Result<Option<i32>, ChainError> {
    let Some(bytes) = store.get(Column::HashIndex, hash)? else {
        return Ok(None);
    };
    let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
        corruption(
            format!("hash index entry for {}", hash256_to_hex(hash)),
            format!("expected 4 bytes, found {}", bytes.len()),
        )
    })?;
    Ok(Some(u32::from_le_bytes(raw) as i32))
}

pub fn fetch_hash_by_height<S: KeyValueStore + ?Sized>(
    store: &S,
    height: i32,
) -> Result<Option<Hash256>, ChainError> {
    let Some(bytes) = store.get(Column::HeightIndex, &(height as u32).to_le_bytes())? else {
        return Ok(None);
    };
    let hash: Hash256 = bytes.as_slice().try_into().map_err(|_| {
        corruption(
            format!("height index entry for {height}"),
            format!("expected 32 bytes, found {}", bytes.len()),
        )
    })?;
    Ok(Some(hash))
}

/// The persisted pointer to the best chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BestChainState {
    pub hash: Hash256,
    pub height: u32,
    pub total_txns: u64,
    pub work_sum: U256,
}

pub fn serialize_best_chain_state(state: &BestChainState) -> Vec<u8> {
    let work = state.work_sum.to_big_endian();
    // Leading zero bytes carry no information.
    let first = work.iter().position(|byte| *byte != 0).unwrap_or(work.len());
    let work = &work[first..];

    let mut out = Vec::with_capacity(BEST_CHAIN_STATE_MIN_LEN + work.len());
    out.extend_from_slice(&state.hash);
    out.extend_from_slice(&state.height.to_le_bytes());
    out.extend_from_slice(&state.total_txns.to_le_bytes());
    out.extend_from_slice(&(work.len() as u32).to_le_bytes());
    out.extend_from_slice(work);
    out
}

pub fn deserialize_best_chain_state(bytes: &[u8]) -> Result<BestChainState, DeserializeError> {
    if bytes.len() < BEST_CHAIN_STATE_MIN_LEN {
        return Err(DeserializeError::new(format!(
            "best chain state has {} bytes, expected at least {BEST_CHAIN_STATE_MIN_LEN}",
            bytes.len()
        )));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes[..32]);
    let height = u32::from_le_bytes([bytes[32], bytes[33], bytes[34], bytes[35]]);
    let mut total = [0u8; 8];
    total.copy_from_slice(&bytes[36..44]);
    let total_txns = u64::from_le_bytes(total);
    let work_len = u32::from_le_bytes([bytes[44], bytes[45], bytes[46], bytes[47]]) as usize;
    let work = bytes
        .get(BEST_CHAIN_STATE_MIN_LEN..BEST_CHAIN_STATE_MIN_LEN.saturating_add(work_len))
        .filter(|work| work.len() <= 32)
        .ok_or_else(|| DeserializeError::new("best chain state work sum is truncated"))?;
    Ok(BestChainState {
        hash,
        height,
        total_txns,
        work_sum: U256::from_big_endian(work),
    })
}

pub fn put_best_chain_state(batch: &mut WriteBatch, state: &BestChainState) {
    batch.put(
        Column::Meta,
        META_CHAIN_STATE_KEY,
        serialize_best_chain_state(state),
    );
}

pub fn fetch_best_chain_state<S: KeyValueStore + ?Sized>(
    store: &S,
) -> Result<Option<BestChainState>, ChainError> {
    let Some(bytes) = store.get(Column::Meta, META_CHAIN_STATE_KEY)? else {
        return Ok(None);
    };
    deserialize_best_chain_state(&bytes)
        .map(Some)
        .map_err(|err| corruption("corrupt best chain state", err))
}

pub fn put_db_version(batch: &mut WriteBatch) {
    batch.put(Column::Meta, META_DB_VERSION_KEY, DB_VERSION.to_le_bytes());
}

pub fn fetch_db_version<S: KeyValueStore + ?Sized>(store: &S) -> Result<Option<u32>, ChainError> {
    let Some(bytes) = store.get(Column::Meta, META_DB_VERSION_KEY)? else {
        return Ok(None);
    };
    let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
        corruption(
            "database version",
            format!("expected 4 bytes, found {}", bytes.len()),
        )
    })?;
    Ok(Some(u32::from_le_bytes(raw)))
}

/// Every block index record in height order, so parents precede children.
pub fn load_block_index_records<S: KeyValueStore + ?Sized>(
    store: &S,
) -> Result<Vec<(BlockHeader, BlockStatus)>, ChainError> {
    let mut records = Vec::new();
    let mut visitor = |_key: &[u8], value: &[u8]| -> Result<(), StoreError> {
        records.push(decode_block_index_value(value)?);
        Ok(())
    };
    store.for_each_prefix(Column::BlockIndex, &[], &mut visitor)?;
    Ok(records)
}

pub fn put_block(batch: &mut WriteBatch, block: &Block) {
    batch.put(Column::BlockData, block.hash(), block.consensus_encode());
}

pub fn store_block<S: KeyValueStore + ?Sized>(store: &S, block: &Block) -> Result<(), ChainError> {
    let mut batch = WriteBatch::new();
    put_block(&mut batch, block);
    store.write_batch(&batch)?;
    Ok(())
}

pub fn has_block<S: KeyValueStore + ?Sized>(store: &S, hash: &Hash256) -> Result<bool, ChainError> {
    Ok(store.contains(Column::BlockData, hash)?)
}

pub fn fetch_block<S: KeyValueStore + ?Sized>(
    store: &S,
    hash: &Hash256,
) -> Result<Option<Block>, ChainError> {
    let Some(bytes) = store.get(Column::BlockData, hash)? else {
        return Ok(None);
    };
    Block::consensus_decode(&bytes)
        .map(Some)
        .map_err(|err| corruption(format!("corrupt block {}", hash256_to_hex(hash)), err))
}

pub fn fetch_block_header<S: KeyValueStore + ?Sized>(
    store: &S,
    hash: &Hash256,
) -> Result<Option<BlockHeader>, ChainError> {
    let Some(bytes) = fetch_block_region(store, hash, 0, HEADER_SIZE)? else {
        return Ok(None);
    };
    BlockHeader::consensus_decode(&bytes)
        .map(Some)
        .map_err(|err| corruption(format!("corrupt block header {}", hash256_to_hex(hash)), err))
}

/// `len` bytes of the serialized block starting at `offset`.
pub fn fetch_block_region<S: KeyValueStore + ?Sized>(
    store: &S,
    hash: &Hash256,
    offset: usize,
    len: usize,
) -> Result<Option<Vec<u8>>, ChainError> {
    let Some(bytes) = store.get(Column::BlockData, hash)? else {
        return Ok(None);
    };
    let end = offset.checked_add(len).filter(|end| *end <= bytes.len());
    match end {
        Some(end) => Ok(Some(bytes[offset..end].to_vec())),
        None => Err(ChainError::InvalidRequest(format!(
            "block region {offset}+{len} exceeds block {} of {} bytes",
            hash256_to_hex(hash),
            bytes.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btcnode_consensus::{consensus_params, Network};
    use btcnode_primitives::genesis_block;
    use btcnode_storage::memory::MemoryStore;

    #[test]
    fn utxo_keys_use_vlq_index() {
        let key = outpoint_key(&OutPoint::new([0xaa; 32], 300));
        assert_eq!(key.len(), 34);
        assert_eq!(&key[32..], &[0x81, 0x2c]);
    }

    #[test]
    fn utxo_entry_layout() {
        // Coinbase output of mainnet block 1: height 1, 50 BTC to an uncompressed key.
        let pk_script = btcnode_primitives::hex::hex_to_bytes(
            "410496b538e853519c726a2c91e61ec11600ae1390813a627c66fb8be7947be63c52da7589379515d4e0a604f8141781e62294721166bf621e73a82cbf2342c858eeac",
        )
        .expect("hex");
        let entry = UtxoEntry::new(5_000_000_000, pk_script.clone(), 1, true);
        let bytes = serialize_utxo_entry(&entry).expect("unspent");
        // Header code 3, amount code 50, then tag 4 for an even-y key.
        assert_eq!(&bytes[..3], &[0x03, 0x32, 0x04]);
        assert_eq!(bytes.len(), 3 + 32);
        let decoded = deserialize_utxo_entry(&bytes).expect("decode");
        assert_eq!(decoded.amount(), 5_000_000_000);
        assert_eq!(decoded.pk_script(), pk_script.as_slice());
        assert_eq!(decoded.block_height(), 1);
        assert!(decoded.is_coinbase());

        let mut spent = entry;
        spent.spend();
        assert!(serialize_utxo_entry(&spent).is_none());
        assert!(deserialize_utxo_entry(&[0x03]).is_err());
        assert!(deserialize_utxo_entry(&[]).is_err());
    }

    #[test]
    fn corrupt_utxo_is_a_store_error() {
        let store = MemoryStore::new();
        let outpoint = OutPoint::new([1u8; 32], 0);
        let mut batch = WriteBatch::new();
        batch.put(Column::Utxo, outpoint_key(&outpoint), [0x02]);
        store.write_batch(&batch).expect("write");
        match fetch_utxo_entry(&store, &outpoint) {
            Err(ChainError::Store(StoreError::Corruption(message))) => {
                assert!(message.contains("corrupt utxo entry"))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(fetch_utxo_entry(&store, &OutPoint::new([2u8; 32], 0))
            .expect("read")
            .is_none());
    }

    #[test]
    fn best_chain_state_round_trip() {
        let state = BestChainState {
            hash: [0x11; 32],
            height: 123_456,
            total_txns: 9_876_543,
            work_sum: U256::from(0x0100_0100_0100u64),
        };
        let bytes = serialize_best_chain_state(&state);
        assert_eq!(bytes.len(), BEST_CHAIN_STATE_MIN_LEN + 6);
        assert_eq!(deserialize_best_chain_state(&bytes).expect("decode"), state);
        assert!(deserialize_best_chain_state(&bytes[..47]).is_err());
        assert!(deserialize_best_chain_state(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn main_chain_index_both_ways() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        put_main_chain_index(&mut batch, &[7u8; 32], 42);
        store.write_batch(&batch).expect("write");
        assert_eq!(fetch_height_by_hash(&store, &[7u8; 32]).expect("read"), Some(42));
        assert_eq!(fetch_hash_by_height(&store, 42).expect("read"), Some([7u8; 32]));

        let mut batch = WriteBatch::new();
        remove_main_chain_index(&mut batch, &[7u8; 32], 42);
        store.write_batch(&batch).expect("write");
        assert_eq!(fetch_height_by_hash(&store, &[7u8; 32]).expect("read"), None);
        assert_eq!(fetch_hash_by_height(&store, 42).expect("read"), None);
    }

    #[test]
    fn block_blobs() {
        let store = MemoryStore::new();
        let genesis = genesis_block(&consensus_params(Network::Regtest));
        let hash = genesis.hash();
        assert!(!has_block(&store, &hash).expect("has"));
        store_block(&store, &genesis).expect("store");
        assert!(has_block(&store, &hash).expect("has"));
        assert_eq!(fetch_block(&store, &hash).expect("fetch"), Some(genesis.clone()));
        assert_eq!(
            fetch_block_header(&store, &hash).expect("header"),
            Some(genesis.header)
        );
        let version = fetch_block_region(&store, &hash, 0, 4)
            .expect("region")
            .expect("present");
        assert_eq!(version, 1i32.to_le_bytes().to_vec());
        assert!(matches!(
            fetch_block_region(&store, &hash, 280, 10),
            Err(ChainError::InvalidRequest(_))
        ));
        assert!(fetch_block(&store, &[0u8; 32]).expect("fetch").is_none());
    }
}
