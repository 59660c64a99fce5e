//! Working set of unspent outputs as of one block.

use std::collections::{HashMap, HashSet};

use btcnode_consensus::Hash256;
use btcnode_primitives::block::Block;
use btcnode_primitives::outpoint::OutPoint;
use btcnode_primitives::transaction::Transaction;
use btcnode_script::standard::is_unspendable;
use btcnode_storage::KeyValueStore;

use crate::chainio::fetch_utxo_entry;
use crate::error::{assert_error, ChainError};
use crate::spendjournal::{count_spent_outputs, SpentTxOut};

const TFC_COINBASE: u8 = 1 << 0;
const TFC_SPENT: u8 = 1 << 1;
const TFC_MODIFIED: u8 = 1 << 2;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UtxoEntry {
    amount: i64,
    pk_script: Vec<u8>,
    block_height: i32,
    packed_flags: u8,
}

impl UtxoEntry {
    pub fn new(amount: i64, pk_script: Vec<u8>, block_height: i32, is_coinbase: bool) -> Self {
        let mut packed_flags = 0;
        if is_coinbase {
            packed_flags |= TFC_COINBASE;
        }
        Self {
            amount,
            pk_script,
            block_height,
            packed_flags,
        }
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn pk_script(&self) -> &[u8] {
        &self.pk_script
    }

    pub fn block_height(&self) -> i32 {
        self.block_height
    }

    pub fn is_coinbase(&self) -> bool {
        self.packed_flags & TFC_COINBASE != 0
    }

    pub fn is_spent(&self) -> bool {
        self.packed_flags & TFC_SPENT != 0
    }

    pub fn is_modified(&self) -> bool {
        self.packed_flags & TFC_MODIFIED != 0
    }

    /// Marks the output spent. Spending twice changes nothing.
    pub fn spend(&mut self) {
        if self.is_spent() {
            return;
        }
        self.packed_flags |= TFC_SPENT | TFC_MODIFIED;
    }

    fn overwrite(&mut self, amount: i64, pk_script: Vec<u8>, block_height: i32, is_coinbase: bool) {
        self.amount = amount;
        self.pk_script = pk_script;
        self.block_height = block_height;
        self.packed_flags = TFC_MODIFIED;
        if is_coinbase {
            self.packed_flags |= TFC_COINBASE;
        }
    }

    fn modified(mut self) -> Self {
        self.packed_flags |= TFC_MODIFIED;
        self
    }
}

/// Outputs keyed by outpoint. A `None` value records a lookup that found nothing,
/// which is different from an outpoint that was never loaded.
#[derive(Clone, Debug, Default)]
pub struct UtxoViewpoint {
    entries: HashMap<OutPoint, Option<UtxoEntry>>,
    best_hash: Hash256,
}

impl UtxoViewpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn best_hash(&self) -> Hash256 {
        self.best_hash
    }

    pub fn set_best_hash(&mut self, hash: Hash256) {
        self.best_hash = hash;
    }

    pub fn lookup_entry(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.entries.get(outpoint).and_then(Option::as_ref)
    }

    pub fn remove_entry(&mut self, outpoint: &OutPoint) {
        self.entries.remove(outpoint);
    }

    pub fn entries(&self) -> &HashMap<OutPoint, Option<UtxoEntry>> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add_tx_out(&mut self, tx: &Transaction, index: u32, height: i32) {
        let Some(output) = tx.vout.get(index as usize) else {
            return;
        };
        if is_unspendable(&output.script_pubkey) {
            return;
        }
        self.put_output(
            OutPoint::new(tx.txid(), index),
            output.value,
            output.script_pubkey.clone(),
            height,
            tx.is_coinbase(),
        );
    }

    pub fn add_tx_outs(&mut self, tx: &Transaction, height: i32) {
        let txid = tx.txid();
        let is_coinbase = tx.is_coinbase();
        for (index, output) in tx.vout.iter().enumerate() {
            if is_unspendable(&output.script_pubkey) {
                continue;
            }
            self.put_output(
                OutPoint::new(txid, index as u32),
                output.value,
                output.script_pubkey.clone(),
                height,
                is_coinbase,
            );
        }
    }

    fn put_output(
        &mut self,
        outpoint: OutPoint,
        amount: i64,
        pk_script: Vec<u8>,
        height: i32,
        is_coinbase: bool,
    ) {
        match self.entries.get_mut(&outpoint) {
            Some(Some(entry)) => entry.overwrite(amount, pk_script, height, is_coinbase),
            _ => {
                let entry = UtxoEntry::new(amount, pk_script, height, is_coinbase).modified();
                self.entries.insert(outpoint, Some(entry));
            }
        }
    }

    /// Spends the inputs of `tx` and adds its outputs. Spent outputs are appended
    /// to `stxos` in input order when provided.
    pub fn connect_transaction(
        &mut self,
        tx: &Transaction,
        height: i32,
        mut stxos: Option<&mut Vec<SpentTxOut>>,
    ) -> Result<(), ChainError> {
        if tx.is_coinbase() {
            self.add_tx_outs(tx, height);
            return Ok(());
        }
        for input in &tx.vin {
            let entry = match self.entries.get_mut(&input.prevout) {
                Some(Some(entry)) if !entry.is_spent() => entry,
                _ => {
                    return Err(assert_error(format!(
                        "view missing unspent input {}",
                        input.prevout
                    )))
                }
            };
            if let Some(stxos) = stxos.as_mut() {
                stxos.push(SpentTxOut {
                    amount: entry.amount,
                    pk_script: entry.pk_script.clone(),
                    height: entry.block_height,
                    is_coinbase: entry.is_coinbase(),
                });
            }
            entry.spend();
        }
        self.add_tx_outs(tx, height);
        Ok(())
    }

    pub fn connect_transactions(
        &mut self,
        block: &Block,
        height: i32,
        mut stxos: Option<&mut Vec<SpentTxOut>>,
    ) -> Result<(), ChainError> {
        for tx in &block.transactions {
            self.connect_transaction(tx, height, stxos.as_mut().map(|stxos| &mut **stxos))?;
        }
        self.best_hash = block.hash();
        Ok(())
    }

    /// Undoes `block`: its own outputs become spent and every input gets back the
    /// entry recorded in `stxos`.
    pub fn disconnect_transactions<S: KeyValueStore + ?Sized>(
        &mut self,
        store: &S,
        block: &Block,
        height: i32,
        stxos: &[SpentTxOut],
    ) -> Result<(), ChainError> {
        if stxos.len() != count_spent_outputs(block) {
            return Err(assert_error(format!(
                "disconnect of block {} has {} spent outputs, expected {}",
                btcnode_consensus::hash256_to_hex(&block.hash()),
                stxos.len(),
                count_spent_outputs(block)
            )));
        }

        // Load the block's own outputs so spending them below also reaches the store.
        let mut needed = HashSet::new();
        for tx in &block.transactions {
            let txid = tx.txid();
            for (index, output) in tx.vout.iter().enumerate() {
                if is_unspendable(&output.script_pubkey) {
                    continue;
                }
                let outpoint = OutPoint::new(txid, index as u32);
                if !self.entries.contains_key(&outpoint) {
                    needed.insert(outpoint);
                }
            }
        }
        self.fetch_utxos_main(store, &needed)?;

        let mut stxo_index = stxos.len();
        for (tx_index, tx) in block.transactions.iter().enumerate().rev() {
            let is_coinbase = tx_index == 0;
            let txid = tx.txid();
            for (index, output) in tx.vout.iter().enumerate() {
                if is_unspendable(&output.script_pubkey) {
                    continue;
                }
                let outpoint = OutPoint::new(txid, index as u32);
                let slot = self.entries.entry(outpoint).or_insert(None);
                let entry = slot.get_or_insert_with(|| {
                    UtxoEntry::new(
                        output.value,
                        output.script_pubkey.clone(),
                        height,
                        is_coinbase,
                    )
                });
                entry.spend();
            }

            if is_coinbase {
                continue;
            }
            for input in tx.vin.iter().rev() {
                stxo_index -= 1;
                let stxo = &stxos[stxo_index];
                let restored = UtxoEntry::new(
                    stxo.amount,
                    stxo.pk_script.clone(),
                    stxo.height,
                    stxo.is_coinbase,
                )
                .modified();
                self.entries.insert(input.prevout, Some(restored));
            }
        }

        self.best_hash = block.header.prev_block;
        Ok(())
    }

    /// Drops spent-and-written entries and clears the modified flag on the rest.
    pub fn commit(&mut self) {
        self.entries.retain(|_, slot| match slot {
            None => false,
            Some(entry) if entry.is_spent() && entry.is_modified() => false,
            Some(entry) => {
                entry.packed_flags &= !TFC_MODIFIED;
                true
            }
        });
    }

    /// Loads every outpoint in `outpoints` from the store, replacing what the view holds.
    pub fn fetch_utxos_main<S: KeyValueStore + ?Sized>(
        &mut self,
        store: &S,
        outpoints: &HashSet<OutPoint>,
    ) -> Result<(), ChainError> {
        for outpoint in outpoints {
            let entry = fetch_utxo_entry(store, outpoint)?;
            self.entries.insert(*outpoint, entry);
        }
        Ok(())
    }

    /// Loads the outpoints the view does not know about yet.
    pub fn fetch_utxos<S: KeyValueStore + ?Sized>(
        &mut self,
        store: &S,
        outpoints: &HashSet<OutPoint>,
    ) -> Result<(), ChainError> {
        let needed: HashSet<OutPoint> = outpoints
            .iter()
            .filter(|outpoint| !self.entries.contains_key(outpoint))
            .copied()
            .collect();
        self.fetch_utxos_main(store, &needed)
    }

    /// Makes sure every input of `block` has an entry. Outputs created earlier in
    /// the same block are added directly so chained spends resolve.
    pub fn fetch_input_utxos<S: KeyValueStore + ?Sized>(
        &mut self,
        store: &S,
        block: &Block,
        height: i32,
    ) -> Result<(), ChainError> {
        let in_flight: HashMap<Hash256, usize> = block
            .transactions
            .iter()
            .enumerate()
            .map(|(index, tx)| (tx.txid(), index))
            .collect();

        let mut needed = HashSet::new();
        for (tx_index, tx) in block.transactions.iter().enumerate().skip(1) {
            for input in &tx.vin {
                if let Some(&origin_index) = in_flight.get(&input.prevout.hash) {
                    if origin_index < tx_index {
                        self.add_tx_outs(&block.transactions[origin_index], height);
                        continue;
                    }
                }
                if self.entries.contains_key(&input.prevout) {
                    continue;
                }
                needed.insert(input.prevout);
            }
        }
        self.fetch_utxos_main(store, &needed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chainio::put_utxo_view;
    use btcnode_primitives::block::BlockHeader;
    use btcnode_primitives::transaction::{TxIn, TxOut};
    use btcnode_storage::memory::MemoryStore;
    use btcnode_storage::WriteBatch;

    fn tx(inputs: &[OutPoint], values: &[i64]) -> Transaction {
        Transaction {
            version: 1,
            vin: inputs
                .iter()
                .map(|prevout| TxIn::new(*prevout, vec![0x51], u32::MAX))
                .collect(),
            vout: values
                .iter()
                .map(|value| TxOut {
                    value: *value,
                    script_pubkey: vec![0x51],
                })
                .collect(),
            lock_time: 0,
        }
    }

    fn coinbase(tag: u8) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::null(), vec![tag, tag], u32::MAX)],
            vout: vec![
                TxOut {
                    value: 50,
                    script_pubkey: vec![0x51],
                },
                TxOut {
                    value: 0,
                    script_pubkey: vec![0x6a, 0x00],
                },
            ],
            lock_time: 0,
        }
    }

    fn block(prev: Hash256, transactions: Vec<Transaction>) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_block: prev,
                merkle_root: [0u8; 32],
                time: 0,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            transactions,
        }
    }

    #[test]
    fn spend_is_idempotent() {
        let mut entry = UtxoEntry::new(10, vec![0x51], 1, false);
        entry.spend();
        let once = entry.clone();
        entry.spend();
        assert_eq!(entry, once);
        assert!(entry.is_spent());
        assert!(entry.is_modified());
    }

    #[test]
    fn removed_entries_are_forgotten() {
        let funding = tx(&[OutPoint::new([2u8; 32], 0)], &[10, 20]);
        let mut view = UtxoViewpoint::new();
        view.add_tx_out(&funding, 1, 3);
        let outpoint = OutPoint::new(funding.txid(), 1);
        assert_eq!(view.lookup_entry(&outpoint).map(UtxoEntry::amount), Some(20));

        view.remove_entry(&outpoint);
        assert!(view.lookup_entry(&outpoint).is_none());
        assert!(view.entries().is_empty());
    }

    #[test]
    fn commit_prunes_spent_entries() {
        let funding = tx(&[OutPoint::new([1u8; 32], 0)], &[10, 20]);
        let mut view = UtxoViewpoint::new();
        view.add_tx_outs(&funding, 5);
        let before = view.entries().clone();
        assert!(before.values().flatten().all(UtxoEntry::is_modified));

        view.commit();
        assert_eq!(view.len(), 2);
        let snapshot = view.entries().clone();
        view.commit();
        assert_eq!(view.entries(), &snapshot);

        let outpoint = OutPoint::new(funding.txid(), 0);
        let spender = tx(&[outpoint], &[9]);
        let mut stxos = Vec::new();
        view.connect_transaction(&spender, 6, Some(&mut stxos))
            .expect("connect");
        assert_eq!(stxos.len(), 1);
        assert_eq!(stxos[0].amount, 10);
        assert_eq!(stxos[0].height, 5);
        view.commit();
        assert!(view.lookup_entry(&outpoint).is_none());
        assert!(!view.entries().contains_key(&outpoint));
    }

    #[test]
    fn unspendable_outputs_are_skipped() {
        let mut view = UtxoViewpoint::new();
        let coinbase = coinbase(1);
        view.add_tx_outs(&coinbase, 0);
        assert_eq!(view.len(), 1);
        let entry = view
            .lookup_entry(&OutPoint::new(coinbase.txid(), 0))
            .expect("entry");
        assert!(entry.is_coinbase());
        view.add_tx_out(&coinbase, 1, 0);
        view.add_tx_out(&coinbase, 7, 0);
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn missing_or_spent_inputs_are_assertions() {
        let mut view = UtxoViewpoint::new();
        let spender = tx(&[OutPoint::new([4u8; 32], 0)], &[1]);
        let err = view
            .connect_transaction(&spender, 1, None)
            .expect_err("missing input");
        assert!(matches!(err, ChainError::Assert(_)));

        let funding = tx(&[OutPoint::new([5u8; 32], 0)], &[3]);
        view.add_tx_outs(&funding, 1);
        let spender = tx(&[OutPoint::new(funding.txid(), 0)], &[2]);
        view.connect_transaction(&spender, 2, None).expect("first spend");
        let err = view
            .connect_transaction(&spender, 2, None)
            .expect_err("double spend");
        assert!(matches!(err, ChainError::Assert(_)));
    }

    #[test]
    fn intra_block_spends_resolve_without_the_store() {
        let store = MemoryStore::new();
        let parent = tx(&[OutPoint::new([7u8; 32], 0)], &[40]);
        let child = tx(&[OutPoint::new(parent.txid(), 0)], &[30]);
        let block = block([0u8; 32], vec![coinbase(2), parent.clone(), child]);

        let mut view = UtxoViewpoint::new();
        view.fetch_input_utxos(&store, &block, 3).expect("fetch");
        assert!(view.lookup_entry(&OutPoint::new(parent.txid(), 0)).is_some());
        // The external input was looked up and recorded as absent.
        assert!(view.entries().contains_key(&OutPoint::new([7u8; 32], 0)));
        assert!(view.lookup_entry(&OutPoint::new([7u8; 32], 0)).is_none());
    }

    #[test]
    fn disconnect_restores_spent_outputs() {
        let store = MemoryStore::new();
        let funding_block = block([0u8; 32], vec![coinbase(1)]);
        let mut view = UtxoViewpoint::new();
        view.connect_transactions(&funding_block, 1, None)
            .expect("connect funding");
        let mut batch = WriteBatch::new();
        put_utxo_view(&mut batch, &view);
        store.write_batch(&batch).expect("write");
        view.commit();

        let funding_out = OutPoint::new(funding_block.transactions[0].txid(), 0);
        let spender = tx(&[funding_out], &[45]);
        let spend_block = block(funding_block.hash(), vec![coinbase(2), spender.clone()]);

        let mut view = UtxoViewpoint::new();
        view.fetch_input_utxos(&store, &spend_block, 2).expect("fetch");
        let mut stxos = Vec::new();
        view.connect_transactions(&spend_block, 2, Some(&mut stxos))
            .expect("connect spend");
        assert_eq!(view.best_hash(), spend_block.hash());
        let mut batch = WriteBatch::new();
        put_utxo_view(&mut batch, &view);
        store.write_batch(&batch).expect("write");
        view.commit();
        assert!(view.lookup_entry(&funding_out).is_none());

        let mut view = UtxoViewpoint::new();
        view.disconnect_transactions(&store, &spend_block, 2, &stxos)
            .expect("disconnect");
        assert_eq!(view.best_hash(), funding_block.hash());
        let restored = view.lookup_entry(&funding_out).expect("restored");
        assert_eq!(restored.amount(), 50);
        assert_eq!(restored.block_height(), 1);
        assert!(restored.is_coinbase());
        assert!(restored.is_modified());
        let created = view
            .lookup_entry(&OutPoint::new(spender.txid(), 0))
            .expect("loaded");
        assert!(created.is_spent());

        let err = view
            .disconnect_transactions(&store, &spend_block, 2, &[])
            .expect_err("wrong journal length");
        assert!(matches!(err, ChainError::Assert(_)));
    }
}
