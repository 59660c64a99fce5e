#![cfg(feature = "fjall")]

use btcnode_storage::fjall::{FjallOptions, FjallStore};
use btcnode_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn fjall_smoke_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let options = FjallOptions {
            sync_writes: true,
            ..FjallOptions::default()
        };
        let store = FjallStore::open_with_options(dir.path(), options).expect("open fjall");
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"key", b"value");
        // Block index rows sort by big-endian height.
        batch.put(Column::BlockIndex, [0, 0, 1, 0, 0xaa], b"b");
        batch.put(Column::BlockIndex, [0, 0, 0, 2, 0xbb], b"a");
        store.write_batch(&batch).expect("first commit");
        assert_eq!(
            store.get(Column::Meta, b"key").expect("get"),
            Some(b"value".to_vec())
        );

        let rows = store.scan_prefix(Column::BlockIndex, &[]).expect("scan");
        assert_eq!(
            rows,
            vec![
                (vec![0, 0, 0, 2, 0xbb], b"a".to_vec()),
                (vec![0, 0, 1, 0, 0xaa], b"b".to_vec()),
            ]
        );
        let mut streamed = Vec::new();
        store
            .for_each_prefix(Column::BlockIndex, &[0, 0, 1], &mut |key, _| {
                streamed.push(key.to_vec());
                Ok(())
            })
            .expect("stream");
        assert_eq!(streamed, vec![vec![0, 0, 1, 0, 0xaa]]);

        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"batch", b"ok");
        batch.delete(Column::Meta, b"key");
        store.write_batch(&batch).expect("second commit");
        store.flush().expect("flush");
    }

    let store = FjallStore::open(dir.path()).expect("reopen fjall");
    assert!(!store.contains(Column::Meta, b"key").expect("contains"));
    assert_eq!(
        store.get(Column::Meta, b"batch").expect("get"),
        Some(b"ok".to_vec())
    );
    assert_eq!(store.scan_prefix(Column::BlockIndex, &[]).expect("scan").len(), 2);
}
