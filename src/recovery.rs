//! Crash recovery: replay the write-ahead log written since the last
//! checkpoint back onto the last-checkpoint root.
//!
//! Grounded on `original_source/include/yudb/tx_manager.h`'s recovery
//! path (replay committed transactions' logged operations in order,
//! discard anything after the last complete `Commit`) and realized here
//! by driving the exact same [`crate::txn::TxManager`] machinery a live
//! writer uses: each recovered transaction is replayed as an ordinary
//! `update()`/`commit()` round-trip, so the recovered state goes through
//! identical validation and CoW bookkeeping as a fresh write. The single
//! replay pass ends with a `checkpoint()`, which persists the recovered
//! state and truncates the WAL, so a second crash mid-recovery can't
//! replay the same operations twice.

use crate::bucket::BucketMut;
use crate::error::{Result, RoltError};
use crate::page::TxId;
use crate::txn::TxManager;
use crate::wal::{LogicalRecord, Reader};
use std::collections::HashMap;

/// Reads the WAL at `txm.wal_path()`, replays every transaction whose
/// `Commit` record is present, and checkpoints the result. Returns
/// whether anything was replayed. A missing or empty WAL file is not an
/// error -- it just means the last session shut down cleanly.
pub fn recover(txm: &TxManager) -> Result<bool> {
    let data = match std::fs::read(txm.wal_path()) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if data.is_empty() {
        return Ok(false);
    }

    let mut reader = Reader::new(&data);
    let first = match reader.next_record() {
        Ok(Some(raw)) => LogicalRecord::decode(&raw).ok(),
        _ => None,
    };
    match first {
        Some(LogicalRecord::WalTxId(t)) if t >= txm.current_tx_id() => {}
        Some(LogicalRecord::WalTxId(t)) => {
            log::warn!("recovery: WAL marker tx_id={t} predates committed meta tx_id={}, skipping stale WAL", txm.current_tx_id());
            return Ok(false);
        }
        _ => {
            log::warn!("recovery: WAL does not begin with a WalTxId marker, skipping");
            return Ok(false);
        }
    }

    let groups = collect_committed_transactions(&data);
    if groups.is_empty() {
        return Ok(false);
    }

    for (tx_id, records) in groups {
        log::debug!("recovery: replaying tx_id={tx_id} ({} records)", records.len());
        replay_transaction(txm, records)?;
    }
    txm.checkpoint()?;
    Ok(true)
}

/// Walks the WAL's logical record stream and groups the records of every
/// transaction that reached a `Commit`. A transaction still open (no
/// `Commit`/`Rollback` reached) at the end of the log -- the crash
/// victim -- is silently dropped, per spec.md's atomicity requirement.
/// A decode or CRC failure stops replay at that point rather than
/// erroring out: it marks the unwritten or torn tail of the log.
fn collect_committed_transactions(data: &[u8]) -> Vec<(TxId, Vec<LogicalRecord>)> {
    let mut reader = Reader::new(data);
    let mut groups = Vec::new();
    let mut current: Option<(TxId, Vec<LogicalRecord>)> = None;
    loop {
        let raw = match reader.next_record() {
            Ok(Some(raw)) => raw,
            Ok(None) | Err(_) => break,
        };
        let record = match LogicalRecord::decode(&raw) {
            Ok(r) => r,
            Err(_) => break,
        };
        match record {
            LogicalRecord::Begin(tx) => current = Some((tx, Vec::new())),
            LogicalRecord::Commit(tx) => {
                if let Some((cur_tx, recs)) = current.take() {
                    if cur_tx == tx {
                        groups.push((cur_tx, recs));
                    }
                }
            }
            LogicalRecord::Rollback(_) => current = None,
            LogicalRecord::WalTxId(_) => {}
            other => {
                if let Some((_, recs)) = current.as_mut() {
                    recs.push(other);
                }
            }
        }
    }
    groups
}

fn replay_transaction(txm: &TxManager, records: Vec<LogicalRecord>) -> Result<()> {
    let utx = txm.update()?;
    let mut buckets: HashMap<u64, BucketMut> = HashMap::new();
    buckets.insert(0, utx.user_bucket_mut());

    for record in records {
        match record {
            LogicalRecord::SubBucket { parent, name, bucket_id, .. } => {
                let child = buckets
                    .get(&parent)
                    .ok_or_else(|| RoltError::Corruption("WAL references an unknown parent bucket".into()))?
                    .bucket_mut(&name)?;
                buckets.insert(bucket_id, child);
            }
            LogicalRecord::Put { bucket, key, value } => {
                buckets
                    .get(&bucket)
                    .ok_or_else(|| RoltError::Corruption("WAL references an unknown bucket".into()))?
                    .put(&key, &value)?;
            }
            LogicalRecord::Delete { bucket, key } => {
                buckets
                    .get(&bucket)
                    .ok_or_else(|| RoltError::Corruption("WAL references an unknown bucket".into()))?
                    .delete(&key)?;
            }
            LogicalRecord::Begin(_) | LogicalRecord::Commit(_) | LogicalRecord::Rollback(_) | LogicalRecord::WalTxId(_) => {}
        }
    }
    drop(buckets);
    utx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::default_comparator;
    use crate::options::Options;
    use crate::pager::Pager;
    use std::fs::File;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn collects_only_transactions_that_reached_commit() {
        let records = vec![
            LogicalRecord::Begin(1),
            LogicalRecord::Put { bucket: 0, key: b"a".to_vec(), value: b"1".to_vec() },
            LogicalRecord::Commit(1),
            LogicalRecord::Begin(2),
            LogicalRecord::Put { bucket: 0, key: b"b".to_vec(), value: b"2".to_vec() },
            // tx 2 never commits: crash victim, must be dropped.
        ];
        let data = write_wal(&records);
        let groups = collect_committed_transactions(&data);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0, 1);
    }

    #[test]
    fn rolled_back_transaction_is_dropped() {
        let records = vec![
            LogicalRecord::Begin(1),
            LogicalRecord::Put { bucket: 0, key: b"a".to_vec(), value: b"1".to_vec() },
            LogicalRecord::Rollback(1),
        ];
        let data = write_wal(&records);
        assert!(collect_committed_transactions(&data).is_empty());
    }

    #[test]
    fn wal_tx_id_marker_mid_stream_does_not_break_grouping() {
        let records = vec![
            LogicalRecord::WalTxId(0),
            LogicalRecord::Begin(1),
            LogicalRecord::Put { bucket: 0, key: b"a".to_vec(), value: b"1".to_vec() },
            LogicalRecord::Commit(1),
        ];
        let data = write_wal(&records);
        let groups = collect_committed_transactions(&data);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0, 1);
    }

    fn write_wal(records: &[LogicalRecord]) -> Vec<u8> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.wal");
        let file = File::create(&path).unwrap();
        let mut writer = crate::wal::Writer::new(file, 0);
        for r in records {
            writer.append_record(&r.encode()).unwrap();
        }
        writer.sync().unwrap();
        std::fs::read(&path).unwrap()
    }

    fn open_txm(dir: &std::path::Path) -> TxManager {
        let path = dir.join("r.db");
        let options = Options::default();
        Pager::create(&path, options.page_size).unwrap();
        let (pager, meta, slot) = Pager::open(&path, options.cache_pool_page_count, false).unwrap();
        let wal_path = dir.join("r.db.wal");
        TxManager::new(Arc::new(pager), default_comparator(), options, meta, slot, wal_path).unwrap()
    }

    #[test]
    fn recover_is_noop_on_a_freshly_opened_wal() {
        let dir = tempdir().unwrap();
        let txm = open_txm(dir.path());
        assert!(!recover(&txm).unwrap());
    }

    #[test]
    fn recover_skips_a_wal_marker_stale_relative_to_committed_meta() {
        let dir = tempdir().unwrap();
        let txm = open_txm(dir.path());

        // Advance the committed tx_id past what the forged WAL below claims.
        let utx = txm.update().unwrap();
        utx.user_bucket_mut().put(b"real", b"v").unwrap();
        utx.commit().unwrap();
        txm.checkpoint().unwrap();
        assert_eq!(txm.current_tx_id(), 1);

        // Forge a WAL that predates the committed meta: a marker claiming
        // tx_id 0, with an (unreachable) committed write behind it.
        let stale = vec![
            LogicalRecord::WalTxId(0),
            LogicalRecord::Begin(0),
            LogicalRecord::Put { bucket: 0, key: b"stale".to_vec(), value: b"v".to_vec() },
            LogicalRecord::Commit(0),
        ];
        std::fs::write(txm.wal_path(), write_wal(&stale)).unwrap();

        assert!(!recover(&txm).unwrap());
        let vtx = txm.view();
        assert_eq!(vtx.user_bucket().get(b"stale").unwrap(), None);
    }
}
