//! An embedded, single-process, transactional key-value store: a
//! copy-on-write B+tree with nested buckets, MVCC snapshot reads, and a
//! write-ahead log for crash recovery.
//!
//! See [`DB`] for the entry point, [`Options`] for tunables, and
//! [`bucket::Bucket`]/[`bucket::BucketMut`] for the read/write surface a
//! transaction hands out.

mod bucket;
mod cursor;
mod db;
mod error;
mod free_list;
mod meta;
mod node;
mod options;
mod page;
mod pager;
mod recovery;
mod txn;
mod wal;

pub use bucket::{Bucket, BucketMut};
pub use cursor::Cursor;
pub use db::DB;
pub use error::{Result, RoltError};
pub use node::{default_comparator, Comparator};
pub use options::{Options, OptionsBuilder};
pub use page::{PageId, TxId};
pub use txn::{UpdateTx, ViewTx};

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_update_view_roundtrip() {
        let dir = tempdir().unwrap();
        let db = DB::open(dir.path().join("it_works.db")).unwrap();

        let utx = db.update().unwrap();
        utx.user_bucket_mut().put(b"hello", b"world").unwrap();
        utx.commit().unwrap();

        let vtx = db.view();
        assert_eq!(vtx.user_bucket().get(b"hello").unwrap().unwrap(), b"world");
    }
}
