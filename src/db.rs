//! The top-level handle: opens a data file (creating it if missing),
//! replays the WAL left over from an unclean shutdown, and hands out
//! [`ViewTx`]/[`UpdateTx`] handles backed by a shared [`TxManager`].
//!
//! Grounded on the teacher's `DB`/`DBBuilder` (create-if-missing, builder
//! for page size and cache sizing) and `Idb::open` (exclusive file lock,
//! meta-page selection), generalized to also run [`recovery::recover`]
//! before the database is usable, per spec.md §4.8.

use crate::error::Result;
use crate::node::default_comparator;
use crate::options::Options;
use crate::pager::Pager;
use crate::recovery;
use crate::txn::{TxManager, UpdateTx, ViewTx};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An open database. Cheap to share by reference: `view`/`update` borrow
/// from it directly rather than requiring `Rc`/`Arc` wrapping by callers.
pub struct DB {
    txm: TxManager,
}

impl DB {
    /// Opens `path`, creating a new empty database there if it doesn't
    /// exist yet, with default [`Options`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_options(path, Options::default())
    }

    pub fn open_with_options<P: AsRef<Path>>(path: P, options: Options) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            if options.read_only {
                return Err(crate::error::RoltError::InvalidArgument(
                    "cannot create a new database file in read-only mode".into(),
                ));
            }
            Pager::create(path, options.page_size)?;
        }

        let (pager, meta, slot) = Pager::open(path, options.cache_pool_page_count, options.read_only)?;
        let pager = Arc::new(pager);
        let wal_path = wal_path_for(path);
        let read_only = options.read_only;
        let txm = TxManager::new(pager, default_comparator(), options, meta, slot, wal_path)?;

        if !read_only {
            recovery::recover(&txm)?;
        }
        Ok(Self { txm })
    }

    pub fn current_tx_id(&self) -> crate::page::TxId {
        self.txm.current_tx_id()
    }

    /// Opens a read-only snapshot at the current committed tx_id. Many
    /// can be open at once, concurrently with an in-progress `update()`.
    pub fn view(&self) -> ViewTx<'_> {
        self.txm.view()
    }

    /// Begins the single live writable transaction. Blocks until any
    /// other in-progress `update()` finishes.
    pub fn update(&self) -> Result<UpdateTx<'_>> {
        self.txm.update()
    }

    /// Persists the free list and switches the on-disk meta page to the
    /// latest committed state, then truncates the WAL. Not required
    /// after every `commit` -- see [`TxManager::checkpoint`].
    pub fn checkpoint(&self) -> Result<()> {
        self.txm.checkpoint()
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        if !self.txm.pager().is_read_only() {
            if let Err(e) = self.txm.checkpoint() {
                log::warn!("checkpoint on close failed: {e}");
            }
        }
    }
}

fn wal_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".wal");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_new_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = DB::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(db.current_tx_id(), 0);
    }

    #[test]
    fn put_get_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let db = DB::open(&path).unwrap();
            let utx = db.update().unwrap();
            utx.user_bucket_mut().put(b"k", b"v").unwrap();
            utx.commit().unwrap();
            db.checkpoint().unwrap();
        }
        let db = DB::open(&path).unwrap();
        let vtx = db.view();
        assert_eq!(vtx.user_bucket().get(b"k").unwrap().unwrap(), b"v");
    }

    /// Builds a `TxManager` directly (bypassing `DB`, which would
    /// checkpoint on drop) to leave an uncheckpointed commit behind for
    /// the next `DB::open` to recover from the WAL.
    #[test]
    fn recovers_uncheckpointed_commit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let options = Options::default();
        Pager::create(&path, options.page_size).unwrap();
        let (pager, meta, slot) = Pager::open(&path, options.cache_pool_page_count, false).unwrap();
        let txm = TxManager::new(
            Arc::new(pager),
            default_comparator(),
            options,
            meta,
            slot,
            wal_path_for(&path),
        )
        .unwrap();
        let utx = txm.update().unwrap();
        utx.user_bucket_mut().put(b"k", b"v").unwrap();
        utx.commit().unwrap();
        drop(txm); // no checkpoint; only the WAL records this write

        let db = DB::open(&path).unwrap();
        let vtx = db.view();
        assert_eq!(vtx.user_bucket().get(b"k").unwrap().unwrap(), b"v");
    }
}
