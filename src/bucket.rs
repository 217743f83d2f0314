//! Nested buckets: each is its own materialized B+tree, addressed from
//! its parent leaf by a `BucketValue` pointer (root page id + sequence).
//!
//! Grounded on the teacher's `Bucket`/`IBucket` (a bucket is a B+tree
//! root plus a `HashMap<String, Bucket>` of children). The teacher never
//! finished `create_bucket`; it's implemented here in full.

use crate::btree::BTree;
use crate::cursor::{Cursor, NodeReader};
use crate::error::{DebugBytes, Result, RoltError};
use crate::node::Comparator;
use crate::page::{PageId, TxId};
use crate::pager::Pager;
use crate::wal::LogicalRecord;
use std::cell::RefCell;
use std::rc::Rc;

const TAG_MATERIALIZED: u8 = 1;

/// Value size ceiling, per spec.md's `kValueMaxSize` floor of 2 GiB.
/// Oversized values are rejected outright rather than silently
/// truncated or chained across more pages than the free list can
/// realistically track.
const MAX_VALUE_SIZE: usize = 2 * 1024 * 1024 * 1024;

/// The value stored for a nested-bucket leaf entry: a pointer to the
/// nested bucket's own B+tree root.
#[derive(Debug, Clone)]
pub struct BucketValue {
    pub root: PageId,
    pub sequence: u64,
}

impl BucketValue {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(13);
        buf.push(TAG_MATERIALIZED);
        buf.extend_from_slice(&self.root.to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != 13 || buf[0] != TAG_MATERIALIZED {
            return Err(RoltError::Corruption("malformed bucket value".into()));
        }
        let root = u32::from_le_bytes(buf[1..5].try_into().unwrap());
        let sequence = u64::from_le_bytes(buf[5..13].try_into().unwrap());
        Ok(BucketValue { root, sequence })
    }
}

/// Read-only view of one bucket (root or nested), borrowed from either a
/// `ViewTx` or an `UpdateTx`.
pub struct Bucket<'tx, R: NodeReader> {
    reader: &'tx R,
    cmp: Comparator,
    root: PageId,
}

impl<'tx, R: NodeReader> Bucket<'tx, R> {
    pub fn new(reader: &'tx R, cmp: Comparator, root: PageId) -> Self {
        Self { reader, cmp, root }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut cursor = Cursor::new(self.reader, self.cmp.clone());
        cursor.seek(self.root, key)?;
        match cursor.current() {
            Some((k, v, is_bucket)) if k == key && !is_bucket => Ok(Some(v.to_vec())),
            _ => Ok(None),
        }
    }

    pub fn bucket(&self, name: &[u8]) -> Result<Bucket<'tx, R>> {
        let mut cursor = Cursor::new(self.reader, self.cmp.clone());
        cursor.seek(self.root, name)?;
        match cursor.current() {
            Some((k, v, true)) if k == name => {
                let bv = BucketValue::decode(v)?;
                self.nested_view(bv)
            }
            _ => Err(RoltError::BucketNotFound(DebugBytes::from(name))),
        }
    }

    fn nested_view(&self, value: BucketValue) -> Result<Bucket<'tx, R>> {
        Ok(Bucket::new(self.reader, self.cmp.clone(), value.root))
    }

    pub fn cursor(&self) -> Cursor<'tx, R> {
        Cursor::new(self.reader, self.cmp.clone())
    }

    pub fn root(&self) -> PageId {
        self.root
    }
}

/// A shared log of logical WAL records accumulated during one writer
/// transaction, flushed to the on-disk WAL by the transaction manager at
/// commit.
pub type WalLog = Rc<RefCell<Vec<LogicalRecord>>>;

/// A writable bucket bound to an in-progress `UpdateTx`. `bucket_id` is
/// this bucket's opaque id within the transaction's WAL stream (0 for
/// the root bucket).
pub struct BucketMut<'tx> {
    pager: &'tx Pager,
    tx_id: TxId,
    cmp: Comparator,
    root: Rc<RefCell<PageId>>,
    log: WalLog,
    bucket_id: u64,
    next_bucket_id: Rc<RefCell<u64>>,
}

impl<'tx> BucketMut<'tx> {
    pub fn new(
        pager: &'tx Pager,
        tx_id: TxId,
        cmp: Comparator,
        root: PageId,
        log: WalLog,
        bucket_id: u64,
        next_bucket_id: Rc<RefCell<u64>>,
    ) -> Self {
        Self::from_shared_root(pager, tx_id, cmp, Rc::new(RefCell::new(root)), log, bucket_id, next_bucket_id)
    }

    /// Like [`BucketMut::new`], but shares an existing root cell instead
    /// of owning a fresh one. Used for the root bucket of an `UpdateTx`,
    /// whose root cell the transaction itself reads back at commit time.
    pub fn from_shared_root(
        pager: &'tx Pager,
        tx_id: TxId,
        cmp: Comparator,
        root: Rc<RefCell<PageId>>,
        log: WalLog,
        bucket_id: u64,
        next_bucket_id: Rc<RefCell<u64>>,
    ) -> Self {
        Self { pager, tx_id, cmp, root, log, bucket_id, next_bucket_id }
    }

    pub fn root(&self) -> PageId {
        *self.root.borrow()
    }

    fn tree(&self) -> BTree<'tx> {
        BTree::new(self.pager, self.tx_id, self.cmp.clone())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.tree().get(*self.root.borrow(), key)? {
            Some((value, false)) => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(RoltError::InvalidArgument("key must not be empty".into()));
        }
        if key.len() > self.pager.page_size() as usize || value.len() > MAX_VALUE_SIZE {
            return Err(RoltError::KeyValueTooLarge);
        }
        self.log.borrow_mut().push(LogicalRecord::Put {
            bucket: self.bucket_id,
            key: key.to_vec(),
            value: value.to_vec(),
        });
        let new_root = self.tree().put(*self.root.borrow(), key, value, false)?;
        *self.root.borrow_mut() = new_root;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.log.borrow_mut().push(LogicalRecord::Delete {
            bucket: self.bucket_id,
            key: key.to_vec(),
        });
        let new_root = self.tree().delete(*self.root.borrow(), key)?;
        *self.root.borrow_mut() = new_root;
        Ok(())
    }

    /// Opens (creating if absent) a nested bucket by name and returns a
    /// handle scoped to it. A freshly created bucket gets an empty root
    /// right away, since a `BucketMut` needs a real page id to recurse
    /// through.
    pub fn bucket_mut(&self, name: &[u8]) -> Result<BucketMut<'tx>> {
        let existing = self.tree().get(*self.root.borrow(), name)?;
        let (root, bucket_id) = match existing {
            Some((bytes, true)) => (BucketValue::decode(&bytes)?.root, self.allocate_bucket_id()),
            Some((_, false)) => return Err(RoltError::IncompatibleValue),
            None => {
                let bucket_id = self.allocate_bucket_id();
                self.log.borrow_mut().push(LogicalRecord::SubBucket {
                    parent: self.bucket_id,
                    name: name.to_vec(),
                    bucket_id,
                    inline: false,
                });
                let root = self.new_empty_leaf()?;
                self.write_back_materialized(name, root, 0)?;
                (root, bucket_id)
            }
        };

        Ok(BucketMut::new(
            self.pager,
            self.tx_id,
            self.cmp.clone(),
            root,
            self.log.clone(),
            bucket_id,
            self.next_bucket_id.clone(),
        ))
    }

    fn new_empty_leaf(&self) -> Result<PageId> {
        let id = self.pager.alloc(1)?;
        let page_size = self.pager.page_size() as usize;
        let mut buf = vec![0u8; page_size];
        crate::node::Node::new_leaf().encode(&mut buf, self.tx_id, |_| {
            unreachable!("an empty leaf never overflows")
        })?;
        self.pager.put_dirty(id, buf);
        Ok(id)
    }

    fn write_back_materialized(&self, name: &[u8], root: PageId, sequence: u64) -> Result<()> {
        let value = BucketValue { root, sequence };
        let new_root = self.tree().put(*self.root.borrow(), name, &value.encode(), true)?;
        *self.root.borrow_mut() = new_root;
        Ok(())
    }

    fn allocate_bucket_id(&self) -> u64 {
        let mut next = self.next_bucket_id.borrow_mut();
        let id = *next;
        *next += 1;
        id
    }

    pub fn cursor(&self, reader: &'tx Pager) -> Cursor<'tx, Pager> {
        Cursor::new(reader, self.cmp.clone())
    }
}

#[cfg(test)]
mod tests {
    use crate::db::DB;
    use crate::error::RoltError;
    use tempfile::tempdir;

    #[test]
    fn nested_bucket_put_get_is_visible_after_commit() {
        let dir = tempdir().unwrap();
        let db = DB::open(dir.path().join("b.db")).unwrap();

        let utx = db.update().unwrap();
        let root = utx.user_bucket_mut();
        let widgets = root.bucket_mut(b"widgets").unwrap();
        widgets.put(b"sku1", b"red").unwrap();
        utx.commit().unwrap();

        let vtx = db.view();
        let widgets = vtx.user_bucket().bucket(b"widgets").unwrap();
        assert_eq!(widgets.get(b"sku1").unwrap().unwrap(), b"red");
    }

    #[test]
    fn reopening_same_bucket_name_returns_same_contents() {
        let dir = tempdir().unwrap();
        let db = DB::open(dir.path().join("b.db")).unwrap();

        let utx = db.update().unwrap();
        let root = utx.user_bucket_mut();
        root.bucket_mut(b"widgets").unwrap().put(b"a", b"1").unwrap();
        let widgets_again = root.bucket_mut(b"widgets").unwrap();
        assert_eq!(widgets_again.get(b"a").unwrap().unwrap(), b"1");
        widgets_again.put(b"b", b"2").unwrap();
        utx.commit().unwrap();

        let vtx = db.view();
        let widgets = vtx.user_bucket().bucket(b"widgets").unwrap();
        assert_eq!(widgets.get(b"a").unwrap().unwrap(), b"1");
        assert_eq!(widgets.get(b"b").unwrap().unwrap(), b"2");
    }

    #[test]
    fn bucket_not_found_on_missing_name() {
        let dir = tempdir().unwrap();
        let db = DB::open(dir.path().join("b.db")).unwrap();
        let vtx = db.view();
        assert!(matches!(vtx.user_bucket().bucket(b"nope"), Err(RoltError::BucketNotFound(_))));
    }

    #[test]
    fn bucket_mut_on_plain_key_is_incompatible() {
        let dir = tempdir().unwrap();
        let db = DB::open(dir.path().join("b.db")).unwrap();
        let utx = db.update().unwrap();
        let root = utx.user_bucket_mut();
        root.put(b"plain", b"v").unwrap();
        assert!(matches!(root.bucket_mut(b"plain"), Err(RoltError::IncompatibleValue)));
    }

    #[test]
    fn empty_key_is_rejected() {
        let dir = tempdir().unwrap();
        let db = DB::open(dir.path().join("b.db")).unwrap();
        let utx = db.update().unwrap();
        assert!(matches!(
            utx.user_bucket_mut().put(b"", b"v"),
            Err(RoltError::InvalidArgument(_))
        ));
    }

    #[test]
    fn oversized_key_is_rejected() {
        let dir = tempdir().unwrap();
        let options = crate::options::Options::builder().page_size(4096).build().unwrap();
        let db = DB::open_with_options(dir.path().join("b.db"), options).unwrap();
        let utx = db.update().unwrap();
        let huge_key = vec![b'k'; 8192]; // bigger than the 4096-byte page
        assert!(matches!(
            utx.user_bucket_mut().put(&huge_key, b"v"),
            Err(RoltError::KeyValueTooLarge)
        ));
    }
}
