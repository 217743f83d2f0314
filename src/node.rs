//! In-memory B+tree node representation and its wire encoding.
//!
//! Grounded on the teacher's `node.rs` (`Inode`/`NodeType::Branch`/
//! `NodeType::Leaf`, `read`/`write`), generalized to the slotted page
//! layout in [`crate::page`] and to spec.md §4.2's separator-key branch
//! format: a branch holds `n` `(key, left_child)` pairs plus one trailing
//! `tail_child` covering keys greater than or equal to the last
//! separator.

use crate::error::{Result, RoltError};
use crate::page::{
    max_inline_record_size, BranchSlot, LeafSlot, NodePage, NodePageMut, PageId, PageType, TxId,
    BRANCH_SLOT_SIZE, BUCKET_FLAG, LEAF_SLOT_SIZE, NODE_HEADER_SIZE, OVERFLOW_FLAG,
    OVERFLOW_HEADER_SIZE,
};
use std::cmp::Ordering;
use std::sync::Arc;

/// A key-ordering function. The default is plain byte-lexicographic
/// order; callers may install their own, e.g. for integer-keyed buckets.
pub type Comparator = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

pub fn default_comparator() -> Comparator {
    Arc::new(|a: &[u8], b: &[u8]| a.cmp(b))
}

#[derive(Debug, Clone)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub is_bucket: bool,
}

#[derive(Debug, Clone)]
pub struct BranchEntry {
    pub key: Vec<u8>,
    pub child: PageId,
}

#[derive(Debug, Clone)]
pub enum Node {
    Leaf(Vec<LeafEntry>),
    Branch {
        entries: Vec<BranchEntry>,
        tail_child: PageId,
    },
}

pub enum Found {
    Exact(usize),
    Before(usize),
}

impl Node {
    pub fn new_leaf() -> Self {
        Node::Leaf(Vec::new())
    }

    pub fn new_branch(tail_child: PageId) -> Self {
        Node::Branch {
            entries: Vec::new(),
            tail_child,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(v) => v.len(),
            Node::Branch { entries, .. } => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First key in the node, used as its own separator key when it is
    /// referenced from a parent branch.
    pub fn first_key(&self) -> Option<&[u8]> {
        match self {
            Node::Leaf(v) => v.first().map(|e| e.key.as_slice()),
            Node::Branch { entries, .. } => entries.first().map(|e| e.key.as_slice()),
        }
    }

    /// Approximate on-disk footprint: header, slot array, and inline
    /// record bytes. A leaf entry whose key+value would exceed
    /// `max_inline_record_size(page_size)` is stored as an overflow chain
    /// instead, so it costs only `OVERFLOW_HEADER_SIZE` bytes here --
    /// its actual payload lives on separate pages.
    pub fn encoded_size(&self, page_size: usize) -> usize {
        match self {
            Node::Leaf(entries) => {
                let max_inline = max_inline_record_size(page_size);
                NODE_HEADER_SIZE
                    + entries.len() * LEAF_SLOT_SIZE
                    + entries
                        .iter()
                        .map(|e| {
                            let raw = e.key.len() + e.value.len();
                            if raw > max_inline { OVERFLOW_HEADER_SIZE } else { raw }
                        })
                        .sum::<usize>()
            }
            Node::Branch { entries, .. } => {
                NODE_HEADER_SIZE
                    + entries.len() * BRANCH_SLOT_SIZE
                    + entries.iter().map(|e| e.key.len()).sum::<usize>()
            }
        }
    }

    pub fn search(&self, key: &[u8], cmp: &Comparator) -> Found {
        match self {
            Node::Leaf(entries) => match entries.binary_search_by(|e| cmp(&e.key, key)) {
                Ok(i) => Found::Exact(i),
                Err(i) => Found::Before(i),
            },
            Node::Branch { entries, .. } => match entries.binary_search_by(|e| cmp(&e.key, key)) {
                Ok(i) => Found::Exact(i),
                Err(i) => Found::Before(i),
            },
        }
    }

    /// Index of the child to descend into for `key`. Valid for `Branch`
    /// nodes only; panics (via empty match) on a leaf.
    pub fn child_index(&self, key: &[u8], cmp: &Comparator) -> usize {
        match self {
            Node::Branch { entries, .. } => {
                let idx = match self.search(key, cmp) {
                    Found::Exact(i) => i + 1,
                    Found::Before(i) => i,
                };
                idx.min(entries.len())
            }
            Node::Leaf(_) => 0,
        }
    }

    pub fn child_at(&self, idx: usize) -> PageId {
        match self {
            Node::Branch { entries, tail_child } => {
                if idx >= entries.len() {
                    *tail_child
                } else {
                    entries[idx].child
                }
            }
            Node::Leaf(_) => 0,
        }
    }

    pub fn child_count(&self) -> usize {
        match self {
            Node::Branch { entries, .. } => entries.len() + 1,
            Node::Leaf(_) => 0,
        }
    }

    /// Replaces the child id at `idx` (0..=entries.len(), where
    /// `entries.len()` addresses `tail_child`).
    pub fn set_child_at(&mut self, idx: usize, new_child: PageId) {
        match self {
            Node::Branch { entries, tail_child } => {
                if idx >= entries.len() {
                    *tail_child = new_child;
                } else {
                    entries[idx].child = new_child;
                }
            }
            Node::Leaf(_) => {}
        }
    }

    pub fn decode(page: &NodePage, mut read_overflow: impl FnMut(PageId, usize) -> Vec<u8>) -> Result<Self> {
        match page.page_type()? {
            PageType::Leaf => {
                let mut entries = Vec::with_capacity(page.slot_count());
                for i in 0..page.slot_count() {
                    let slot = page.leaf_slot(i);
                    let (key, value) = read_leaf_record(page, &slot, &mut read_overflow);
                    entries.push(LeafEntry {
                        key,
                        value,
                        is_bucket: slot.is_bucket(),
                    });
                }
                Ok(Node::Leaf(entries))
            }
            PageType::Branch => {
                let mut entries = Vec::with_capacity(page.slot_count());
                for i in 0..page.slot_count() {
                    let slot = page.branch_slot(i);
                    let key = if slot.is_overflow() {
                        read_overflow(slot.offset, slot.key_size as usize)
                    } else {
                        page.record_bytes(slot.offset, slot.key_size).to_vec()
                    };
                    entries.push(BranchEntry {
                        key,
                        child: slot.left_child,
                    });
                }
                Ok(Node::Branch {
                    entries,
                    tail_child: page.tail_child(),
                })
            }
            other => Err(RoltError::Corruption(format!(
                "page decoded as a node has unexpected type {other:?}"
            ))),
        }
    }

    /// Encodes the node into `buf` (one page worth of bytes). Records too
    /// large to inline are handed to `write_overflow`, which must
    /// allocate and persist an overflow chain and return its first page
    /// id.
    pub fn encode(
        &self,
        buf: &mut [u8],
        tx_id: TxId,
        mut write_overflow: impl FnMut(&[u8]) -> Result<PageId>,
    ) -> Result<()> {
        let mut page = NodePageMut::new(buf);
        page.zero();
        let page_size = page.page_size();
        let max_inline = max_inline_record_size(page_size);

        match self {
            Node::Leaf(entries) => {
                page.set_page_type(PageType::Leaf);
                page.set_slot_count(entries.len());
                page.set_last_modified_tx_id(tx_id);
                let mut data_off = page_size as u32;
                for (i, e) in entries.iter().enumerate() {
                    let mut flags = if e.is_bucket { BUCKET_FLAG } else { 0 };
                    let total_len = e.key.len() + e.value.len();
                    if total_len > max_inline {
                        flags |= OVERFLOW_FLAG;
                        let mut payload = Vec::with_capacity(total_len);
                        payload.extend_from_slice(&e.key);
                        payload.extend_from_slice(&e.value);
                        let start = write_overflow(&payload)?;
                        page.set_leaf_slot(
                            i,
                            LeafSlot {
                                offset: start,
                                key_size: e.key.len() as u32,
                                value_size: e.value.len() as u32,
                                flags,
                            },
                        );
                    } else {
                        data_off -= total_len as u32;
                        let mut rec = Vec::with_capacity(total_len);
                        rec.extend_from_slice(&e.key);
                        rec.extend_from_slice(&e.value);
                        page.write_record(data_off, &rec);
                        page.set_leaf_slot(
                            i,
                            LeafSlot {
                                offset: data_off,
                                key_size: e.key.len() as u32,
                                value_size: e.value.len() as u32,
                                flags,
                            },
                        );
                    }
                }
                page.set_data_offset(data_off);
                page.set_space_used(page_size as u32 - data_off);
            }
            Node::Branch { entries, tail_child } => {
                page.set_page_type(PageType::Branch);
                page.set_slot_count(entries.len());
                page.set_last_modified_tx_id(tx_id);
                page.set_tail_child(*tail_child);
                let mut data_off = page_size as u32;
                for (i, e) in entries.iter().enumerate() {
                    let mut flags = 0u8;
                    if e.key.len() > max_inline {
                        flags |= OVERFLOW_FLAG;
                        let start = write_overflow(&e.key)?;
                        page.set_branch_slot(
                            i,
                            BranchSlot {
                                offset: start,
                                key_size: e.key.len() as u32,
                                left_child: e.child,
                                flags,
                            },
                        );
                    } else {
                        data_off -= e.key.len() as u32;
                        page.write_record(data_off, &e.key);
                        page.set_branch_slot(
                            i,
                            BranchSlot {
                                offset: data_off,
                                key_size: e.key.len() as u32,
                                left_child: e.child,
                                flags,
                            },
                        );
                    }
                }
                page.set_data_offset(data_off);
                page.set_space_used(page_size as u32 - data_off);
            }
        }
        Ok(())
    }

    /// Splits off the entries at and after `at` into a new sibling,
    /// returning `(sibling, separator_key)` -- the key the parent should
    /// use to route to the sibling.
    pub fn split_at(&mut self, at: usize) -> (Node, Vec<u8>) {
        match self {
            Node::Leaf(entries) => {
                let right = entries.split_off(at);
                let sep = right[0].key.clone();
                (Node::Leaf(right), sep)
            }
            Node::Branch { entries, tail_child } => {
                let mut right = entries.split_off(at);
                // The entry at the split point becomes the parent
                // separator; its child slides into the left sibling's
                // tail_child, since it covered [sep, right[0].key).
                let promoted = right.remove(0);
                let right_node = Node::Branch {
                    entries: right,
                    tail_child: *tail_child,
                };
                *tail_child = promoted.child;
                (right_node, promoted.key)
            }
        }
    }

    /// Appends another node's entries onto this one, used when merging a
    /// right sibling into a left one during rebalance. `separator` is
    /// the parent key that used to route to `other` (branch merges only).
    pub fn merge(&mut self, other: Node, separator: Option<Vec<u8>>) {
        match (self, other) {
            (Node::Leaf(a), Node::Leaf(b)) => a.extend(b),
            (
                Node::Branch { entries: a, tail_child: a_tail },
                Node::Branch { entries: b, tail_child: b_tail },
            ) => {
                a.push(BranchEntry {
                    key: separator.expect("branch merge requires a separator key"),
                    child: *a_tail,
                });
                a.extend(b);
                *a_tail = b_tail;
            }
            _ => unreachable!("cannot merge a leaf with a branch"),
        }
    }
}

fn read_leaf_record(
    page: &NodePage,
    slot: &LeafSlot,
    read_overflow: &mut impl FnMut(PageId, usize) -> Vec<u8>,
) -> (Vec<u8>, Vec<u8>) {
    if slot.is_overflow() {
        let total = read_overflow(slot.offset, (slot.key_size + slot.value_size) as usize);
        let (k, v) = total.split_at(slot.key_size as usize);
        (k.to_vec(), v.to_vec())
    } else {
        let bytes = page.record_bytes(slot.offset, slot.key_size + slot.value_size);
        (
            bytes[..slot.key_size as usize].to_vec(),
            bytes[slot.key_size as usize..].to_vec(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_split_and_encode_roundtrip() {
        let mut leaf = Node::Leaf(vec![
            LeafEntry { key: b"a".to_vec(), value: b"1".to_vec(), is_bucket: false },
            LeafEntry { key: b"b".to_vec(), value: b"2".to_vec(), is_bucket: false },
            LeafEntry { key: b"c".to_vec(), value: b"3".to_vec(), is_bucket: false },
        ]);
        let (right, sep) = leaf.split_at(2);
        assert_eq!(sep, b"c".to_vec());
        assert_eq!(leaf.len(), 2);
        assert_eq!(right.len(), 1);

        let mut buf = vec![0u8; 4096];
        leaf.encode(&mut buf, 1, |_| unreachable!("no overflow expected")).unwrap();
        let page = NodePage::new(&buf);
        let decoded = Node::decode(&page, |_, _| unreachable!()).unwrap();
        match decoded {
            Node::Leaf(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].key, b"a");
                assert_eq!(entries[1].value, b"2");
            }
            _ => panic!("expected leaf"),
        }
    }

    #[test]
    fn branch_child_routing() {
        let branch = Node::Branch {
            entries: vec![
                BranchEntry { key: b"m".to_vec(), child: 10 },
                BranchEntry { key: b"t".to_vec(), child: 11 },
            ],
            tail_child: 12,
        };
        let cmp = default_comparator();
        assert_eq!(branch.child_at(branch.child_index(b"a", &cmp)), 10);
        assert_eq!(branch.child_at(branch.child_index(b"m", &cmp)), 11);
        assert_eq!(branch.child_at(branch.child_index(b"z", &cmp)), 12);
    }

    #[test]
    fn branch_encode_roundtrip_with_overflow() {
        let big_key = vec![7u8; 8000];
        let branch = Node::Branch {
            entries: vec![BranchEntry { key: big_key.clone(), child: 5 }],
            tail_child: 6,
        };
        let mut overflow_store: Vec<u8> = Vec::new();
        let mut buf = vec![0u8; 4096];
        branch
            .encode(&mut buf, 1, |bytes| {
                overflow_store = bytes.to_vec();
                Ok(99)
            })
            .unwrap();
        let page = NodePage::new(&buf);
        let decoded = Node::decode(&page, |pid, len| {
            assert_eq!(pid, 99);
            overflow_store[..len].to_vec()
        })
        .unwrap();
        match decoded {
            Node::Branch { entries, tail_child } => {
                assert_eq!(entries[0].key, big_key);
                assert_eq!(tail_child, 6);
            }
            _ => panic!("expected branch"),
        }
    }
}
