//! Stack-based B+tree cursor.
//!
//! Grounded on the teacher's `Cursor`/`ElementRef` stack sketch
//! (`search`, ElementRef wrapping a page/node), completed here: since
//! leaves carry no sibling pointers, `next`/`prev` walk back up the
//! root-to-leaf stack to the nearest ancestor with an unvisited child
//! and descend back down, the standard way to iterate a B+tree that
//! only has child pointers.
//!
//! Generic over [`NodeReader`] so the same cursor code serves a live
//! writer (reads go through the pager's dirty-page cache) and a
//! read-only snapshot (reads go straight against a captured mmap).

use crate::error::Result;
use crate::node::{Comparator, Node};
use crate::page::{overflow_page_count, NodePage, PageId, OVERFLOW_HEADER_SIZE};
use crate::pager::Pager;
use memmap::Mmap;
use std::sync::Arc;

/// Abstracts "read these pages" so [`Node::decode`] can be driven either
/// by a writer's pager (dirty cache first, then mmap) or by a plain
/// committed-snapshot reader.
pub trait NodeReader {
    fn page_size(&self) -> u32;
    fn read_raw(&self, id: PageId, count: u32) -> Vec<u8>;
}

impl NodeReader for Pager {
    fn page_size(&self) -> u32 {
        Pager::page_size(self)
    }
    fn read_raw(&self, id: PageId, count: u32) -> Vec<u8> {
        if count <= 1 {
            self.read_page(id)
        } else {
            self.read_pages(id, count)
        }
    }
}

/// A read-only view over one committed snapshot of the data file, used
/// by view transactions so they never consult the writer's dirty cache.
pub struct Snapshot {
    pub mmap: Arc<Mmap>,
    pub page_size: u32,
}

impl NodeReader for Snapshot {
    fn page_size(&self) -> u32 {
        self.page_size
    }
    fn read_raw(&self, id: PageId, count: u32) -> Vec<u8> {
        let off = id as usize * self.page_size as usize;
        let len = self.page_size as usize * count as usize;
        self.mmap[off..off + len].to_vec()
    }
}

pub fn decode_node_at<R: NodeReader + ?Sized>(reader: &R, id: PageId) -> Result<Node> {
    let bytes = reader.read_raw(id, 1);
    let page = NodePage::new(&bytes);
    Node::decode(&page, |start, len| {
        let count = overflow_page_count(len, reader.page_size() as usize);
        let raw = reader.read_raw(start, count);
        let page_size = reader.page_size() as usize;
        let cap_first = page_size - OVERFLOW_HEADER_SIZE;
        let mut out = Vec::with_capacity(len);
        let first_take = cap_first.min(len);
        out.extend_from_slice(&raw[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + first_take]);
        if len > cap_first {
            out.extend_from_slice(&raw[page_size..page_size + (len - cap_first)]);
        }
        out
    })
}

struct Frame {
    node: Node,
    index: usize,
}

pub struct Cursor<'a, R: NodeReader> {
    reader: &'a R,
    cmp: Comparator,
    stack: Vec<Frame>,
}

impl<'a, R: NodeReader> Cursor<'a, R> {
    pub fn new(reader: &'a R, cmp: Comparator) -> Self {
        Self { reader, cmp, stack: Vec::new() }
    }

    /// Positions the cursor at the first key greater than or equal to
    /// `key` (or past the end, if none).
    pub fn seek(&mut self, root: PageId, key: &[u8]) -> Result<()> {
        self.stack.clear();
        self.descend_seek(root, key)
    }

    fn descend_seek(&mut self, page_id: PageId, key: &[u8]) -> Result<()> {
        let node = decode_node_at(self.reader, page_id)?;
        match &node {
            Node::Leaf(entries) => {
                let idx = match entries.binary_search_by(|e| (self.cmp)(&e.key, key)) {
                    Ok(i) => i,
                    Err(i) => i,
                };
                self.stack.push(Frame { node, index: idx });
                Ok(())
            }
            Node::Branch { .. } => {
                let idx = node.child_index(key, &self.cmp);
                let child = node.child_at(idx);
                self.stack.push(Frame { node, index: idx });
                self.descend_seek(child, key)
            }
        }
    }

    pub fn first(&mut self, root: PageId) -> Result<()> {
        self.stack.clear();
        self.descend_first(root)
    }

    fn descend_first(&mut self, page_id: PageId) -> Result<()> {
        let node = decode_node_at(self.reader, page_id)?;
        match &node {
            Node::Leaf(_) => {
                self.stack.push(Frame { node, index: 0 });
                Ok(())
            }
            Node::Branch { .. } => {
                let child = node.child_at(0);
                self.stack.push(Frame { node, index: 0 });
                self.descend_first(child)
            }
        }
    }

    pub fn last(&mut self, root: PageId) -> Result<()> {
        self.stack.clear();
        self.descend_last(root)
    }

    fn descend_last(&mut self, page_id: PageId) -> Result<()> {
        let node = decode_node_at(self.reader, page_id)?;
        match &node {
            Node::Leaf(entries) => {
                let idx = entries.len().saturating_sub(1);
                self.stack.push(Frame { node, index: idx });
                Ok(())
            }
            Node::Branch { .. } => {
                let idx = node.child_count() - 1;
                let child = node.child_at(idx);
                self.stack.push(Frame { node, index: idx });
                self.descend_last(child)
            }
        }
    }

    /// The key/value/is_bucket triple under the cursor, or `None` if the
    /// cursor has walked off either end of the tree or the tree is
    /// empty.
    pub fn current(&self) -> Option<(&[u8], &[u8], bool)> {
        let frame = self.stack.last()?;
        match &frame.node {
            Node::Leaf(entries) => entries
                .get(frame.index)
                .map(|e| (e.key.as_slice(), e.value.as_slice(), e.is_bucket)),
            Node::Branch { .. } => None,
        }
    }

    pub fn next(&mut self) -> Result<bool> {
        match self.stack.last_mut() {
            Some(frame) => {
                if let Node::Leaf(entries) = &frame.node {
                    if frame.index + 1 < entries.len() {
                        frame.index += 1;
                        return Ok(true);
                    }
                }
            }
            None => return Ok(false),
        }
        self.stack.pop();
        while let Some(frame) = self.stack.last_mut() {
            let child_count = frame.node.child_count();
            if frame.index + 1 < child_count {
                frame.index += 1;
                let next_child = frame.node.child_at(frame.index);
                self.descend_first(next_child)?;
                return Ok(true);
            }
            self.stack.pop();
        }
        Ok(false)
    }

    pub fn prev(&mut self) -> Result<bool> {
        match self.stack.last_mut() {
            Some(frame) => {
                if frame.index > 0 {
                    frame.index -= 1;
                    return Ok(true);
                }
            }
            None => return Ok(false),
        }
        self.stack.pop();
        while let Some(frame) = self.stack.last_mut() {
            if frame.index > 0 {
                frame.index -= 1;
                let prev_child = frame.node.child_at(frame.index);
                self.descend_last(prev_child)?;
                return Ok(true);
            }
            self.stack.pop();
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::BTree;
    use crate::node::default_comparator;
    use tempfile::tempdir;

    fn populated_pager(page_size: u32, keys: &[&str]) -> (Pager, PageId) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cursor.db");
        Pager::create(&path, page_size).unwrap();
        let (pager, _meta, _slot) = Pager::open(&path, 64, false).unwrap();
        let tree = BTree::new(&pager, 1, default_comparator());
        let mut root = crate::page::INITIAL_ROOT_PAGE;
        for k in keys {
            root = tree.put(root, k.as_bytes(), b"v", false).unwrap();
        }
        std::mem::forget(dir);
        (pager, root)
    }

    #[test]
    fn forward_iteration_visits_keys_in_order() {
        let (pager, root) = populated_pager(512, &["c", "a", "e", "b", "d"]);
        let mut cursor = Cursor::new(&pager, default_comparator());
        cursor.first(root).unwrap();
        let mut seen = Vec::new();
        loop {
            let (k, _, _) = cursor.current().unwrap();
            seen.push(k.to_vec());
            if !cursor.next().unwrap() {
                break;
            }
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec(), b"e".to_vec()]);
    }

    #[test]
    fn backward_iteration_visits_keys_in_reverse() {
        let (pager, root) = populated_pager(512, &["c", "a", "e", "b", "d"]);
        let mut cursor = Cursor::new(&pager, default_comparator());
        cursor.last(root).unwrap();
        let mut seen = Vec::new();
        loop {
            let (k, _, _) = cursor.current().unwrap();
            seen.push(k.to_vec());
            if !cursor.prev().unwrap() {
                break;
            }
        }
        assert_eq!(seen, vec![b"e".to_vec(), b"d".to_vec(), b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn seek_positions_at_first_key_greater_or_equal() {
        let (pager, root) = populated_pager(4096, &["a", "c", "e"]);
        let mut cursor = Cursor::new(&pager, default_comparator());
        cursor.seek(root, b"b").unwrap();
        assert_eq!(cursor.current().unwrap().0, b"c");
    }

    #[test]
    fn next_past_the_end_returns_false_and_walks_off() {
        let (pager, root) = populated_pager(4096, &["a"]);
        let mut cursor = Cursor::new(&pager, default_comparator());
        cursor.first(root).unwrap();
        assert!(!cursor.next().unwrap());
        assert!(cursor.current().is_none());
    }
}
