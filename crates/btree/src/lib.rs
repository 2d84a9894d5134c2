//! Persistent B+ tree index over the record store.
//!
//! Keys are unsigned 64-bit integers, values opaque strings. Every tree
//! node is stored as one fixed-size record and every value as its own
//! record, so the index adds no file format of its own beyond the node
//! payload. Leaves form a doubly-linked list in ascending key order, which
//! backs the cursor operations.
//!
//! Descent keeps the visited ancestor offsets on a local stack; overflow
//! and underflow handling walk that stack back up instead of chasing the
//! persisted parent links (those are kept as cross-checks only).

mod node;


pub use node::{Node, NodeType, MAX_KEYS, MIN_KEYS, NODE_PAYLOAD_SIZE, TREE_ORDER};

use bincode::config::{self, Config};
use bincode::serde::{decode_from_slice, encode_into_slice};
use common::{DbError, DbResult, NONE_OFFSET};
use serde::{Deserialize, Serialize};
use storage::RecordFile;

/// Encoded size of the index header record payload.
pub const INDEX_HEADER_SIZE: usize = 32;

pub(crate) fn bincode_config() -> impl Config {
    config::legacy()
}

/// Index bookkeeping, stored as the first record of the file.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct IndexHeader {
    tree_order: u64,
    root_position: u64,
    records_count: u64,
    auto_key_counter: u64,
}

impl IndexHeader {
    fn to_bytes(&self) -> DbResult<[u8; INDEX_HEADER_SIZE]> {
        let mut buf = [0u8; INDEX_HEADER_SIZE];
        let written = encode_into_slice(self, &mut buf, bincode_config())
            .map_err(|e| DbError::Storage(format!("encode index header failed: {e}")))?;
        debug_assert_eq!(written, INDEX_HEADER_SIZE);
        Ok(buf)
    }

    fn from_bytes(payload: &[u8]) -> DbResult<Self> {
        if payload.len() != INDEX_HEADER_SIZE {
            return Err(DbError::Corrupted(format!(
                "index header has {} bytes",
                payload.len()
            )));
        }
        let (header, read): (Self, usize) = decode_from_slice(payload, bincode_config())
            .map_err(|e| DbError::Corrupted(format!("decode index header failed: {e}")))?;
        debug_assert_eq!(read, INDEX_HEADER_SIZE);
        Ok(header)
    }
}

/// Cursor: a leaf and an entry index within it.
#[derive(Clone, Copy, Debug)]
struct Cursor {
    leaf: u64,
    index: usize,
}

/// Ordered map from `u64` keys to string values, persisted through a
/// [`RecordFile`].
///
/// Mutating operations persist every dirtied node and the index header
/// before returning; durability to the device still requires
/// [`flush`](BTreeIndex::flush).
#[derive(Debug)]
pub struct BTreeIndex {
    records: RecordFile,
    header: IndexHeader,
    header_position: u64,
    cursor: Option<Cursor>,
    tree_changed: bool,
}

impl BTreeIndex {
    /// Load the index from `records`, bootstrapping an empty tree (index
    /// header record plus an empty root leaf) on fresh storage.
    ///
    /// Refuses to open a file whose persisted tree order differs from the
    /// compiled [`TREE_ORDER`]; the node layout would be misread.
    pub fn open(mut records: RecordFile) -> DbResult<Self> {
        let (header, header_position) = match records.first()? {
            None => {
                let mut header = IndexHeader {
                    tree_order: TREE_ORDER as u64,
                    root_position: NONE_OFFSET,
                    records_count: 0,
                    auto_key_counter: 0,
                };
                let header_position = records.create_record(&header.to_bytes()?)?;
                let root_payload = Node::new_leaf().to_payload()?;
                header.root_position = records.create_record(&root_payload)?;
                records.set_position(header_position)?;
                records.set_record_data(&header.to_bytes()?)?;
                (header, header_position)
            }
            Some(header_position) => {
                let header = IndexHeader::from_bytes(&records.record_data()?)?;
                if header.tree_order != TREE_ORDER as u64 {
                    return Err(DbError::Storage(format!(
                        "index was created with tree order {}, this build uses {}",
                        header.tree_order, TREE_ORDER
                    )));
                }
                if header.root_position == NONE_OFFSET {
                    return Err(DbError::Corrupted("index has no root node".into()));
                }
                (header, header_position)
            }
        };

        Ok(Self {
            records,
            header,
            header_position,
            cursor: None,
            // Forces first()/last()/search() before next()/previous().
            tree_changed: true,
        })
    }

    /// Number of key/value pairs in the tree.
    pub fn size(&self) -> u64 {
        self.header.records_count
    }

    /// The key an auto-keyed insert would receive next.
    pub fn next_auto_key(&self) -> u64 {
        self.header.auto_key_counter
    }

    pub fn is_read_only(&self) -> bool {
        self.records.is_read_only()
    }

    /// The underlying record store (statistics, file size).
    pub fn records(&self) -> &RecordFile {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut RecordFile {
        &mut self.records
    }

    /// Push all buffered pages to the device.
    pub fn flush(&mut self) -> DbResult<()> {
        self.records.flush()
    }

    /// Whether `key` is present, without touching the cursor.
    pub fn contains(&mut self, key: u64) -> DbResult<bool> {
        let (leaf, _path) = self.find_leaf(key)?;
        Ok(leaf.search(key).is_some())
    }

    /// Levels of inner nodes above the leaves (0 for a leaf root).
    pub fn height(&mut self) -> DbResult<usize> {
        let mut levels = 0;
        let mut node = self.load_node(self.header.root_position)?;
        while node.is_inner() {
            node = self.load_node(node.slot_at(0))?;
            levels += 1;
        }
        Ok(levels)
    }

    /// Insert a new key/value pair. A present key is reported as
    /// [`DbError::DuplicateKey`] and the tree is left untouched.
    pub fn insert(&mut self, key: u64, value: &str) -> DbResult<()> {
        if key == NONE_OFFSET {
            return Err(DbError::Storage(format!("key {key} is reserved")));
        }
        let (mut leaf, path) = self.find_leaf(key)?;
        let Some(index) = leaf.place_for(key) else {
            return Err(DbError::DuplicateKey(key));
        };

        let value_position = self.records.create_record(value.as_bytes())?;
        leaf.leaf_insert_at(index, key, value_position);
        if leaf.is_overflow() {
            self.split_and_propagate(leaf, path)?;
        } else {
            self.persist_node(&mut leaf)?;
        }

        self.header.records_count += 1;
        if key >= self.header.auto_key_counter {
            self.header.auto_key_counter = key + 1;
        }
        self.persist_index_header()?;
        self.tree_changed = true;
        Ok(())
    }

    /// Overwrite the value of an existing key.
    ///
    /// When the new value fits the record in place the cursor stays valid;
    /// when the value record moves, iteration must re-anchor.
    pub fn update(&mut self, key: u64, value: &str) -> DbResult<()> {
        let (mut leaf, _path) = self.find_leaf(key)?;
        let Some(index) = leaf.search(key) else {
            return Err(DbError::KeyNotFound(key));
        };

        let value_position = leaf.slot_at(index);
        self.records.set_position(value_position)?;
        let new_position = self.records.set_record_data(value.as_bytes())?;
        if new_position != value_position {
            leaf.set_slot_at(index, new_position);
            self.persist_node(&mut leaf)?;
            self.tree_changed = true;
        }
        Ok(())
    }

    /// Look up `key`. A hit anchors the cursor on the found entry.
    pub fn search(&mut self, key: u64) -> DbResult<Option<String>> {
        let (leaf, _path) = self.find_leaf(key)?;
        let Some(index) = leaf.search(key) else {
            return Ok(None);
        };
        let value = self.read_value(leaf.slot_at(index))?;
        self.cursor = Some(Cursor {
            leaf: leaf.position,
            index,
        });
        self.tree_changed = false;
        Ok(Some(value))
    }

    /// Remove `key` and its value record, rebalancing as needed.
    pub fn erase(&mut self, key: u64) -> DbResult<()> {
        let (mut leaf, path) = self.find_leaf(key)?;
        let Some(index) = leaf.search(key) else {
            return Err(DbError::KeyNotFound(key));
        };

        let value_position = leaf.slot_at(index);
        self.records.set_position(value_position)?;
        self.records.remove_record()?;

        leaf.leaf_delete_at(index);
        if leaf.is_underflow() && !path.is_empty() {
            self.rebalance(leaf, path)?;
        } else {
            self.persist_node(&mut leaf)?;
        }

        self.header.records_count -= 1;
        self.persist_index_header()?;
        self.tree_changed = true;
        Ok(())
    }

    /// Anchor the cursor on the smallest key and return its entry.
    pub fn first(&mut self) -> DbResult<Option<(u64, String)>> {
        let (leaf, _path) = self.find_leaf(0)?;
        if leaf.key_count() == 0 {
            self.cursor = None;
            return Ok(None);
        }
        self.cursor = Some(Cursor {
            leaf: leaf.position,
            index: 0,
        });
        self.tree_changed = false;
        let value = self.read_value(leaf.slot_at(0))?;
        Ok(Some((leaf.key_at(0), value)))
    }

    /// Anchor the cursor on the largest key and return its entry.
    ///
    /// Probing with the sentinel offset sends every inner node to its
    /// rightmost child.
    pub fn last(&mut self) -> DbResult<Option<(u64, String)>> {
        let (leaf, _path) = self.find_leaf(NONE_OFFSET)?;
        if leaf.key_count() == 0 {
            self.cursor = None;
            return Ok(None);
        }
        let index = leaf.key_count() - 1;
        self.cursor = Some(Cursor {
            leaf: leaf.position,
            index,
        });
        self.tree_changed = false;
        let value = self.read_value(leaf.slot_at(index))?;
        Ok(Some((leaf.key_at(index), value)))
    }

    /// Step the cursor to the next entry in ascending order.
    ///
    /// Returns `None` off the end, or when the tree changed since the
    /// cursor was last anchored by `first`/`last`/`search`.
    pub fn next(&mut self) -> DbResult<Option<(u64, String)>> {
        if self.tree_changed {
            return Ok(None);
        }
        let Some(cursor) = self.cursor else {
            return Ok(None);
        };

        let mut leaf = self.load_node(cursor.leaf)?;
        let mut index = cursor.index + 1;
        if index >= leaf.key_count() {
            if leaf.right_sibling == NONE_OFFSET {
                return Ok(None);
            }
            leaf = self.load_node(leaf.right_sibling)?;
            if leaf.key_count() == 0 {
                return Ok(None);
            }
            index = 0;
        }

        self.cursor = Some(Cursor {
            leaf: leaf.position,
            index,
        });
        let value = self.read_value(leaf.slot_at(index))?;
        Ok(Some((leaf.key_at(index), value)))
    }

    /// Step the cursor to the previous entry in descending order.
    pub fn previous(&mut self) -> DbResult<Option<(u64, String)>> {
        if self.tree_changed {
            return Ok(None);
        }
        let Some(cursor) = self.cursor else {
            return Ok(None);
        };

        let mut leaf = self.load_node(cursor.leaf)?;
        let index = if cursor.index == 0 {
            if leaf.left_sibling == NONE_OFFSET {
                return Ok(None);
            }
            leaf = self.load_node(leaf.left_sibling)?;
            if leaf.key_count() == 0 {
                return Ok(None);
            }
            leaf.key_count() - 1
        } else {
            cursor.index - 1
        };

        self.cursor = Some(Cursor {
            leaf: leaf.position,
            index,
        });
        let value = self.read_value(leaf.slot_at(index))?;
        Ok(Some((leaf.key_at(index), value)))
    }

    // ---- Node I/O ----

    fn load_node(&mut self, position: u64) -> DbResult<Node> {
        self.records.set_position(position)?;
        let payload = self.records.record_data()?;
        Node::from_record(position, &payload)
    }

    fn persist_node(&mut self, node: &mut Node) -> DbResult<()> {
        if !node.dirty {
            return Ok(());
        }
        self.records.set_position(node.position)?;
        let stored_at = self.records.set_record_data(&node.to_payload()?)?;
        // The payload size is fixed, so the record never relocates.
        debug_assert_eq!(stored_at, node.position);
        node.dirty = false;
        Ok(())
    }

    fn create_node(&mut self, mut node: Node) -> DbResult<Node> {
        let payload = node.to_payload()?;
        node.position = self.records.create_record(&payload)?;
        node.dirty = false;
        Ok(node)
    }

    fn free_node(&mut self, position: u64) -> DbResult<()> {
        self.records.set_position(position)?;
        self.records.remove_record()?;
        Ok(())
    }

    fn read_value(&mut self, position: u64) -> DbResult<String> {
        self.records.set_position(position)?;
        let bytes = self.records.record_data()?;
        String::from_utf8(bytes)
            .map_err(|_| DbError::Corrupted(format!("value record at {position} is not UTF-8")))
    }

    fn persist_index_header(&mut self) -> DbResult<()> {
        let bytes = self.header.to_bytes()?;
        self.records.set_position(self.header_position)?;
        self.records.set_record_data(&bytes)?;
        Ok(())
    }

    // ---- Descent ----

    /// Walk from the root to the leaf covering `key`, collecting the
    /// ancestor offsets on the way down.
    fn find_leaf(&mut self, key: u64) -> DbResult<(Node, Vec<u64>)> {
        let mut path = Vec::new();
        let mut node = self.load_node(self.header.root_position)?;
        #[cfg(debug_assertions)]
        let mut visited = vec![node.position];

        while node.is_inner() {
            let child_position = node.slot_at(node.child_index(key));
            #[cfg(debug_assertions)]
            {
                if visited.contains(&child_position) {
                    return Err(DbError::Corrupted(format!(
                        "cycle through tree node {child_position}"
                    )));
                }
                visited.push(child_position);
            }
            path.push(node.position);
            node = self.load_node(child_position)?;
        }
        Ok((node, path))
    }

    // ---- Overflow ----

    /// Split an overflowing node and push its middle key into the parent,
    /// repeating up the ancestor path; splitting the root grows the tree
    /// one level.
    fn split_and_propagate(&mut self, mut node: Node, mut path: Vec<u64>) -> DbResult<()> {
        loop {
            let mid = node.key_count() / 2;
            let up_key = node.key_at(mid);

            let mut right = node.split_off(mid);
            right.parent = path.last().copied().unwrap_or(NONE_OFFSET);
            right.left_sibling = node.position;
            right.right_sibling = node.right_sibling;
            let mut right = self.create_node(right)?;

            // Children that moved over now answer to the new node.
            if right.is_inner() {
                for slot in 0..right.slot_count() {
                    let child_position = right.slot_at(slot);
                    let mut child = self.load_node(child_position)?;
                    child.parent = right.position;
                    child.dirty = true;
                    self.persist_node(&mut child)?;
                }
            }

            // Wire the new node into the sibling chain.
            if node.right_sibling != NONE_OFFSET {
                let mut after = self.load_node(node.right_sibling)?;
                after.left_sibling = right.position;
                after.dirty = true;
                self.persist_node(&mut after)?;
            }
            node.right_sibling = right.position;
            node.dirty = true;

            match path.pop() {
                None => {
                    let new_root =
                        self.create_node(Node::new_root(up_key, node.position, right.position))?;
                    node.parent = new_root.position;
                    right.parent = new_root.position;
                    right.dirty = true;
                    self.persist_node(&mut node)?;
                    self.persist_node(&mut right)?;
                    self.header.root_position = new_root.position;
                    return Ok(());
                }
                Some(parent_position) => {
                    self.persist_node(&mut node)?;
                    let mut parent = self.load_node(parent_position)?;
                    let index = parent.child_index(up_key);
                    parent.inner_insert_at(index, up_key, node.position, right.position);
                    if parent.is_overflow() {
                        node = parent;
                        continue;
                    }
                    self.persist_node(&mut parent)?;
                    return Ok(());
                }
            }
        }
    }

    // ---- Underflow ----

    /// Refill a deficient node by borrowing from a sibling under the same
    /// parent, or merge and repeat one level up. An inner root left
    /// without keys hands the root role to its single child.
    fn rebalance(&mut self, mut node: Node, mut path: Vec<u64>) -> DbResult<()> {
        loop {
            let Some(parent_position) = path.pop() else {
                if node.is_inner() && node.key_count() == 0 {
                    let child_position = node.slot_at(0);
                    let mut child = self.load_node(child_position)?;
                    child.parent = NONE_OFFSET;
                    child.dirty = true;
                    self.persist_node(&mut child)?;
                    self.free_node(node.position)?;
                    self.header.root_position = child_position;
                } else {
                    self.persist_node(&mut node)?;
                }
                return Ok(());
            };

            if !node.is_underflow() {
                // A merge below already left this level balanced.
                self.persist_node(&mut node)?;
                return Ok(());
            }

            let mut parent = self.load_node(parent_position)?;

            if node.left_sibling != NONE_OFFSET {
                let left = self.load_node(node.left_sibling)?;
                if left.parent == parent_position && left.can_lend() {
                    self.borrow_from_left(&mut parent, &mut node, left)?;
                    self.persist_node(&mut node)?;
                    self.persist_node(&mut parent)?;
                    return Ok(());
                }
            }
            if node.right_sibling != NONE_OFFSET {
                let right = self.load_node(node.right_sibling)?;
                if right.parent == parent_position && right.can_lend() {
                    self.borrow_from_right(&mut parent, &mut node, right)?;
                    self.persist_node(&mut node)?;
                    self.persist_node(&mut parent)?;
                    return Ok(());
                }
            }

            let merge_left = node.left_sibling != NONE_OFFSET
                && self.load_node(node.left_sibling)?.parent == parent_position;
            if merge_left {
                let left = self.load_node(node.left_sibling)?;
                self.merge_nodes(&mut parent, left, node)?;
            } else {
                if node.right_sibling == NONE_OFFSET {
                    return Err(DbError::Corrupted(format!(
                        "node {} has no sibling to merge with",
                        node.position
                    )));
                }
                let right = self.load_node(node.right_sibling)?;
                self.merge_nodes(&mut parent, node, right)?;
            }

            // The parent lost a separator and may now be deficient.
            node = parent;
        }
    }

    /// Move the rightmost key of `left` into `node`, updating the
    /// separator between them.
    fn borrow_from_left(
        &mut self,
        parent: &mut Node,
        node: &mut Node,
        mut left: Node,
    ) -> DbResult<()> {
        let node_index = self.expect_child(parent, node.position)?;
        let separator_index = node_index.checked_sub(1).ok_or_else(|| {
            DbError::Corrupted(format!(
                "node {} has a left sibling but is its parent's first child",
                node.position
            ))
        })?;
        let lend_index = left.key_count() - 1;

        match node.node_type {
            NodeType::Leaf => {
                let key = left.key_at(lend_index);
                let value_position = left.slot_at(lend_index);
                left.leaf_delete_at(lend_index);
                node.leaf_insert_at(0, key, value_position);
                // The borrowed key becomes the separator.
                parent.set_key_at(separator_index, node.key_at(0));
            }
            NodeType::Inner => {
                let separator = parent.key_at(separator_index);
                let up_key = left.key_at(lend_index);
                let child_position = left.slot_at(left.slot_count() - 1);
                left.inner_delete_at(lend_index);
                // The separator descends in front of the borrowed child.
                node.inner_insert_front(separator, child_position);
                let mut child = self.load_node(child_position)?;
                child.parent = node.position;
                child.dirty = true;
                self.persist_node(&mut child)?;
                parent.set_key_at(separator_index, up_key);
            }
        }
        self.persist_node(&mut left)?;
        Ok(())
    }

    /// Move the leftmost key of `right` into `node`, updating the
    /// separator between them.
    fn borrow_from_right(
        &mut self,
        parent: &mut Node,
        node: &mut Node,
        mut right: Node,
    ) -> DbResult<()> {
        let node_index = self.expect_child(parent, node.position)?;
        let separator_index = node_index;
        if separator_index >= parent.key_count() {
            return Err(DbError::Corrupted(format!(
                "node {} has a right sibling but is its parent's last child",
                node.position
            )));
        }

        match node.node_type {
            NodeType::Leaf => {
                let key = right.key_at(0);
                let value_position = right.slot_at(0);
                right.leaf_delete_at(0);
                node.leaf_insert_at(node.key_count(), key, value_position);
                parent.set_key_at(separator_index, right.key_at(0));
            }
            NodeType::Inner => {
                let separator = parent.key_at(separator_index);
                let up_key = right.key_at(0);
                let child_position = right.slot_at(0);
                right.inner_delete_front();
                node.inner_push_back(separator, child_position);
                let mut child = self.load_node(child_position)?;
                child.parent = node.position;
                child.dirty = true;
                self.persist_node(&mut child)?;
                parent.set_key_at(separator_index, up_key);
            }
        }
        self.persist_node(&mut right)?;
        Ok(())
    }

    /// Fold `right` into `left`: the separator between them descends (for
    /// inner nodes), `right`'s record is freed, and the sibling chain is
    /// rewired. The separator is removed from `parent`.
    fn merge_nodes(&mut self, parent: &mut Node, mut left: Node, right: Node) -> DbResult<()> {
        let index = self.expect_child(parent, left.position)?;
        if index >= parent.key_count() {
            return Err(DbError::Corrupted(format!(
                "no separator above node {}",
                left.position
            )));
        }
        let separator = parent.key_at(index);

        match left.node_type {
            NodeType::Leaf => {
                left.keys.extend_from_slice(&right.keys);
                left.slots.extend_from_slice(&right.slots);
            }
            NodeType::Inner => {
                left.keys.push(separator);
                left.keys.extend_from_slice(&right.keys);
                for &child_position in &right.slots {
                    let mut child = self.load_node(child_position)?;
                    child.parent = left.position;
                    child.dirty = true;
                    self.persist_node(&mut child)?;
                }
                left.slots.extend_from_slice(&right.slots);
            }
        }

        left.right_sibling = right.right_sibling;
        if right.right_sibling != NONE_OFFSET {
            let mut after = self.load_node(right.right_sibling)?;
            after.left_sibling = left.position;
            after.dirty = true;
            self.persist_node(&mut after)?;
        }
        left.dirty = true;
        self.persist_node(&mut left)?;
        self.free_node(right.position)?;

        parent.inner_delete_at(index);
        Ok(())
    }

    fn expect_child(&self, parent: &Node, position: u64) -> DbResult<usize> {
        parent.position_of_child(position).ok_or_else(|| {
            DbError::Corrupted(format!(
                "node {} is not a child of node {}",
                position, parent.position
            ))
        })
    }
}
