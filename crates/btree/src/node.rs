//! B+ tree node model.
//!
//! A node on disk is one fixed-size record payload (`NodeData`); in memory
//! it is a `Node` with growable key/slot vectors so a node may briefly hold
//! one key beyond its limit while a split or borrow is in flight. Nodes are
//! only persisted once they are back within bounds.

use common::{DbError, DbResult, NONE_OFFSET};
use serde::{Deserialize, Serialize};

use crate::bincode_config;
use bincode::serde::{decode_from_slice, encode_into_slice};

/// Branching factor M: the maximum number of children per inner node.
pub const TREE_ORDER: usize = 5;
/// Maximum keys a persisted node may hold (M − 1).
pub const MAX_KEYS: usize = TREE_ORDER - 1;
/// Minimum keys of every node except the root (⌊M/2⌋).
pub const MIN_KEYS: usize = TREE_ORDER / 2;
/// Encoded size of one node payload.
pub const NODE_PAYLOAD_SIZE: usize = 40 + 16 * TREE_ORDER;

/// Discriminates separator nodes from data-carrying leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Inner,
    Leaf,
}

/// On-disk node layout.
///
/// `slots` holds child node offsets for inner nodes and value record
/// offsets for leaves; only the first `keys_count`/`slots_count` entries
/// are meaningful.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct NodeData {
    parent: u64,
    left_sibling: u64,
    right_sibling: u64,
    node_type: NodeType,
    keys_count: u32,
    slots_count: u32,
    reserved: u32,
    keys: [u64; TREE_ORDER],
    slots: [u64; TREE_ORDER],
}

/// One loaded tree node.
#[derive(Clone, Debug)]
pub struct Node {
    /// Record offset this node lives at; `NONE_OFFSET` until first stored.
    pub(crate) position: u64,
    pub(crate) node_type: NodeType,
    /// Persisted back-reference to the parent node. Descent does not rely
    /// on it; it is maintained as a cross-check.
    pub(crate) parent: u64,
    pub(crate) left_sibling: u64,
    pub(crate) right_sibling: u64,
    /// Keys in strictly ascending order.
    pub(crate) keys: Vec<u64>,
    /// Child offsets (inner) or value record offsets (leaf).
    pub(crate) slots: Vec<u64>,
    /// Set when the in-memory state differs from the stored record.
    pub(crate) dirty: bool,
}

impl Node {
    pub(crate) fn new_leaf() -> Self {
        Self {
            position: NONE_OFFSET,
            node_type: NodeType::Leaf,
            parent: NONE_OFFSET,
            left_sibling: NONE_OFFSET,
            right_sibling: NONE_OFFSET,
            keys: Vec::new(),
            slots: Vec::new(),
            dirty: true,
        }
    }

    /// A fresh root over two freshly split halves.
    pub(crate) fn new_root(key: u64, left: u64, right: u64) -> Self {
        Self {
            position: NONE_OFFSET,
            node_type: NodeType::Inner,
            parent: NONE_OFFSET,
            left_sibling: NONE_OFFSET,
            right_sibling: NONE_OFFSET,
            keys: vec![key],
            slots: vec![left, right],
            dirty: true,
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.node_type == NodeType::Leaf
    }

    pub(crate) fn is_inner(&self) -> bool {
        self.node_type == NodeType::Inner
    }

    pub(crate) fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_overflow(&self) -> bool {
        self.keys.len() > MAX_KEYS
    }

    pub(crate) fn is_underflow(&self) -> bool {
        self.keys.len() < MIN_KEYS
    }

    /// Whether this node can lend a key without going deficient.
    pub(crate) fn can_lend(&self) -> bool {
        self.keys.len() > MIN_KEYS
    }

    pub(crate) fn key_at(&self, index: usize) -> u64 {
        self.keys[index]
    }

    pub(crate) fn set_key_at(&mut self, index: usize, key: u64) {
        self.keys[index] = key;
        self.dirty = true;
    }

    pub(crate) fn slot_at(&self, index: usize) -> u64 {
        self.slots[index]
    }

    pub(crate) fn set_slot_at(&mut self, index: usize, slot: u64) {
        self.slots[index] = slot;
        self.dirty = true;
    }

    /// Which child subtree covers `key` (inner nodes).
    ///
    /// A key equal to a separator belongs to the right subtree; a key
    /// below every separator to the leftmost.
    pub(crate) fn child_index(&self, key: u64) -> usize {
        for (index, &entry) in self.keys.iter().enumerate() {
            if key == entry {
                return index + 1;
            }
            if key < entry {
                return index;
            }
        }
        self.keys.len()
    }

    /// Binary search for `key` among this node's keys.
    pub(crate) fn search(&self, key: u64) -> Option<usize> {
        self.keys.binary_search(&key).ok()
    }

    /// Insertion index that keeps keys ascending, or `None` when the key
    /// is already present.
    pub(crate) fn place_for(&self, key: u64) -> Option<usize> {
        match self.keys.binary_search(&key) {
            Ok(_) => None,
            Err(index) => Some(index),
        }
    }

    /// Index of the child stored at `position` (inner nodes).
    pub(crate) fn position_of_child(&self, position: u64) -> Option<usize> {
        self.slots.iter().position(|&slot| slot == position)
    }

    pub(crate) fn leaf_insert_at(&mut self, index: usize, key: u64, value_position: u64) {
        debug_assert!(self.is_leaf());
        self.keys.insert(index, key);
        self.slots.insert(index, value_position);
        self.dirty = true;
    }

    pub(crate) fn leaf_delete_at(&mut self, index: usize) {
        debug_assert!(self.is_leaf());
        self.keys.remove(index);
        self.slots.remove(index);
        self.dirty = true;
    }

    /// Insert a separator with its two children at `index`: the left child
    /// lands at the key's position, the right one immediately after.
    pub(crate) fn inner_insert_at(&mut self, index: usize, key: u64, left: u64, right: u64) {
        debug_assert!(self.is_inner());
        self.keys.insert(index, key);
        self.slots.insert(index, left);
        if index + 1 < self.slots.len() {
            self.slots[index + 1] = right;
        } else {
            self.slots.push(right);
        }
        self.dirty = true;
    }

    /// Remove the separator at `index` together with its right child.
    pub(crate) fn inner_delete_at(&mut self, index: usize) {
        debug_assert!(self.is_inner());
        self.keys.remove(index);
        self.slots.remove(index + 1);
        self.dirty = true;
    }

    /// Prepend a separator and leading child (borrow from the left).
    pub(crate) fn inner_insert_front(&mut self, key: u64, child: u64) {
        debug_assert!(self.is_inner());
        self.keys.insert(0, key);
        self.slots.insert(0, child);
        self.dirty = true;
    }

    /// Drop the first separator and leading child (lend to the left).
    pub(crate) fn inner_delete_front(&mut self) {
        debug_assert!(self.is_inner());
        self.keys.remove(0);
        self.slots.remove(0);
        self.dirty = true;
    }

    /// Append a separator and trailing child (borrow from the right).
    pub(crate) fn inner_push_back(&mut self, key: u64, child: u64) {
        debug_assert!(self.is_inner());
        self.keys.push(key);
        self.slots.push(child);
        self.dirty = true;
    }

    /// Split this node at `mid`, returning the detached right half.
    ///
    /// A leaf keeps keys below `mid` and hands over the rest; an inner
    /// node additionally drops the key at `mid` itself, which ascends to
    /// the parent as the separator between the halves.
    pub(crate) fn split_off(&mut self, mid: usize) -> Node {
        let (keys, slots) = match self.node_type {
            NodeType::Leaf => {
                let keys = self.keys.split_off(mid);
                let slots = self.slots.split_off(mid);
                (keys, slots)
            }
            NodeType::Inner => {
                let keys = self.keys.split_off(mid + 1);
                self.keys.pop();
                let slots = self.slots.split_off(mid + 1);
                (keys, slots)
            }
        };
        self.dirty = true;
        Node {
            position: NONE_OFFSET,
            node_type: self.node_type,
            parent: self.parent,
            left_sibling: NONE_OFFSET,
            right_sibling: NONE_OFFSET,
            keys,
            slots,
            dirty: true,
        }
    }

    /// Encode for storage. Counts must be back within node bounds.
    pub(crate) fn to_payload(&self) -> DbResult<Vec<u8>> {
        debug_assert!(self.keys.len() <= MAX_KEYS);
        debug_assert!(self.slots.len() <= TREE_ORDER);
        let mut data = NodeData {
            parent: self.parent,
            left_sibling: self.left_sibling,
            right_sibling: self.right_sibling,
            node_type: self.node_type,
            keys_count: self.keys.len() as u32,
            slots_count: self.slots.len() as u32,
            reserved: 0,
            keys: [0; TREE_ORDER],
            slots: [0; TREE_ORDER],
        };
        data.keys[..self.keys.len()].copy_from_slice(&self.keys);
        data.slots[..self.slots.len()].copy_from_slice(&self.slots);

        let mut buf = vec![0u8; NODE_PAYLOAD_SIZE];
        let written = encode_into_slice(&data, &mut buf, bincode_config())
            .map_err(|e| DbError::Storage(format!("encode tree node failed: {e}")))?;
        debug_assert_eq!(written, NODE_PAYLOAD_SIZE);
        Ok(buf)
    }

    /// Decode the record payload stored at `position`.
    pub(crate) fn from_record(position: u64, payload: &[u8]) -> DbResult<Self> {
        if payload.len() != NODE_PAYLOAD_SIZE {
            return Err(DbError::Corrupted(format!(
                "tree node at {position} has payload of {} bytes",
                payload.len()
            )));
        }
        let (data, read): (NodeData, usize) = decode_from_slice(payload, bincode_config())
            .map_err(|e| DbError::Corrupted(format!("decode tree node at {position} failed: {e}")))?;
        debug_assert_eq!(read, NODE_PAYLOAD_SIZE);

        let keys_count = data.keys_count as usize;
        let slots_count = data.slots_count as usize;
        if keys_count > MAX_KEYS || slots_count > TREE_ORDER {
            return Err(DbError::Corrupted(format!(
                "tree node at {position} has {keys_count} keys and {slots_count} slots"
            )));
        }
        let consistent = match data.node_type {
            NodeType::Leaf => slots_count == keys_count,
            NodeType::Inner => keys_count >= 1 && slots_count == keys_count + 1,
        };
        if !consistent {
            return Err(DbError::Corrupted(format!(
                "tree node at {position} has inconsistent counts"
            )));
        }
        let keys = data.keys[..keys_count].to_vec();
        debug_assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));

        Ok(Self {
            position,
            node_type: data.node_type,
            parent: data.parent,
            left_sibling: data.left_sibling,
            right_sibling: data.right_sibling,
            keys,
            slots: data.slots[..slots_count].to_vec(),
            dirty: false,
        })
    }
}
