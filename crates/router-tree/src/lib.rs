//! Compressed radix (Patricia) tree over sequences of token ids.
//!
//! Mirrors a worker's believed KV-cache contents: `insert` records that a
//! sequence has been sent to the worker, `delete` retracts that, and
//! `prefix_match` finds the longest prefix of a query the worker has
//! already seen. Reference counting on each node means structure that no
//! live sequence still needs disappears on its own, with no scheduled
//! eviction pass.

use std::collections::HashMap;
use std::fmt;

pub type TokenId = u32;

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("sequence of length {sequence_len} is not present in the tree")]
    NotFound { sequence_len: usize },
}

#[derive(Debug, Default)]
struct Node {
    edge: Vec<TokenId>,
    children: HashMap<TokenId, Node>,
    count: u64,
}

/// A tree tracking zero or more live (inserted, not yet deleted) token-id
/// sequences for a single worker.
#[derive(Default)]
pub struct RadixTree {
    root: Node,
}

impl RadixTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of currently-tracked sequences (inserts minus deletes
    /// over the tree's lifetime).
    pub fn len(&self) -> u64 {
        self.root.count
    }

    pub fn is_empty(&self) -> bool {
        self.root.count == 0
    }

    /// Add one reference for `seq`.
    pub fn insert(&mut self, seq: &[TokenId]) {
        insert_rec(&mut self.root, seq);
        self.root.count += 1;
    }

    /// Longest prefix of `seq` reachable along a single root-to-node path.
    /// Read-only; never mutates the tree.
    pub fn prefix_match(&self, seq: &[TokenId]) -> Vec<TokenId> {
        let mut node = &self.root;
        let mut remaining = seq;
        let mut matched = 0usize;

        loop {
            if remaining.is_empty() {
                break;
            }
            let Some(child) = node.children.get(&remaining[0]) else {
                break;
            };
            let p = common_prefix_len(&child.edge, remaining);
            matched += p;
            if p == child.edge.len() {
                remaining = &remaining[p..];
                node = child;
            } else {
                break;
            }
        }

        seq[..matched].to_vec()
    }

    /// Remove one reference for `seq`. `seq` must currently be tracked
    /// (i.e. inserted and not yet deleted); otherwise returns `NotFound`
    /// and leaves the tree unchanged.
    pub fn delete(&mut self, seq: &[TokenId]) -> Result<(), TreeError> {
        if !self.terminates_at_node(seq) {
            return Err(TreeError::NotFound {
                sequence_len: seq.len(),
            });
        }
        delete_rec(&mut self.root, seq);
        self.root.count -= 1;
        Ok(())
    }

    /// True if `seq` traverses only fully-consumed edges and lands
    /// exactly on a node, rather than stopping partway along an edge.
    /// `prefix_match(seq) == seq` is not enough to tell the two apart:
    /// a mid-edge stop still reports the tokens matched so far as the
    /// prefix, which equals `seq` whenever `seq` ends inside that edge.
    fn terminates_at_node(&self, seq: &[TokenId]) -> bool {
        let mut node = &self.root;
        let mut remaining = seq;
        loop {
            if remaining.is_empty() {
                return true;
            }
            let Some(child) = node.children.get(&remaining[0]) else {
                return false;
            };
            let p = common_prefix_len(&child.edge, remaining);
            if p != child.edge.len() {
                return false;
            }
            remaining = &remaining[p..];
            node = child;
        }
    }
}

impl fmt::Debug for RadixTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "RadixTree(root count={})", self.root.count)?;
        fn write_node(f: &mut fmt::Formatter<'_>, node: &Node, depth: usize) -> fmt::Result {
            let mut entries: Vec<_> = node.children.iter().collect();
            entries.sort_by_key(|(k, _)| **k);
            for (_, child) in entries {
                writeln!(
                    f,
                    "{}edge={:?} count={}",
                    "  ".repeat(depth + 1),
                    child.edge,
                    child.count
                )?;
                write_node(f, child, depth + 1)?;
            }
            Ok(())
        }
        write_node(f, &self.root, 0)
    }
}

fn common_prefix_len(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn insert_rec(node: &mut Node, remaining: &[TokenId]) {
    if remaining.is_empty() {
        return;
    }
    let key = remaining[0];
    match node.children.get_mut(&key) {
        Some(child) => {
            let p = common_prefix_len(&child.edge, remaining);
            if p == child.edge.len() {
                child.count += 1;
                insert_rec(child, &remaining[p..]);
            } else {
                split_child(child, p);
                child.count += 1;
                insert_rec(child, &remaining[p..]);
            }
        }
        None => {
            node.children.insert(
                key,
                Node {
                    edge: remaining.to_vec(),
                    children: HashMap::new(),
                    count: 1,
                },
            );
        }
    }
}

/// Splits `child`'s edge at offset `p` (`0 < p < child.edge.len()`),
/// introducing a new intermediate node that takes over `child`'s old edge
/// tail, count, and children. `child` is left in place as the
/// intermediate, with `edge` truncated to its first `p` tokens.
fn split_child(child: &mut Node, p: usize) {
    let old_edge = std::mem::take(&mut child.edge);
    let old_children = std::mem::take(&mut child.children);
    let old_count = child.count;

    let tail_key = old_edge[p];
    let grandchild = Node {
        edge: old_edge[p..].to_vec(),
        children: old_children,
        count: old_count,
    };

    child.edge = old_edge[..p].to_vec();
    child.count = old_count;
    child.children.insert(tail_key, grandchild);
}

const VALIDATED: &str = "delete() validates the full path via prefix_match before mutating";

fn delete_rec(node: &mut Node, remaining: &[TokenId]) {
    if remaining.is_empty() {
        return;
    }
    let key = remaining[0];
    let p = {
        let child = node.children.get(&key).expect(VALIDATED);
        common_prefix_len(&child.edge, remaining)
    };
    node.children.get_mut(&key).expect(VALIDATED).count -= 1;
    delete_rec(node.children.get_mut(&key).expect(VALIDATED), &remaining[p..]);
    if node.children.get(&key).expect(VALIDATED).count == 0 {
        node.children.remove(&key);
    }
}
