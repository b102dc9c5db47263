//! Bitcoin transaction merkle trees over leaves in internal (little-endian)
//! byte order.

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{Block, TxMerkleNode, Txid};

pub type Node = [u8; 32];

fn hash_pair(left: &Node, right: &Node) -> Node {
    let mut combined = [0u8; 64];
    combined[..32].copy_from_slice(left);
    combined[32..].copy_from_slice(right);
    sha256d::Hash::hash(&combined).to_byte_array()
}

fn next_level(level: &[Node]) -> Vec<Node> {
    level
        .chunks(2)
        .map(|pair| hash_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
        .collect()
}

pub fn leaves(txids: &[Txid]) -> Vec<Node> {
    txids.iter().map(|id| id.to_byte_array()).collect()
}

/// Leaves of a block in in-block order.
pub fn block_leaves(block: &Block) -> Vec<Node> {
    block
        .txdata
        .iter()
        .map(|tx| tx.compute_txid().to_byte_array())
        .collect()
}

/// Sibling hashes from the leaf at `index` up to (not including) the root. The
/// odd node of a level is paired with itself.
pub fn merkle_branch(leaves: &[Node], mut index: usize) -> Vec<Node> {
    let mut branch = Vec::new();
    if index >= leaves.len() {
        return branch;
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let sibling = index ^ 1;
        branch.push(*level.get(sibling).unwrap_or(&level[index]));
        level = next_level(&level);
        index >>= 1;
    }
    branch
}

pub fn root_from_branch(leaf: &Node, mut index: usize, branch: &[Node]) -> Node {
    let mut acc = *leaf;
    for sibling in branch {
        acc = if index & 1 == 1 {
            hash_pair(sibling, &acc)
        } else {
            hash_pair(&acc, sibling)
        };
        index >>= 1;
    }
    acc
}

/// The branch as one byte string, the layout the verifying contract reads.
pub fn concat_branch(branch: &[Node]) -> Vec<u8> {
    branch.iter().flatten().copied().collect()
}

pub fn to_merkle_node(node: &Node) -> TxMerkleNode {
    TxMerkleNode::from_byte_array(*node)
}
