use bitcoin::{Block, BlockHash, OutPoint, ScriptBuf, Transaction, TxIn, Txid};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Utxo {
    pub height: u64, // block height that the Tx was included in
    pub txid: Txid,
    pub vout: u32,
    pub value: u64,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: self.vout,
        }
    }
}

impl From<&Utxo> for TxIn {
    fn from(val: &Utxo) -> Self {
        TxIn {
            previous_output: val.outpoint(),
            ..TxIn::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub best_block_hash: BlockHash,
    pub height: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockId {
    Height(u64),
    Hash(BlockHash),
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockId::Height(h) => write!(f, "#{h}"),
            BlockId::Hash(h) => h.fmt(f),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChainBlock {
    pub hash: BlockHash,
    pub height: u64,
    pub block: Block,
}

impl ChainBlock {
    /// Position of `txid` in the block, if it is there.
    pub fn index_of(&self, txid: &Txid) -> Option<usize> {
        self.block
            .txdata
            .iter()
            .position(|tx| tx.compute_txid() == *txid)
    }
}

/// A transaction together with the block that confirmed it, if any.
#[derive(Clone, Debug)]
pub struct ChainTx {
    pub txid: Txid,
    pub tx: Transaction,
    pub block_hash: Option<BlockHash>,
}

impl ChainTx {
    pub fn new(tx: Transaction, block_hash: Option<BlockHash>) -> Self {
        Self {
            txid: tx.compute_txid(),
            tx,
            block_hash,
        }
    }

    pub fn has_memo(&self) -> bool {
        crate::script::has_memo(&self.tx)
    }
}

/// A transaction that hit a seed UTXO and can be paid a bounty.
#[derive(Clone, Debug)]
pub struct Recipient {
    pub txid: Txid,
    pub block_hash: BlockHash,
    pub tx: Transaction,
}

impl Recipient {
    /// The payout replicates the recipient's own last output.
    pub fn payout_script(&self) -> Option<&ScriptBuf> {
        self.tx.output.last().map(|o| &o.script_pubkey)
    }
}

/// A UTXO annotated with the recipients collected for it while scanning.
#[derive(Clone, Debug)]
pub struct BountyInput {
    pub utxo: Utxo,
    pub recipients: Vec<Recipient>,
}

impl BountyInput {
    pub fn new(utxo: Utxo) -> Self {
        Self {
            utxo,
            recipients: Vec::new(),
        }
    }
}
