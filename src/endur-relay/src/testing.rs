//! In-memory chain fixtures shared by the unit tests.

use async_trait::async_trait;
use bitcoin::{
    absolute::LockTime,
    block::{Header, Version as BlockVersion},
    consensus::encode::deserialize,
    hashes::Hash,
    transaction::Version,
    Address, Amount, Block, BlockHash, CompactTarget, OutPoint, PubkeyHash, ScriptBuf, Sequence,
    Transaction, TxIn, TxMerkleNode, TxOut, Txid, Witness,
};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::chain::ChainSource;
use crate::error::Error;
use crate::hit::is_hit;
use crate::types::{BlockId, ChainBlock, ChainInfo, ChainTx, Utxo};

pub const REGULAR_BITS: u32 = 0x1d00fffe;
pub const GENESIS_TIME: u32 = 1_600_000_000;

pub fn p2pkh(tag: u8) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([tag; 20]))
}

pub fn address(tag: u8) -> Address {
    Address::from_script(&p2pkh(tag), bitcoin::Network::Testnet).unwrap()
}

pub fn coinbase(n: u32) -> Transaction {
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(n.to_le_bytes().to_vec()),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(50_0000_0000),
            script_pubkey: p2pkh(0xcb),
        }],
    }
}

/// A one-input transaction spending `prev`, with a `<sig> <pubkey>` shaped
/// script_sig and the given outputs. `salt` goes into the lock time so callers
/// can search for txids with particular properties.
pub fn spend(prev: OutPoint, outputs: Vec<TxOut>, salt: u32) -> Transaction {
    let mut script_sig = vec![0x47];
    script_sig.extend_from_slice(&[0x30; 0x47]);
    script_sig.push(0x21);
    script_sig.extend_from_slice(&[0x02; 33]);
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_consensus(salt),
        input: vec![TxIn {
            previous_output: prev,
            script_sig: ScriptBuf::from_bytes(script_sig),
            sequence: Sequence(0xfffffffe),
            witness: Witness::new(),
        }],
        output: outputs,
    }
}

pub fn pay(tag: u8, value: u64) -> TxOut {
    TxOut {
        value: Amount::from_sat(value),
        script_pubkey: p2pkh(tag),
    }
}

/// First transaction (by salt) built from `make` whose hit status against
/// `seed` equals `hit`.
pub fn search_tx(seed: &Txid, hit: bool, make: impl Fn(u32) -> Transaction) -> Transaction {
    search_where(make, |txid| is_hit(seed, txid) == hit)
}

pub fn search_where(
    make: impl Fn(u32) -> Transaction,
    pred: impl Fn(&Txid) -> bool,
) -> Transaction {
    (0u32..).map(make).find(|tx| pred(&tx.compute_txid())).unwrap()
}

pub fn seed_txid(n: u8) -> Txid {
    Txid::from_byte_array([n; 32])
}

pub fn utxo(n: u8, value: u64) -> Utxo {
    Utxo {
        height: 1,
        txid: seed_txid(n),
        vout: 0,
        value,
    }
}

pub fn make_block(prev: BlockHash, txdata: Vec<Transaction>, bits: u32, time: u32) -> Block {
    let mut block = Block {
        header: Header {
            version: BlockVersion::ONE,
            prev_blockhash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            time,
            bits: CompactTarget::from_consensus(bits),
            nonce: 0,
        },
        txdata,
    };
    if let Some(root) = block.compute_merkle_root() {
        block.header.merkle_root = root;
    }
    block
}

#[derive(Default)]
struct Inner {
    blocks: Vec<Block>,
    loose_txs: HashMap<Txid, Transaction>,
    unspents: HashMap<String, Vec<Utxo>>,
    history: HashMap<String, Vec<Txid>>,
    failing: HashSet<u64>,
    block_fetches: usize,
    sent: Vec<Vec<u8>>,
}

/// A chain backend over synthetic blocks, with fetch accounting.
#[derive(Default)]
pub struct MockChain(Mutex<Inner>);

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_block(&self, txdata: Vec<Transaction>) -> BlockHash {
        self.push_block_with_bits(txdata, REGULAR_BITS)
    }

    pub fn push_block_with_bits(&self, txdata: Vec<Transaction>, bits: u32) -> BlockHash {
        let mut inner = self.0.lock().unwrap();
        let prev = inner
            .blocks
            .last()
            .map(|b| b.block_hash())
            .unwrap_or_else(BlockHash::all_zeros);
        let time = GENESIS_TIME + 600 * inner.blocks.len() as u32;
        let block = make_block(prev, txdata, bits, time);
        let hash = block.block_hash();
        inner.blocks.push(block);
        hash
    }

    /// Replace a block in place, e.g. to corrupt its merkle root.
    pub fn replace_block(&self, height: u64, block: Block) {
        self.0.lock().unwrap().blocks[height as usize] = block;
    }

    pub fn block_at(&self, height: u64) -> Block {
        self.0.lock().unwrap().blocks[height as usize].clone()
    }

    pub fn add_loose_tx(&self, tx: Transaction) {
        self.0
            .lock()
            .unwrap()
            .loose_txs
            .insert(tx.compute_txid(), tx);
    }

    pub fn set_unspents(&self, address: &Address, utxos: Vec<Utxo>) {
        self.0
            .lock()
            .unwrap()
            .unspents
            .insert(address.to_string(), utxos);
    }

    /// History entries are given oldest first, as they were confirmed.
    pub fn set_history(&self, address: &Address, txids: Vec<Txid>) {
        self.0
            .lock()
            .unwrap()
            .history
            .insert(address.to_string(), txids);
    }

    pub fn fail_block(&self, height: u64) {
        self.0.lock().unwrap().failing.insert(height);
    }

    pub fn block_fetches(&self) -> usize {
        self.0.lock().unwrap().block_fetches
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().sent.clone()
    }

    fn find_tx(inner: &Inner, txid: &Txid) -> Option<ChainTx> {
        for block in inner.blocks.iter() {
            if let Some(tx) = block.txdata.iter().find(|tx| tx.compute_txid() == *txid) {
                return Some(ChainTx::new(tx.clone(), Some(block.block_hash())));
            }
        }
        inner
            .loose_txs
            .get(txid)
            .map(|tx| ChainTx::new(tx.clone(), None))
    }
}

#[async_trait]
impl ChainSource for MockChain {
    async fn get_info(&self) -> Result<ChainInfo, Error> {
        let inner = self.0.lock().unwrap();
        let last = inner
            .blocks
            .last()
            .ok_or_else(|| Error::Fetch("empty chain".to_string()))?;
        Ok(ChainInfo {
            best_block_hash: last.block_hash(),
            height: inner.blocks.len() as u64 - 1,
        })
    }

    async fn get_block(&self, id: BlockId) -> Result<ChainBlock, Error> {
        let mut inner = self.0.lock().unwrap();
        inner.block_fetches += 1;
        let height = match id {
            BlockId::Height(h) => h,
            BlockId::Hash(hash) => inner
                .blocks
                .iter()
                .position(|b| b.block_hash() == hash)
                .ok_or_else(|| Error::Fetch(format!("unknown block {hash}")))?
                as u64,
        };
        if inner.failing.contains(&height) {
            return Err(Error::Fetch(format!("backend unavailable for block {height}")));
        }
        let block = inner
            .blocks
            .get(height as usize)
            .cloned()
            .ok_or_else(|| Error::Fetch(format!("unknown block {id}")))?;
        // round-trip through the wire format like a real backend would
        let block: Block = deserialize(&bitcoin::consensus::encode::serialize(&block))
            .map_err(|e| Error::Decode(e.to_string()))?;
        Ok(ChainBlock {
            hash: block.block_hash(),
            height,
            block,
        })
    }

    async fn get_tx(&self, txid: &Txid) -> Result<ChainTx, Error> {
        let inner = self.0.lock().unwrap();
        Self::find_tx(&inner, txid).ok_or_else(|| Error::Fetch(format!("unknown tx {txid}")))
    }

    async fn get_unspents(&self, address: &Address) -> Result<Vec<Utxo>, Error> {
        let inner = self.0.lock().unwrap();
        Ok(inner
            .unspents
            .get(&address.to_string())
            .cloned()
            .unwrap_or_default())
    }

    async fn get_tx_history(
        &self,
        address: &Address,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<Result<ChainTx, Error>>, Error> {
        let inner = self.0.lock().unwrap();
        let ids = inner
            .history
            .get(&address.to_string())
            .cloned()
            .unwrap_or_default();
        Ok(ids
            .iter()
            .rev()
            .skip(offset)
            .take(page_size)
            .map(|id| {
                Self::find_tx(&inner, id).ok_or_else(|| Error::Fetch(format!("unknown tx {id}")))
            })
            .collect())
    }

    async fn send_tx(&self, raw: &[u8]) -> Result<Txid, Error> {
        let tx: Transaction = deserialize(raw).map_err(|e| Error::Decode(e.to_string()))?;
        let mut inner = self.0.lock().unwrap();
        inner.sent.push(raw.to_vec());
        Ok(tx.compute_txid())
    }
}
