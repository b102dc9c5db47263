use async_trait::async_trait;
use bitcoin::{consensus::encode::serialize, Address, BlockHash, Transaction, Txid};
use std::collections::HashMap;

use crate::error::Error;
use crate::types::{BlockId, ChainBlock, ChainInfo, ChainTx, Utxo};

/// Read/broadcast access to a Bitcoin-family chain backend.
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn get_info(&self) -> Result<ChainInfo, Error>;

    /// The block with every transaction, inputs and output scripts included.
    async fn get_block(&self, id: BlockId) -> Result<ChainBlock, Error>;

    async fn get_tx(&self, txid: &Txid) -> Result<ChainTx, Error>;

    async fn get_unspents(&self, address: &Address) -> Result<Vec<Utxo>, Error>;

    /// One page of the address history, newest first. An entry that cannot be
    /// fetched is reported in place, so only the last page is short.
    async fn get_tx_history(
        &self,
        address: &Address,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<Result<ChainTx, Error>>, Error>;

    async fn send_tx(&self, raw: &[u8]) -> Result<Txid, Error>;
}

/// Produces signatures for transaction digests. Implementations return a
/// 64-byte compact ECDSA signature.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, digest: [u8; 32]) -> Result<Vec<u8>, String>;
}

/// Fetch cache owned by a single scan or proof preparation.
#[derive(Default)]
pub struct BlockCache {
    heights: HashMap<u64, BlockHash>,
    blocks: HashMap<BlockHash, ChainBlock>,
    txs: HashMap<Txid, ChainTx>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub async fn block<S>(&mut self, source: &S, id: BlockId) -> Result<&ChainBlock, Error>
    where
        S: ChainSource + ?Sized,
    {
        let hash = match id {
            BlockId::Height(h) => self.heights.get(&h).copied(),
            BlockId::Hash(h) => Some(h),
        };
        if let Some(hash) = hash {
            if self.blocks.contains_key(&hash) {
                return Ok(&self.blocks[&hash]);
            }
        }

        let block = source.get_block(id).await?;
        self.heights.insert(block.height, block.hash);
        Ok(&*self.blocks.entry(block.hash).or_insert(block))
    }

    pub async fn tx<S>(&mut self, source: &S, txid: &Txid) -> Result<&ChainTx, Error>
    where
        S: ChainSource + ?Sized,
    {
        if !self.txs.contains_key(txid) {
            let tx = source.get_tx(txid).await?;
            self.txs.insert(*txid, tx);
        }
        Ok(&self.txs[txid])
    }
}

pub async fn broadcast<S>(source: &S, tx: &Transaction) -> Result<Txid, Error>
where
    S: ChainSource + ?Sized,
{
    let txid = source.send_tx(&serialize(tx)).await?;
    log::info!("broadcast {} ({} bytes)", txid, tx.total_size());
    Ok(txid)
}
