//! Tie-break between competing memo transactions mined in the same block.

use bitcoin::{hashes::Hash, Block, BlockHash, Script, Txid};

use crate::chain::{BlockCache, ChainSource};
use crate::error::Error;
use crate::hit::keccak256;
use crate::reversed;
use crate::script::memo_index;
use crate::types::{BlockId, ChainTx};

/// Bytes of a memo script compared when grouping competitors.
pub const MEMO_PREFIX_LEN: usize = 5;

/// Top 32 bits of `keccak256(BE(block_hash) ‖ LE(txid))`. Lower wins.
pub fn rank(block_hash: &BlockHash, txid: &Txid) -> u32 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(&reversed(&block_hash.to_byte_array()));
    buf[32..].copy_from_slice(txid.as_byte_array());
    let digest = keccak256(&buf);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

fn memo_prefix(script: &Script) -> &[u8] {
    let b = script.as_bytes();
    &b[..b.len().min(MEMO_PREFIX_LEN)]
}

/// Transactions of `block` whose memo script starts like `memo`.
///
/// Only the first [`MEMO_PREFIX_LEN`] bytes are compared, so unrelated memos
/// sharing that prefix are grouped together too.
pub fn competing_txids(block: &Block, memo: &Script) -> Vec<Txid> {
    let prefix = memo_prefix(memo);
    block
        .txdata
        .iter()
        .filter(|tx| {
            memo_index(&tx.output)
                .map(|i| memo_prefix(&tx.output[i].script_pubkey) == prefix)
                .unwrap_or(false)
        })
        .map(|tx| tx.compute_txid())
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub winner: Txid,
    pub rank: u32,
    /// Every other candidate with its rank, each lost to `winner`.
    pub losers: Vec<(Txid, u32)>,
}

impl Resolution {
    pub fn verdict(&self, txid: &Txid) -> Verdict {
        if *txid == self.winner {
            Verdict::Winner
        } else {
            Verdict::LostTo(self.winner)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Winner,
    LostTo(Txid),
}

/// Picks the lowest ranked candidate. Equal ranks fall back to the txid, so the
/// outcome never depends on the order of `candidates`.
pub fn resolve(block_hash: &BlockHash, candidates: &[Txid]) -> Option<Resolution> {
    let mut ranked: Vec<(u32, Txid)> = candidates.iter().map(|id| (rank(block_hash, id), *id)).collect();
    ranked.sort_unstable();
    ranked.dedup();

    let mut ranked = ranked.into_iter();
    let (rank, winner) = ranked.next()?;
    Some(Resolution {
        winner,
        rank,
        losers: ranked.map(|(r, id)| (id, r)).collect(),
    })
}

/// Whether the confirmed memo transaction `tx` is the canonical one in its
/// block.
pub async fn contest<S>(source: &S, tx: &ChainTx) -> Result<Verdict, Error>
where
    S: ChainSource + ?Sized,
{
    let hash = tx.block_hash.ok_or(Error::NotConfirmed(tx.txid))?;
    let i = memo_index(&tx.tx.output).ok_or(Error::NoMemo(tx.txid))?;

    let mut cache = BlockCache::new();
    let block = cache.block(source, BlockId::Hash(hash)).await?;
    let competitors = competing_txids(&block.block, &tx.tx.output[i].script_pubkey);
    let resolution = resolve(&hash, &competitors).ok_or(Error::TxNotInBlock {
        txid: tx.txid,
        block: hash,
    })?;

    let verdict = resolution.verdict(&tx.txid);
    if let Verdict::LostTo(winner) = verdict {
        log::info!("{} lost to {} in block {}", tx.txid, winner, hash);
    }
    Ok(verdict)
}
