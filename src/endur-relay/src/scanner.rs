use bitcoin::CompactTarget;

use crate::chain::{BlockCache, ChainSource};
use crate::config::RelayConfig;
use crate::hit::is_hit;
use crate::script::has_memo;
use crate::types::{BlockId, BountyInput, ChainInfo, Recipient, Utxo};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanParams {
    pub max_blocks_back: u64,
    pub max_recipients: usize,
    pub min_difficulty: CompactTarget,
    pub max_block_age_secs: Option<u32>,
}

impl From<&RelayConfig> for ScanParams {
    fn from(cfg: &RelayConfig) -> Self {
        Self {
            max_blocks_back: cfg.max_blocks_back,
            max_recipients: cfg.max_recipients,
            min_difficulty: cfg.min_difficulty_target(),
            max_block_age_secs: cfg.max_block_age_secs,
        }
    }
}

/// Walks recent blocks looking for transactions that hit the wallet's UTXOs.
pub struct BountyScanner {
    params: ScanParams,
}

impl BountyScanner {
    pub fn new(params: ScanParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ScanParams {
        &self.params
    }

    /// Picks the UTXO that collected the most recipients; the first one wins
    /// a tie. Returns `None` only when `utxos` is empty.
    pub async fn scan<S>(&self, source: &S, utxos: &[Utxo], head: &ChainInfo) -> Option<BountyInput>
    where
        S: ChainSource + ?Sized,
    {
        let mut cache = BlockCache::new();
        self.scan_with(source, &mut cache, utxos, head).await
    }

    pub async fn scan_with<S>(
        &self,
        source: &S,
        cache: &mut BlockCache,
        utxos: &[Utxo],
        head: &ChainInfo,
    ) -> Option<BountyInput>
    where
        S: ChainSource + ?Sized,
    {
        let head_time = match self.params.max_block_age_secs {
            None => None,
            Some(_) => match cache.block(source, BlockId::Hash(head.best_block_hash)).await {
                Ok(b) => Some(b.block.header.time),
                Err(err) => {
                    log::warn!("chain head {} unavailable, no age limit: {}", head.best_block_hash, err);
                    None
                }
            },
        };

        let mut candidates: Vec<BountyInput> = Vec::with_capacity(utxos.len());
        for utxo in utxos {
            let mut input = BountyInput::new(*utxo);
            self.collect(source, cache, &mut input, head, head_time).await;
            if input.recipients.len() >= self.params.max_recipients {
                log::info!(
                    "utxo {}:{} collected {} recipients",
                    utxo.txid,
                    utxo.vout,
                    input.recipients.len()
                );
                return Some(input);
            }
            candidates.push(input);
        }

        let best = candidates.into_iter().reduce(|best, cur| {
            if cur.recipients.len() > best.recipients.len() {
                cur
            } else {
                best
            }
        });
        if let Some(best) = &best {
            log::info!(
                "best utxo {}:{} with {} recipients",
                best.utxo.txid,
                best.utxo.vout,
                best.recipients.len()
            );
        }
        best
    }

    async fn collect<S>(
        &self,
        source: &S,
        cache: &mut BlockCache,
        input: &mut BountyInput,
        head: &ChainInfo,
        head_time: Option<u32>,
    ) where
        S: ChainSource + ?Sized,
    {
        let seed = input.utxo.txid;
        for back in 0..self.params.max_blocks_back {
            let Some(height) = head.height.checked_sub(back) else {
                break;
            };
            let block = match cache.block(source, BlockId::Height(height)).await {
                Ok(block) => block,
                Err(err) => {
                    log::warn!("skip block {}: {}", height, err);
                    continue;
                }
            };

            let header = &block.block.header;
            if let (Some(max_age), Some(head_time)) = (self.params.max_block_age_secs, head_time) {
                if head_time.saturating_sub(header.time) > max_age {
                    log::debug!("block {} is older than {}s, stop", height, max_age);
                    break;
                }
            }
            if header.bits == self.params.min_difficulty {
                log::debug!("skip minimum difficulty block {}", height);
                continue;
            }

            for tx in block.block.txdata.iter().skip(1) {
                if tx.is_coinbase() {
                    continue;
                }
                let txid = tx.compute_txid();
                if !is_hit(&seed, &txid) {
                    continue;
                }
                if has_memo(tx) {
                    log::debug!("hit {} already carries a memo", txid);
                    continue;
                }
                let Some(last) = tx.output.last() else {
                    continue;
                };
                if input
                    .recipients
                    .iter()
                    .any(|r| r.payout_script() == Some(&last.script_pubkey))
                {
                    log::debug!("hit {} duplicates a recipient script", txid);
                    continue;
                }

                input.recipients.push(Recipient {
                    txid,
                    block_hash: block.hash,
                    tx: tx.clone(),
                });
                if input.recipients.len() >= self.params.max_recipients {
                    return;
                }
            }
        }
    }
}
