//! SPV proofs of relayed transactions, in the layout the verifying contract
//! expects: raw header bytes, a concatenated merkle branch and the
//! transaction split into canonical `version`/`vin`/`vout`/`locktime` fields.

use bitcoin::{
    block::Header,
    consensus::encode::serialize,
    hashes::Hash,
    secp256k1, Address, BlockHash, Network, Transaction, Txid,
};
use hex::prelude::*;
use serde::{Serialize, Serializer};

use crate::chain::{BlockCache, ChainSource};
use crate::error::Error;
use crate::hit::is_hit;
use crate::merkle::{block_leaves, concat_branch, merkle_branch};
use crate::reversed;
use crate::script::{guess_brand, pubkey_pos, ScriptShape};
use crate::types::{BlockId, ChainBlock, ChainTx};

fn as_0x<T, S>(bytes: &T, s: S) -> Result<S::Ok, S::Error>
where
    T: AsRef<[u8]>,
    S: Serializer,
{
    s.serialize_str(&format!("0x{}", bytes.as_ref().to_lower_hex_string()))
}

/// Canonical fields of a witness-stripped transaction. `version` and
/// `locktime` are the byte-swapped integers the contract reads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TxParams {
    pub version: u32,
    pub locktime: u32,
    /// Input count followed by every input, as serialized.
    #[serde(serialize_with = "as_0x")]
    pub vin: Vec<u8>,
    /// Output count followed by every output, as serialized.
    #[serde(serialize_with = "as_0x")]
    pub vout: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitParams {
    #[serde(serialize_with = "as_0x")]
    pub header: Vec<u8>,
    pub merkle_index: usize,
    #[serde(serialize_with = "as_0x")]
    pub merkle_proof: Vec<u8>,
    #[serde(flatten)]
    pub tx: TxParams,
    pub memo_length: usize,
    pub input_index: usize,
    pub pubkey_pos: usize,
    #[serde(serialize_with = "as_0x")]
    pub payer: [u8; 20],
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutpointParams {
    #[serde(flatten)]
    pub tx: TxParams,
    pub pkh_pos: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BountyParams {
    #[serde(serialize_with = "as_0x")]
    pub header: Vec<u8>,
    #[serde(serialize_with = "as_0x")]
    pub merkle_proof: Vec<u8>,
    pub merkle_index: usize,
    #[serde(flatten)]
    pub tx: TxParams,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Prepared {
    pub params: SubmitParams,
    pub outpoint: Vec<OutpointParams>,
    pub bounty: Vec<BountyParams>,
}

#[derive(Clone, Debug)]
pub struct PrepareOptions {
    /// Memo brand; guessed from the memo output when unset.
    pub brand: Option<String>,
    pub payer: [u8; 20],
    pub input_index: usize,
    /// Overrides the offset found in the input's script_sig.
    pub pubkey_pos: Option<usize>,
    pub no_bounty: bool,
    /// Network used to render the sampled bounty address.
    pub network: Network,
    pub history_page_size: usize,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            brand: None,
            payer: [0u8; 20],
            input_index: 0,
            pubkey_pos: None,
            no_bounty: false,
            network: Network::Bitcoin,
            history_page_size: 50,
        }
    }
}

impl From<&crate::RelayConfig> for PrepareOptions {
    fn from(cfg: &crate::RelayConfig) -> Self {
        Self {
            brand: Some(cfg.brand.clone()),
            network: cfg.network,
            history_page_size: cfg.history_page_size,
            ..Self::default()
        }
    }
}

/// The 80 header bytes exactly as hashed for proof of work.
pub fn extract_header(header: &Header) -> Vec<u8> {
    serialize(header)
}

/// Concatenated merkle branch of the transaction at `index`. The root is
/// recomputed from every transaction of the block and must match the header.
pub fn extract_merkle_proof(block: &ChainBlock, index: usize) -> Result<Vec<u8>, Error> {
    let declared = block.block.header.merkle_root;
    let computed = block
        .block
        .compute_merkle_root()
        .ok_or_else(|| Error::Decode(format!("block {} has no transactions", block.hash)))?;
    if computed != declared {
        return Err(Error::MerkleRootMismatch {
            block: block.hash,
            declared,
            computed,
        });
    }
    let leaves = block_leaves(&block.block);
    if index >= leaves.len() {
        return Err(Error::Decode(format!(
            "index {} out of {} transactions in block {}",
            index,
            leaves.len(),
            block.hash
        )));
    }
    Ok(concat_branch(&merkle_branch(&leaves, index)))
}

pub fn extract_tx_params(tx: &Transaction) -> TxParams {
    let mut stripped = tx.clone();
    for input in stripped.input.iter_mut() {
        input.witness.clear();
    }
    let raw = serialize(&stripped);
    // the input section ends right after the last input's sequence
    let split = 4 + serialize(&stripped.input).len();
    TxParams {
        version: (tx.version.0 as u32).swap_bytes(),
        locktime: tx.lock_time.to_consensus_u32().swap_bytes(),
        vin: raw[4..split].to_vec(),
        vout: raw[split..raw.len() - 4].to_vec(),
    }
}

/// Output sampled for the bounty check: `1 + (hash mod (outputs - 2))`, the
/// hash read as a big-endian integer.
pub fn sampling_index(block_hash: &BlockHash, outputs: usize) -> Option<usize> {
    if outputs < 3 {
        return None;
    }
    let m = (outputs - 2) as u128;
    let r = reversed(&block_hash.to_byte_array())
        .iter()
        .fold(0u128, |r, b| (r * 256 + *b as u128) % m);
    Some(1 + r as usize)
}

async fn proven_block<'c, S>(
    source: &S,
    cache: &'c mut BlockCache,
    tx: &ChainTx,
) -> Result<(&'c ChainBlock, usize), Error>
where
    S: ChainSource + ?Sized,
{
    let hash = tx.block_hash.ok_or(Error::NotConfirmed(tx.txid))?;
    let block = cache.block(source, BlockId::Hash(hash)).await?;
    let index = block.index_of(&tx.txid).ok_or(Error::TxNotInBlock {
        txid: tx.txid,
        block: hash,
    })?;
    Ok((block, index))
}

async fn submit_params<S>(
    source: &S,
    cache: &mut BlockCache,
    tx: &ChainTx,
    options: &PrepareOptions,
) -> Result<SubmitParams, Error>
where
    S: ChainSource + ?Sized,
{
    let (block, index) = proven_block(source, cache, tx).await?;
    let merkle_proof = extract_merkle_proof(block, index)?;
    let header = extract_header(&block.block.header);

    let brand = match &options.brand {
        Some(brand) => brand.clone(),
        None => guess_brand(&tx.tx).ok_or(Error::NoMemo(tx.txid))?,
    };
    let input = tx
        .tx
        .input
        .get(options.input_index)
        .ok_or(Error::InputOutOfRange {
            txid: tx.txid,
            index: options.input_index,
        })?;
    let pubkey_pos = options
        .pubkey_pos
        .unwrap_or_else(|| pubkey_pos(&input.script_sig));

    Ok(SubmitParams {
        header,
        merkle_index: index,
        merkle_proof,
        tx: extract_tx_params(&tx.tx),
        memo_length: brand.len(),
        input_index: options.input_index,
        pubkey_pos,
        payer: options.payer,
    })
}

async fn outpoint_params<S>(
    source: &S,
    cache: &mut BlockCache,
    tx: &ChainTx,
    input_index: usize,
) -> Result<Vec<OutpointParams>, Error>
where
    S: ChainSource + ?Sized,
{
    let input = tx.tx.input.get(input_index).ok_or(Error::InputOutOfRange {
        txid: tx.txid,
        index: input_index,
    })?;
    match ScriptShape::classify(&input.script_sig) {
        shape if shape.is_self_contained() => return Ok(vec![]),
        ScriptShape::Unknown(bytes) if !bytes.is_empty() => {
            log::warn!(
                "unrecognised script_sig of {} input {}: {}",
                tx.txid,
                input_index,
                bytes.to_lower_hex_string()
            );
        }
        _ => {}
    }

    let dependency = cache.tx(source, &input.previous_output.txid).await?;
    Ok(vec![OutpointParams {
        tx: extract_tx_params(&dependency.tx),
        pkh_pos: 0,
    }])
}

async fn find_bounty_tx<S>(
    source: &S,
    address: &Address,
    seed: &Txid,
    page_size: usize,
) -> Result<Option<ChainTx>, Error>
where
    S: ChainSource + ?Sized,
{
    let page_size = page_size.max(1);
    let mut offset = 0;
    loop {
        let page = source.get_tx_history(address, page_size, offset).await?;
        let fetched = page.len();
        for entry in page {
            let t = match entry {
                Ok(t) => t,
                Err(err) => {
                    log::warn!("skip history entry of {}: {}", address, err);
                    continue;
                }
            };
            if t.block_hash.is_some() && !t.has_memo() && is_hit(seed, &t.txid) {
                return Ok(Some(t));
            }
        }
        if fetched < page_size {
            return Ok(None);
        }
        offset += page_size;
    }
}

async fn bounty_params<S>(
    source: &S,
    cache: &mut BlockCache,
    tx: &ChainTx,
    options: &PrepareOptions,
) -> Result<(BountyParams, Vec<OutpointParams>), Error>
where
    S: ChainSource + ?Sized,
{
    let block_hash = tx.block_hash.ok_or(Error::NotConfirmed(tx.txid))?;
    let index = sampling_index(&block_hash, tx.tx.output.len()).ok_or(Error::NotEnoughOutputs {
        txid: tx.txid,
        outputs: tx.tx.output.len(),
    })?;
    let address = Address::from_script(&tx.tx.output[index].script_pubkey, options.network)
        .map_err(|_| Error::NoSamplingAddress(tx.txid))?;
    let seed = tx
        .tx
        .input
        .first()
        .map(|i| i.previous_output.txid)
        .ok_or(Error::InputOutOfRange {
            txid: tx.txid,
            index: 0,
        })?;

    let found = find_bounty_tx(source, &address, &seed, options.history_page_size)
        .await?
        .ok_or_else(|| Error::BountyTxNotFound(address.to_string()))?;
    log::info!("bounty of {} found in {} at {}", tx.txid, found.txid, address);

    let (block, merkle_index) = proven_block(source, cache, &found).await?;
    let bounty = BountyParams {
        header: extract_header(&block.block.header),
        merkle_proof: extract_merkle_proof(block, merkle_index)?,
        merkle_index,
        tx: extract_tx_params(&found.tx),
    };

    let mut inputs = Vec::with_capacity(tx.tx.input.len());
    for input in tx.tx.input.iter() {
        let prev = cache.tx(source, &input.previous_output.txid).await?;
        inputs.push(OutpointParams {
            tx: extract_tx_params(&prev.tx),
            pkh_pos: 0,
        });
    }
    Ok((bounty, inputs))
}

/// Builds every parameter needed to submit `tx` to the verifying contract.
///
/// `outpoint` is empty when the spending key can be read from the proven
/// input itself. With a bounty proof, `outpoint` lists the previous
/// transaction of every input instead.
pub async fn prepare<S>(source: &S, tx: &ChainTx, options: &PrepareOptions) -> Result<Prepared, Error>
where
    S: ChainSource + ?Sized,
{
    let mut cache = BlockCache::new();
    let params = submit_params(source, &mut cache, tx, options).await?;

    let mut outpoint = if params.pubkey_pos != 0 {
        vec![]
    } else {
        outpoint_params(source, &mut cache, tx, options.input_index).await?
    };

    let mut bounty = vec![];
    if !options.no_bounty {
        let (proof, mut inputs) = bounty_params(source, &mut cache, tx, options).await?;
        if let (Some(first), Some(proven)) = (outpoint.first(), inputs.get_mut(params.input_index)) {
            proven.pkh_pos = first.pkh_pos;
        }
        outpoint = inputs;
        bounty.push(proof);
    }

    Ok(Prepared {
        params,
        outpoint,
        bounty,
    })
}

/// A claim as recorded by the contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimRecord {
    pub block_hash: [u8; 32],
    pub memo_hash: [u8; 32],
    pub payer: [u8; 20],
    pub amount: u128,
    pub timestamp: u64,
    /// A 20-byte key hash left-aligned and zero padded, or a 32-byte key.
    pub pubkey: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimParams {
    #[serde(serialize_with = "as_0x")]
    pub block_hash: [u8; 32],
    #[serde(serialize_with = "as_0x")]
    pub memo_hash: [u8; 32],
    #[serde(serialize_with = "as_0x")]
    pub payer: [u8; 20],
    pub amount: String,
    pub timestamp: String,
    #[serde(rename = "isPKH")]
    pub is_pkh: bool,
    #[serde(serialize_with = "as_0x")]
    pub pub_x: [u8; 32],
    #[serde(serialize_with = "as_0x")]
    pub pub_y: [u8; 32],
    pub skip_commission: bool,
}

pub fn pubkey_coordinates(pubkey: &secp256k1::PublicKey) -> ([u8; 32], [u8; 32]) {
    let full = pubkey.serialize_uncompressed();
    let mut x = [0u8; 32];
    let mut y = [0u8; 32];
    x.copy_from_slice(&full[1..33]);
    y.copy_from_slice(&full[33..65]);
    (x, y)
}

pub fn prepare_claim_params(record: &ClaimRecord, pub_x: [u8; 32], pub_y: [u8; 32]) -> ClaimParams {
    ClaimParams {
        block_hash: record.block_hash,
        memo_hash: record.memo_hash,
        payer: record.payer,
        amount: record.amount.to_string(),
        timestamp: record.timestamp.to_string(),
        is_pkh: record.pubkey[20..].iter().all(|b| *b == 0),
        pub_x,
        pub_y,
        skip_commission: false,
    }
}
