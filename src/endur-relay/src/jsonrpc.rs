use async_trait::async_trait;
use bitcoin::consensus::{encode::serialize_hex, Decodable, ReadExt};
use bitcoin::{Address, BlockHash, Transaction, Txid};
use hex::prelude::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, to_vec, Value};
use std::str::FromStr;

use crate::chain::ChainSource;
use crate::err_string;
use crate::error::Error;
use crate::types::{BlockId, ChainBlock, ChainInfo, ChainTx, Utxo};

pub static APP_AGENT: &str = concat!(
    "Mozilla/5.0 endur-relay ",
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
);

#[async_trait]
pub trait JsonRPCAgent: Send + Sync {
    async fn post(&self, idempotency_key: String, body: Vec<u8>) -> Result<bytes::Bytes, String>;
}

pub struct NodeRPC {}

#[derive(Debug, Serialize)]
pub struct RPCRequest<'a> {
    jsonrpc: &'a str,
    method: &'a str,
    params: &'a [Value],
    id: u64,
}

#[derive(Debug, Deserialize)]
pub struct RPCResponse<T> {
    result: Option<T>,
    error: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RawTxInfo {
    pub hex: String,
    #[serde(default)]
    pub blockhash: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeaderInfo {
    pub hash: String,
    pub height: u64,
}

/// One entry of `getaddressutxos` (address-indexed nodes).
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressUtxo {
    pub txid: String,
    pub output_index: u32,
    pub satoshis: u64,
    pub height: u64,
}

impl TryFrom<&AddressUtxo> for Utxo {
    type Error = String;

    fn try_from(u: &AddressUtxo) -> Result<Self, Self::Error> {
        Ok(Utxo {
            height: u.height,
            txid: Txid::from_str(&u.txid).map_err(err_string)?,
            vout: u.output_index,
            value: u.satoshis,
        })
    }
}

impl NodeRPC {
    pub async fn get_best_blockhash<A>(agent: &A, idempotency_key: String) -> Result<BlockHash, String>
    where
        A: JsonRPCAgent + ?Sized,
    {
        let hex: String = Self::call(agent, idempotency_key, "getbestblockhash", &[]).await?;
        BlockHash::from_str(&hex).map_err(err_string)
    }

    pub async fn get_block_count<A>(agent: &A, idempotency_key: String) -> Result<u64, String>
    where
        A: JsonRPCAgent + ?Sized,
    {
        Self::call(agent, idempotency_key, "getblockcount", &[]).await
    }

    pub async fn get_blockhash<A>(
        agent: &A,
        idempotency_key: String,
        height: u64,
    ) -> Result<BlockHash, String>
    where
        A: JsonRPCAgent + ?Sized,
    {
        let hex: String =
            Self::call(agent, idempotency_key, "getblockhash", &[height.into()]).await?;
        BlockHash::from_str(&hex).map_err(err_string)
    }

    pub async fn get_block_header<A>(
        agent: &A,
        idempotency_key: String,
        hash: &BlockHash,
    ) -> Result<HeaderInfo, String>
    where
        A: JsonRPCAgent + ?Sized,
    {
        Self::call(
            agent,
            idempotency_key,
            "getblockheader",
            &[hash.to_string().into(), true.into()],
        )
        .await
    }

    /// Raw block hex, decoded by the caller.
    pub async fn get_block_hex<A>(
        agent: &A,
        idempotency_key: String,
        hash: &BlockHash,
    ) -> Result<String, String>
    where
        A: JsonRPCAgent + ?Sized,
    {
        Self::call(
            agent,
            idempotency_key,
            "getblock",
            &[hash.to_string().into(), 0.into()],
        )
        .await
    }

    pub async fn get_raw_transaction<A>(
        agent: &A,
        idempotency_key: String,
        txid: &Txid,
    ) -> Result<RawTxInfo, String>
    where
        A: JsonRPCAgent + ?Sized,
    {
        Self::call(
            agent,
            idempotency_key,
            "getrawtransaction",
            &[txid.to_string().into(), 1.into()],
        )
        .await
    }

    pub async fn get_address_utxos<A>(
        agent: &A,
        idempotency_key: String,
        address: &Address,
    ) -> Result<Vec<AddressUtxo>, String>
    where
        A: JsonRPCAgent + ?Sized,
    {
        Self::call(
            agent,
            idempotency_key,
            "getaddressutxos",
            &[json!({ "addresses": [address.to_string()] })],
        )
        .await
    }

    /// Every txid that touched `address`, oldest first.
    pub async fn get_address_txids<A>(
        agent: &A,
        idempotency_key: String,
        address: &Address,
    ) -> Result<Vec<String>, String>
    where
        A: JsonRPCAgent + ?Sized,
    {
        Self::call(
            agent,
            idempotency_key,
            "getaddresstxids",
            &[json!({ "addresses": [address.to_string()] })],
        )
        .await
    }

    pub async fn send_rawtransaction<A>(
        agent: &A,
        idempotency_key: String,
        raw: &[u8],
    ) -> Result<Txid, String>
    where
        A: JsonRPCAgent + ?Sized,
    {
        let hex: String = Self::call(
            agent,
            idempotency_key,
            "sendrawtransaction",
            &[raw.to_lower_hex_string().into()],
        )
        .await?;
        Txid::from_str(&hex).map_err(err_string)
    }

    pub async fn call<A, T>(
        agent: &A,
        idempotency_key: String,
        method: &str,
        params: &[Value],
    ) -> Result<T, String>
    where
        A: JsonRPCAgent + ?Sized,
        T: DeserializeOwned,
    {
        let input = RPCRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        };
        let input = to_vec(&input).map_err(err_string)?;
        let data = agent.post(idempotency_key, input).await?;

        let output: RPCResponse<T> = serde_json::from_slice(&data).map_err(err_string)?;

        if let Some(error) = output.error {
            if !error.is_null() {
                return Err(serde_json::to_string(&error).map_err(err_string)?);
            }
        }

        match output.result {
            Some(result) => Ok(result),
            None => serde_json::from_value(Value::Null).map_err(err_string),
        }
    }
}

pub fn deserialize_hex<T: Decodable>(hex: &str) -> Result<T, String> {
    let data = Vec::from_hex(hex).map_err(err_string)?;
    let mut reader = &data[..];
    let object = Decodable::consensus_decode_from_finite_reader(&mut reader).map_err(err_string)?;
    if reader.read_u8().is_ok() {
        Err("decode_hex: data not consumed entirely".to_string())
    } else {
        Ok(object)
    }
}

/// [`ChainSource`] over a JSON-RPC node with the address index enabled.
pub struct RpcChainSource<A> {
    agent: A,
}

impl<A: JsonRPCAgent> RpcChainSource<A> {
    pub fn new(agent: A) -> Self {
        Self { agent }
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    async fn block_by_hash(&self, hash: BlockHash, height: Option<u64>) -> Result<ChainBlock, Error> {
        let height = match height {
            Some(h) => h,
            None => {
                NodeRPC::get_block_header(&self.agent, format!("header-{hash}"), &hash)
                    .await
                    .map_err(Error::Fetch)?
                    .height
            }
        };
        let hex = NodeRPC::get_block_hex(&self.agent, format!("block-{hash}"), &hash)
            .await
            .map_err(Error::Fetch)?;
        let block: bitcoin::Block = deserialize_hex(&hex).map_err(Error::Decode)?;
        Ok(ChainBlock {
            hash: block.block_hash(),
            height,
            block,
        })
    }
}

#[async_trait]
impl<A: JsonRPCAgent> ChainSource for RpcChainSource<A> {
    async fn get_info(&self) -> Result<ChainInfo, Error> {
        let best_block_hash = NodeRPC::get_best_blockhash(&self.agent, "best".to_string())
            .await
            .map_err(Error::Fetch)?;
        let header = NodeRPC::get_block_header(
            &self.agent,
            format!("header-{best_block_hash}"),
            &best_block_hash,
        )
        .await
        .map_err(Error::Fetch)?;
        Ok(ChainInfo {
            best_block_hash,
            height: header.height,
        })
    }

    async fn get_block(&self, id: BlockId) -> Result<ChainBlock, Error> {
        match id {
            BlockId::Hash(hash) => self.block_by_hash(hash, None).await,
            BlockId::Height(height) => {
                let hash = NodeRPC::get_blockhash(&self.agent, format!("hash-{height}"), height)
                    .await
                    .map_err(Error::Fetch)?;
                self.block_by_hash(hash, Some(height)).await
            }
        }
    }

    async fn get_tx(&self, txid: &Txid) -> Result<ChainTx, Error> {
        let info = NodeRPC::get_raw_transaction(&self.agent, format!("tx-{txid}"), txid)
            .await
            .map_err(Error::Fetch)?;
        let tx: Transaction = deserialize_hex(&info.hex).map_err(Error::Decode)?;
        let block_hash = match info.blockhash {
            Some(h) => Some(BlockHash::from_str(&h).map_err(|e| Error::Decode(err_string(e)))?),
            None => None,
        };
        Ok(ChainTx::new(tx, block_hash))
    }

    async fn get_unspents(&self, address: &Address) -> Result<Vec<Utxo>, Error> {
        let utxos = NodeRPC::get_address_utxos(&self.agent, format!("utxos-{address}"), address)
            .await
            .map_err(Error::Fetch)?;
        utxos
            .iter()
            .map(|u| Utxo::try_from(u).map_err(Error::Decode))
            .collect()
    }

    async fn get_tx_history(
        &self,
        address: &Address,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<Result<ChainTx, Error>>, Error> {
        let txids = NodeRPC::get_address_txids(&self.agent, format!("txids-{address}"), address)
            .await
            .map_err(Error::Fetch)?;
        let mut page = Vec::with_capacity(page_size);
        for id in txids.iter().rev().skip(offset).take(page_size) {
            let txid = Txid::from_str(id).map_err(|e| Error::Decode(err_string(e)))?;
            page.push(self.get_tx(&txid).await);
        }
        Ok(page)
    }

    async fn send_tx(&self, raw: &[u8]) -> Result<Txid, Error> {
        NodeRPC::send_rawtransaction(&self.agent, String::new(), raw)
            .await
            .map_err(Error::Fetch)
    }
}

/// Hex form of a transaction as `sendrawtransaction` expects it.
pub fn tx_hex(tx: &Transaction) -> String {
    serialize_hex(tx)
}
