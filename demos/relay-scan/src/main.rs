use async_trait::async_trait;
use base64::Engine;
use endur_relay::{
    bitcoin::{Address, Network, Txid},
    builder::{parse_fee, TxBuilder},
    chain::ChainSource,
    err_string,
    jsonrpc::*,
    resolver::contest,
    scanner::{BountyScanner, ScanParams},
    spv::{prepare, PrepareOptions},
    RelayConfig,
};
use dotenvy::dotenv;
use reqwest::{header, Client, ClientBuilder, Url};
use std::str::FromStr;
use std::time::Duration;

struct RPCAgent {
    client: Client,
    url: Url,
}

impl RPCAgent {
    pub fn new() -> Result<Self, String> {
        let rpcurl = std::env::var("RPC_URL").map_err(|_| "RPC_URL is not set".to_string())?;
        let rpcuser = std::env::var("RPC_USER").unwrap_or_default();
        let rpcpassword = std::env::var("RPC_PASSWORD").unwrap_or_default();

        let mut common_headers = header::HeaderMap::with_capacity(4);
        common_headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );
        common_headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        common_headers.insert(
            header::ACCEPT_ENCODING,
            header::HeaderValue::from_static("gzip"),
        );

        let url = reqwest::Url::parse(&rpcurl).map_err(err_string)?;
        if !rpcuser.is_empty() && !rpcpassword.is_empty() {
            let auth = format!("{}:{}", rpcuser, rpcpassword);
            let auth = format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(auth)
            );
            common_headers.insert(header::AUTHORIZATION, auth.parse().map_err(err_string)?);
        }

        let client = ClientBuilder::new()
            .use_rustls_tls()
            .no_proxy()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .user_agent(APP_AGENT)
            .default_headers(common_headers)
            .gzip(true)
            .build()
            .map_err(err_string)?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl JsonRPCAgent for RPCAgent {
    async fn post(&self, _idempotency_key: String, body: Vec<u8>) -> Result<bytes::Bytes, String> {
        let req = self.client.post(self.url.clone()).body(body);
        let res = req.send().await.map_err(err_string)?;
        if res.status().is_success() {
            res.bytes().await.map_err(err_string)
        } else {
            Err(format!(
                "HTTP error: {}, {}",
                res.status(),
                res.text().await.unwrap_or_default()
            ))
        }
    }
}

fn load_config() -> Result<RelayConfig, String> {
    let mut cfg: RelayConfig = match std::env::var("RELAY_CONFIG") {
        Ok(path) => {
            let data = std::fs::read_to_string(&path).map_err(err_string)?;
            serde_json::from_str(&data).map_err(err_string)?
        }
        Err(_) => {
            let network = match std::env::var("NETWORK") {
                Ok(name) => Network::from_str(&name).map_err(err_string)?,
                Err(_) => Network::Testnet,
            };
            RelayConfig::for_network(network)
        }
    };
    if let Ok(fee) = std::env::var("FEE") {
        cfg.fee = parse_fee(&fee).map_err(err_string)?;
    }
    Ok(cfg)
}

// SENDER_ADDRESS=tb1... FEE=1306 cargo run -p relay-scan
// PROVE_TXID=<txid> cargo run -p relay-scan
#[tokio::main]
async fn main() -> Result<(), String> {
    dotenv().ok();
    env_logger::init();

    let cfg = load_config()?;
    let source = RpcChainSource::new(RPCAgent::new()?);
    let head = source.get_info().await.map_err(err_string)?;
    log::info!("chain head {} at {}", head.best_block_hash, head.height);

    if let Ok(sender) = std::env::var("SENDER_ADDRESS") {
        let sender = Address::from_str(&sender)
            .map_err(err_string)?
            .require_network(cfg.network)
            .map_err(err_string)?;
        let utxos = source.get_unspents(&sender).await.map_err(err_string)?;
        log::info!("{} has {} unspent outputs", sender, utxos.len());

        let scanner = BountyScanner::new(ScanParams::from(&cfg));
        match scanner.scan(&source, &utxos, &head).await {
            None => log::warn!("no unspent outputs to fund a bounty"),
            Some(input) => {
                let others: Vec<_> = utxos
                    .iter()
                    .filter(|u| u.outpoint() != input.utxo.outpoint())
                    .copied()
                    .collect();
                let built = TxBuilder::from_config(&cfg)
                    .build(
                        &input.utxo,
                        &input.recipients,
                        &others,
                        &sender.script_pubkey(),
                        cfg.fee,
                    )
                    .map_err(err_string)?;
                println!(
                    "unsigned bounty tx {}: {} recipients x {}, change {}",
                    built.tx.compute_txid(),
                    built.paid,
                    built.amount,
                    built.change()
                );
                println!("{}", tx_hex(&built.tx));
            }
        }
    }

    if let Ok(txid) = std::env::var("PROVE_TXID") {
        let txid = Txid::from_str(&txid).map_err(err_string)?;
        let tx = source.get_tx(&txid).await.map_err(err_string)?;
        let verdict = contest(&source, &tx).await.map_err(err_string)?;
        println!("{}: {:?}", txid, verdict);

        let prepared = prepare(&source, &tx, &PrepareOptions::from(&cfg))
            .await
            .map_err(err_string)?;
        println!(
            "{}",
            serde_json::to_string_pretty(&prepared).map_err(err_string)?
        );
    }

    Ok(())
}
