use bitcoin::{BlockHash, TxMerkleNode, Txid};
use thiserror::Error;

/// Failures of the pure transaction builder. These are reported as values so
/// callers can tell a wallet that cannot pay apart from a backend that is down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("invalid fee: {0:?}")]
    InvalidFee(String),

    #[error("insufficient fund, available: {available}, required: {required}")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("no valid bounty amount in [1, {fee}]")]
    NoValidBountyAmount { fee: u64 },

    #[error("memo {0:?} cannot be pushed in a data output")]
    InvalidMemo(String),

    #[error("signed transaction shape changed: {0}")]
    ShapeChanged(String),
}

#[derive(Debug, Error)]
pub enum Error {
    /// Transport or backend failure reported by a chain source agent.
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("merkle root mismatch in block {block}: declared {declared}, computed {computed}")]
    MerkleRootMismatch {
        block: BlockHash,
        declared: TxMerkleNode,
        computed: TxMerkleNode,
    },

    #[error("transaction {txid} is not in block {block}")]
    TxNotInBlock { txid: Txid, block: BlockHash },

    #[error("transaction {0} is not confirmed")]
    NotConfirmed(Txid),

    #[error("no bounty transaction found in the history of {0}")]
    BountyTxNotFound(String),

    #[error("transaction {txid} has {outputs} outputs, bounty sampling needs at least 3")]
    NotEnoughOutputs { txid: Txid, outputs: usize },

    #[error("transaction {0} carries no memo output")]
    NoMemo(Txid),

    #[error("input {index} out of range for transaction {txid}")]
    InputOutOfRange { txid: Txid, index: usize },

    #[error("sampling output of {0} has no standard address")]
    NoSamplingAddress(Txid),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Build(#[from] BuildError),
}

impl Error {
    /// Backend failures that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Fetch(_))
    }
}
