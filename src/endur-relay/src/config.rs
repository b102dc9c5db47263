use bitcoin::{CompactTarget, Network};
use serde::{Deserialize, Serialize};

/// Difficulty bits of testnet minimum-difficulty blocks.
pub const MIN_DIFFICULTY_BITS: u32 = 0x1d00ffff;

pub const DEFAULT_BRAND: &str = "endur.io";

/// Conservative byte-size estimates used when pricing a transaction before it
/// is signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeEstimates {
    /// Bytes a `<sig> <pubkey>` script_sig adds to an input once signed.
    pub signature_bytes: u64,
    /// Outpoint (32 + 4) plus sequence (4).
    pub input_fixed_bytes: u64,
    /// Value (8) plus script length prefix (1).
    pub output_fixed_bytes: u64,
}

impl SizeEstimates {
    pub const DEFAULT: Self = Self {
        signature_bytes: 107,
        input_fixed_bytes: 40,
        output_fixed_bytes: 9,
    };

    /// Bytes needed to create an output with the given script and later spend
    /// it with a single signature.
    pub fn viable_output_size(&self, script_len: usize) -> u64 {
        self.output_fixed_bytes
            + script_len as u64
            + self.input_fixed_bytes
            + 1 // script_sig length prefix
            + self.signature_bytes
    }
}

impl Default for SizeEstimates {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Parameters of one relay deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub network: Network,
    /// Memo brand embedded in the data output.
    pub brand: String,
    /// How many blocks below the chain head the scanner walks per UTXO.
    pub max_blocks_back: u64,
    /// Stop collecting recipients for a UTXO once it has this many.
    pub max_recipients: usize,
    /// Total fee of the bounty transaction, also the upper bound of the bounty
    /// amount search.
    pub fee: u64,
    /// Mining multiplier advertised in the memo when greater than 1.
    pub xmine: u32,
    /// Blocks declaring these bits are skipped by the scanner.
    pub min_difficulty_bits: u32,
    /// Stop walking back once a block is older than this many seconds relative
    /// to the chain head.
    pub max_block_age_secs: Option<u32>,
    pub history_page_size: usize,
    pub sizes: SizeEstimates,
}

impl RelayConfig {
    pub fn mainnet() -> Self {
        Self {
            network: Network::Bitcoin,
            brand: DEFAULT_BRAND.to_string(),
            max_blocks_back: 6,
            max_recipients: 8,
            fee: 1306,
            xmine: 1,
            min_difficulty_bits: MIN_DIFFICULTY_BITS,
            max_block_age_secs: None,
            history_page_size: 50,
            sizes: SizeEstimates::DEFAULT,
        }
    }

    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            fee: 999,
            ..Self::mainnet()
        }
    }

    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Bitcoin => Self::mainnet(),
            network => Self {
                network,
                ..Self::testnet()
            },
        }
    }

    pub fn min_difficulty_target(&self) -> CompactTarget {
        CompactTarget::from_consensus(self.min_difficulty_bits)
    }

    /// The memo text: the brand, suffixed with ` x<multiplier>` when mining
    /// with a multiplier.
    pub fn memo(&self) -> String {
        memo_text(&self.brand, self.xmine)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::mainnet()
    }
}

pub fn memo_text(brand: &str, xmine: u32) -> String {
    if xmine > 1 {
        format!("{brand} x{xmine}")
    } else {
        brand.to_string()
    }
}
