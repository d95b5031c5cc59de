use bitcoin::Network;
use serde::{Deserialize, Serialize};

/// WIF version byte for mainnet keys.
pub const MAINNET_WIF_VERSION: u8 = 0x80;

/// WIF version byte shared by every test network.
pub const TESTNET_WIF_VERSION: u8 = 0xEF;

/// Supported Bitcoin networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BtcNetwork {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl BtcNetwork {
    /// Convert to the `bitcoin` crate's `Network` type.
    pub fn to_bitcoin_network(self) -> Network {
        match self {
            BtcNetwork::Mainnet => Network::Bitcoin,
            BtcNetwork::Testnet => Network::Testnet,
            BtcNetwork::Signet => Network::Signet,
            BtcNetwork::Regtest => Network::Regtest,
        }
    }

    /// BIP-44 coin type: 0 on mainnet, 1 on every test network.
    pub fn coin_type(self) -> u32 {
        match self {
            BtcNetwork::Mainnet => 0,
            _ => 1,
        }
    }

    /// Version byte prefixed to WIF-encoded private keys.
    pub fn wif_version(self) -> u8 {
        match self {
            BtcNetwork::Mainnet => MAINNET_WIF_VERSION,
            _ => TESTNET_WIF_VERSION,
        }
    }

    pub fn is_mainnet(self) -> bool {
        self == BtcNetwork::Mainnet
    }

    /// Whether two networks share key and extended-key encodings.
    ///
    /// Testnet, signet and regtest cannot be told apart from a WIF or an
    /// extended public key; only mainnet vs. test is recoverable.
    pub fn same_key_family(self, other: BtcNetwork) -> bool {
        self.is_mainnet() == other.is_mainnet()
    }
}

impl std::fmt::Display for BtcNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BtcNetwork::Mainnet => write!(f, "mainnet"),
            BtcNetwork::Testnet => write!(f, "testnet"),
            BtcNetwork::Signet => write!(f, "signet"),
            BtcNetwork::Regtest => write!(f, "regtest"),
        }
    }
}
