//! Network selection (mainnet / testnet)

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Mainnet,
    Testnet,
}

impl NetworkType {
    /// Parse from a config string; anything other than "mainnet" is testnet.
    pub fn from_config(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "mainnet" => NetworkType::Mainnet,
            _ => NetworkType::Testnet,
        }
    }

    /// Subdirectory under the data dir. Mainnet uses the base directory.
    pub fn data_subdir(&self) -> Option<&'static str> {
        match self {
            NetworkType::Mainnet => None,
            NetworkType::Testnet => Some("testnet"),
        }
    }

    pub fn chain_id(&self) -> &'static str {
        match self {
            NetworkType::Mainnet => "bt2c-mainnet-1",
            NetworkType::Testnet => "bt2c-testnet-1",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkType::Mainnet => write!(f, "mainnet"),
            NetworkType::Testnet => write!(f, "testnet"),
        }
    }
}

impl Default for NetworkType {
    fn default() -> Self {
        NetworkType::Testnet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        assert_eq!(NetworkType::from_config("mainnet"), NetworkType::Mainnet);
        assert_eq!(NetworkType::from_config("MAINNET"), NetworkType::Mainnet);
        assert_eq!(NetworkType::from_config("testnet"), NetworkType::Testnet);
        assert_eq!(NetworkType::from_config("garbage"), NetworkType::Testnet);
    }
}
