//! Settings of the Algorand verifier (the `[algorand]` section).

use serde::Deserialize;

/// USDC asset id on Algorand mainnet.
pub const USDC_MAINNET_ASSET_ID: u64 = 31_566_704;

/// USDC asset id on Algorand testnet.
pub const USDC_TESTNET_ASSET_ID: u64 = 10_458_941;

/// Algorand network the indexer serves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorandNetwork {
    /// Production network.
    Mainnet,
    /// Test network.
    #[default]
    Testnet,
}

impl AlgorandNetwork {
    /// USDC asset id on this network.
    #[must_use]
    pub const fn usdc_asset_id(self) -> u64 {
        match self {
            Self::Mainnet => USDC_MAINNET_ASSET_ID,
            Self::Testnet => USDC_TESTNET_ASSET_ID,
        }
    }
}

/// Indexer endpoint and asset settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AlgorandConfig {
    /// Indexer base URL, e.g. `https://testnet-idx.algonode.cloud`.
    pub indexer_url: String,

    /// Token sent as `X-API-Key`; omitted when empty.
    #[serde(default)]
    pub api_token: Option<String>,

    /// Asset to accept; defaults to USDC on [`Self::network`].
    #[serde(default)]
    pub asset_id: Option<u64>,

    /// Network used for the default asset.
    #[serde(default)]
    pub network: AlgorandNetwork,

    /// Decimal places of the asset's base unit (default: 6).
    #[serde(default = "default_asset_decimals")]
    pub asset_decimals: u32,

    /// Cap on one indexer call in seconds (default: 10).
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_asset_decimals() -> u32 {
    6
}

fn default_timeout_seconds() -> u64 {
    10
}

impl AlgorandConfig {
    /// Testnet defaults for the given indexer.
    #[must_use]
    pub fn testnet(indexer_url: impl Into<String>) -> Self {
        Self {
            indexer_url: indexer_url.into(),
            api_token: None,
            asset_id: None,
            network: AlgorandNetwork::Testnet,
            asset_decimals: default_asset_decimals(),
            timeout_seconds: default_timeout_seconds(),
        }
    }

    /// Asset the verifier expects when the receipt names none.
    #[must_use]
    pub fn default_asset_id(&self) -> u64 {
        self.asset_id
            .filter(|id| *id != 0)
            .unwrap_or_else(|| self.network.usdc_asset_id())
    }

    /// API token, if non-blank.
    #[must_use]
    pub fn api_token(&self) -> Option<&str> {
        self.api_token
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_asset_follows_network() {
        let mut config: AlgorandConfig =
            serde_json::from_str(r#"{"indexer_url": "http://idx", "network": "mainnet"}"#).unwrap();
        assert_eq!(config.default_asset_id(), USDC_MAINNET_ASSET_ID);
        assert_eq!(config.asset_decimals, 6);
        assert_eq!(config.timeout_seconds, 10);

        config.asset_id = Some(42);
        assert_eq!(config.default_asset_id(), 42);

        assert_eq!(
            AlgorandConfig::testnet("http://idx").default_asset_id(),
            USDC_TESTNET_ASSET_ID
        );
    }

    #[test]
    fn test_blank_token_is_ignored() {
        let mut config = AlgorandConfig::testnet("http://idx");
        config.api_token = Some("  ".into());
        assert_eq!(config.api_token(), None);
    }
}
