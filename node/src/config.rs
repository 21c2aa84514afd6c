//! # Node Configuration File
//!
//! `config.toml` in the data directory. Every field has a default, so an
//! empty file (or no file at all) yields a working local node. Command-line
//! flags override what the file says.
//!
//! ```toml
//! p2p_port = 9860
//! metrics_port = 9862
//! advertised_host = "203.0.113.7"
//! seeds = ["seed1.bazaar.example:9860"]
//!
//! [offers]
//! maker_fee = 20000
//!
//! [trades]
//! availability_timeout_ms = 30000
//! ```

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use bazaar_protocol::config::{
    NetworkConfig, OfferConfig, TradeConfig, DEFAULT_METRICS_PORT, DEFAULT_P2P_PORT,
};
use bazaar_protocol::network::NodeAddress;
use bazaar_protocol::AppConfig;

/// Balance of the development wallet when neither file nor flag sets one.
pub const DEFAULT_DEV_BALANCE: u64 = 100_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Interface the P2P listener binds to.
    pub listen_host: String,
    pub p2p_port: u16,
    pub metrics_port: u16,
    /// Host other peers dial. Defaults to `localhost`.
    pub advertised_host: String,
    /// Seed nodes as `host:port`.
    pub seeds: Vec<String>,
    /// Starting balance of the in-memory development wallet, in satoshis.
    pub dev_balance: u64,
    pub network: NetworkConfig,
    pub offers: OfferConfig,
    pub trades: TradeConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".into(),
            p2p_port: DEFAULT_P2P_PORT,
            metrics_port: DEFAULT_METRICS_PORT,
            advertised_host: "localhost".into(),
            seeds: Vec::new(),
            dev_balance: DEFAULT_DEV_BALANCE,
            network: NetworkConfig::default(),
            offers: OfferConfig::default(),
            trades: TradeConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Read a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config in {}", path.display()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize config")
    }

    /// Translate into the protocol's application config.
    pub fn app_config(&self) -> Result<AppConfig> {
        let listen_addr: SocketAddr = format!("{}:{}", self.listen_host, self.p2p_port)
            .parse()
            .with_context(|| format!("invalid listen host {:?}", self.listen_host))?;
        let advertised = NodeAddress::new(self.advertised_host.clone(), self.p2p_port);

        let seed_nodes = self
            .seeds
            .iter()
            .map(|s| {
                s.parse::<NodeAddress>()
                    .with_context(|| format!("invalid seed address {s:?}"))
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter(|seed| seed != &advertised)
            .collect();

        let mut config = AppConfig::new(listen_addr, advertised);
        config.seed_nodes = seed_nodes;
        config.network = self.network.clone();
        config.offers = self.offers.clone();
        config.trades = self.trades.clone();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, NodeConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "p2p_port = 7000\nseeds = [\"a.example:9860\"]\n\n[trades]\ntaker_fee = 5"
        )
        .unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.p2p_port, 7000);
        assert_eq!(config.metrics_port, DEFAULT_METRICS_PORT);
        assert_eq!(config.seeds, vec!["a.example:9860".to_string()]);
        assert_eq!(config.trades.taker_fee, 5);
        assert_eq!(config.trades.tx_fee, TradeConfig::default().tx_fee);
    }

    #[test]
    fn written_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = NodeConfig {
            p2p_port: 9999,
            ..NodeConfig::default()
        };
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();
        assert_eq!(NodeConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn own_address_is_not_a_seed() {
        let config = NodeConfig {
            seeds: vec!["localhost:9860".into(), "peer.example:9860".into()],
            ..NodeConfig::default()
        };
        let app = config.app_config().unwrap();
        assert_eq!(app.seed_nodes, vec![NodeAddress::new("peer.example", 9860)]);
        assert_eq!(app.listen_addr.port(), 9860);
    }

    #[test]
    fn bad_seed_is_rejected() {
        let config = NodeConfig {
            seeds: vec!["no-port".into()],
            ..NodeConfig::default()
        };
        assert!(config.app_config().is_err());
    }
}
