//! Configuration management for ForgeChain
//!
//! Every field has a default, so a missing `config.toml` still yields a
//! single-node devnet. Durations are written the humantime way (`"2s"`,
//! `"500ms"`).

use crate::crypto::{validate_public_key_hex, KeyPair};
use crate::error::{ChainError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub database: DatabaseConfig,
    pub miner: MinerConfig,
    pub sync: SyncConfig,
    pub genesis: GenesisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub p2p_port: u16,
    /// Address peers know this node by. Defaults to `ws://host:p2p_port`.
    pub advertised_address: Option<String>,
    pub bootstrap_peers: Vec<String>,
    pub allowed_peers: Vec<AllowedPeer>,
    #[serde(with = "humantime_duration")]
    pub warmup: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedPeer {
    pub address: String,
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    pub enabled: bool,
    #[serde(with = "humantime_duration")]
    pub interval: Duration,
    /// Node identity and forger key. A throwaway key is generated when absent.
    pub secret_key_hex: Option<String>,
    /// Recipient of block rewards. Defaults to the node's own address.
    pub reward_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub catch_up: bool,
    #[serde(with = "humantime_duration")]
    pub resync_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    pub initial_supply: u64,
    /// Stakes seeded into an empty registry so the first forger can be elected.
    pub validators: Vec<ValidatorStake>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorStake {
    pub public_key: String,
    pub stake: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            p2p_port: 5001,
            advertised_address: None,
            bootstrap_peers: Vec::new(),
            allowed_peers: Vec::new(),
            warmup: Duration::from_secs(2),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_data_path(),
        }
    }
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            secret_key_hex: None,
            reward_address: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            catch_up: false,
            resync_interval: Duration::from_secs(10),
        }
    }
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            initial_supply: 1_000_000,
            validators: Vec::new(),
        }
    }
}

fn default_data_path() -> String {
    dirs::data_dir()
        .map(|dir| dir.join("forgechain").join("chain.db"))
        .and_then(|path| path.to_str().map(str::to_string))
        .unwrap_or_else(|| "./data/chain.db".to_string())
}

impl NetworkConfig {
    pub fn advertised_address(&self) -> String {
        self.advertised_address
            .clone()
            .unwrap_or_else(|| format!("ws://{}:{}", self.host, self.p2p_port))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.p2p_port)
    }

    /// Allow-list as address -> public key.
    pub fn allow_list(&self) -> HashMap<String, String> {
        self.allowed_peers
            .iter()
            .map(|peer| (peer.address.clone(), peer.public_key.clone()))
            .collect()
    }
}

impl MinerConfig {
    pub fn keypair(&self) -> Result<Option<KeyPair>> {
        self.secret_key_hex
            .as_deref()
            .map(KeyPair::from_secret_hex)
            .transpose()
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(ChainError::ConfigError("database.path must be set".to_string()));
        }

        if self.miner.interval.is_zero() {
            return Err(ChainError::ConfigError("miner.interval must be positive".to_string()));
        }

        if self.sync.resync_interval.is_zero() {
            return Err(ChainError::ConfigError(
                "sync.resync_interval must be positive".to_string(),
            ));
        }

        self.miner
            .keypair()
            .map_err(|e| ChainError::ConfigError(format!("miner.secret_key_hex: {}", e)))?;

        for peer in &self.network.allowed_peers {
            validate_public_key_hex(&peer.public_key).map_err(|e| {
                ChainError::ConfigError(format!("allowed peer {}: {}", peer.address, e))
            })?;
        }

        for validator in &self.genesis.validators {
            validate_public_key_hex(&validator.public_key).map_err(|e| {
                ChainError::ConfigError(format!("genesis validator {}: {}", validator.public_key, e))
            })?;
        }

        Ok(())
    }
}

/// Reads `path`, falling back to defaults when the file does not exist.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let text = fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| {
            ChainError::ConfigError(format!("failed to parse {}: {}", path.display(), e))
        })?
    } else {
        Config::default()
    };

    config.validate()?;
    Ok(config)
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.network.p2p_port, 5001);
        assert_eq!(config.network.advertised_address(), "ws://127.0.0.1:5001");
        assert_eq!(config.miner.interval, Duration::from_secs(5));
        assert!(!config.sync.catch_up);
    }

    #[test]
    fn test_partial_file_with_durations() {
        let key = KeyPair::generate();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[network]
p2p_port = 6001
warmup = "750ms"

[[network.allowed_peers]]
address = "ws://10.0.0.2:6001"
public_key = "{pk}"

[miner]
interval = "2s"
secret_key_hex = "{sk}"

[sync]
catch_up = true

[genesis]
initial_supply = 500
validators = [{{ public_key = "{pk}", stake = 10 }}]
"#,
            pk = key.address(),
            sk = key.secret_key_hex()
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.network.p2p_port, 6001);
        assert_eq!(config.network.host, "127.0.0.1");
        assert_eq!(config.network.warmup, Duration::from_millis(750));
        assert_eq!(config.miner.interval, Duration::from_secs(2));
        assert!(config.sync.catch_up);
        assert_eq!(config.genesis.initial_supply, 500);
        assert_eq!(config.genesis.validators[0].stake, 10);
        assert_eq!(
            config.network.allow_list().get("ws://10.0.0.2:6001"),
            Some(&key.address())
        );
        assert_eq!(
            config.miner.keypair().unwrap().map(|k| k.address()),
            Some(key.address())
        );
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::default();
        config.database.path = " ".to_string();
        assert!(matches!(config.validate(), Err(ChainError::ConfigError(_))));

        let mut config = Config::default();
        config.miner.secret_key_hex = Some("not-hex".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.network.allowed_peers.push(AllowedPeer {
            address: "ws://x".to_string(),
            public_key: "abcd".to_string(),
        });
        assert!(config.validate().is_err());
    }
}
