use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::RepositoryError;

/// An untyped plugin section: a `type` discriminator plus free-form options.
///
/// Fetchers, aggregators and senders are all configured through these. The
/// concrete plugin decodes the mapping into its own options struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginConfig(pub BTreeMap<String, serde_yaml::Value>);

impl PluginConfig {
    /// The `type` discriminator naming the plugin implementation.
    pub fn plugin_type(&self) -> Result<&str, RepositoryError> {
        self.0
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or(RepositoryError::MissingPluginType)
    }

    /// Decodes the whole section into a typed options struct.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RepositoryError> {
        let value = serde_yaml::to_value(&self.0).map_err(RepositoryError::Encode)?;
        serde_yaml::from_value(value).map_err(RepositoryError::Encode)
    }
}

/// A parsing config: what to fetch, from which targets, and which aggregation
/// configs consume the result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsingConfig {
    /// Host groups resolved through a hosts fetcher.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Explicit target hosts, merged with the resolved groups.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Names of the aggregation configs fed by this parsing config.
    #[serde(default)]
    pub agg_configs: Vec<String>,
    /// Fetcher plugin section.
    #[serde(default)]
    pub data_fetcher: PluginConfig,
    /// Seconds between two ticks of the task runner.
    #[serde(default = "default_iteration_interval")]
    pub iteration_interval: u64,
}

/// An aggregation config: named data sections and the senders that receive
/// the folded results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default)]
    pub data: BTreeMap<String, PluginConfig>,
    #[serde(default)]
    pub senders: BTreeMap<String, PluginConfig>,
}

/// Cluster-wide agent settings from `combaine.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Gossip/raft bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Port the raft transport listens on.
    #[serde(default = "default_raft_port")]
    pub raft_port: u16,
    /// Port the gossip transport listens on.
    #[serde(default = "default_gossip_port")]
    pub gossip_port: u16,
    /// State directory; `raft/` is created underneath it.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Gossip seeds contacted on startup.
    #[serde(default)]
    pub seed_nodes: Vec<String>,
    /// URL template resolving a host group, e.g.
    /// `http://hosts.example.net/api/groups/{group}`.
    #[serde(default)]
    pub hosts_source: Option<String>,
    /// Shared fetcher cache settings.
    #[serde(default)]
    pub cache: CacheSettings,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            raft_port: default_raft_port(),
            gossip_port: default_gossip_port(),
            data_dir: default_data_dir(),
            seed_nodes: Vec::new(),
            hosts_source: None,
            cache: CacheSettings::default(),
        }
    }
}

/// TTL cache tuning, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_ttl")]
    pub ttl: u64,
    #[serde(default = "default_cache_interval")]
    pub interval: u64,
    #[serde(default = "default_cache_cleanup_after")]
    pub cleanup_after: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
            interval: default_cache_interval(),
            cleanup_after: default_cache_cleanup_after(),
        }
    }
}

/// Sender service settings from `sender.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Listen address of the sender gRPC service.
    #[serde(default = "default_sender_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub cache: CacheSettings,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_sender_endpoint(),
            cache: CacheSettings::default(),
        }
    }
}

fn default_iteration_interval() -> u64 {
    60
}

fn default_bind_addr() -> String {
    "::".to_string()
}

fn default_raft_port() -> u16 {
    9001
}

fn default_gossip_port() -> u16 {
    9000
}

fn default_data_dir() -> String {
    "/var/spool/combaine".to_string()
}

fn default_cache_ttl() -> u64 {
    5
}

fn default_cache_interval() -> u64 {
    15
}

fn default_cache_cleanup_after() -> u64 {
    150
}

fn default_sender_endpoint() -> String {
    "[::]:9003".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_config_exposes_type() {
        let cfg: PluginConfig = serde_yaml::from_str("type: timetail\nport: 3132\n").unwrap();
        assert_eq!(cfg.plugin_type().unwrap(), "timetail");
    }

    #[test]
    fn plugin_config_without_type_errors() {
        let cfg: PluginConfig = serde_yaml::from_str("port: 3132\n").unwrap();
        assert!(cfg.plugin_type().is_err());
    }

    #[test]
    fn plugin_config_decodes_options() {
        #[derive(Deserialize)]
        struct Options {
            #[serde(rename = "type")]
            _type: String,
            port: u16,
        }

        let cfg: PluginConfig = serde_yaml::from_str("type: timetail\nport: 3132\n").unwrap();
        let opts: Options = cfg.decode().unwrap();
        assert_eq!(opts.port, 3132);
    }
}
