//! # Combaine Repository
//!
//! Read-only access to the on-disk configuration tree used by the combaine
//! agents and workers.
//!
//! The repository directory is laid out as:
//!
//! ```text
//! <base>/
//!   combaine.yaml      cluster-wide settings
//!   sender.yaml        sender service settings (optional)
//!   parsing/           one YAML file per parsing config
//!   aggregate/         one YAML file per aggregation config
//! ```
//!
//! Parsing configs describe what to fetch and from where; aggregation configs
//! describe how per-host payloads are folded and where the results are sent.
//! The repository is opened once at startup and handed to the components that
//! need it; there is no global handle.

mod configs;
mod error;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub use configs::{
    AggregationConfig,
    CacheSettings,
    ClusterConfig,
    ParsingConfig,
    PluginConfig,
    SenderConfig,
};
pub use error::RepositoryError;
use tracing::debug;

const PARSING_DIR: &str = "parsing";
const AGGREGATE_DIR: &str = "aggregate";
const CLUSTER_CONFIG_FILE: &str = "combaine.yaml";
const SENDER_CONFIG_FILE: &str = "sender.yaml";

/// Handle to a validated configuration directory.
#[derive(Debug, Clone)]
pub struct Repository {
    base: PathBuf,
}

impl Repository {
    /// Opens the repository rooted at `base`, validating that the parsing and
    /// aggregation sub-directories exist.
    pub fn open(base: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let base = base.as_ref().to_path_buf();
        for sub in [PARSING_DIR, AGGREGATE_DIR] {
            let dir = base.join(sub);
            if !dir.is_dir() {
                return Err(RepositoryError::MissingDirectory(dir));
            }
        }
        debug!(base = %base.display(), "Opened config repository.");
        Ok(Self { base })
    }

    /// Names of every parsing config in the repository, sorted.
    pub fn list_parsing_configs(&self) -> Result<Vec<String>, RepositoryError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.base.join(PARSING_DIR))? {
            let path = entry?.path();
            if let Some(name) = config_name(&path) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Reads and decodes the parsing config with the given name.
    pub fn read_parsing_config(&self, name: &str) -> Result<ParsingConfig, RepositoryError> {
        let path = self.base.join(PARSING_DIR).join(format!("{name}.yaml"));
        let raw = fs::read(&path).map_err(|_| RepositoryError::MissingConfig {
            kind: "parsing",
            name: name.to_string(),
        })?;
        let cfg: ParsingConfig = serde_yaml::from_slice(&raw).map_err(|source| {
            RepositoryError::Malformed {
                name: name.to_string(),
                source,
            }
        })?;
        Ok(cfg)
    }

    /// Reads every aggregation config referenced by the named parsing config.
    ///
    /// A missing aggregation file is an error: a parsing config that points at
    /// a config which does not exist cannot be dispatched.
    pub fn read_aggregation_configs(
        &self,
        parsing_name: &str,
    ) -> Result<BTreeMap<String, AggregationConfig>, RepositoryError> {
        let parsing = self.read_parsing_config(parsing_name)?;
        let mut configs = BTreeMap::new();
        for agg_name in &parsing.agg_configs {
            let path = self.base.join(AGGREGATE_DIR).join(format!("{agg_name}.yaml"));
            let raw = fs::read(&path).map_err(|_| RepositoryError::MissingConfig {
                kind: "aggregation",
                name: agg_name.clone(),
            })?;
            let cfg: AggregationConfig =
                serde_yaml::from_slice(&raw).map_err(|source| RepositoryError::Malformed {
                    name: agg_name.clone(),
                    source,
                })?;
            configs.insert(agg_name.clone(), cfg);
        }
        Ok(configs)
    }

    /// Reads the cluster-wide settings from `combaine.yaml`.
    pub fn read_cluster_config(&self) -> Result<ClusterConfig, RepositoryError> {
        let path = self.base.join(CLUSTER_CONFIG_FILE);
        let raw = fs::read(&path).map_err(|_| RepositoryError::MissingConfig {
            kind: "cluster",
            name: CLUSTER_CONFIG_FILE.to_string(),
        })?;
        let cfg: ClusterConfig =
            serde_yaml::from_slice(&raw).map_err(|source| RepositoryError::Malformed {
                name: CLUSTER_CONFIG_FILE.to_string(),
                source,
            })?;
        Ok(cfg)
    }

    /// Reads the sender service settings, falling back to defaults when the
    /// file is absent.
    pub fn read_sender_config(&self) -> Result<SenderConfig, RepositoryError> {
        let path = self.base.join(SENDER_CONFIG_FILE);
        if !path.is_file() {
            return Ok(SenderConfig::default());
        }
        let raw = fs::read(&path)?;
        let cfg: SenderConfig =
            serde_yaml::from_slice(&raw).map_err(|source| RepositoryError::Malformed {
                name: SENDER_CONFIG_FILE.to_string(),
                source,
            })?;
        Ok(cfg)
    }
}

fn config_name(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn seed_repository(dir: &Path) {
        write(
            dir,
            "parsing/nginx.yaml",
            r#"
hosts: ["web-1", "web-2"]
agg_configs: ["nginx-timings"]
data_fetcher:
  type: timetail
  timetail_port: 3132
  timetail_url: "/timetail?pattern=request&log_ts="
  logname: "nginx/access.log"
iteration_interval: 30
"#,
        );
        write(
            dir,
            "aggregate/nginx-timings.yaml",
            r#"
data:
  timings:
    type: average
senders:
  juggler-main:
    type: juggler
    endpoint: "[::1]:9003"
"#,
        );
        write(
            dir,
            "combaine.yaml",
            r#"
bind_addr: "::"
raft_port: 9101
data_dir: "/tmp/combaine-test"
seed_nodes: []
"#,
        );
    }

    #[test]
    fn open_rejects_incomplete_tree() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("parsing")).unwrap();
        let err = Repository::open(dir.path()).unwrap_err();
        assert!(matches!(err, RepositoryError::MissingDirectory(_)));
    }

    #[test]
    fn list_and_read_parsing_configs() {
        let dir = tempfile::tempdir().unwrap();
        seed_repository(dir.path());

        let repo = Repository::open(dir.path()).unwrap();
        assert_eq!(repo.list_parsing_configs().unwrap(), vec!["nginx"]);

        let cfg = repo.read_parsing_config("nginx").unwrap();
        assert_eq!(cfg.hosts, vec!["web-1", "web-2"]);
        assert_eq!(cfg.agg_configs, vec!["nginx-timings"]);
        assert_eq!(cfg.iteration_interval, 30);
        assert_eq!(cfg.data_fetcher.plugin_type().unwrap(), "timetail");
    }

    #[test]
    fn read_aggregation_configs_resolves_references() {
        let dir = tempfile::tempdir().unwrap();
        seed_repository(dir.path());

        let repo = Repository::open(dir.path()).unwrap();
        let aggs = repo.read_aggregation_configs("nginx").unwrap();
        assert_eq!(aggs.len(), 1);
        let agg = &aggs["nginx-timings"];
        assert!(agg.data.contains_key("timings"));
        assert!(agg.senders.contains_key("juggler-main"));
    }

    #[test]
    fn missing_parsing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        seed_repository(dir.path());

        let repo = Repository::open(dir.path()).unwrap();
        let err = repo.read_parsing_config("absent").unwrap_err();
        assert!(matches!(err, RepositoryError::MissingConfig { .. }));
    }

    #[test]
    fn sender_config_defaults_when_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        seed_repository(dir.path());

        let repo = Repository::open(dir.path()).unwrap();
        let cfg = repo.read_sender_config().unwrap();
        assert_eq!(cfg.endpoint, "[::]:9003");

        write(dir.path(), "sender.yaml", "endpoint: \"[::]:9103\"\n");
        let cfg = repo.read_sender_config().unwrap();
        assert_eq!(cfg.endpoint, "[::]:9103");
    }

    #[test]
    fn cluster_config_defaults_apply() {
        let dir = tempfile::tempdir().unwrap();
        seed_repository(dir.path());
        write(dir.path(), "combaine.yaml", "data_dir: \"/tmp/c\"\n");

        let repo = Repository::open(dir.path()).unwrap();
        let cfg = repo.read_cluster_config().unwrap();
        assert_eq!(cfg.raft_port, 9001);
        assert_eq!(cfg.bind_addr, "::");
    }
}
