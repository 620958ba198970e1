//! Fetcher plugins.
//!
//! Fetchers pull the raw payload for one target host. They are registered by
//! name at startup and built per task from the parsing config's
//! `data_fetcher` section.

mod timetail;

use std::collections::HashMap;

use async_trait::async_trait;
use combaine_repository::PluginConfig;
use thiserror::Error;

pub use timetail::TimetailFetcher;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetcher {0} is already registered")]
    DuplicateFetcher(String),

    #[error("unknown fetcher type: {0}")]
    UnknownFetcher(String),

    #[error("{fetcher}: missing option {option}")]
    MissingOption {
        fetcher: &'static str,
        option: &'static str,
    },

    #[error("bad fetcher config: {0}")]
    Config(#[from] combaine_repository::RepositoryError),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// One fetch request: the target host and the time span to cover.
#[derive(Debug, Clone)]
pub struct FetcherTask {
    /// Session id, carried into logs.
    pub id: String,
    pub target: String,
    /// Seconds of history to fetch.
    pub period: i64,
}

#[async_trait]
pub trait Fetcher: Send + Sync + std::fmt::Debug {
    async fn fetch(&self, task: &FetcherTask) -> Result<Vec<u8>, FetchError>;
}

type FetcherFactory = fn(&PluginConfig) -> Result<Box<dyn Fetcher>, FetchError>;

/// Name-to-constructor mapping seeded once at startup.
///
/// Registration order does not matter; registering the same name twice is a
/// startup error.
#[derive(Default)]
pub struct FetcherRegistry {
    factories: HashMap<String, FetcherFactory>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in fetcher registered.
    pub fn with_defaults() -> Result<Self, FetchError> {
        let mut registry = Self::new();
        registry.register("timetail", timetail::new_timetail_fetcher)?;
        Ok(registry)
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: FetcherFactory,
    ) -> Result<(), FetchError> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(FetchError::DuplicateFetcher(name));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Builds a fetcher from a plugin section, keyed by its `type` field.
    pub fn create(&self, cfg: &PluginConfig) -> Result<Box<dyn Fetcher>, FetchError> {
        let fetcher_type = cfg.plugin_type()?;
        let factory = self
            .factories
            .get(fetcher_type)
            .ok_or_else(|| FetchError::UnknownFetcher(fetcher_type.to_string()))?;
        factory(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timetail_config() -> PluginConfig {
        serde_yaml::from_str(
            r#"
type: timetail
timetail_port: 3132
timetail_url: "/timetail?pattern=request&log_ts="
logname: "nginx/access.log"
"#,
        )
        .unwrap()
    }

    #[test]
    fn default_registry_builds_timetail() {
        let registry = FetcherRegistry::with_defaults().unwrap();
        assert!(registry.create(&timetail_config()).is_ok());
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let mut registry = FetcherRegistry::with_defaults().unwrap();
        let err = registry
            .register("timetail", timetail::new_timetail_fetcher)
            .unwrap_err();
        assert!(matches!(err, FetchError::DuplicateFetcher(_)));
    }

    #[test]
    fn unknown_type_is_an_error() {
        let registry = FetcherRegistry::with_defaults().unwrap();
        let cfg: PluginConfig = serde_yaml::from_str("type: carrier-pigeon\n").unwrap();
        let err = registry.create(&cfg).unwrap_err();
        assert!(matches!(err, FetchError::UnknownFetcher(_)));
    }

    #[test]
    fn timetail_requires_a_port() {
        let registry = FetcherRegistry::with_defaults().unwrap();
        let cfg: PluginConfig = serde_yaml::from_str("type: timetail\n").unwrap();
        let err = registry.create(&cfg).unwrap_err();
        assert!(matches!(err, FetchError::MissingOption { .. }));
    }
}
