use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use combaine_cache::TtlCache;
use tracing::warn;

/// Resolves a host group name into the hosts currently in that group.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, id: &str, group: &str) -> Result<Vec<String>, anyhow::Error>;
}

/// Resolves groups through an HTTP hosts API, with lookups coalesced and
/// cached by the shared TTL cache.
///
/// The source is a URL template containing `{group}`, e.g.
/// `http://hosts.example.net/api/groups/{group}`; the endpoint answers with
/// one hostname per line.
pub struct HttpHostResolver {
    source: String,
    cache: TtlCache,
    client: reqwest::Client,
}

impl HttpHostResolver {
    pub fn new(source: impl Into<String>, cache: TtlCache) -> Self {
        Self {
            source: source.into(),
            cache,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl HostResolver for HttpHostResolver {
    async fn resolve(&self, id: &str, group: &str) -> Result<Vec<String>, anyhow::Error> {
        let url = self.source.replace("{group}", group);
        let client = self.client.clone();
        let key = format!("hosts:{group}");

        let hosts = self
            .cache
            .get_strings(id, &key, move || {
                let client = client.clone();
                let url = url.clone();
                async move {
                    let body = client
                        .get(&url)
                        .send()
                        .await?
                        .error_for_status()?
                        .text()
                        .await?;
                    let hosts = body
                        .lines()
                        .map(str::trim)
                        .filter(|line| !line.is_empty())
                        .map(str::to_string)
                        .collect::<Vec<_>>();
                    Ok(hosts)
                }
            })
            .await?;
        Ok(hosts)
    }
}

/// Fixed group table for tests and single-host setups.
#[derive(Default)]
pub struct StaticHostResolver {
    groups: std::collections::HashMap<String, Vec<String>>,
}

impl StaticHostResolver {
    pub fn new(groups: std::collections::HashMap<String, Vec<String>>) -> Self {
        Self { groups }
    }
}

#[async_trait]
impl HostResolver for StaticHostResolver {
    async fn resolve(&self, _id: &str, group: &str) -> Result<Vec<String>, anyhow::Error> {
        Ok(self.groups.get(group).cloned().unwrap_or_default())
    }
}

/// Merges a parsing config's explicit hosts with its resolved groups,
/// deduplicated and sorted. Unresolvable groups are skipped with a warning;
/// the tick proceeds with whatever targets are known.
pub async fn resolve_targets(
    resolver: &Arc<dyn HostResolver>,
    id: &str,
    hosts: &[String],
    groups: &[String],
) -> Vec<String> {
    let mut targets: BTreeSet<String> = hosts.iter().cloned().collect();
    for group in groups {
        match resolver.resolve(id, group).await {
            Ok(resolved) => targets.extend(resolved),
            Err(error) => {
                warn!(session = %id, group = %group, error = %error, "Failed to resolve host group.");
            },
        }
    }
    targets.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[tokio::test]
    async fn targets_merge_hosts_and_groups() {
        let resolver: Arc<dyn HostResolver> = Arc::new(StaticHostResolver::new(HashMap::from([
            (
                "backend".to_string(),
                vec!["db-1".to_string(), "web-1".to_string()],
            ),
        ])));

        let targets = resolve_targets(
            &resolver,
            "t",
            &["web-1".to_string(), "web-2".to_string()],
            &["backend".to_string(), "missing".to_string()],
        )
        .await;
        assert_eq!(targets, vec!["db-1", "web-1", "web-2"]);
    }
}
