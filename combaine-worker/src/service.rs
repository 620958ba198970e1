use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use combaine_cache::TtlCache;
use combaine_repository::{AggregationConfig, ParsingConfig};
use combaine_rpc::worker_server::Worker as WorkerRpc;
use combaine_rpc::{AggregatingResult, AggregatingTask, ParsingResult, ParsingTask};
use tonic::{Request, Response, Status};
use tracing::{debug, error, info};

use crate::fetchers::{Fetcher, FetcherRegistry, FetcherTask};

/// The gRPC worker service: fetches target payloads for the parse stage and
/// folds collected payloads for the aggregate stage.
///
/// Fetches go through the shared TTL cache so concurrent tasks hitting the
/// same target share one in-flight request.
pub struct WorkerService {
    fetchers: Arc<FetcherRegistry>,
    cache: TtlCache,
}

impl WorkerService {
    pub fn new(fetchers: Arc<FetcherRegistry>, cache: TtlCache) -> Self {
        Self { fetchers, cache }
    }

    async fn fetch_from_target(
        &self,
        task: &ParsingTask,
        parsing_config: &ParsingConfig,
    ) -> Result<Vec<u8>, Status> {
        let fetcher_type = parsing_config
            .data_fetcher
            .plugin_type()
            .map_err(|e| Status::invalid_argument(e.to_string()))?
            .to_string();
        debug!(session = %task.id, fetcher = %fetcher_type, "Fetching data.");

        let fetcher: Arc<dyn Fetcher> = Arc::from(
            self.fetchers
                .create(&parsing_config.data_fetcher)
                .map_err(|e| Status::invalid_argument(e.to_string()))?,
        );

        let frame = task.frame.clone().unwrap_or_default();
        let period = (frame.current - frame.previous).max(1);
        let fetcher_task = FetcherTask {
            id: task.id.clone(),
            target: task.host.clone(),
            period,
        };
        let cache_key = format!("{};{}", task.host, fetcher_type);

        let started = Instant::now();
        let blob = tokio::time::timeout(
            Duration::from_secs(period as u64),
            self.cache.get_bytes(&task.id, &cache_key, move || {
                let fetcher = fetcher.clone();
                let fetcher_task = fetcher_task.clone();
                async move { Ok(fetcher.fetch(&fetcher_task).await?) }
            }),
        )
        .await
        .map_err(|_| Status::deadline_exceeded("fetch deadline exceeded"))?
        .map_err(|e| Status::unavailable(e.to_string()))?;
        info!(
            session = %task.id,
            took = ?started.elapsed(),
            bytes = blob.len(),
            host = %task.host,
            "Fetching completed."
        );
        Ok(blob)
    }
}

#[tonic::async_trait]
impl WorkerRpc for WorkerService {
    async fn do_parsing(
        &self,
        request: Request<ParsingTask>,
    ) -> Result<Response<ParsingResult>, Status> {
        let task = request.into_inner();
        info!(session = %task.id, config = %task.parsing_config_name, "Start parsing.");

        let parsing_config: ParsingConfig = serde_yaml::from_slice(&task.parsing_config)
            .map_err(|e| Status::invalid_argument(format!("bad parsing config: {e}")))?;
        let aggregation_configs: BTreeMap<String, AggregationConfig> =
            serde_yaml::from_slice(&task.aggregation_configs)
                .map_err(|e| Status::invalid_argument(format!("bad aggregation configs: {e}")))?;

        let started = Instant::now();
        let blob = match self.fetch_from_target(&task, &parsing_config).await {
            Ok(blob) => blob,
            Err(status) => {
                error!(session = %task.id, error = %status, "Error while fetching data.");
                return Err(status);
            },
        };

        // One payload per aggregation section, keyed the way the aggregate
        // stage consumes them.
        let mut result = ParsingResult::default();
        for aggregation_config in aggregation_configs.values() {
            for section in aggregation_config.data.keys() {
                let key = format!("{};{}", task.host, section);
                debug!(session = %task.id, key = %key, "Write data with key.");
                result.data.insert(key, blob.clone());
            }
        }

        info!(
            session = %task.id,
            took = ?started.elapsed(),
            "Parsing completed."
        );
        Ok(Response::new(result))
    }

    async fn do_aggregating(
        &self,
        request: Request<AggregatingTask>,
    ) -> Result<Response<AggregatingResult>, Status> {
        let task = request.into_inner();
        info!(session = %task.id, config = %task.config, "Start aggregating.");

        let aggregation_config: AggregationConfig = serde_yaml::from_slice(&task.aggregation_config)
            .map_err(|e| Status::invalid_argument(format!("bad aggregation config: {e}")))?;
        let payloads = task.parsing_result.unwrap_or_default().data;

        let mut result = AggregatingResult::default();
        for section in aggregation_config.data.keys() {
            let mut folded = Vec::new();
            for host in &task.hosts {
                let key = format!("{host};{section}");
                if let Some(blob) = payloads.get(&key) {
                    folded.extend_from_slice(blob);
                }
            }
            result.data.insert(section.clone(), folded);
        }

        info!(session = %task.id, sections = result.data.len(), "Aggregating completed.");
        Ok(Response::new(result))
    }
}

#[cfg(test)]
mod tests {
    use combaine_rpc::TimeFrame;

    use super::*;

    fn aggregation_yaml() -> Vec<u8> {
        b"agg:\n  data:\n    timings:\n      type: average\n    codes:\n      type: quant\n".to_vec()
    }

    fn test_service() -> WorkerService {
        let cache = TtlCache::new(
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        WorkerService::new(Arc::new(FetcherRegistry::with_defaults().unwrap()), cache)
    }

    #[tokio::test]
    async fn do_parsing_rejects_malformed_config() {
        let service = test_service();
        let task = ParsingTask {
            id: "t".to_string(),
            frame: Some(TimeFrame {
                previous: 0,
                current: 60,
            }),
            host: "web-1".to_string(),
            parsing_config_name: "nginx".to_string(),
            parsing_config: b"{not yaml".to_vec(),
            aggregation_configs: aggregation_yaml(),
        };

        let status = service.do_parsing(Request::new(task)).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn do_aggregating_folds_per_section() {
        let service = test_service();

        let mut parsing_result = ParsingResult::default();
        parsing_result.data.insert("web-1;timings".to_string(), b"ab".to_vec());
        parsing_result.data.insert("web-2;timings".to_string(), b"cd".to_vec());
        parsing_result.data.insert("web-1;codes".to_string(), b"xy".to_vec());

        let task = AggregatingTask {
            id: "t".to_string(),
            frame: Some(TimeFrame {
                previous: 0,
                current: 60,
            }),
            config: "agg".to_string(),
            parsing_config_name: "nginx".to_string(),
            aggregation_config: b"data:\n  timings:\n    type: average\n  codes:\n    type: quant\n"
                .to_vec(),
            hosts: vec!["web-1".to_string(), "web-2".to_string()],
            parsing_result: Some(parsing_result),
        };

        let result = service
            .do_aggregating(Request::new(task))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(result.data["timings"], b"abcd".to_vec());
        assert_eq!(result.data["codes"], b"xy".to_vec());
    }
}
