use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use combaine_repository::{AggregationConfig, ParsingConfig, Repository};
use combaine_rpc::{
    AggregatingResult,
    AggregatingTask,
    ParsingResult,
    ParsingTask,
    SenderRequest,
    TimeFrame,
};
use combaine_worker::{
    resolve_targets,
    HostResolver,
    Worker,
    WorkerError,
    WorkerReply,
    METHOD_AGGREGATING,
    METHOD_PARSING,
};
use futures::future::join_all;
use prost::Message;
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::senders::SenderNetwork;
use crate::stats::ClientStats;

/// Upper bound on concurrent parse dispatches within one tick.
const PARSING_FANOUT: usize = 8;

/// Everything a task runner needs, injected once at cluster construction so
/// tests can supply fakes.
pub struct RunnerContext {
    pub repository: Repository,
    pub worker: Arc<dyn Worker>,
    pub resolver: Arc<dyn HostResolver>,
    pub senders: SenderNetwork,
    pub stats: Arc<ClientStats>,
    /// Process-wide shutdown; runners also stop on their own token.
    pub shutdown: CancellationToken,
}

/// Starts the per-config execution loop, bound to the assignment's
/// cancellation token.
pub fn spawn_task_runner(ctx: Arc<RunnerContext>, config_name: String, cancel: CancellationToken) {
    tokio::spawn(run(ctx, config_name, cancel));
}

async fn run(ctx: Arc<RunnerContext>, config_name: String, cancel: CancellationToken) {
    let parsing = match ctx.repository.read_parsing_config(&config_name) {
        Ok(parsing) => parsing,
        Err(error) => {
            error!(config = %config_name, error = %error, "Cannot read parsing config, task exits.");
            return;
        },
    };
    let aggregations = match ctx.repository.read_aggregation_configs(&config_name) {
        Ok(aggregations) => aggregations,
        Err(error) => {
            error!(config = %config_name, error = %error, "Cannot read aggregation configs, task exits.");
            return;
        },
    };

    let period = Duration::from_secs(parsing.iteration_interval.max(1));
    info!(config = %config_name, period = ?period, "Task runner started.");

    // First tick is aligned to the period so every owner of this config
    // covers the same time frames.
    let align = period.as_secs() - (unix_now() as u64 % period.as_secs());
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(align)) => {},
        _ = cancel.cancelled() => {
            info!(config = %config_name, "Task runner cancelled before first tick.");
            return;
        },
        _ = ctx.shutdown.cancelled() => return,
    }

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {},
            _ = cancel.cancelled() => break,
            _ = ctx.shutdown.cancelled() => break,
        }

        if let Err(error) = run_tick(&ctx, &config_name, &parsing, &aggregations, period, &cancel).await
        {
            // The next tick is the retry.
            warn!(config = %config_name, error = %error, "Tick failed.");
        }
    }
    info!(config = %config_name, "Task runner stopped.");
}

/// One parse -> aggregate -> send cycle.
async fn run_tick(
    ctx: &Arc<RunnerContext>,
    config_name: &str,
    parsing: &ParsingConfig,
    aggregations: &BTreeMap<String, AggregationConfig>,
    period: Duration,
    cancel: &CancellationToken,
) -> Result<(), serde_yaml::Error> {
    let current = unix_now();
    let frame = TimeFrame {
        previous: current - period.as_secs() as i64,
        current,
    };
    let id = format!("{config_name}-{current}");

    let targets = resolve_targets(&ctx.resolver, &id, &parsing.hosts, &parsing.groups).await;
    if targets.is_empty() {
        debug!(session = %id, "No targets to fetch from.");
        return Ok(());
    }

    let parsing_yaml = serde_yaml::to_string(parsing)?.into_bytes();
    let aggregations_yaml = serde_yaml::to_string(aggregations)?.into_bytes();

    // Parse phase: concurrent and unordered across targets, bounded fan-out,
    // one deadline per dispatch.
    let semaphore = Arc::new(Semaphore::new(PARSING_FANOUT));
    let dispatches = targets.iter().map(|host| {
        let semaphore = semaphore.clone();
        let task = ParsingTask {
            id: id.clone(),
            frame: Some(frame.clone()),
            host: host.clone(),
            parsing_config_name: config_name.to_string(),
            parsing_config: parsing_yaml.clone(),
            aggregation_configs: aggregations_yaml.clone(),
        };
        async move {
            if cancel.is_cancelled() {
                return (host.clone(), Err(WorkerError::Cancelled));
            }
            let _permit = semaphore.acquire().await;
            let reply = ctx.worker.enqueue(METHOD_PARSING, task.encode_to_vec());
            (host.clone(), reply.wait(period, cancel).await)
        }
    });

    let mut collected: HashMap<String, Vec<u8>> = HashMap::new();
    for (host, outcome) in join_all(dispatches).await {
        match outcome.and_then(|raw| WorkerReply::extract::<ParsingResult>(&raw)) {
            Ok(result) => {
                ctx.stats.add_success_parsing();
                collected.extend(result.data);
            },
            Err(WorkerError::DeadlineExceeded) => {
                ctx.stats.add_failed_parsing();
                warn!(session = %id, host = %host, "Parsing deadline exceeded.");
            },
            Err(error) => {
                ctx.stats.add_failed_parsing();
                warn!(session = %id, host = %host, error = %error, "Parsing failed.");
            },
        }
    }

    // Aggregate phase, per aggregation config; per-section failures are
    // isolated from one another.
    for (aggregation_name, aggregation) in aggregations {
        if cancel.is_cancelled() {
            break;
        }

        let task = AggregatingTask {
            id: id.clone(),
            frame: Some(frame.clone()),
            config: aggregation_name.clone(),
            parsing_config_name: config_name.to_string(),
            aggregation_config: serde_yaml::to_string(aggregation)?.into_bytes(),
            hosts: targets.clone(),
            parsing_result: Some(ParsingResult {
                data: collected.clone(),
            }),
        };
        let reply = ctx.worker.enqueue(METHOD_AGGREGATING, task.encode_to_vec());
        let result = match reply.wait(period, cancel).await {
            Ok(raw) => match WorkerReply::extract::<AggregatingResult>(&raw) {
                Ok(result) => {
                    ctx.stats.add_success_aggregate();
                    result
                },
                Err(error) => {
                    ctx.stats.add_failed_aggregate();
                    warn!(session = %id, config = %aggregation_name, error = %error, "Bad aggregate result.");
                    continue;
                },
            },
            Err(WorkerError::DeadlineExceeded) => {
                ctx.stats.add_failed_aggregate();
                warn!(session = %id, config = %aggregation_name, "Aggregating deadline exceeded.");
                continue;
            },
            Err(error) => {
                ctx.stats.add_failed_aggregate();
                warn!(session = %id, config = %aggregation_name, error = %error, "Aggregating failed.");
                continue;
            },
        };

        send_results(ctx, &id, aggregation, &result, period).await;
    }

    Ok(())
}

/// Forwards one aggregation result to every sender configured for it.
async fn send_results(
    ctx: &Arc<RunnerContext>,
    id: &str,
    aggregation: &AggregationConfig,
    result: &AggregatingResult,
    deadline: Duration,
) {
    for (sender_name, sender_cfg) in &aggregation.senders {
        let endpoint = match sender_cfg.0.get("endpoint").and_then(|v| v.as_str()) {
            Some(endpoint) => endpoint.to_string(),
            None => {
                warn!(session = %id, sender = %sender_name, "Sender has no endpoint, skipping.");
                continue;
            },
        };

        let config = match serde_yaml::to_string(sender_cfg) {
            Ok(config) => config.into_bytes(),
            Err(error) => {
                warn!(session = %id, sender = %sender_name, error = %error, "Cannot encode sender config.");
                continue;
            },
        };

        let request = SenderRequest {
            id: id.to_string(),
            config,
            data: result.data.clone(),
        };
        match ctx.senders.send(&endpoint, request, deadline).await {
            Ok(response) => {
                debug!(session = %id, sender = %sender_name, response = %response, "Sender accepted result.");
            },
            Err(status) => {
                warn!(session = %id, sender = %sender_name, error = %status, "Sender call failed.");
            },
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use combaine_worker::StaticHostResolver;

    use super::*;

    struct MockWorker {
        parse_calls: AtomicUsize,
        aggregate_calls: AtomicUsize,
        fail_parsing: bool,
    }

    impl MockWorker {
        fn new(fail_parsing: bool) -> Self {
            Self {
                parse_calls: AtomicUsize::new(0),
                aggregate_calls: AtomicUsize::new(0),
                fail_parsing,
            }
        }
    }

    impl Worker for MockWorker {
        fn enqueue(&self, method: &str, payload: Vec<u8>) -> WorkerReply {
            match method {
                METHOD_PARSING => {
                    self.parse_calls.fetch_add(1, Ordering::SeqCst);
                    if self.fail_parsing {
                        return WorkerReply::ready(Err(WorkerError::AppCall));
                    }
                    let task = ParsingTask::decode(payload.as_slice()).unwrap();
                    let mut result = ParsingResult::default();
                    result
                        .data
                        .insert(format!("{};timings", task.host), b"blob".to_vec());
                    WorkerReply::ready(Ok(result.encode_to_vec()))
                },
                METHOD_AGGREGATING => {
                    self.aggregate_calls.fetch_add(1, Ordering::SeqCst);
                    let task = AggregatingTask::decode(payload.as_slice()).unwrap();
                    let mut result = AggregatingResult::default();
                    let merged: usize = task
                        .parsing_result
                        .map(|r| r.data.len())
                        .unwrap_or_default();
                    result
                        .data
                        .insert("timings".to_string(), merged.to_string().into_bytes());
                    WorkerReply::ready(Ok(result.encode_to_vec()))
                },
                other => WorkerReply::ready(Err(WorkerError::UnknownMethod(other.to_string()))),
            }
        }
    }

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn seed_repository(dir: &Path) -> Repository {
        write(
            dir,
            "parsing/nginx.yaml",
            "hosts: [\"web-1\", \"web-2\"]\nagg_configs: [\"agg\"]\niteration_interval: 1\ndata_fetcher:\n  type: timetail\n  timetail_port: 3132\n",
        );
        write(dir, "aggregate/agg.yaml", "data:\n  timings:\n    type: average\n");
        Repository::open(dir).unwrap()
    }

    fn test_context(worker: Arc<MockWorker>, repository: Repository) -> Arc<RunnerContext> {
        Arc::new(RunnerContext {
            repository,
            worker,
            resolver: Arc::new(StaticHostResolver::default()),
            senders: SenderNetwork::default(),
            stats: Arc::new(ClientStats::default()),
            shutdown: CancellationToken::new(),
        })
    }

    #[tokio::test]
    async fn runner_executes_ticks_and_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let repository = seed_repository(dir.path());
        let worker = Arc::new(MockWorker::new(false));
        let ctx = test_context(worker.clone(), repository);

        let cancel = CancellationToken::new();
        spawn_task_runner(ctx.clone(), "nginx".to_string(), cancel.clone());

        // The aligned start can eat up to one full period before the first
        // tick, so allow a couple of periods.
        tokio::time::sleep(Duration::from_millis(2600)).await;
        let snapshot = ctx.stats.get_stats();
        assert!(snapshot.success_parsing >= 2, "expected both targets parsed");
        assert!(snapshot.success_aggregate >= 1);
        assert_eq!(snapshot.failed_parsing, 0);

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let after_cancel = worker.parse_calls.load(Ordering::SeqCst);

        // The runner must exit within one tick of cancellation.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(worker.parse_calls.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test]
    async fn parse_failures_increment_failed_counters_only() {
        let dir = tempfile::tempdir().unwrap();
        let repository = seed_repository(dir.path());
        let worker = Arc::new(MockWorker::new(true));
        let ctx = test_context(worker.clone(), repository);

        let cancel = CancellationToken::new();
        spawn_task_runner(ctx.clone(), "nginx".to_string(), cancel.clone());

        tokio::time::sleep(Duration::from_millis(2600)).await;
        cancel.cancel();

        let snapshot = ctx.stats.get_stats();
        assert_eq!(snapshot.success_parsing, 0);
        assert!(snapshot.failed_parsing >= 2);
        // Aggregation still ran over the (empty) collected data.
        assert!(snapshot.aggregate_total >= 1);
    }

    #[tokio::test]
    async fn missing_config_exits_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let repository = seed_repository(dir.path());
        let worker = Arc::new(MockWorker::new(false));
        let ctx = test_context(worker.clone(), repository);

        let cancel = CancellationToken::new();
        spawn_task_runner(ctx.clone(), "absent".to_string(), cancel.clone());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(worker.parse_calls.load(Ordering::SeqCst), 0);
    }
}
