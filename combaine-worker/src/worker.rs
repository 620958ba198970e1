use std::time::Duration;

use combaine_rpc::worker_client::WorkerClient;
use combaine_rpc::{AggregatingTask, ParsingTask};
use prost::Message;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

/// Method name for the parse stage.
pub const METHOD_PARSING: &str = "parsing";
/// Method name for the aggregate stage.
pub const METHOD_AGGREGATING: &str = "aggregating";

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker dropped the call without producing a reply.
    #[error("application call error")]
    AppCall,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("cancelled")]
    Cancelled,

    #[error("unknown worker method: {0}")]
    UnknownMethod(String),

    #[error("worker call failed: {0}")]
    Status(String),

    #[error("malformed worker payload: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Asynchronous result of an enqueued worker call.
pub struct WorkerReply {
    rx: oneshot::Receiver<Result<Vec<u8>, WorkerError>>,
}

impl WorkerReply {
    /// Pairs a reply with the sender the worker resolves it through.
    pub fn pending() -> (oneshot::Sender<Result<Vec<u8>, WorkerError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A reply that is already resolved; used by in-process workers and
    /// tests.
    pub fn ready(result: Result<Vec<u8>, WorkerError>) -> Self {
        let (tx, reply) = Self::pending();
        let _ = tx.send(result);
        reply
    }

    /// Awaits the reply, racing the deadline and the caller's cancellation.
    ///
    /// A dropped reply and an error reply are both failures.
    pub async fn wait(
        self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, WorkerError> {
        tokio::select! {
            result = self.rx => match result {
                Ok(inner) => inner,
                Err(_) => Err(WorkerError::AppCall),
            },
            _ = tokio::time::sleep(deadline) => Err(WorkerError::DeadlineExceeded),
            _ = cancel.cancelled() => Err(WorkerError::Cancelled),
        }
    }

    /// Decodes a raw reply into its typed message.
    pub fn extract<T: Message + Default>(data: &[u8]) -> Result<T, WorkerError> {
        Ok(T::decode(data)?)
    }
}

/// A parse/aggregate worker reachable by method name.
pub trait Worker: Send + Sync + 'static {
    /// Enqueues a call; the payload is the protobuf-encoded task for the
    /// method.
    fn enqueue(&self, method: &str, payload: Vec<u8>) -> WorkerReply;
}

/// The gRPC-backed worker used in production.
#[derive(Clone)]
pub struct GrpcWorker {
    client: WorkerClient<Channel>,
}

impl GrpcWorker {
    /// Connects lazily to the worker endpoint, e.g. `http://[::1]:9002`.
    pub fn connect(endpoint: &str) -> Result<Self, tonic::transport::Error> {
        let channel = tonic::transport::Endpoint::from_shared(endpoint.to_string())?
            .connect_timeout(Duration::from_secs(5))
            .connect_lazy();
        Ok(Self {
            client: WorkerClient::new(channel),
        })
    }
}

impl Worker for GrpcWorker {
    fn enqueue(&self, method: &str, payload: Vec<u8>) -> WorkerReply {
        let (tx, reply) = WorkerReply::pending();
        let mut client = self.client.clone();
        let method = method.to_string();

        tokio::spawn(async move {
            let result = match method.as_str() {
                METHOD_PARSING => match ParsingTask::decode(payload.as_slice()) {
                    Ok(task) => client
                        .do_parsing(task)
                        .await
                        .map(|resp| resp.into_inner().encode_to_vec())
                        .map_err(|status| WorkerError::Status(status.to_string())),
                    Err(err) => Err(WorkerError::Decode(err)),
                },
                METHOD_AGGREGATING => match AggregatingTask::decode(payload.as_slice()) {
                    Ok(task) => client
                        .do_aggregating(task)
                        .await
                        .map(|resp| resp.into_inner().encode_to_vec())
                        .map_err(|status| WorkerError::Status(status.to_string())),
                    Err(err) => Err(WorkerError::Decode(err)),
                },
                other => Err(WorkerError::UnknownMethod(other.to_string())),
            };
            let _ = tx.send(result);
        });

        reply
    }
}
