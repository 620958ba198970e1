use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use combaine_rpc::sender_client::SenderClient;
use combaine_rpc::SenderRequest;
use parking_lot::RwLock;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

pub const CONNECT_TIMEOUT_LIMIT: Duration = Duration::from_secs(5);

/// A pool of sender gRPC channels which can be reused and multiplexed across
/// task runners.
#[derive(Clone, Default)]
pub struct SenderNetwork {
    clients: Arc<RwLock<HashMap<String, Channel>>>,
}

impl SenderNetwork {
    /// Attempts to get an already existing connection or creates a new lazy
    /// connection.
    pub fn get_or_connect(&self, endpoint: &str) -> Result<Channel, tonic::transport::Error> {
        {
            let guard = self.clients.read();
            if let Some(channel) = guard.get(endpoint) {
                return Ok(channel.clone());
            }
        }

        let uri = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("http://{endpoint}")
        };
        let channel = Endpoint::from_shared(uri)?
            .connect_timeout(CONNECT_TIMEOUT_LIMIT)
            .connect_lazy();

        debug!(endpoint = %endpoint, "Opened sender channel.");
        self.clients
            .write()
            .insert(endpoint.to_string(), channel.clone());
        Ok(channel)
    }

    /// Ships one request to the sender at `endpoint` within `deadline`.
    pub async fn send(
        &self,
        endpoint: &str,
        request: SenderRequest,
        deadline: Duration,
    ) -> Result<String, tonic::Status> {
        let channel = self
            .get_or_connect(endpoint)
            .map_err(|e| tonic::Status::unavailable(e.to_string()))?;
        let mut client = SenderClient::new(channel);

        let mut req = tonic::Request::new(request);
        req.set_timeout(deadline);

        let response = client.do_send(req).await?;
        Ok(response.into_inner().response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channels_are_pooled_per_endpoint() {
        let network = SenderNetwork::default();
        network.get_or_connect("[::1]:9003").unwrap();
        network.get_or_connect("[::1]:9003").unwrap();
        network.get_or_connect("[::1]:9004").unwrap();
        assert_eq!(network.clients.read().len(), 2);
    }
}
