use async_trait::async_trait;
use combaine_repository::PluginConfig;
use serde::Deserialize;
use tracing::info;

use super::{FetchError, Fetcher, FetcherTask};

#[derive(Debug, Deserialize)]
struct TimetailOptions {
    #[serde(default)]
    timetail_port: u16,
    #[serde(default)]
    timetail_url: String,
    #[serde(default)]
    logname: String,
}

/// Fetches a slice of a remote log through the timetail HTTP service.
#[derive(Debug)]
pub struct TimetailFetcher {
    port: u16,
    url: String,
    logname: String,
    client: reqwest::Client,
}

pub(super) fn new_timetail_fetcher(cfg: &PluginConfig) -> Result<Box<dyn Fetcher>, FetchError> {
    let options: TimetailOptions = cfg.decode()?;
    if options.timetail_port == 0 {
        return Err(FetchError::MissingOption {
            fetcher: "timetail",
            option: "timetail_port",
        });
    }
    Ok(Box::new(TimetailFetcher {
        port: options.timetail_port,
        url: options.timetail_url,
        logname: options.logname,
        client: reqwest::Client::new(),
    }))
}

impl TimetailFetcher {
    fn request_url(&self, task: &FetcherTask) -> String {
        format!(
            "http://{}:{}{}{}&time={}",
            task.target, self.port, self.url, self.logname, task.period
        )
    }
}

#[async_trait]
impl Fetcher for TimetailFetcher {
    async fn fetch(&self, task: &FetcherTask) -> Result<Vec<u8>, FetchError> {
        let url = self.request_url(task);
        info!(session = %task.id, url = %url, "timetail: requesting URL.");

        let resp = self.client.get(&url).send().await?;
        info!(session = %task.id, url = %url, status = %resp.status(), "timetail: result.");

        let body = resp.error_for_status()?.bytes().await?;
        Ok(body.to_vec())
    }
}
