//! Beacon sources the bridge can mirror.
//!
//! A source hands out the chain's public parameters and a stream of new
//! rounds. Streams may end or fail at any time; the bridge reconnects.
//! Nothing a source returns is trusted: every round is validated before it
//! is published.

use crate::config::SourceConfig;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use relay_core::{ChainInfo, Round};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Stream of rounds from one connection to a source.
pub type RoundStream = BoxStream<'static, Result<Round, SourceError>>;

/// A lost or unusable connection to the beacon source. Never surfaced to
/// callers of the bridge; it only triggers backoff and reconnect.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("Malformed {what} from source: {reason}")]
    Decode { what: &'static str, reason: String },

    #[error("Cannot load certificate {}: {reason}", .path.display())]
    Tls { path: PathBuf, reason: String },

    #[error("Source stream closed")]
    Closed,
}

#[async_trait]
pub trait BeaconSource: Send + Sync {
    /// Public parameters of `chain_id`, including the group key.
    async fn chain_info(&self, chain_id: &str) -> Result<ChainInfo, SourceError>;

    /// Open a stream of rounds for `chain_id`, starting with the current one.
    async fn watch(&self, chain_id: &str) -> Result<RoundStream, SourceError>;
}

/// Source speaking the public beacon HTTP API:
/// `GET /{chain}/info` and `GET /{chain}/public/latest`.
///
/// The API has no push endpoint, so `watch` polls `latest` and yields each
/// round number the first time it is seen.
#[derive(Clone, Debug)]
pub struct HttpSource {
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

impl HttpSource {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_millis(config.request_timeout_ms));

        if let Some(path) = &config.cert_path {
            let tls_err = |reason: String| SourceError::Tls {
                path: path.clone(),
                reason,
            };
            let pem = std::fs::read(path).map_err(|e| tls_err(e.to_string()))?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| tls_err(e.to_string()))?;
            builder = builder.add_root_certificate(cert);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: base_url(&config.address, config.insecure),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        client: &reqwest::Client,
        url: String,
        what: &'static str,
    ) -> Result<T, SourceError> {
        trace!(%url, "polling source");
        let response = client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| SourceError::Decode {
            what,
            reason: e.to_string(),
        })
    }
}

/// `insecure` picks plain HTTP. An address that already names a scheme is kept.
fn base_url(address: &str, insecure: bool) -> String {
    let address = address.trim_end_matches('/');
    if address.contains("://") {
        return address.to_string();
    }
    let scheme = if insecure { "http" } else { "https" };
    format!("{}://{}", scheme, address)
}

struct Poller {
    client: reqwest::Client,
    url: String,
    interval: Duration,
    last_seen: Option<u64>,
    first: bool,
    failed: bool,
}

#[async_trait]
impl BeaconSource for HttpSource {
    async fn chain_info(&self, chain_id: &str) -> Result<ChainInfo, SourceError> {
        let url = format!("{}/{}/info", self.base_url, chain_id);
        Self::get_json(&self.client, url, "chain info").await
    }

    async fn watch(&self, chain_id: &str) -> Result<RoundStream, SourceError> {
        let poller = Poller {
            client: self.client.clone(),
            url: format!("{}/{}/public/latest", self.base_url, chain_id),
            interval: self.poll_interval,
            last_seen: None,
            first: true,
            failed: false,
        };

        let rounds = stream::unfold(poller, |mut poller| async move {
            if poller.failed {
                return None;
            }
            loop {
                if !poller.first {
                    tokio::time::sleep(poller.interval).await;
                }
                poller.first = false;

                let round: Round =
                    match Self::get_json(&poller.client, poller.url.clone(), "round").await {
                        Ok(round) => round,
                        Err(e) => {
                            poller.failed = true;
                            return Some((Err(e), poller));
                        }
                    };
                if poller.last_seen.map_or(true, |seen| round.round > seen) {
                    poller.last_seen = Some(round.round);
                    return Some((Ok(round), poller));
                }
                debug!(round = round.round, "no new round yet");
            }
        });
        Ok(Box::pin(rounds))
    }
}
