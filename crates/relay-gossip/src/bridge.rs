//! The relay bridge: mirrors a beacon source onto the chain's gossip topic.
//!
//! ```text
//! Connecting ──> Streaming ──> ErrorBackoff ──> Connecting ...
//!      │             │              │
//!      └─────────────┴──────────────┴──> ShuttingDown ──> Stopped
//! ```
//!
//! Only the last published round number survives a reconnect. A round is
//! published at most once per round number; a publish failure is treated
//! like a broken source stream, so the round is retried after reconnecting.

use crate::backoff::Backoff;
use crate::config::GossipRelayConfig;
use crate::error::{Error, Result};
use crate::source::{BeaconSource, HttpSource, SourceError};
use futures::StreamExt;
use parking_lot::RwLock;
use relay_core::{BlsVerifier, RejectReason, Round, RoundValidator};
use relay_p2p::{
    construct_host, load_or_create_identity, topic_name, Datastore, Host, Multiaddr, PeerId,
    Topic, TransportError,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where the bridge's loop currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeState {
    Connecting,
    Streaming,
    ErrorBackoff,
    ShuttingDown,
    Stopped,
}

/// Why one connection to the source ended.
#[derive(Debug, Error)]
enum StreamError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("source served an unusable chain key: {0}")]
    ChainKey(#[from] RejectReason),

    #[error("publish failed: {0}")]
    Publish(#[from] TransportError),

    #[error("source stream ended")]
    Ended,
}

/// A running bridge node: its own libp2p host plus the source loop.
pub struct GossipRelayNode {
    chain_id: String,
    topic_name: String,
    host: Host,
    state: Arc<RwLock<BridgeState>>,
    last_published: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
    /// Held for the whole of `shutdown`, so concurrent callers all return
    /// after the bridge has stopped.
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GossipRelayNode {
    /// Start a bridge reading from the HTTP source named in `config`.
    pub async fn new(config: GossipRelayConfig) -> Result<Self> {
        config.validate()?;
        let source = HttpSource::new(&config.source).map_err(|e| Error::Config(e.to_string()))?;
        Self::with_source(config, Arc::new(source)).await
    }

    /// Start a bridge reading from `source`.
    pub async fn with_source(
        config: GossipRelayConfig,
        source: Arc<dyn BeaconSource>,
    ) -> Result<Self> {
        config.validate()?;
        let bootstrap_peers = config.bootstrap_peers()?;

        let keypair = load_or_create_identity(&config.identity_path())?;
        let datastore = Datastore::open(&config.data_dir)?;
        let (host, pubsub) = construct_host(
            datastore,
            keypair,
            &config.listen_addr,
            &bootstrap_peers,
            &config.transport,
        )
        .await?;

        let topic_name = topic_name(&config.chain_id);
        let topic = match pubsub.join(&topic_name).await {
            Ok(topic) => topic,
            Err(e) => {
                host.shutdown().await;
                return Err(e.into());
            }
        };

        let state = Arc::new(RwLock::new(BridgeState::Connecting));
        let last_published = Arc::new(AtomicU64::new(0));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let relay = SourceLoop {
            chain_id: config.chain_id.clone(),
            source,
            topic,
            backoff: Backoff::new(config.backoff.clone()),
            state: state.clone(),
            last_published: last_published.clone(),
        };
        let task = tokio::spawn(relay.run(shutdown_rx));

        info!(
            chain = %config.chain_id,
            topic = %topic_name,
            peer_id = %host.peer_id(),
            "relay bridge started"
        );

        Ok(Self {
            chain_id: config.chain_id,
            topic_name,
            host,
            state,
            last_published,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn peer_id(&self) -> PeerId {
        self.host.peer_id()
    }

    /// Addresses other relay nodes and clients can dial, including `/p2p/<peer id>`.
    pub fn multiaddrs(&self) -> Vec<Multiaddr> {
        self.host.multiaddrs()
    }

    pub fn state(&self) -> BridgeState {
        *self.state.read()
    }

    /// Highest round published so far.
    pub fn last_published(&self) -> Option<u64> {
        match self.last_published.load(Ordering::Acquire) {
            0 => None,
            round => Some(round),
        }
    }

    /// Stop the source loop, leave the topic and close the host.
    ///
    /// Nothing is published once this returns. Later calls are no-ops.
    pub async fn shutdown(&self) {
        let mut slot = self.task.lock().await;
        let Some(task) = slot.take() else {
            return;
        };
        *self.state.write() = BridgeState::ShuttingDown;
        let _ = self.shutdown.send(true);
        if let Err(e) = task.await {
            warn!(chain = %self.chain_id, error = %e, "bridge loop ended abnormally");
        }
        // Host shutdown drains the command queue, so any publish the loop
        // issued before stopping is settled here.
        self.host.shutdown().await;
        *self.state.write() = BridgeState::Stopped;
        info!(chain = %self.chain_id, "relay bridge stopped");
    }
}

impl Drop for GossipRelayNode {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

struct SourceLoop {
    chain_id: String,
    source: Arc<dyn BeaconSource>,
    topic: Topic,
    backoff: Backoff,
    state: Arc<RwLock<BridgeState>>,
    last_published: Arc<AtomicU64>,
}

impl SourceLoop {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(BridgeState::Connecting);

            let fault = tokio::select! {
                _ = shutdown.changed() => break,
                fault = self.stream_once() => fault,
            };

            self.set_state(BridgeState::ErrorBackoff);
            let delay = self.backoff.next_delay();
            warn!(
                chain = %self.chain_id,
                error = %fault,
                attempt = self.backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "source stream interrupted, reconnecting"
            );

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(chain = %self.chain_id, "source loop exiting");
        // Dropping the topic handle here leaves the topic.
    }

    fn set_state(&self, state: BridgeState) {
        let mut current = self.state.write();
        // Shutdown wins over anything the loop reports afterwards.
        if !matches!(*current, BridgeState::ShuttingDown | BridgeState::Stopped) {
            *current = state;
        }
    }

    /// Consume one connection to the source. Always ends in a `StreamError`.
    async fn stream_once(&mut self) -> StreamError {
        match self.stream_rounds().await {
            Ok(()) => StreamError::Ended,
            Err(e) => e,
        }
    }

    async fn stream_rounds(&mut self) -> std::result::Result<(), StreamError> {
        let info = self.source.chain_info(&self.chain_id).await?;
        let verifier = Arc::new(BlsVerifier::from_chain_info(&info)?);

        let mut validator = RoundValidator::new(self.chain_id.clone(), verifier);
        validator.record(self.last_published.load(Ordering::Acquire));

        // Relayed gossip is checked for authenticity only; ordering is each
        // receiver's business.
        let gossip_check = validator.clone();
        self.topic.set_validator(Arc::new(move |data: &[u8]| {
            Round::from_bytes(data)
                .map(|round| gossip_check.check_authentic(&round).is_ok())
                .unwrap_or(false)
        }))?;

        let mut rounds = self.source.watch(&self.chain_id).await?;
        self.set_state(BridgeState::Streaming);
        info!(chain = %self.chain_id, period = info.period, "streaming rounds from source");

        while let Some(next) = rounds.next().await {
            let round = next?;
            if let Err(reason) = validator.check(&round) {
                match reason {
                    RejectReason::NotNewer { .. } => {
                        debug!(round = round.round, %reason, "skipping round from source");
                    }
                    _ => {
                        warn!(round = round.round, %reason, "dropping invalid round from source");
                    }
                }
                continue;
            }

            self.topic.publish(round.to_bytes()).await?;
            validator.record(round.round);
            self.last_published.store(round.round, Ordering::Release);
            self.backoff.reset();
            info!(round = round.round, topic = %self.topic.name(), "published round");
        }
        Ok(())
    }
}
