//! Shared fixtures for the relay integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use relay_core::{ChainInfo, Round};
use relay_gossip::{
    BackoffConfig, BeaconSource, GossipRelayConfig, RoundStream, SourceConfig, SourceError,
};
use relay_p2p::{construct_host, load_or_create_identity, Datastore, Host, Multiaddr, PubSub, TransportConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub const LOCALHOST: &str = "/ip4/127.0.0.1/tcp/0";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scripted beacon source.
///
/// Every connection replays the script, then streams rounds pushed with
/// `push`. The stream never ends on its own.
pub struct MockSource {
    info: ChainInfo,
    script: Vec<Round>,
    live: broadcast::Sender<Round>,
    connections: AtomicUsize,
    info_calls: AtomicUsize,
    info_failures: AtomicUsize,
    fail_first_after: Option<usize>,
}

impl MockSource {
    pub fn new(info: ChainInfo, script: Vec<Round>) -> Self {
        let (live, _) = broadcast::channel(64);
        Self {
            info,
            script,
            live,
            connections: AtomicUsize::new(0),
            info_calls: AtomicUsize::new(0),
            info_failures: AtomicUsize::new(0),
            fail_first_after: None,
        }
    }

    /// Fail the first `n` chain info requests.
    pub fn failing_chain_info(self, n: usize) -> Self {
        self.info_failures.store(n, Ordering::SeqCst);
        self
    }

    /// The first connection breaks after emitting `n` scripted rounds.
    pub fn failing_first_connection_after(mut self, n: usize) -> Self {
        self.fail_first_after = Some(n);
        self
    }

    pub fn push(&self, round: Round) {
        let _ = self.live.send(round);
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn info_calls(&self) -> usize {
        self.info_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BeaconSource for MockSource {
    async fn chain_info(&self, _chain_id: &str) -> Result<ChainInfo, SourceError> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .info_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SourceError::Status {
                url: "mock://info".into(),
                status: 503,
            });
        }
        Ok(self.info.clone())
    }

    async fn watch(&self, _chain_id: &str) -> Result<RoundStream, SourceError> {
        let connection = self.connections.fetch_add(1, Ordering::SeqCst);

        if connection == 0 {
            if let Some(n) = self.fail_first_after {
                let rounds: Vec<_> = self.script.iter().take(n).cloned().map(Ok).collect();
                let broken = stream::iter(rounds).chain(stream::once(async { Err(SourceError::Closed) }));
                return Ok(broken.boxed());
            }
        }

        let live = self.live.subscribe();
        let live = stream::unfold(live, |mut live| async move {
            loop {
                match live.recv().await {
                    Ok(round) => return Some((Ok(round), live)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        let scripted = stream::iter(self.script.clone().into_iter().map(Ok));
        Ok(scripted.chain(live).boxed())
    }
}

pub fn transport_config() -> TransportConfig {
    TransportConfig {
        heartbeat_interval_ms: 100,
        bootstrap_timeout_ms: 5_000,
        ..TransportConfig::default()
    }
}

pub fn bridge_config(dir: &tempfile::TempDir, chain_id: &str) -> GossipRelayConfig {
    let mut config = GossipRelayConfig::new(chain_id, dir.path(), SourceConfig::new("mock"));
    config.listen_addr = LOCALHOST.to_string();
    config.backoff = BackoffConfig {
        initial_delay_ms: 50,
        max_delay_ms: 200,
        multiplier: 2.0,
        jitter: 0.1,
    };
    config.transport = transport_config();
    config
}

/// A plain host for a client, bootstrapped to `peers`.
pub async fn peer_host(dir: &tempfile::TempDir, peers: &[Multiaddr]) -> (Host, PubSub) {
    let keypair = load_or_create_identity(&dir.path().join("identity.key")).unwrap();
    let store = Datastore::open(dir.path()).unwrap();
    construct_host(store, keypair, LOCALHOST, peers, &transport_config())
        .await
        .unwrap()
}

/// Next round number on a watcher channel, failing the test after a while.
pub async fn next_round(rounds: &mut mpsc::Receiver<Round>) -> u64 {
    tokio::time::timeout(Duration::from_secs(15), rounds.recv())
        .await
        .expect("timed out waiting for a round")
        .expect("watcher channel closed")
        .round
}

/// Assert nothing arrives on the channel for `ms` milliseconds.
pub async fn assert_quiet(rounds: &mut mpsc::Receiver<Round>, ms: u64) {
    if let Ok(Some(round)) = tokio::time::timeout(Duration::from_millis(ms), rounds.recv()).await {
        panic!("unexpected round {}", round.round);
    }
}

/// Publish `data`, retrying until the topic has a peer to send to.
pub async fn publish_when_meshed(topic: &relay_p2p::Topic, data: Vec<u8>) {
    for _ in 0..100 {
        if topic.publish(data.clone()).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("topic {} never reached a peer", topic.name());
}
