//! Host construction for the relay.
//!
//! Relay nodes run on servers, so the transport is plain TCP secured with
//! Noise and multiplexed with Yamux. Every connection is encrypted; the
//! relay does not offer a plaintext libp2p transport.

use crate::behaviour::{create_gossipsub_config, RelayBehaviour};
use crate::datastore::Datastore;
use crate::driver::Driver;
use crate::error::TransportError;
use crate::pubsub::{Command, PubSub};
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::{noise, tcp, yamux, Multiaddr, PeerId, SwarmBuilder};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

/// Configuration for the P2P transport layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
    /// GossipSub heartbeat in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Largest gossip message accepted or sent, in bytes.
    pub max_transmit_size: usize,

    /// Messages buffered per subscription before new ones are dropped.
    pub subscription_buffer: usize,

    /// How long to wait for the listener to bind, in milliseconds.
    pub listen_timeout_ms: u64,

    /// How long to wait for a bootstrap peer to connect, in milliseconds.
    pub bootstrap_timeout_ms: u64,

    /// Close connections idle for this long, in milliseconds.
    pub idle_connection_timeout_ms: u64,

    /// How often to redial bootstrap peers while no peer is connected, in milliseconds.
    pub redial_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1_000,
            max_transmit_size: 64 * 1024,
            subscription_buffer: 256,
            listen_timeout_ms: 5_000,
            bootstrap_timeout_ms: 10_000,
            idle_connection_timeout_ms: 60_000,
            redial_interval_ms: 30_000,
        }
    }
}

impl TransportConfig {
    /// Reject values that would make the host unusable.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval_ms == 0 {
            return Err("heartbeat_interval_ms must be positive".into());
        }
        if self.max_transmit_size == 0 {
            return Err("max_transmit_size must be positive".into());
        }
        if self.subscription_buffer == 0 {
            return Err("subscription_buffer must be positive".into());
        }
        if self.redial_interval_ms == 0 {
            return Err("redial_interval_ms must be positive".into());
        }
        Ok(())
    }
}

/// Parse a multiaddress, naming the offending input on failure.
pub fn parse_multiaddr(addr: &str) -> Result<Multiaddr, TransportError> {
    addr.parse().map_err(|e: libp2p::multiaddr::Error| TransportError::InvalidAddress {
        addr: addr.to_string(),
        reason: e.to_string(),
    })
}

/// Build a libp2p host bound to `listen_addr`, dial `bootstrap_peers`, and
/// return the host with its pub/sub capability.
///
/// Fails if the listen address is unusable, or if bootstrap peers were given
/// and none of them could be reached.
pub async fn construct_host(
    datastore: Datastore,
    keypair: Keypair,
    listen_addr: &str,
    bootstrap_peers: &[Multiaddr],
    config: &TransportConfig,
) -> Result<(Host, PubSub), TransportError> {
    let listen_addr = parse_multiaddr(listen_addr)?;
    let gossipsub_config = create_gossipsub_config(config)?;
    let peer_id = keypair.public().to_peer_id();
    let idle_timeout = Duration::from_millis(config.idle_connection_timeout_ms);

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| TransportError::Build(e.to_string()))?
        .with_behaviour(|key| RelayBehaviour::new(key, gossipsub_config))
        .map_err(|e| TransportError::Build(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(idle_timeout))
        .build();

    let listen_addrs = Arc::new(RwLock::new(Vec::new()));
    let (commands, command_rx) = mpsc::unbounded_channel();

    let mut driver = Driver::new(
        swarm,
        command_rx,
        datastore,
        listen_addrs.clone(),
        Duration::from_millis(config.redial_interval_ms),
    );
    driver
        .listen(listen_addr, Duration::from_millis(config.listen_timeout_ms))
        .await?;
    driver
        .bootstrap(
            bootstrap_peers,
            Duration::from_millis(config.bootstrap_timeout_ms),
        )
        .await?;

    let task = tokio::spawn(driver.run());
    info!(%peer_id, "relay host started");

    let host = Host {
        peer_id,
        listen_addrs,
        commands: commands.clone(),
        task: Mutex::new(Some(task)),
    };
    let pubsub = PubSub::new(commands, config.subscription_buffer);
    Ok((host, pubsub))
}

/// A running libp2p host. Owns the swarm task; read-only after construction.
pub struct Host {
    peer_id: PeerId,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    commands: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Host {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Bound listen addresses, without the peer id.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs.read().clone()
    }

    /// Dialable addresses of this host: listen addresses with `/p2p/<peer id>`.
    pub fn multiaddrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs
            .read()
            .iter()
            .map(|addr| addr.clone().with(Protocol::P2p(self.peer_id)))
            .collect()
    }

    /// Whether `shutdown` has already run.
    pub fn is_shut_down(&self) -> bool {
        self.task.lock().is_none()
    }

    /// Stop the swarm task, closing every connection and subscription.
    /// Safe to call repeatedly; later calls return immediately.
    pub async fn shutdown(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
        let _ = task.await;
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        if self.task.lock().is_some() {
            let (reply, _) = oneshot::channel();
            let _ = self.commands.send(Command::Shutdown { reply });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::load_or_create_identity;

    const LOCALHOST: &str = "/ip4/127.0.0.1/tcp/0";

    /// Driver logs show up with `RUST_LOG=relay_p2p=debug`.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn test_config() -> TransportConfig {
        TransportConfig {
            heartbeat_interval_ms: 100,
            bootstrap_timeout_ms: 3_000,
            ..TransportConfig::default()
        }
    }

    async fn spawn_host(
        dir: &tempfile::TempDir,
        name: &str,
        peers: &[Multiaddr],
    ) -> Result<(Host, PubSub), TransportError> {
        let keypair = load_or_create_identity(&dir.path().join(format!("{}.key", name))).unwrap();
        let store = Datastore::open(dir.path().join(name)).unwrap();
        construct_host(store, keypair, LOCALHOST, peers, &test_config()).await
    }

    #[test]
    fn test_parse_multiaddr() {
        assert!(parse_multiaddr(LOCALHOST).is_ok());
        assert!(matches!(
            parse_multiaddr("127.0.0.1:4444"),
            Err(TransportError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_config_validation() {
        assert!(TransportConfig::default().validate().is_ok());
        let bad = TransportConfig {
            subscription_buffer: 0,
            ..TransportConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_host_advertises_dialable_addrs() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let (host, _pubsub) = spawn_host(&dir, "a", &[]).await.unwrap();

        let addrs = host.multiaddrs();
        assert!(!addrs.is_empty());
        let expected = Protocol::P2p(host.peer_id());
        assert!(addrs.iter().all(|a| a.iter().last() == Some(expected.clone())));
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_listen_address() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let keypair = load_or_create_identity(&dir.path().join("k")).unwrap();
        let store = Datastore::open(dir.path().join("d")).unwrap();
        let result = construct_host(store, keypair, "not-an-addr", &[], &test_config()).await;
        assert!(matches!(result, Err(TransportError::InvalidAddress { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_bootstrap_fails() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        // Bind then drop a host so its port is closed.
        let (dead, _) = spawn_host(&dir, "dead", &[]).await.unwrap();
        let dead_addrs = dead.multiaddrs();
        dead.shutdown().await;
        drop(dead);

        let result = spawn_host(&dir, "b", &dead_addrs).await;
        assert!(matches!(
            result,
            Err(TransportError::BootstrapUnreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_bootstrap_connects_and_persists_peer() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let (a, _) = spawn_host(&dir, "a", &[]).await.unwrap();
        let (b, pubsub_b) = spawn_host(&dir, "b", &a.multiaddrs()).await.unwrap();

        assert!(pubsub_b.connected_peers().await.contains(&a.peer_id()));

        b.shutdown().await;
        let cached = Datastore::open(dir.path().join("b")).unwrap().known_peers();
        assert!(!cached.is_empty());
        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let (host, pubsub) = spawn_host(&dir, "a", &[]).await.unwrap();
        host.shutdown().await;
        host.shutdown().await;
        assert!(host.is_shut_down());
        assert!(matches!(
            pubsub.join("/beacon-relay/pubsub/v0.0.0/test").await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_ends_open_subscriptions() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let (host, pubsub) = spawn_host(&dir, "a", &[]).await.unwrap();
        let topic = pubsub.join("/beacon-relay/pubsub/v0.0.0/test").await.unwrap();
        let mut subscription = topic.subscribe().unwrap();

        host.shutdown().await;
        assert!(subscription.next().await.is_none());
        assert!(matches!(topic.subscribe(), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let (host, pubsub) = spawn_host(&dir, "a", &[]).await.unwrap();
        let first = pubsub.join("t").await.unwrap();
        let second = pubsub.join("t").await.unwrap();
        assert_eq!(first.name(), second.name());
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_and_subscribe_between_hosts() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let (a, pubsub_a) = spawn_host(&dir, "a", &[]).await.unwrap();
        let (b, pubsub_b) = spawn_host(&dir, "b", &a.multiaddrs()).await.unwrap();

        let topic_b = pubsub_b.join("rounds").await.unwrap();
        let mut sub = topic_b.subscribe().unwrap();
        let topic_a = pubsub_a.join("rounds").await.unwrap();

        // Publishing fails until the subscription has propagated.
        let mut published = false;
        for _ in 0..50 {
            if topic_a.publish(b"hello".to_vec()).await.is_ok() {
                published = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(published);

        let msg = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.data, b"hello");
        assert_eq!(msg.source_peer, Some(a.peer_id()));

        b.shutdown().await;
        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_topic_validator_rejects() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let (a, pubsub_a) = spawn_host(&dir, "a", &[]).await.unwrap();
        let (b, pubsub_b) = spawn_host(&dir, "b", &a.multiaddrs()).await.unwrap();

        let topic_b = pubsub_b.join("rounds").await.unwrap();
        topic_b
            .set_validator(Arc::new(|data: &[u8]| data != b"bad"))
            .unwrap();
        let mut sub = topic_b.subscribe().unwrap();
        let topic_a = pubsub_a.join("rounds").await.unwrap();

        let mut published = false;
        for _ in 0..50 {
            if topic_a.publish(b"bad".to_vec()).await.is_ok() {
                published = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(published);
        topic_a.publish(b"good".to_vec()).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.data, b"good");

        b.shutdown().await;
        a.shutdown().await;
    }
}
