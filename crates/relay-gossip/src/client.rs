//! The relay client: turns the chain's gossip topic into per-caller streams
//! of validated rounds.
//!
//! One read loop per client serves every watcher. Each watcher gets its own
//! bounded channel; when a watcher falls behind and its buffer is full, new
//! rounds are dropped for that watcher only. The read loop never waits on a
//! consumer.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use relay_core::{BlsVerifier, ChainInfo, RejectReason, Round, RoundValidator, RoundVerifier};
use relay_p2p::{topic_name, GossipStats, PubSub, Subscription, TransportError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Subscribes to a chain's topic and delivers accepted rounds to watchers.
///
/// Cheap to clone; clones share the subscription and the watchers.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    topic_name: String,
    pubsub: PubSub,
    registry: Mutex<Registry>,
    reader: tokio::sync::Mutex<Option<Reader>>,
    shutdown: watch::Sender<bool>,
}

/// State shared between `watch` and the read loop.
struct Registry {
    watchers: HashMap<u64, Watcher>,
    next_id: u64,
    validator: RoundValidator,
    stats: GossipStats,
}

struct Watcher {
    sender: mpsc::Sender<Round>,
    /// Dropped when the watcher leaves the registry; ends its cancel task.
    _evicted: oneshot::Sender<()>,
}

struct Reader {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Reader {
    async fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.task.await;
    }
}

impl Client {
    /// Client for `chain_id` on an existing pub/sub handle. Rounds are checked
    /// against `verifier`.
    pub fn new_with_pubsub(
        pubsub: PubSub,
        chain_id: &str,
        verifier: Arc<dyn RoundVerifier>,
    ) -> Result<Self> {
        Self::with_config(pubsub, ClientConfig::new(chain_id), verifier)
    }

    /// Client verifying rounds with the group key in `info`.
    pub fn from_chain_info(pubsub: PubSub, info: &ChainInfo) -> Result<Self> {
        let verifier =
            BlsVerifier::from_chain_info(info).map_err(|e| Error::Config(e.to_string()))?;
        Self::new_with_pubsub(pubsub, &info.hash, Arc::new(verifier))
    }

    pub fn with_config(
        pubsub: PubSub,
        config: ClientConfig,
        verifier: Arc<dyn RoundVerifier>,
    ) -> Result<Self> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        let registry = Registry {
            watchers: HashMap::new(),
            next_id: 0,
            validator: RoundValidator::new(config.chain_id.clone(), verifier),
            stats: GossipStats::default(),
        };
        Ok(Self {
            inner: Arc::new(Inner {
                topic_name: topic_name(&config.chain_id),
                config,
                pubsub,
                registry: Mutex::new(registry),
                reader: tokio::sync::Mutex::new(None),
                shutdown,
            }),
        })
    }

    pub fn chain_id(&self) -> &str {
        &self.inner.config.chain_id
    }

    /// Highest round accepted so far, zero if none.
    pub fn last_accepted(&self) -> u64 {
        self.inner.registry.lock().validator.last_accepted()
    }

    pub fn stats(&self) -> GossipStats {
        self.inner.registry.lock().stats.clone()
    }

    /// Number of active watchers.
    pub fn watchers(&self) -> usize {
        self.inner.registry.lock().watchers.len()
    }

    /// Start watching for rounds.
    ///
    /// The returned channel yields accepted rounds in strictly increasing
    /// order until `ctx` completes or the client shuts down, then closes.
    /// Any future works as `ctx`; a `oneshot::Receiver` cancels when its
    /// sender fires or is dropped.
    pub async fn watch<C>(&self, ctx: C) -> Result<mpsc::Receiver<Round>>
    where
        C: Future + Send + 'static,
    {
        let mut reader = self.inner.reader.lock().await;
        if *self.inner.shutdown.borrow() {
            return Err(TransportError::Closed.into());
        }

        let (sender, receiver) = mpsc::channel(self.inner.config.watch_buffer);
        let (evict, evicted) = oneshot::channel();
        // Register before subscribing so the first round cannot slip past.
        let id = self.inner.register(Watcher {
            sender: sender.clone(),
            _evicted: evict,
        });

        let running = reader.as_ref().is_some_and(|r| !r.task.is_finished());
        if !running {
            match self.inner.subscribe().await {
                Ok(subscription) => {
                    *reader = Some(Inner::spawn_reader(self.inner.clone(), subscription));
                }
                Err(e) => {
                    self.inner.registry.lock().watchers.remove(&id);
                    return Err(e);
                }
            }
        }
        drop(reader);

        let inner = self.inner.clone();
        let cancelled = async move {
            ctx.await;
        };
        tokio::spawn(async move {
            // A dropped receiver counts as cancellation. Eviction (shutdown or
            // a closed subscription) needs no unregister.
            tokio::select! {
                biased;
                _ = cancelled => {}
                _ = sender.closed() => {}
                _ = evicted => return,
            }
            drop(sender);
            inner.unregister(id).await;
        });

        debug!(watcher = id, topic = %self.inner.topic_name, "watcher registered");
        Ok(receiver)
    }

    /// Stop the read loop, release the subscription and close every watcher's
    /// channel. The pub/sub handle itself stays usable. Later calls are no-ops.
    pub async fn shutdown(&self) {
        let mut reader = self.inner.reader.lock().await;
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        if let Some(reader) = reader.take() {
            reader.stop().await;
        }
        let stats = {
            let mut registry = self.inner.registry.lock();
            registry.watchers.clear();
            registry.stats.clone()
        };
        info!(topic = %self.inner.topic_name, "client stopped. {}", stats.summary());
    }
}

impl Inner {
    fn register(&self, watcher: Watcher) -> u64 {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.watchers.insert(id, watcher);
        id
    }

    /// Drop a watcher; the last one out releases the subscription.
    async fn unregister(&self, id: u64) {
        let mut reader = self.reader.lock().await;
        let remaining = {
            let mut registry = self.registry.lock();
            registry.watchers.remove(&id);
            registry.watchers.len()
        };
        debug!(watcher = id, remaining, "watcher cancelled");
        if remaining == 0 {
            if let Some(reader) = reader.take() {
                reader.stop().await;
                info!(topic = %self.topic_name, "last watcher gone, left topic");
            }
        }
    }

    async fn subscribe(&self) -> Result<Subscription> {
        let topic = self.pubsub.join(&self.topic_name).await?;

        // Forged or malformed rounds are rejected at the gossip layer, so this
        // host never forwards them to its mesh.
        let checker = self.registry.lock().validator.clone();
        topic.set_validator(Arc::new(move |data: &[u8]| {
            Round::from_bytes(data)
                .map(|round| checker.check_authentic(&round).is_ok())
                .unwrap_or(false)
        }))?;

        let subscription = topic.subscribe()?;
        info!(topic = %self.topic_name, "subscribed to rounds");
        Ok(subscription)
    }

    fn spawn_reader(inner: Arc<Inner>, subscription: Subscription) -> Reader {
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(inner.read_loop(subscription, stopped));
        Reader { stop, task }
    }

    async fn read_loop(self: Arc<Self>, mut subscription: Subscription, mut stopped: oneshot::Receiver<()>) {
        // Authenticity checks run outside the registry lock.
        let checker = self.registry.lock().validator.clone();

        loop {
            let message = tokio::select! {
                _ = &mut stopped => return,
                message = subscription.next() => message,
            };
            let Some(message) = message else {
                break;
            };

            let verdict = Round::from_bytes(&message.data)
                .map_err(|e| e.to_string())
                .and_then(|round| match checker.check_authentic(&round) {
                    Ok(()) => Ok(round),
                    Err(reason) => Err(reason.to_string()),
                });
            self.deliver(verdict, &message.propagation_peer.to_string());
        }

        // Subscription ended underneath us: the host is gone.
        warn!(topic = %self.topic_name, "subscription closed, closing watchers");
        self.registry.lock().watchers.clear();
    }

    fn deliver(&self, verdict: std::result::Result<Round, String>, peer: &str) {
        let mut registry = self.registry.lock();
        registry.stats.messages_received += 1;

        let round = match verdict {
            Ok(round) => round,
            Err(reason) => {
                registry.stats.messages_invalid += 1;
                debug!(%peer, %reason, "dropping invalid round");
                return;
            }
        };
        registry.stats.messages_valid += 1;

        if let Err(reason @ RejectReason::NotNewer { .. }) = registry.validator.check_newer(&round) {
            registry.stats.messages_duplicate += 1;
            trace!(round = round.round, %reason, "dropping stale round");
            return;
        }
        registry.validator.record(round.round);

        let mut delivered = 0u64;
        let mut dropped = 0u64;
        registry.watchers.retain(|id, watcher| match watcher.sender.try_send(round.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                warn!(watcher = id, round = round.round, "watcher buffer full, dropping round");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        registry.stats.rounds_delivered += delivered;
        registry.stats.rounds_dropped += dropped;
        debug!(round = round.round, watchers = delivered, "delivered round");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::testing::TestChain;
    use relay_p2p::{construct_host, load_or_create_identity, Datastore, Host, TransportConfig};
    use std::time::Duration;

    async fn local_pubsub(dir: &tempfile::TempDir) -> (Host, PubSub) {
        let keypair = load_or_create_identity(&dir.path().join("identity.key")).unwrap();
        let store = Datastore::open(dir.path()).unwrap();
        construct_host(store, keypair, "/ip4/127.0.0.1/tcp/0", &[], &TransportConfig::default())
            .await
            .unwrap()
    }

    fn client(pubsub: PubSub, chain: &TestChain) -> Client {
        Client::new_with_pubsub(pubsub, chain.chain_id(), Arc::new(chain.verifier())).unwrap()
    }

    #[tokio::test]
    async fn test_empty_chain_id_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let (host, pubsub) = local_pubsub(&dir).await;
        let chain = TestChain::new("test");
        let result = Client::new_with_pubsub(pubsub, "", Arc::new(chain.verifier()));
        assert!(matches!(result, Err(Error::Config(_))));
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_deliver_enforces_order() {
        let dir = tempfile::tempdir().unwrap();
        let (host, pubsub) = local_pubsub(&dir).await;
        let chain = TestChain::new("test");
        let client = client(pubsub, &chain);

        let (_cancel, ctx) = oneshot::channel::<()>();
        let mut rounds = client.watch(ctx).await.unwrap();

        for n in [1, 3, 2, 3, 5] {
            client.inner.deliver(Ok(chain.round(n)), "peer");
        }
        client.inner.deliver(Err("bad signature".into()), "peer");

        for expected in [1, 3, 5] {
            assert_eq!(rounds.recv().await.unwrap().round, expected);
        }
        assert!(rounds.try_recv().is_err());

        let stats = client.stats();
        assert_eq!(stats.messages_received, 6);
        assert_eq!(stats.messages_invalid, 1);
        assert_eq!(stats.messages_duplicate, 2);
        assert_eq!(stats.rounds_delivered, 3);
        assert_eq!(client.last_accepted(), 5);

        client.shutdown().await;
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_buffer_drops_new_rounds() {
        let dir = tempfile::tempdir().unwrap();
        let (host, pubsub) = local_pubsub(&dir).await;
        let chain = TestChain::new("test");
        let config = ClientConfig {
            chain_id: "test".into(),
            watch_buffer: 2,
        };
        let client = Client::with_config(pubsub, config, Arc::new(chain.verifier())).unwrap();

        let (_cancel, ctx) = oneshot::channel::<()>();
        let mut rounds = client.watch(ctx).await.unwrap();
        for round in chain.rounds(1..=4) {
            client.inner.deliver(Ok(round), "peer");
        }

        assert_eq!(rounds.recv().await.unwrap().round, 1);
        assert_eq!(rounds.recv().await.unwrap().round, 2);
        assert!(rounds.try_recv().is_err());
        assert_eq!(client.stats().rounds_dropped, 2);

        // Later rounds still arrive once there is room.
        client.inner.deliver(Ok(chain.round(5)), "peer");
        assert_eq!(rounds.recv().await.unwrap().round, 5);

        client.shutdown().await;
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_closes_only_that_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let (host, pubsub) = local_pubsub(&dir).await;
        let chain = TestChain::new("test");
        let client = client(pubsub, &chain);

        let (cancel_a, ctx_a) = oneshot::channel::<()>();
        let (_cancel_b, ctx_b) = oneshot::channel::<()>();
        let mut a = client.watch(ctx_a).await.unwrap();
        let mut b = client.watch(ctx_b).await.unwrap();

        client.inner.deliver(Ok(chain.round(1)), "peer");
        cancel_a.send(()).unwrap();

        assert_eq!(a.recv().await.unwrap().round, 1);
        assert!(a.recv().await.is_none());

        client.inner.deliver(Ok(chain.round(2)), "peer");
        assert_eq!(b.recv().await.unwrap().round, 1);
        assert_eq!(b.recv().await.unwrap().round, 2);
        assert_eq!(client.watchers(), 1);

        client.shutdown().await;
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_last_watcher_releases_subscription() {
        let dir = tempfile::tempdir().unwrap();
        let (host, pubsub) = local_pubsub(&dir).await;
        let chain = TestChain::new("test");
        let client = client(pubsub, &chain);

        let (cancel, ctx) = oneshot::channel::<()>();
        let mut rounds = client.watch(ctx).await.unwrap();
        assert!(client.inner.reader.lock().await.is_some());

        drop(cancel);
        assert!(rounds.recv().await.is_none());
        assert!(client.inner.reader.lock().await.is_none());

        // Watching again re-subscribes.
        let (_cancel, ctx) = oneshot::channel::<()>();
        let _rounds = client.watch(ctx).await.unwrap();
        assert!(client.inner.reader.lock().await.is_some());

        client.shutdown().await;
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_context_output_need_not_be_send() {
        let dir = tempfile::tempdir().unwrap();
        let (host, pubsub) = local_pubsub(&dir).await;
        let chain = TestChain::new("test");
        let client = client(pubsub, &chain);

        // Completes at once with a value that cannot cross threads.
        let mut rounds = client.watch(async { std::rc::Rc::new(()) }).await.unwrap();
        assert!(rounds.recv().await.is_none());

        client.shutdown().await;
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_receiver_releases_subscription() {
        let dir = tempfile::tempdir().unwrap();
        let (host, pubsub) = local_pubsub(&dir).await;
        let chain = TestChain::new("test");
        let client = client(pubsub, &chain);

        // The context never completes; only the receiver goes away.
        let rounds = client.watch(std::future::pending::<()>()).await.unwrap();
        assert_eq!(client.watchers(), 1);
        drop(rounds);

        tokio::time::timeout(Duration::from_secs(5), async {
            while client.watchers() != 0 || client.inner.reader.lock().await.is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscription not released");

        client.shutdown().await;
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_closes_watchers() {
        let dir = tempfile::tempdir().unwrap();
        let (host, pubsub) = local_pubsub(&dir).await;
        let chain = TestChain::new("test");
        let client = client(pubsub, &chain);

        let (_cancel, ctx) = oneshot::channel::<()>();
        let mut rounds = client.watch(ctx).await.unwrap();

        client.shutdown().await;
        client.shutdown().await;
        assert!(rounds.recv().await.is_none());
        assert!(matches!(
            client.watch(std::future::pending::<()>()).await,
            Err(Error::Transport(TransportError::Closed))
        ));
        host.shutdown().await;
    }
}
