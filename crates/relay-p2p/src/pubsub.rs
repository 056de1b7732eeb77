//! Pub/sub handles handed to the bridge and client.
//!
//! The swarm lives in the host's driver task; these handles talk to it over a
//! command channel. `PubSub` and `Topic` are cheap to clone and share.

use crate::error::TransportError;
use crate::topic::GossipMessage;
use libp2p::gossipsub::{IdentTopic, TopicHash};
use libp2p::PeerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};

/// Gossip-level validator for a topic. Returning false rejects the message:
/// it is neither delivered locally nor forwarded to other peers.
pub type TopicValidator = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

pub(crate) enum Command {
    Join {
        topic: IdentTopic,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Leave {
        topic: TopicHash,
    },
    Publish {
        topic: TopicHash,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Subscribe {
        topic: TopicHash,
        id: u64,
        sender: mpsc::Sender<GossipMessage>,
    },
    Unsubscribe {
        topic: TopicHash,
        id: u64,
    },
    SetValidator {
        topic: TopicHash,
        validator: TopicValidator,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// The pub/sub capability of a host.
#[derive(Clone)]
pub struct PubSub {
    commands: mpsc::UnboundedSender<Command>,
    topics: Arc<Mutex<HashMap<String, Weak<TopicInner>>>>,
    next_subscription: Arc<AtomicU64>,
    subscription_buffer: usize,
}

impl PubSub {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>, subscription_buffer: usize) -> Self {
        Self {
            commands,
            topics: Arc::new(Mutex::new(HashMap::new())),
            next_subscription: Arc::new(AtomicU64::new(0)),
            subscription_buffer,
        }
    }

    /// Join a topic. Idempotent: while any handle for `name` is alive, joining
    /// again returns a handle to the same topic.
    pub async fn join(&self, name: &str) -> Result<Topic, TransportError> {
        if let Some(inner) = self.topics.lock().get(name).and_then(Weak::upgrade) {
            return Ok(Topic { inner });
        }

        let ident = IdentTopic::new(name);
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Join {
                topic: ident.clone(),
                reply,
            })
            .map_err(|_| TransportError::Closed)?;
        response.await.map_err(|_| TransportError::Closed)??;

        let fresh = Arc::new(TopicInner {
            name: name.to_string(),
            hash: ident.hash(),
            commands: self.commands.clone(),
            next_subscription: self.next_subscription.clone(),
            subscription_buffer: self.subscription_buffer,
        });

        // Another join may have raced us; the loser's handle is dropped,
        // which balances its join with a leave.
        let mut topics = self.topics.lock();
        if let Some(existing) = topics.get(name).and_then(Weak::upgrade) {
            return Ok(Topic { inner: existing });
        }
        topics.insert(name.to_string(), Arc::downgrade(&fresh));
        Ok(Topic { inner: fresh })
    }

    /// Peers the host is currently connected to.
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::ConnectedPeers { reply }).is_err() {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }
}

struct TopicInner {
    name: String,
    hash: TopicHash,
    commands: mpsc::UnboundedSender<Command>,
    next_subscription: Arc<AtomicU64>,
    subscription_buffer: usize,
}

impl Drop for TopicInner {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Leave {
            topic: self.hash.clone(),
        });
    }
}

/// A joined topic. The host stays subscribed while any clone is alive.
#[derive(Clone)]
pub struct Topic {
    inner: Arc<TopicInner>,
}

impl Topic {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Publish raw bytes. A payload identical to one already seen counts as published.
    pub async fn publish(&self, data: Vec<u8>) -> Result<(), TransportError> {
        let (reply, response) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Publish {
                topic: self.inner.hash.clone(),
                data,
                reply,
            })
            .map_err(|_| TransportError::Closed)?;
        response.await.map_err(|_| TransportError::Closed)?
    }

    /// Open a stream of validated messages on this topic.
    pub fn subscribe(&self) -> Result<Subscription, TransportError> {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inner.subscription_buffer);
        self.inner
            .commands
            .send(Command::Subscribe {
                topic: self.inner.hash.clone(),
                id,
                sender,
            })
            .map_err(|_| TransportError::Closed)?;
        Ok(Subscription {
            id,
            topic: self.clone(),
            receiver,
        })
    }

    /// Install the gossip-level validator for this topic, replacing any previous one.
    pub fn set_validator(&self, validator: TopicValidator) -> Result<(), TransportError> {
        self.inner
            .commands
            .send(Command::SetValidator {
                topic: self.inner.hash.clone(),
                validator,
            })
            .map_err(|_| TransportError::Closed)
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic").field("name", &self.inner.name).finish()
    }
}

/// A stream of messages on one topic. Dropping it unsubscribes.
///
/// Yields `None` once the host shuts down or the topic is left.
pub struct Subscription {
    id: u64,
    topic: Topic,
    receiver: mpsc::Receiver<GossipMessage>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<GossipMessage> {
        self.receiver.recv().await
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.topic.inner.commands.send(Command::Unsubscribe {
            topic: self.topic.inner.hash.clone(),
            id: self.id,
        });
    }
}
