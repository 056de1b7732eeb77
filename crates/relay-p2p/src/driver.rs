//! The host's swarm event loop.
//!
//! One task owns the swarm. It serves commands from the pub/sub handles,
//! runs topic validators, fans validated messages out to subscriptions and
//! keeps the peer datastore and scores up to date.

use crate::behaviour::{PeerScore, RelayBehaviour, RelayBehaviourEvent};
use crate::bootstrap::BootstrapState;
use crate::datastore::Datastore;
use crate::error::TransportError;
use crate::pubsub::{Command, TopicValidator};
use crate::topic::GossipMessage;
use futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic, MessageAcceptance, TopicHash};
use libp2p::swarm::{dial_opts::DialOpts, SwarmEvent};
use libp2p::{identify, ping, Multiaddr, PeerId, Swarm};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, trace, warn};

pub(crate) struct Driver {
    swarm: Swarm<RelayBehaviour>,
    commands: mpsc::UnboundedReceiver<Command>,
    datastore: Datastore,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    bootstrap_peers: Vec<Multiaddr>,
    bootstrap: BootstrapState,
    redial_interval: Duration,
    joined: HashMap<TopicHash, (IdentTopic, usize)>,
    subscribers: HashMap<TopicHash, Vec<(u64, mpsc::Sender<GossipMessage>)>>,
    validators: HashMap<TopicHash, TopicValidator>,
    scores: HashMap<PeerId, PeerScore>,
}

impl Driver {
    pub(crate) fn new(
        swarm: Swarm<RelayBehaviour>,
        commands: mpsc::UnboundedReceiver<Command>,
        datastore: Datastore,
        listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
        redial_interval: Duration,
    ) -> Self {
        Self {
            swarm,
            commands,
            datastore,
            listen_addrs,
            bootstrap_peers: Vec::new(),
            bootstrap: BootstrapState::new(),
            redial_interval,
            joined: HashMap::new(),
            subscribers: HashMap::new(),
            validators: HashMap::new(),
            scores: HashMap::new(),
        }
    }

    /// Start listening and wait until the first address is bound.
    pub(crate) async fn listen(
        &mut self,
        addr: Multiaddr,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let listen_err = |reason: String| TransportError::Listen {
            addr: addr.to_string(),
            reason,
        };

        self.swarm
            .listen_on(addr.clone())
            .map_err(|e| listen_err(e.to_string()))?;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        while self.listen_addrs.read().is_empty() {
            tokio::select! {
                event = self.swarm.select_next_some() => match event {
                    SwarmEvent::ListenerError { error, .. } => {
                        return Err(listen_err(error.to_string()));
                    }
                    SwarmEvent::ListenerClosed { reason, .. } => {
                        return Err(listen_err(format!("listener closed: {:?}", reason)));
                    }
                    other => self.handle_swarm_event(other),
                },
                _ = &mut deadline => {
                    return Err(listen_err("timed out waiting for listen address".to_string()));
                }
            }
        }
        Ok(())
    }

    /// Dial bootstrap peers and wait until one connects or all fail.
    /// Cached datastore peers are dialed too, but only as hints.
    pub(crate) async fn bootstrap(
        &mut self,
        peers: &[Multiaddr],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.bootstrap_peers = peers.to_vec();

        let mut in_flight = Vec::new();
        for addr in peers {
            let opts = DialOpts::from(addr.clone());
            let connection_id = opts.connection_id();
            match self.swarm.dial(opts) {
                Ok(()) => in_flight.push(connection_id),
                Err(e) => warn!(%addr, error = %e, "bootstrap dial failed"),
            }
        }
        self.bootstrap.start(peers.len(), in_flight);

        for addr in self.datastore.known_peers() {
            if peers.contains(&addr) {
                continue;
            }
            if let Err(e) = self.swarm.dial(addr.clone()) {
                debug!(%addr, error = %e, "cached peer dial failed");
            }
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        while !self.bootstrap.is_settled() {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                _ = &mut deadline => self.bootstrap.on_timeout(),
            }
        }

        if self.bootstrap.is_failed() {
            warn!("{}", self.bootstrap.log_state());
            return Err(TransportError::BootstrapUnreachable {
                attempted: peers.len(),
            });
        }
        info!("{}", self.bootstrap.log_state());
        Ok(())
    }

    /// Serve commands and swarm events until shutdown.
    pub(crate) async fn run(mut self) {
        let mut redial_timer = tokio::time::interval(self.redial_interval);
        redial_timer.tick().await;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            return;
                        }
                    }
                    None => {
                        self.close();
                        return;
                    }
                },
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                _ = redial_timer.tick() => self.redial_if_isolated(),
            }
        }
    }

    fn close(&mut self) {
        for (topic, _) in self.joined.values() {
            if let Err(e) = self.swarm.behaviour_mut().gossipsub.unsubscribe(topic) {
                debug!(topic = %topic, error = %e, "unsubscribe on shutdown failed");
            }
        }
        self.joined.clear();
        // Dropping the senders ends every open subscription.
        self.subscribers.clear();
        self.validators.clear();

        if let Err(e) = self.datastore.flush() {
            warn!(error = %e, "failed to persist peer datastore");
        }
        info!(peer_id = %self.swarm.local_peer_id(), "host stopped");
    }

    fn redial_if_isolated(&mut self) {
        if self.swarm.connected_peers().next().is_some() || self.bootstrap_peers.is_empty() {
            return;
        }
        info!(
            peers = self.bootstrap_peers.len(),
            "no peers connected, redialling bootstrap peers"
        );
        for addr in self.bootstrap_peers.clone() {
            if let Err(e) = self.swarm.dial(addr.clone()) {
                warn!(%addr, error = %e, "redial failed");
            }
        }
    }

    /// Returns `false` once the host has been shut down.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Join { topic, reply } => {
                let hash = topic.hash();
                if let Some((_, count)) = self.joined.get_mut(&hash) {
                    *count += 1;
                    let _ = reply.send(Ok(()));
                    return true;
                }
                let result = match self.swarm.behaviour_mut().gossipsub.subscribe(&topic) {
                    Ok(_) => {
                        info!(topic = %hash, "joined topic");
                        self.joined.insert(hash, (topic, 1));
                        Ok(())
                    }
                    Err(e) => Err(TransportError::Subscribe {
                        topic: hash.to_string(),
                        reason: e.to_string(),
                    }),
                };
                let _ = reply.send(result);
            }
            Command::Leave { topic } => {
                let Some((ident, count)) = self.joined.get_mut(&topic) else {
                    return true;
                };
                *count -= 1;
                if *count > 0 {
                    return true;
                }
                let ident = ident.clone();
                self.joined.remove(&topic);
                self.subscribers.remove(&topic);
                self.validators.remove(&topic);
                if let Err(e) = self.swarm.behaviour_mut().gossipsub.unsubscribe(&ident) {
                    warn!(%topic, error = %e, "failed to leave topic");
                } else {
                    info!(%topic, "left topic");
                }
            }
            Command::Publish { topic, data, reply } => {
                let result = match self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(topic.clone(), data)
                {
                    Ok(_) => Ok(()),
                    Err(gossipsub::PublishError::Duplicate) => {
                        debug!(%topic, "payload already published on topic");
                        Ok(())
                    }
                    Err(e) => Err(TransportError::Publish {
                        topic: topic.to_string(),
                        reason: e.to_string(),
                    }),
                };
                let _ = reply.send(result);
            }
            Command::Subscribe { topic, id, sender } => {
                self.subscribers.entry(topic).or_default().push((id, sender));
            }
            Command::Unsubscribe { topic, id } => {
                if let Some(subs) = self.subscribers.get_mut(&topic) {
                    subs.retain(|(sub_id, _)| *sub_id != id);
                }
            }
            Command::SetValidator { topic, validator } => {
                self.validators.insert(topic, validator);
            }
            Command::ConnectedPeers { reply } => {
                let _ = reply.send(self.swarm.connected_peers().cloned().collect());
            }
            Command::Shutdown { reply } => {
                self.close();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<RelayBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "listening");
                self.listen_addrs.write().push(address);
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.listen_addrs.write().retain(|a| a != &address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                if self.bootstrap.on_connected(connection_id) {
                    info!(%peer_id, "connected to bootstrap peer");
                } else {
                    debug!(%peer_id, "connected");
                }
                if endpoint.is_dialer() {
                    if let Ok(addr) = endpoint.get_remote_address().clone().with_p2p(peer_id) {
                        self.datastore.record_peer(&addr);
                    }
                }
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                debug!(%peer_id, "disconnected");
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
                ..
            } => {
                if self.bootstrap.on_failed(connection_id) {
                    warn!(peer = ?peer_id, %error, "bootstrap peer unreachable");
                } else {
                    debug!(peer = ?peer_id, %error, "outgoing connection failed");
                }
            }
            SwarmEvent::Behaviour(RelayBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message_id,
                message,
            })) => {
                self.handle_message(propagation_source, message_id, message);
            }
            SwarmEvent::Behaviour(RelayBehaviourEvent::Gossipsub(
                gossipsub::Event::Subscribed { peer_id, topic },
            )) => {
                debug!(%peer_id, %topic, "peer subscribed");
            }
            SwarmEvent::Behaviour(RelayBehaviourEvent::Ping(ping::Event {
                peer,
                result: Ok(rtt),
                ..
            })) => {
                self.scores.entry(peer).or_default().record_latency(rtt);
            }
            SwarmEvent::Behaviour(RelayBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                trace!(%peer_id, agent = %info.agent_version, "identified peer");
            }
            _ => {}
        }
    }

    fn handle_message(
        &mut self,
        propagation_source: PeerId,
        message_id: gossipsub::MessageId,
        message: gossipsub::Message,
    ) {
        let valid = match self.validators.get(&message.topic) {
            Some(validator) => validator(&message.data),
            None => true,
        };
        let acceptance = if valid {
            MessageAcceptance::Accept
        } else {
            MessageAcceptance::Reject
        };
        let _ = self
            .swarm
            .behaviour_mut()
            .gossipsub
            .report_message_validation_result(&message_id, &propagation_source, acceptance);

        let score = self.scores.entry(propagation_source).or_default();
        score.record(valid);
        if score.should_disconnect() {
            warn!(
                peer = %propagation_source,
                reputation = score.reputation(),
                "disconnecting peer sending invalid rounds"
            );
            self.scores.remove(&propagation_source);
            let _ = self.swarm.disconnect_peer_id(propagation_source);
        }

        if !valid {
            debug!(peer = %propagation_source, topic = %message.topic, "rejected gossip message");
            return;
        }

        let Some(subs) = self.subscribers.get_mut(&message.topic) else {
            return;
        };
        let delivered = GossipMessage {
            topic: message.topic.to_string(),
            data: message.data,
            source_peer: message.source,
            propagation_peer: propagation_source,
            message_id: message_id.0,
        };
        subs.retain(|(id, sender)| match sender.try_send(delivered.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(subscription = id, topic = %delivered.topic, "subscription full, dropping message");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
}
