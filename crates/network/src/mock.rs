//! Mock DHT transport for testing
//!
//! This module provides an in-memory implementation of the DhtTransport
//! trait with configurable latency and failures.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::time::sleep;

use replimesh_core::{ContentId, PeerId, PeerRecord};

use crate::transport::{DhtTransport, DialTarget, ProviderStream};
use crate::{NetworkError, NetworkResult};

#[derive(Debug, Default)]
struct MockState {
    /// Providers per content root
    providers: HashMap<ContentId, Vec<PeerRecord>>,
    /// Roots whose provider lookup fails
    failing_lookups: HashSet<ContentId>,
    /// Roots whose announce fails
    failing_provides: HashSet<ContentId>,
    /// Records returned by peer lookups
    peers: HashMap<PeerId, PeerRecord>,
    /// Live connection table
    connections: Vec<PeerRecord>,
    /// Whether enumerating connections fails
    connections_fail: bool,
    /// Peers reachable by direct dial
    dialable: HashSet<PeerId>,
    /// Peers reachable through a relay
    relayable: HashSet<PeerId>,
    /// Successfully announced roots, in order
    provided: Vec<ContentId>,
    /// Every dial attempt, in order
    dials: Vec<DialTarget>,
    /// Every ping, in order
    pings: Vec<PeerId>,
    /// Call counters
    provide_calls: usize,
    find_providers_calls: usize,
    stream_calls: usize,
    find_peer_calls: usize,
    connections_calls: usize,
}

/// An in-memory DHT transport
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    /// Latency of provider lookups
    provider_delay: Duration,
    /// Latency of peer lookups
    find_peer_delay: Duration,
    /// Latency of connection enumeration
    connections_delay: Duration,
    /// Latency of dials
    dial_delay: Duration,
}

impl MockTransport {
    /// Create a transport that knows nothing
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Providers returned for `root`
    pub fn with_providers(self, root: impl Into<ContentId>, providers: Vec<PeerRecord>) -> Self {
        self.state().providers.insert(root.into(), providers);
        self
    }

    /// Make provider lookups for `root` fail
    pub fn with_failing_lookup(self, root: impl Into<ContentId>) -> Self {
        self.state().failing_lookups.insert(root.into());
        self
    }

    /// Make announcing `root` fail
    pub fn with_failing_provide(self, root: impl Into<ContentId>) -> Self {
        self.state().failing_provides.insert(root.into());
        self
    }

    /// Record returned by peer lookups for `record.id`
    pub fn with_peer(self, record: PeerRecord) -> Self {
        self.state().peers.insert(record.id.clone(), record);
        self
    }

    /// Add a live connection
    pub fn with_connection(self, record: PeerRecord) -> Self {
        self.state().connections.push(record);
        self
    }

    /// Make connection enumeration fail after `delay`
    pub fn with_failing_connections(mut self, delay: Duration) -> Self {
        self.state().connections_fail = true;
        self.connections_delay = delay;
        self
    }

    /// Peer accepts direct dials
    pub fn with_dialable(self, peer: impl Into<PeerId>) -> Self {
        self.state().dialable.insert(peer.into());
        self
    }

    /// Peer accepts relayed dials
    pub fn with_relayable(self, peer: impl Into<PeerId>) -> Self {
        self.state().relayable.insert(peer.into());
        self
    }

    pub fn with_provider_delay(mut self, delay: Duration) -> Self {
        self.provider_delay = delay;
        self
    }

    pub fn with_find_peer_delay(mut self, delay: Duration) -> Self {
        self.find_peer_delay = delay;
        self
    }

    pub fn with_dial_delay(mut self, delay: Duration) -> Self {
        self.dial_delay = delay;
        self
    }

    /// Roots announced so far
    pub fn provided(&self) -> Vec<ContentId> {
        self.state().provided.clone()
    }

    /// Dial attempts so far
    pub fn dials(&self) -> Vec<DialTarget> {
        self.state().dials.clone()
    }

    /// Pings sent so far
    pub fn pings(&self) -> Vec<PeerId> {
        self.state().pings.clone()
    }

    pub fn provide_calls(&self) -> usize {
        self.state().provide_calls
    }

    pub fn find_providers_calls(&self) -> usize {
        self.state().find_providers_calls
    }

    pub fn stream_calls(&self) -> usize {
        self.state().stream_calls
    }

    pub fn find_peer_calls(&self) -> usize {
        self.state().find_peer_calls
    }

    pub fn connections_calls(&self) -> usize {
        self.state().connections_calls
    }

    fn providers_of(&self, root: &ContentId) -> NetworkResult<Vec<PeerRecord>> {
        let state = self.state();
        if state.failing_lookups.contains(root) {
            return Err(NetworkError::TransportError(format!("provider lookup for {} timed out", root)));
        }
        Ok(state.providers.get(root).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl DhtTransport for MockTransport {
    async fn provide(&self, root: &ContentId) -> NetworkResult<()> {
        let mut state = self.state();
        state.provide_calls += 1;
        if state.failing_provides.contains(root) {
            return Err(NetworkError::TransportError(format!("no route to publish {}", root)));
        }
        state.provided.push(root.clone());
        Ok(())
    }

    async fn find_providers(&self, root: &ContentId, _timeout: Duration) -> NetworkResult<Vec<PeerRecord>> {
        self.state().find_providers_calls += 1;
        sleep(self.provider_delay).await;
        self.providers_of(root)
    }

    async fn find_providers_stream(&self, root: &ContentId, _timeout: Duration) -> NetworkResult<ProviderStream> {
        self.state().stream_calls += 1;
        let providers = self.providers_of(root)?;
        let delay = self.provider_delay;
        Ok(stream::iter(providers)
            .then(move |provider| async move {
                sleep(delay).await;
                Ok(provider)
            })
            .boxed())
    }

    async fn find_peer(&self, peer: &PeerId) -> NetworkResult<PeerRecord> {
        self.state().find_peer_calls += 1;
        sleep(self.find_peer_delay).await;
        self.state()
            .peers
            .get(&peer.canonical())
            .cloned()
            .ok_or_else(|| NetworkError::TransportError(format!("peer {} not found in DHT", peer)))
    }

    async fn connections(&self) -> NetworkResult<Vec<PeerRecord>> {
        self.state().connections_calls += 1;
        sleep(self.connections_delay).await;
        let state = self.state();
        if state.connections_fail {
            return Err(NetworkError::TransportError("swarm unavailable".to_string()));
        }
        Ok(state.connections.clone())
    }

    async fn connect(&self, target: DialTarget) -> NetworkResult<()> {
        self.state().dials.push(target.clone());
        sleep(self.dial_delay).await;
        let state = self.state();
        let reachable = match &target {
            DialTarget::Direct(record) => record.is_dialable() && state.dialable.contains(&record.id),
            DialTarget::Relayed(peer) => state.relayable.contains(&peer.canonical()),
        };
        if reachable {
            Ok(())
        } else {
            Err(NetworkError::TransportError(format!("connection to {} refused", target)))
        }
    }

    async fn ping(&self, peer: &PeerId) -> NetworkResult<()> {
        self.state().pings.push(peer.clone());
        Ok(())
    }
}
