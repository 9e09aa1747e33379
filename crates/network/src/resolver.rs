//! Peer resolution
//!
//! Turns a peer identifier into a record with dialable addresses. Known
//! peers are answered from the directory; everything else races the live
//! connection table against a deduplicated DHT lookup.

use std::sync::Arc;

use tracing::{debug, info, warn};

use replimesh_core::{PeerId, PeerRecord};

use crate::directory::PeerDirectory;
use crate::peekable::{first_success, Peekable};
use crate::search::{SearchOptions, SearchRegistry, SearchStart};
use crate::transport::DhtTransport;
use crate::{NetworkError, NetworkResult};

/// Resolves peer identifiers to peer records
pub struct PeerResolver {
    /// DHT transport
    transport: Arc<dyn DhtTransport>,
    /// Known peers
    directory: PeerDirectory,
    /// In-flight DHT peer lookups, keyed by canonical peer id
    lookups: SearchRegistry<PeerRecord>,
}

impl PeerResolver {
    /// Create a new resolver
    pub fn new(transport: Arc<dyn DhtTransport>, directory: PeerDirectory) -> Self {
        Self {
            transport,
            directory,
            lookups: SearchRegistry::new(),
        }
    }

    /// Resolve `peer` to a full record.
    ///
    /// Fails with [`NetworkError::PeerUnresolvable`] when neither the
    /// connection table nor the DHT knows the peer.
    pub async fn resolve(&self, peer: &PeerId) -> NetworkResult<PeerRecord> {
        if peer.is_canonical() {
            if let Some(record) = self.directory.get(peer).await {
                return Ok(record);
            }
        }

        let canonical = peer.canonical();
        let sources = [
            self.scan_connections(&canonical),
            self.lookup(&canonical).await.handle.result().clone(),
        ];

        match first_success(&sources).await {
            Some(record) => {
                let record = self.directory.merge(record).await;
                debug!("Resolved {}", record);
                Ok(record)
            }
            None => Err(NetworkError::PeerUnresolvable(canonical)),
        }
    }

    /// Join or start the DHT lookup for `peer`
    pub async fn lookup(&self, peer: &PeerId) -> SearchStart<PeerRecord> {
        let peer = peer.canonical();
        let transport = self.transport.clone();
        let directory = self.directory.clone();
        let key = peer.to_string();

        self.lookups
            .begin(&key, SearchOptions::default(), move || async move {
                info!("Resolving addrs for {}", peer);
                match transport.find_peer(&peer).await {
                    Ok(record) => Ok(directory.merge(record).await),
                    Err(e) => {
                        warn!("Error while resolving addrs for {}: {}", peer, e);
                        Err(e)
                    }
                }
            })
            .await
    }

    /// In-flight DHT peer lookups
    pub fn lookups(&self) -> &SearchRegistry<PeerRecord> {
        &self.lookups
    }

    fn scan_connections(&self, peer: &PeerId) -> Peekable<PeerRecord, NetworkError> {
        let transport = self.transport.clone();
        let peer = peer.clone();

        Peekable::spawn(async move {
            let connections = transport.connections().await?;
            connections
                .into_iter()
                .find(|connection| connection.id.refers_to(&peer))
                .ok_or(NetworkError::PeerNotConnected(peer))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::mock::MockTransport;

    fn addr(s: &str) -> multiaddr::Multiaddr {
        s.parse().unwrap()
    }

    fn resolver(transport: &Arc<MockTransport>) -> PeerResolver {
        PeerResolver::new(transport.clone(), PeerDirectory::new())
    }

    #[tokio::test]
    async fn test_known_peer_short_circuits() {
        let transport = Arc::new(MockTransport::new());
        let resolver = resolver(&transport);
        let known = PeerRecord::with_addresses("P1", vec![addr("/ip4/10.0.0.1/tcp/4001")]);
        resolver.directory.merge(known.clone()).await;

        assert_eq!(resolver.resolve(&"P1".into()).await, Ok(known));
        assert_eq!(transport.find_peer_calls(), 0);
        assert_eq!(transport.connections_calls(), 0);
    }

    #[tokio::test]
    async fn test_dht_wins_after_local_failure() {
        let remote = PeerRecord::with_addresses("P1", vec![addr("/ip4/10.0.0.9/tcp/4001")]);
        let transport = Arc::new(
            MockTransport::new()
                .with_failing_connections(Duration::from_millis(10))
                .with_peer(remote.clone())
                .with_find_peer_delay(Duration::from_millis(50)),
        );
        let resolver = resolver(&transport);

        assert_eq!(resolver.resolve(&"P1".into()).await, Ok(remote.clone()));
        assert_eq!(resolver.directory.get(&"P1".into()).await, Some(remote));
    }

    #[tokio::test]
    async fn test_connection_table_match() {
        let connected = PeerRecord::with_addresses("P1", vec![addr("/ip4/10.0.0.5/tcp/4001")]);
        let transport = Arc::new(MockTransport::new().with_connection(connected.clone()));
        let resolver = resolver(&transport);

        // Wrapped identifiers skip the directory and match the table by canonical id
        let resolved = resolver.resolve(&"/p2p/P1".into()).await.unwrap();
        assert_eq!(resolved, connected);
    }

    #[tokio::test]
    async fn test_unresolvable_peer() {
        let transport = Arc::new(MockTransport::new());
        let resolver = resolver(&transport);

        assert_eq!(
            resolver.resolve(&"ghost".into()).await,
            Err(NetworkError::PeerUnresolvable("ghost".into()))
        );
        assert!(!resolver.directory.contains(&"ghost".into()).await);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_lookup() {
        let remote = PeerRecord::with_addresses("P1", vec![addr("/ip4/10.0.0.9/tcp/4001")]);
        let transport = Arc::new(
            MockTransport::new()
                .with_peer(remote.clone())
                .with_find_peer_delay(Duration::from_millis(30)),
        );
        let resolver = Arc::new(resolver(&transport));

        let p1: PeerId = "P1".into();
        let p1_multiaddr: PeerId = "/p2p/P1".into();
        let (a, b) = tokio::join!(resolver.resolve(&p1), resolver.resolve(&p1_multiaddr));
        assert_eq!(a, Ok(remote.clone()));
        assert_eq!(b, Ok(remote));
        assert_eq!(transport.find_peer_calls(), 1);
    }
}
