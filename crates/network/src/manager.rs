//! Peer manager
//!
//! Ties the directory, peer sets, resolver, discovery, connection
//! orchestrator and announcer together behind one handle shared by the
//! database registry and the periodic loops.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use replimesh_core::{CoordinatorConfig, PeerId, PeerRecord};

use crate::announce::{AnnounceReport, Announcer};
use crate::connect::{ConnectOutcome, ConnectionOrchestrator};
use crate::directory::{DatabasePeerSet, PeerDirectory};
use crate::discovery::{ProviderDiscovery, TrackedDatabase};
use crate::resolver::PeerResolver;
use crate::search::{SearchDetails, SearchOptions, SearchStart};
use crate::transport::DhtTransport;
use crate::NetworkResult;

/// Source of the databases the periodic loops work on
#[async_trait]
pub trait DatabaseCatalog: Send + Sync {
    /// Databases currently open
    async fn tracked_databases(&self) -> Vec<TrackedDatabase>;
}

/// Peer discovery and connection management for open databases
pub struct PeerManager {
    directory: PeerDirectory,
    peer_sets: DatabasePeerSet,
    resolver: Arc<PeerResolver>,
    discovery: ProviderDiscovery,
    orchestrator: ConnectionOrchestrator,
    announcer: Announcer,
    /// Peer event forwarders keyed by database id
    attachments: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PeerManager {
    /// Create a manager over `transport`
    pub fn new(transport: Arc<dyn DhtTransport>, config: &CoordinatorConfig) -> Self {
        let directory = PeerDirectory::new();
        let peer_sets = DatabasePeerSet::new();
        let resolver = Arc::new(PeerResolver::new(transport.clone(), directory.clone()));
        let discovery = ProviderDiscovery::new(
            transport.clone(),
            directory.clone(),
            peer_sets.clone(),
            config.use_custom_provider_lookup,
            config.provider_lookup_timeout(),
        );
        let orchestrator =
            ConnectionOrchestrator::new(transport.clone(), directory.clone(), peer_sets.clone(), resolver.clone());

        Self {
            directory,
            peer_sets,
            resolver,
            discovery,
            orchestrator,
            announcer: Announcer::new(transport),
            attachments: Mutex::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn peer_sets(&self) -> &DatabasePeerSet {
        &self.peer_sets
    }

    pub fn announcer(&self) -> Announcer {
        self.announcer.clone()
    }

    /// Resolve a peer identifier to a dialable record
    pub async fn resolve(&self, peer: &PeerId) -> NetworkResult<PeerRecord> {
        self.resolver.resolve(peer).await
    }

    /// Join or start the provider lookup for `database`
    pub async fn find_providers(
        &self,
        database: &TrackedDatabase,
        options: SearchOptions,
    ) -> SearchStart<Vec<PeerRecord>> {
        self.discovery.find_providers(database, options).await
    }

    /// Run discovery for every database and wait for it to settle
    pub async fn discover_all(&self, databases: &[TrackedDatabase]) -> usize {
        self.discovery.discover_all(databases).await
    }

    /// Peers of `database` with every address known for them
    pub async fn get_peers_for(&self, database: &str) -> Vec<PeerRecord> {
        let mut peers = Vec::new();
        for id in self.peer_sets.peers(database).await {
            let record = match self.directory.get(&id).await {
                Some(record) => record,
                None => PeerRecord::new(id),
            };
            peers.push(record);
        }
        peers
    }

    /// Number of peers known to host `database`
    pub async fn peer_count(&self, database: &str) -> usize {
        self.peer_sets.count(database).await
    }

    /// Every peer in the directory
    pub async fn all_known_peers(&self) -> Vec<PeerRecord> {
        self.directory.all().await
    }

    /// Start tracking peers for `database`
    pub async fn register_database(&self, database: &str) {
        self.peer_sets.track(database).await;
    }

    /// Stop tracking `database`.
    ///
    /// Event forwarding stops at once. The peer set is dropped after any
    /// in-flight provider lookup for the database has settled, unless the
    /// database was registered again in the meantime.
    pub async fn remove_database(&self, database: &str) {
        if let Some(forwarder) = self.attachments.lock().await.remove(database) {
            forwarder.abort();
        }

        let Some(generation) = self.peer_sets.generation(database).await else {
            return;
        };
        match self.discovery.in_flight(database).await {
            Some(search) => {
                debug!("Deferring removal of {} until its search settles", database);
                let peer_sets = self.peer_sets.clone();
                let database = database.to_string();
                tokio::spawn(async move {
                    search.wait().await;
                    if !peer_sets.remove_generation(&database, generation).await {
                        debug!("{} was registered again, keeping its peers", database);
                    }
                });
            }
            None => {
                self.peer_sets.remove_generation(database, generation).await;
            }
        }
    }

    /// Forward peer-seen events of `database` into its peer set.
    ///
    /// Each peer is resolved first; a peer that cannot be resolved is still
    /// recorded, without addresses. Replaces any earlier forwarder.
    pub async fn attach(&self, database: &str, mut events: broadcast::Receiver<PeerId>) {
        let resolver = self.resolver.clone();
        let directory = self.directory.clone();
        let peer_sets = self.peer_sets.clone();
        let db = database.to_string();

        let forwarder = tokio::spawn(async move {
            loop {
                let peer = match events.recv().await {
                    Ok(peer) => peer,
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} peer events for {}", missed, db);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let record = match resolver.resolve(&peer).await {
                    Ok(record) => record,
                    Err(e) => {
                        debug!("{}, recording it without addresses", e);
                        directory.merge(PeerRecord::new(peer)).await
                    }
                };
                if peer_sets.insert(&db, &record.id).await {
                    info!("Peer {} joined {}", record.id, db);
                }
            }
            debug!("Peer events for {} closed", db);
        });

        if let Some(previous) = self.attachments.lock().await.insert(database.to_string(), forwarder) {
            previous.abort();
        }
    }

    /// Details of every in-flight provider lookup and peer lookup
    pub async fn searches(&self) -> Vec<SearchDetails> {
        let mut searches = self.discovery.searches().searches().await;
        searches.extend(self.resolver.lookups().searches().await);
        searches
    }

    /// Publish the root of one database
    pub async fn announce(&self, database: &TrackedDatabase) -> NetworkResult<()> {
        self.announcer.announce(database).await
    }

    /// Publish the root of every database
    pub async fn announce_all(&self, databases: &[TrackedDatabase]) -> AnnounceReport {
        self.announcer.announce_all(databases).await
    }

    /// Run one connection pass, skipped if one is already running
    pub async fn connect_pass(&self) -> ConnectOutcome {
        self.orchestrator.run_pass().await
    }
}

impl Drop for PeerManager {
    fn drop(&mut self) {
        for (_, forwarder) in self.attachments.get_mut().drain() {
            forwarder.abort();
        }
    }
}
