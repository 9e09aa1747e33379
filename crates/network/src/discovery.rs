//! Database peer discovery
//!
//! Finds the providers of a database's content root on the DHT and records
//! them in the peer directory and in the database's peer set. One lookup runs
//! per database at a time.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use replimesh_core::{ContentId, PeerRecord};

use crate::directory::{DatabasePeerSet, PeerDirectory};
use crate::search::{SearchHandle, SearchOptions, SearchRegistry, SearchStart};
use crate::transport::DhtTransport;
use crate::{NetworkError, NetworkResult};

/// The parts of an open database the network layer needs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackedDatabase {
    /// Database id, used as the search and peer set key
    pub id: String,
    /// Content root advertised on the DHT
    pub root: ContentId,
}

impl TrackedDatabase {
    pub fn new(id: impl Into<String>, root: impl Into<ContentId>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
        }
    }
}

/// Provider lookups for open databases
pub struct ProviderDiscovery {
    /// DHT transport
    transport: Arc<dyn DhtTransport>,
    /// Known peers
    directory: PeerDirectory,
    /// Peers per database
    peer_sets: DatabasePeerSet,
    /// In-flight lookups keyed by database id
    searches: SearchRegistry<Vec<PeerRecord>>,
    /// Use the streaming lookup unless a search says otherwise
    use_custom_lookup: bool,
    /// Timeout handed to the transport unless a search says otherwise
    lookup_timeout: Duration,
}

impl ProviderDiscovery {
    /// Create a new discovery service
    pub fn new(
        transport: Arc<dyn DhtTransport>,
        directory: PeerDirectory,
        peer_sets: DatabasePeerSet,
        use_custom_lookup: bool,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            directory,
            peer_sets,
            searches: SearchRegistry::new(),
            use_custom_lookup,
            lookup_timeout,
        }
    }

    /// Join or start the provider lookup for `database`.
    ///
    /// Every provider found is registered before the search settles. A failed
    /// lookup is logged and reported through the handle only.
    pub async fn find_providers(
        &self,
        database: &TrackedDatabase,
        options: SearchOptions,
    ) -> SearchStart<Vec<PeerRecord>> {
        let transport = self.transport.clone();
        let directory = self.directory.clone();
        let peer_sets = self.peer_sets.clone();
        let database = database.clone();
        let key = database.id.clone();
        let timeout = options
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.lookup_timeout);
        let streaming = options.use_custom_provider_lookup.unwrap_or(self.use_custom_lookup);

        self.searches
            .begin(&key, options, move || async move {
                info!("Finding peers for {}", database.id);
                let lookup = ProviderLookup {
                    transport,
                    directory,
                    peer_sets,
                    database,
                    timeout,
                };
                let outcome = if streaming {
                    debug!("Using streaming provider lookup");
                    lookup.streamed().await
                } else {
                    lookup.batch().await
                };

                match outcome {
                    Ok(peers) => {
                        info!("Finished finding peers for {}: {} found", lookup.database.id, peers.len());
                        Ok(peers)
                    }
                    Err(e) => {
                        warn!("Error while finding peers for {}: {}", lookup.database.id, e);
                        Err(NetworkError::DiscoveryFailed {
                            target: lookup.database.id.clone(),
                            reason: e.to_string(),
                        })
                    }
                }
            })
            .await
    }

    /// Run discovery for every database and wait for all lookups to settle.
    ///
    /// Returns the number of providers found. Failures are already logged by
    /// the individual lookups.
    pub async fn discover_all(&self, databases: &[TrackedDatabase]) -> usize {
        info!("Finding peers for {} databases", databases.len());
        let mut handles = Vec::with_capacity(databases.len());
        for database in databases {
            handles.push(self.find_providers(database, SearchOptions::default()).await.handle);
        }

        let found: usize = join_all(handles.iter().map(|handle| handle.wait()))
            .await
            .into_iter()
            .filter_map(|outcome| match outcome {
                Some(Ok(peers)) => Some(peers.len()),
                _ => None,
            })
            .sum();
        info!("Finished finding database peers: {} found", found);
        found
    }

    /// In-flight lookup for `database`, if any
    pub async fn in_flight(&self, database: &str) -> Option<SearchHandle<Vec<PeerRecord>>> {
        self.searches.get(database).await
    }

    /// In-flight lookups keyed by database id
    pub fn searches(&self) -> &SearchRegistry<Vec<PeerRecord>> {
        &self.searches
    }
}

async fn register(
    directory: &PeerDirectory,
    peer_sets: &DatabasePeerSet,
    database: &str,
    peer: PeerRecord,
) -> PeerRecord {
    let record = directory.merge(peer).await;
    if peer_sets.insert(database, &record.id).await {
        debug!("Found peer {} for {}", record.id, database);
    }
    record
}

/// One provider lookup, owned by its search task
struct ProviderLookup {
    transport: Arc<dyn DhtTransport>,
    directory: PeerDirectory,
    peer_sets: DatabasePeerSet,
    database: TrackedDatabase,
    timeout: Duration,
}

impl ProviderLookup {
    async fn batch(&self) -> NetworkResult<Vec<PeerRecord>> {
        let providers = self
            .transport
            .find_providers(&self.database.root, self.timeout)
            .await?;

        let mut found = Vec::with_capacity(providers.len());
        for provider in providers {
            found.push(register(&self.directory, &self.peer_sets, &self.database.id, provider).await);
        }
        Ok(found)
    }

    async fn streamed(&self) -> NetworkResult<Vec<PeerRecord>> {
        let mut providers = self
            .transport
            .find_providers_stream(&self.database.root, self.timeout)
            .await?;

        let mut found = Vec::new();
        while let Some(provider) = providers.next().await {
            found.push(register(&self.directory, &self.peer_sets, &self.database.id, provider?).await);
        }
        Ok(found)
    }
}
