//! replimesh
//!
//! Peer discovery and connection coordination for replicated,
//! content-addressed databases. The [`Coordinator`] owns the database
//! registry and the peer manager and drives the periodic connect and
//! announce loops.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use replimesh_core::{init_tracing, ConfigError, ContentId, CoordinatorConfig, Multiaddr, PeerId, PeerRecord};
pub use replimesh_network::{
    AnnounceReport, ConnectOutcome, ConnectReport, DatabaseCatalog, DhtTransport, DialTarget, NetworkError,
    NetworkResult, PeerManager, SearchDetails, SearchOptions, SearchStart, TrackedDatabase,
};
pub use replimesh_storage::{
    Database, DatabaseInfo, DatabaseRegistry, Identity, OpenParams, ReplicationEngine, StorageError, StorageResult,
    WritePolicy,
};

use replimesh_network::{spawn_announce_loop, spawn_connect_loop};

/// Module version information
pub mod version {
    /// The current version of the replimesh library
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

/// Running periodic loops and the channel that stops them
struct Loops {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Builder for a [`Coordinator`]
#[derive(Default)]
pub struct CoordinatorBuilder {
    config: Option<CoordinatorConfig>,
    transport: Option<Arc<dyn DhtTransport>>,
    engine: Option<Arc<dyn ReplicationEngine>>,
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config` instead of the defaults
    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn DhtTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn ReplicationEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Build the coordinator. The loops are not started.
    pub fn build(self) -> NetworkResult<Coordinator> {
        let transport = self
            .transport
            .ok_or_else(|| NetworkError::MissingConfiguration("DHT transport".to_string()))?;
        let engine = self
            .engine
            .ok_or_else(|| NetworkError::MissingConfiguration("replication engine".to_string()))?;
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let peers = Arc::new(PeerManager::new(transport, &config));
        let registry = Arc::new(DatabaseRegistry::new(engine, peers.clone()));

        Ok(Coordinator {
            config,
            peers,
            registry,
            loops: Mutex::new(None),
        })
    }
}

/// Entry point tying databases to the peers that host them
pub struct Coordinator {
    config: CoordinatorConfig,
    peers: Arc<PeerManager>,
    registry: Arc<DatabaseRegistry>,
    loops: Mutex<Option<Loops>>,
}

impl Coordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Start the connect loop, and the announce loop when enabled.
    ///
    /// Does nothing if the loops are already running.
    pub async fn start(&self) {
        let mut loops = self.loops.lock().await;
        if loops.is_some() {
            warn!("Coordinator already started");
            return;
        }

        let (shutdown, stopped) = watch::channel(false);
        let catalog: Arc<dyn DatabaseCatalog> = self.registry.clone();
        let mut tasks = vec![spawn_connect_loop(
            self.peers.clone(),
            catalog.clone(),
            self.config.connect_interval(),
            stopped.clone(),
        )];
        if self.config.announce {
            tasks.push(spawn_announce_loop(
                self.peers.announcer(),
                catalog,
                self.config.announce_interval(),
                stopped,
            ));
        }

        info!("Coordinator started with {} periodic tasks", tasks.len());
        *loops = Some(Loops { shutdown, tasks });
    }

    /// Stop the periodic loops and wait for them to exit.
    ///
    /// A discover-and-connect cycle that is already running is awaited too,
    /// so no dial is in progress once this returns.
    pub async fn stop(&self) {
        let Some(Loops { shutdown, tasks }) = self.loops.lock().await.take() else {
            return;
        };

        let _ = shutdown.send(true);
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Periodic task ended abnormally: {}", e);
            }
        }
        info!("Coordinator stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.loops.lock().await.is_some()
    }

    /// Open the database `name` refers to, or return it if already open
    pub async fn open(&self, name: &str, params: OpenParams) -> StorageResult<Arc<dyn Database>> {
        self.registry.open(name, params).await
    }

    /// Close and forget a database. Returns whether one was open.
    pub async fn evict(&self, name: &str) -> StorageResult<bool> {
        self.registry.evict(name).await
    }

    pub async fn list_databases(&self) -> BTreeMap<String, DatabaseInfo> {
        self.registry.list_databases().await
    }

    pub async fn info(&self, name: &str) -> Option<DatabaseInfo> {
        self.registry.info(name).await
    }

    pub async fn write_policy(&self, name: &str) -> Option<WritePolicy> {
        self.registry.write_policy(name).await
    }

    /// Join or start the provider lookup for an open database.
    ///
    /// Returns `None` when `name` does not refer to an open database.
    pub async fn find_providers(&self, name: &str, options: SearchOptions) -> Option<SearchStart<Vec<PeerRecord>>> {
        let db = self.registry.get(name).await?;
        let tracked = TrackedDatabase::new(db.id(), db.address().root.clone());
        Some(self.peers.find_providers(&tracked, options).await)
    }

    /// Resolve a peer identifier to a dialable record
    pub async fn resolve(&self, peer: &PeerId) -> NetworkResult<PeerRecord> {
        self.peers.resolve(peer).await
    }

    /// Peers known to host the database `name` refers to
    pub async fn get_peers_for(&self, name: &str) -> Vec<PeerRecord> {
        match self.registry.get(name).await {
            Some(db) => self.peers.get_peers_for(db.id()).await,
            None => Vec::new(),
        }
    }

    pub async fn all_known_peers(&self) -> Vec<PeerRecord> {
        self.peers.all_known_peers().await
    }

    /// Subscribe to a database's own peer-seen events.
    ///
    /// Databases are attached on open; this re-subscribes. Returns false when
    /// `name` is not open or its engine does not report peers.
    pub async fn attach(&self, name: &str) -> bool {
        let Some(db) = self.registry.get(name).await else {
            return false;
        };
        match db.peer_events() {
            Some(events) => {
                self.peers.attach(db.id(), events).await;
                true
            }
            None => false,
        }
    }

    /// Feed peer-seen events from another source into a database's peer set.
    ///
    /// Returns false when `name` does not refer to an open database.
    pub async fn attach_events(&self, name: &str, events: broadcast::Receiver<PeerId>) -> bool {
        match self.registry.get(name).await {
            Some(db) => {
                self.peers.attach(db.id(), events).await;
                true
            }
            None => false,
        }
    }

    /// In-flight searches
    pub async fn searches(&self) -> Vec<SearchDetails> {
        self.peers.searches().await
    }

    pub fn identity(&self) -> Identity {
        self.registry.identity()
    }

    /// Announce every open database now
    pub async fn announce_all(&self) -> AnnounceReport {
        let databases = self.registry.tracked_databases().await;
        self.peers.announce_all(&databases).await
    }

    /// Run discovery for every open database now. Returns the providers found.
    pub async fn discover_all(&self) -> usize {
        let databases = self.registry.tracked_databases().await;
        self.peers.discover_all(&databases).await
    }

    /// Run a connection pass now, unless one is already running
    pub async fn connect_pass(&self) -> ConnectOutcome {
        self.peers.connect_pass().await
    }
}
