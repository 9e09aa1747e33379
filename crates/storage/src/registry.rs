//! Registry of open databases
//!
//! Opens databases through the replication engine, at most once per name,
//! and keeps the peer manager in step: every open database gets a peer set,
//! its peer events forwarded, and its root announced.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use replimesh_core::PeerId;
use replimesh_network::{DatabaseCatalog, PeerManager, SearchOptions, SearchRegistry, TrackedDatabase};

use crate::access::WritePolicy;
use crate::database::{Capabilities, Database, DatabaseAddress, DatabaseOptions, Identity, OpenParams, ReplicationEngine};
use crate::{StorageError, StorageResult};

type DatabaseMap = HashMap<String, Arc<dyn Database>>;

/// Snapshot of an open database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseInfo {
    pub address: DatabaseAddress,
    pub dbname: String,
    pub id: String,
    pub options: DatabaseOptions,
    /// Whether the local identity may write
    pub can_append: bool,
    pub write: WritePolicy,
    #[serde(rename = "type")]
    pub db_type: String,
    pub uid: String,
    pub index_length: usize,
    pub access_controller_type: String,
    pub peers: Vec<PeerId>,
    pub peer_count: usize,
    pub capabilities: Capabilities,
}

/// Open databases keyed by their logical name
pub struct DatabaseRegistry {
    engine: Arc<dyn ReplicationEngine>,
    peers: Arc<PeerManager>,
    databases: Arc<RwLock<DatabaseMap>>,
    /// In-flight opens keyed by requested name
    opens: SearchRegistry<Arc<dyn Database>, StorageError>,
}

/// Find a database by logical name, id, or `root/path`
fn find_in(databases: &DatabaseMap, name: &str) -> Option<Arc<dyn Database>> {
    if let Some(db) = databases.get(name) {
        return Some(db.clone());
    }
    databases
        .values()
        .find(|db| db.id() == name || db.address().root_path() == name)
        .cloned()
}

fn tracked(db: &dyn Database) -> TrackedDatabase {
    TrackedDatabase::new(db.id(), db.address().root.clone())
}

impl DatabaseRegistry {
    pub fn new(engine: Arc<dyn ReplicationEngine>, peers: Arc<PeerManager>) -> Self {
        Self {
            engine,
            peers,
            databases: Arc::new(RwLock::new(HashMap::new())),
            opens: SearchRegistry::new(),
        }
    }

    /// Open database, if `name` refers to one
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Database>> {
        find_in(&*self.databases.read().await, name)
    }

    /// Return the database `name` refers to, opening it if needed.
    ///
    /// Concurrent opens of the same name share one underlying open.
    pub async fn open(&self, name: &str, params: OpenParams) -> StorageResult<Arc<dyn Database>> {
        if let Some(db) = self.get(name).await {
            return Ok(db);
        }

        let engine = self.engine.clone();
        let peers = self.peers.clone();
        let databases = self.databases.clone();
        let requested = name.to_string();

        let start = self
            .opens
            .begin(name, SearchOptions::default(), move || async move {
                // A racing open may have registered it since the first check
                if let Some(db) = find_in(&*databases.read().await, &requested) {
                    return Ok(db);
                }

                info!("Opening db {}", requested);
                let db = engine.open(&requested, params).await?;
                info!("Loading db {}", requested);
                db.load().await?;
                info!("Loaded db {}", db.dbname());

                peers.register_database(db.id()).await;
                databases.write().await.insert(db.dbname().to_string(), db.clone());
                if let Some(events) = db.peer_events() {
                    peers.attach(db.id(), events).await;
                }

                let database = tracked(db.as_ref());
                tokio::spawn(async move {
                    if let Err(e) = peers.announce(&database).await {
                        warn!("{}", e);
                    }
                });
                Ok(db)
            })
            .await;

        match start.handle.wait().await {
            Some(outcome) => outcome,
            None => Err(StorageError::OpenAbandoned(name.to_string())),
        }
    }

    /// Close and forget the database `name` refers to.
    ///
    /// Returns whether a database was evicted.
    pub async fn evict(&self, name: &str) -> StorageResult<bool> {
        let Some(db) = self.get(name).await else {
            return Ok(false);
        };

        db.close().await?;
        self.databases.write().await.remove(db.dbname());
        self.peers.remove_database(db.id()).await;
        info!("Unloaded db {}", db.dbname());
        Ok(true)
    }

    /// Write policy of the database `name` refers to
    pub async fn write_policy(&self, name: &str) -> Option<WritePolicy> {
        let db = self.get(name).await?;
        Some(WritePolicy::resolve(db.access().as_ref()))
    }

    /// Snapshot of the database `name` refers to
    pub async fn info(&self, name: &str) -> Option<DatabaseInfo> {
        let db = self.get(name).await?;
        Some(self.snapshot(db.as_ref()).await)
    }

    /// Snapshots of every open database keyed by name
    pub async fn list_databases(&self) -> BTreeMap<String, DatabaseInfo> {
        let open: Vec<_> = self.databases.read().await.values().cloned().collect();
        let mut list = BTreeMap::new();
        for db in open {
            list.insert(db.dbname().to_string(), self.snapshot(db.as_ref()).await);
        }
        list
    }

    /// Identity of the local node
    pub fn identity(&self) -> Identity {
        self.engine.identity()
    }

    pub async fn len(&self) -> usize {
        self.databases.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.databases.read().await.is_empty()
    }

    async fn snapshot(&self, db: &dyn Database) -> DatabaseInfo {
        let access = db.access();
        let write = WritePolicy::resolve(access.as_ref());
        let peers = self.peers.peer_sets().peers(db.id()).await;

        DatabaseInfo {
            address: db.address().clone(),
            dbname: db.dbname().to_string(),
            id: db.id().to_string(),
            options: db.options().clone(),
            can_append: write.allows(&self.engine.identity().id),
            write,
            db_type: db.db_type().to_string(),
            uid: db.uid().to_string(),
            index_length: db.index_len(),
            access_controller_type: access.controller_type().unwrap_or_else(|| "custom".to_string()),
            peer_count: peers.len(),
            peers,
            capabilities: db.capabilities(),
        }
    }
}

#[async_trait]
impl DatabaseCatalog for DatabaseRegistry {
    async fn tracked_databases(&self) -> Vec<TrackedDatabase> {
        let databases = self.databases.read().await;
        let mut list: Vec<_> = databases.values().map(|db| tracked(db.as_ref())).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::future::join_all;
    use replimesh_core::{ContentId, CoordinatorConfig, PeerRecord};
    use replimesh_network::mock::MockTransport;
    use replimesh_network::ConnectOutcome;
    use tokio::time::sleep;

    use crate::mock::{MockAccess, MockDatabase, MockEngine};

    struct Fixture {
        engine: Arc<MockEngine>,
        transport: Arc<MockTransport>,
        peers: Arc<PeerManager>,
        registry: DatabaseRegistry,
    }

    fn fixture(engine: MockEngine, transport: MockTransport) -> Fixture {
        let engine = Arc::new(engine);
        let transport = Arc::new(transport);
        let peers = Arc::new(PeerManager::new(transport.clone(), &CoordinatorConfig::default()));
        let registry = DatabaseRegistry::new(engine.clone(), peers.clone());
        Fixture {
            engine,
            transport,
            peers,
            registry,
        }
    }

    #[tokio::test]
    async fn test_concurrent_opens_share_one_open() {
        let f = fixture(
            MockEngine::default().with_open_delay(Duration::from_millis(30)),
            MockTransport::new(),
        );

        let opened = join_all((0..5).map(|_| f.registry.open("chat", OpenParams::default()))).await;
        let ids: Vec<_> = opened
            .into_iter()
            .map(|db| db.unwrap().id().to_string())
            .collect();
        assert!(ids.iter().all(|id| id == &ids[0]));

        assert_eq!(f.engine.opens(), vec!["chat".to_string()]);
        assert_eq!(f.engine.database("chat").unwrap().loads(), 1);
        assert_eq!(f.registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_lookup_by_name_id_and_root_path() {
        let f = fixture(
            MockEngine::default().with_database(MockDatabase::new("chat", "Qm123")),
            MockTransport::new(),
        );
        f.registry.open("chat", OpenParams::default()).await.unwrap();

        assert!(f.registry.get("chat").await.is_some());
        assert!(f.registry.get("/orbitdb/Qm123/chat").await.is_some());
        assert!(f.registry.get("Qm123/chat").await.is_some());
        assert!(f.registry.get("feed").await.is_none());

        // Opening by id returns the open database without touching the engine
        f.registry.open("Qm123/chat", OpenParams::default()).await.unwrap();
        assert_eq!(f.engine.opens().len(), 1);
    }

    #[tokio::test]
    async fn test_open_announces_root() {
        let f = fixture(
            MockEngine::default().with_database(MockDatabase::new("chat", "Qm123")),
            MockTransport::new(),
        );
        f.registry.open("chat", OpenParams::default()).await.unwrap();

        sleep(Duration::from_millis(10)).await;
        assert_eq!(f.transport.provided(), vec![ContentId::from("Qm123")]);
    }

    #[tokio::test]
    async fn test_failed_open_is_not_registered() {
        let f = fixture(
            MockEngine::default()
                .with_failing_open("missing")
                .with_database(MockDatabase::new("broken", "QmB").with_failing_load()),
            MockTransport::new(),
        );

        assert!(matches!(
            f.registry.open("missing", OpenParams::default()).await,
            Err(StorageError::OpenFailed { .. })
        ));
        assert!(matches!(
            f.registry.open("broken", OpenParams::default()).await,
            Err(StorageError::LoadFailed { .. })
        ));
        assert!(f.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_evict() {
        let f = fixture(
            MockEngine::default().with_database(MockDatabase::new("chat", "Qm123")),
            MockTransport::new(),
        );
        let db = f.registry.open("chat", OpenParams::default()).await.unwrap();

        assert!(f.registry.evict("/orbitdb/Qm123/chat").await.unwrap());
        assert!(!f.registry.evict("chat").await.unwrap());
        assert_eq!(f.engine.database("chat").unwrap().closes(), 1);
        assert!(f.registry.info("chat").await.is_none());
        assert!(!f.peers.peer_sets().is_tracked(db.id()).await);
    }

    #[tokio::test]
    async fn test_failed_close_keeps_database() {
        let f = fixture(
            MockEngine::default().with_database(MockDatabase::new("chat", "Qm123").with_failing_close()),
            MockTransport::new(),
        );
        f.registry.open("chat", OpenParams::default()).await.unwrap();

        assert!(matches!(
            f.registry.evict("chat").await,
            Err(StorageError::CloseFailed { .. })
        ));
        assert!(f.registry.get("chat").await.is_some());
    }

    #[tokio::test]
    async fn test_chat_info_snapshot() {
        let f = fixture(
            MockEngine::new("me").with_database(
                MockDatabase::new("chat", "Qm123")
                    .with_access(MockAccess::direct(&["me"]))
                    .with_index_len(7),
            ),
            MockTransport::new().with_providers("Qm123", vec![PeerRecord::new("P1"), PeerRecord::new("P2")]),
        );
        let db = f.registry.open("chat", OpenParams::default()).await.unwrap();

        f.peers
            .find_providers(&tracked(db.as_ref()), SearchOptions::default())
            .await
            .handle
            .wait()
            .await;

        let info = f.registry.info("chat").await.unwrap();
        assert_eq!(info.peer_count, 2);
        assert_eq!(info.peers, vec![PeerId::new("P1"), PeerId::new("P2")]);
        assert!(info.can_append);
        assert_eq!(info.index_length, 7);
        assert_eq!(info.access_controller_type, "ipfs");

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["peerCount"], 2);
        assert_eq!(json["type"], "eventlog");
        assert_eq!(json["address"]["root"], "Qm123");
        assert_eq!(json["capabilities"], serde_json::json!(["add", "get", "iterator"]));
    }

    #[tokio::test]
    async fn test_unavailable_write_policy() {
        let f = fixture(
            MockEngine::new("me").with_database(MockDatabase::new("chat", "Qm123")),
            MockTransport::new(),
        );
        f.registry.open("chat", OpenParams::default()).await.unwrap();

        assert_eq!(f.registry.write_policy("chat").await, Some(WritePolicy::Unavailable));
        let info = f.registry.info("chat").await.unwrap();
        assert!(!info.can_append);
        assert_eq!(info.access_controller_type, "custom");
        assert_eq!(serde_json::to_value(&info).unwrap()["write"], "unavailable");
    }

    #[tokio::test]
    async fn test_list_and_catalog() {
        let f = fixture(MockEngine::default(), MockTransport::new());
        let params = OpenParams {
            db_type: Some("keyvalue".to_string()),
            ..Default::default()
        };
        f.registry.open("settings", params).await.unwrap();
        f.registry.open("chat", OpenParams::default()).await.unwrap();

        let list = f.registry.list_databases().await;
        assert_eq!(list.keys().collect::<Vec<_>>(), vec!["chat", "settings"]);
        assert_eq!(list["settings"].db_type, "keyvalue");

        let tracked = f.registry.tracked_databases().await;
        assert_eq!(tracked.len(), 2);
        assert_eq!(tracked[0].root, ContentId::from("zdpuchat"));
    }

    #[test_log::test(tokio::test)]
    async fn test_peer_events_are_forwarded() {
        let f = fixture(
            MockEngine::default().with_database(MockDatabase::new("chat", "Qm123").with_peer_events(8)),
            MockTransport::new(),
        );
        let db = f.registry.open("chat", OpenParams::default()).await.unwrap();

        f.engine.database("chat").unwrap().emit_peer("P7");
        for _ in 0..100 {
            if f.peers.peer_count(db.id()).await == 1 {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(f.registry.info("chat").await.unwrap().peers, vec![PeerId::new("P7")]);
    }

    #[tokio::test]
    async fn test_reopen_during_lookup_keeps_peers() {
        let f = fixture(
            MockEngine::default().with_database(MockDatabase::new("chat", "Qm123")),
            MockTransport::new()
                .with_providers("Qm123", vec![PeerRecord::new("P1")])
                .with_provider_delay(Duration::from_millis(50)),
        );
        let db = f.registry.open("chat", OpenParams::default()).await.unwrap();
        let lookup = f
            .peers
            .find_providers(&tracked(db.as_ref()), SearchOptions::default())
            .await;

        assert!(f.registry.evict("chat").await.unwrap());
        f.registry.open("chat", OpenParams::default()).await.unwrap();

        lookup.handle.wait().await;
        sleep(Duration::from_millis(10)).await;
        assert!(f.peers.peer_sets().is_tracked(db.id()).await);
        assert_eq!(f.registry.info("chat").await.unwrap().peer_count, 1);
    }

    #[tokio::test]
    async fn test_discovery_after_evict_dials_nothing() {
        let f = fixture(
            MockEngine::default().with_database(MockDatabase::new("chat", "Qm123")),
            MockTransport::new()
                .with_providers("Qm123", vec![PeerRecord::new("P1")])
                .with_relayable("P1"),
        );
        f.registry.open("chat", OpenParams::default()).await.unwrap();
        let snapshot = f.registry.tracked_databases().await;

        f.registry.evict("chat").await.unwrap();
        f.peers.discover_all(&snapshot).await;

        assert!(f.peers.peer_sets().all_peers().await.is_empty());
        assert_eq!(f.peers.connect_pass().await, ConnectOutcome::Completed(Default::default()));
        assert!(f.transport.dials().is_empty());
    }
}
