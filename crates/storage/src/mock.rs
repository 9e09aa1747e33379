//! In-memory replication engine for testing
//!
//! Databases are either registered up front with [`MockEngine::with_database`]
//! or generated on open from the requested name and type.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::sleep;

use replimesh_core::PeerId;

use crate::access::AccessController;
use crate::database::{
    Capabilities, Capability, Database, DatabaseAddress, DatabaseOptions, Identity, OpenParams, ReplicationEngine,
};
use crate::{StorageError, StorageResult};

/// Capabilities of the common database types
pub fn capabilities_for(db_type: &str) -> Capabilities {
    use Capability::*;

    let caps: &[Capability] = match db_type {
        "eventlog" => &[Add, Get, Iterator],
        "feed" => &[Add, Get, Iterator, Remove],
        "keyvalue" => &[Get, Put, Remove],
        "docstore" => &[Get, Put, Query, Remove],
        "counter" => &[Inc, Value],
        _ => &[],
    };
    caps.iter().copied().collect()
}

/// Access controller with a fixed write list in a chosen place
#[derive(Debug, Clone, Default)]
pub struct MockAccess {
    pub write: Option<Vec<String>>,
    pub granted_write: Option<Vec<String>>,
    pub options_write: Option<Vec<String>>,
    pub controller_type: Option<String>,
}

impl MockAccess {
    /// Controller holding `keys` as its direct write list
    pub fn direct(keys: &[&str]) -> Self {
        Self {
            write: Some(keys.iter().map(|k| k.to_string()).collect()),
            controller_type: Some("ipfs".to_string()),
            ..Default::default()
        }
    }
}

impl AccessController for MockAccess {
    fn write(&self) -> Option<Vec<String>> {
        self.write.clone()
    }

    fn get(&self, capability: &str) -> Option<Vec<String>> {
        match capability {
            "write" => self.granted_write.clone(),
            _ => None,
        }
    }

    fn options_write(&self) -> Option<Vec<String>> {
        self.options_write.clone()
    }

    fn controller_type(&self) -> Option<String> {
        self.controller_type.clone()
    }
}

/// An in-memory database
#[derive(Debug)]
pub struct MockDatabase {
    id: String,
    dbname: String,
    address: DatabaseAddress,
    db_type: String,
    uid: String,
    options: DatabaseOptions,
    access: Arc<MockAccess>,
    index_len: usize,
    capabilities: Capabilities,
    fail_load: bool,
    fail_close: bool,
    loads: AtomicUsize,
    closes: AtomicUsize,
    events: Option<broadcast::Sender<PeerId>>,
}

impl MockDatabase {
    /// An event log called `name` stored under `root`
    pub fn new(name: &str, root: &str) -> Self {
        let address = DatabaseAddress::new(root, name);
        Self {
            id: address.to_string(),
            dbname: name.to_string(),
            uid: format!("{}-uid", name),
            address,
            db_type: "eventlog".to_string(),
            options: DatabaseOptions::default(),
            access: Arc::new(MockAccess::default()),
            index_len: 0,
            capabilities: capabilities_for("eventlog"),
            fail_load: false,
            fail_close: false,
            loads: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            events: None,
        }
    }

    pub fn with_type(mut self, db_type: &str) -> Self {
        self.db_type = db_type.to_string();
        self.capabilities = capabilities_for(db_type);
        self
    }

    pub fn with_options(mut self, options: DatabaseOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_access(mut self, access: MockAccess) -> Self {
        self.access = Arc::new(access);
        self
    }

    pub fn with_index_len(mut self, index_len: usize) -> Self {
        self.index_len = index_len;
        self
    }

    pub fn with_failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    pub fn with_failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Report peer-seen events through a channel of `capacity`
    pub fn with_peer_events(mut self, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        self.events = Some(sender);
        self
    }

    /// Announce that `peer` was seen replicating this database
    pub fn emit_peer(&self, peer: impl Into<PeerId>) -> bool {
        match &self.events {
            Some(events) => events.send(peer.into()).is_ok(),
            None => false,
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Database for MockDatabase {
    fn id(&self) -> &str {
        &self.id
    }

    fn dbname(&self) -> &str {
        &self.dbname
    }

    fn address(&self) -> &DatabaseAddress {
        &self.address
    }

    fn db_type(&self) -> &str {
        &self.db_type
    }

    fn uid(&self) -> &str {
        &self.uid
    }

    fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    fn access(&self) -> Arc<dyn AccessController> {
        self.access.clone()
    }

    fn index_len(&self) -> usize {
        self.index_len
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn load(&self) -> StorageResult<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_load {
            return Err(StorageError::LoadFailed {
                name: self.dbname.clone(),
                reason: "corrupt local log".to_string(),
            });
        }
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(StorageError::CloseFailed {
                name: self.dbname.clone(),
                reason: "store busy".to_string(),
            });
        }
        Ok(())
    }

    fn peer_events(&self) -> Option<broadcast::Receiver<PeerId>> {
        self.events.as_ref().map(broadcast::Sender::subscribe)
    }
}

#[derive(Debug, Default)]
struct EngineState {
    databases: HashMap<String, Arc<MockDatabase>>,
    failing: HashSet<String>,
    opens: Vec<String>,
}

/// An in-memory replication engine
#[derive(Debug)]
pub struct MockEngine {
    identity: Identity,
    state: Mutex<EngineState>,
    open_delay: Duration,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new("local-identity")
    }
}

impl MockEngine {
    /// Engine whose local identity is `identity`
    pub fn new(identity: &str) -> Self {
        Self {
            identity: Identity::new(identity),
            state: Mutex::new(EngineState::default()),
            open_delay: Duration::ZERO,
        }
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serve `database` when its name is opened
    pub fn with_database(self, database: MockDatabase) -> Self {
        self.state()
            .databases
            .insert(database.dbname.clone(), Arc::new(database));
        self
    }

    /// Make opening `name` fail
    pub fn with_failing_open(self, name: &str) -> Self {
        self.state().failing.insert(name.to_string());
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Database served for `name`, once opened or registered
    pub fn database(&self, name: &str) -> Option<Arc<MockDatabase>> {
        self.state().databases.get(name).cloned()
    }

    /// Names passed to `open`, in order
    pub fn opens(&self) -> Vec<String> {
        self.state().opens.clone()
    }
}

#[async_trait]
impl ReplicationEngine for MockEngine {
    async fn open(&self, name: &str, params: OpenParams) -> StorageResult<Arc<dyn Database>> {
        self.state().opens.push(name.to_string());
        sleep(self.open_delay).await;

        let mut state = self.state();
        if state.failing.contains(name) {
            return Err(StorageError::OpenFailed {
                name: name.to_string(),
                reason: "no such database".to_string(),
            });
        }

        let database: Arc<dyn Database> = state
            .databases
            .entry(name.to_string())
            .or_insert_with(|| {
                let db_type = params.db_type.as_deref().unwrap_or("eventlog");
                let access = MockAccess {
                    write: params.write.clone(),
                    ..Default::default()
                };
                Arc::new(
                    MockDatabase::new(name, &format!("zdpu{}", name))
                        .with_type(db_type)
                        .with_options(params.options.clone())
                        .with_access(access),
                )
            })
            .clone();
        Ok(database)
    }

    fn identity(&self) -> Identity {
        self.identity.clone()
    }
}
