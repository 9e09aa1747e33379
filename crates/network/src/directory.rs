//! Known peers and the databases they host
//!
//! Both tables are shared by concurrent discovery and resolution tasks.
//! Every write is a merge, so two tasks learning about the same peer never
//! lose each other's addresses.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use replimesh_core::{PeerId, PeerRecord};

/// Process-wide table of known peers
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    peers: Arc<RwLock<HashMap<PeerId, PeerRecord>>>,
}

impl PeerDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `record` into the directory and return the merged view
    pub async fn merge(&self, record: PeerRecord) -> PeerRecord {
        let id = record.id.canonical();
        let mut peers = self.peers.write().await;
        let entry = peers.entry(id.clone()).or_insert_with(|| PeerRecord::new(id));
        let added = entry.merge(&record);
        if added > 0 {
            debug!("Learned {} new addresses for {}", added, entry.id);
        }
        entry.clone()
    }

    pub async fn get(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.peers.read().await.get(&peer.canonical()).cloned()
    }

    pub async fn contains(&self, peer: &PeerId) -> bool {
        self.peers.read().await.contains_key(&peer.canonical())
    }

    /// Every known peer, ordered by identifier
    pub async fn all(&self) -> Vec<PeerRecord> {
        let peers = self.peers.read().await;
        let mut all: Vec<_> = peers.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }
}

/// Peers of one tracked database
#[derive(Debug, Default)]
struct PeerSetEntry {
    /// Changes each time the database is tracked again
    generation: u64,
    peers: BTreeSet<PeerId>,
}

/// Peers believed to host each database, keyed by database id
///
/// Only databases that were tracked have an entry. Peers reported for any
/// other id are ignored, so a lookup that outlives its database cannot bring
/// the entry back.
#[derive(Debug, Clone, Default)]
pub struct DatabasePeerSet {
    sets: Arc<RwLock<HashMap<String, PeerSetEntry>>>,
    /// Source of entry generations
    generations: Arc<AtomicU64>,
}

impl DatabasePeerSet {
    /// Create an empty peer set table
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure `database` has a (possibly empty) entry and return its new
    /// generation. Known peers are kept.
    pub async fn track(&self, database: &str) -> u64 {
        let mut sets = self.sets.write().await;
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        sets.entry(database.to_string()).or_default().generation = generation;
        generation
    }

    /// Current generation of `database`, if tracked
    pub async fn generation(&self, database: &str) -> Option<u64> {
        self.sets.read().await.get(database).map(|entry| entry.generation)
    }

    /// Record that `peer` hosts `database`. Returns whether it was new.
    ///
    /// Returns false without recording anything when `database` is not
    /// tracked.
    pub async fn insert(&self, database: &str, peer: &PeerId) -> bool {
        match self.sets.write().await.get_mut(database) {
            Some(entry) => entry.peers.insert(peer.canonical()),
            None => {
                debug!("Ignoring peer {} for untracked database {}", peer, database);
                false
            }
        }
    }

    /// Peers of `database`, ordered by identifier
    pub async fn peers(&self, database: &str) -> Vec<PeerId> {
        self.sets
            .read()
            .await
            .get(database)
            .map(|entry| entry.peers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn count(&self, database: &str) -> usize {
        self.sets.read().await.get(database).map_or(0, |entry| entry.peers.len())
    }

    pub async fn is_tracked(&self, database: &str) -> bool {
        self.sets.read().await.contains_key(database)
    }

    /// Union of the peers of every database
    pub async fn all_peers(&self) -> BTreeSet<PeerId> {
        self.sets
            .read()
            .await
            .values()
            .flat_map(|entry| entry.peers.iter().cloned())
            .collect()
    }

    /// Drop the entry for `database`
    pub async fn remove(&self, database: &str) -> bool {
        self.sets.write().await.remove(database).is_some()
    }

    /// Drop the entry for `database` only if it is still at `generation`
    pub async fn remove_generation(&self, database: &str, generation: u64) -> bool {
        let mut sets = self.sets.write().await;
        if sets.get(database).map(|entry| entry.generation) == Some(generation) {
            sets.remove(database);
            true
        } else {
            false
        }
    }
}
