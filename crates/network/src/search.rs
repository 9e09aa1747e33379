//! Search deduplication
//!
//! At most one search runs per key. Callers that arrive while a search is in
//! flight get a handle on the running one instead of starting another. The
//! entry is removed as soon as the search settles, whether or not anyone is
//! awaiting it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::peekable::Peekable;
use crate::NetworkError;

/// Options a search was started with
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOptions {
    /// Lookup timeout handed to the transport, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Use the streaming provider lookup for this search
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_custom_provider_lookup: Option<bool>,
}

/// Introspection view of a search
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDetails {
    /// Search key
    pub key: String,
    /// When the search started, if it is in flight
    pub started_at: Option<DateTime<Utc>>,
    /// Options the search was started with
    pub options: SearchOptions,
}

/// Handle on an in-flight or settled search
#[derive(Debug)]
pub struct SearchHandle<T, E = NetworkError> {
    key: String,
    started_at: DateTime<Utc>,
    options: SearchOptions,
    result: Peekable<T, E>,
}

impl<T, E> Clone for SearchHandle<T, E> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            started_at: self.started_at,
            options: self.options.clone(),
            result: self.result.clone(),
        }
    }
}

impl<T, E> SearchHandle<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn options(&self) -> &SearchOptions {
        &self.options
    }

    /// Peekable view of the outcome
    pub fn result(&self) -> &Peekable<T, E> {
        &self.result
    }

    /// Introspection view of this search
    pub fn details(&self) -> SearchDetails {
        SearchDetails {
            key: self.key.clone(),
            started_at: Some(self.started_at),
            options: self.options.clone(),
        }
    }

    /// Wait for the search to settle.
    ///
    /// Returns `None` if the search task was dropped without an outcome.
    pub async fn wait(&self) -> Option<Result<T, E>> {
        self.result.settled().await
    }
}

/// Outcome of [`SearchRegistry::begin`]
#[derive(Debug, Clone)]
pub struct SearchStart<T, E = NetworkError> {
    /// Whether this call started the search
    pub is_new: bool,
    /// The search, new or shared
    pub handle: SearchHandle<T, E>,
}

/// Registry entry, tagged so a stale completion cannot remove a newer search
#[derive(Debug)]
struct Entry<T, E> {
    generation: u64,
    handle: SearchHandle<T, E>,
}

/// Map of in-flight searches keyed by peer or database identifier
#[derive(Debug)]
pub struct SearchRegistry<T, E = NetworkError> {
    /// In-flight searches
    searches: Arc<RwLock<HashMap<String, Entry<T, E>>>>,
    /// Source of entry generations
    generations: Arc<AtomicU64>,
}

impl<T, E> Clone for SearchRegistry<T, E> {
    fn clone(&self) -> Self {
        Self {
            searches: self.searches.clone(),
            generations: self.generations.clone(),
        }
    }
}

impl<T, E> Default for SearchRegistry<T, E> {
    fn default() -> Self {
        Self {
            searches: Arc::new(RwLock::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<T, E> SearchRegistry<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the search for `key`, starting it with `search` if none is in flight.
    ///
    /// `search` is only invoked when this call starts the search.
    pub async fn begin<S, Fut>(&self, key: &str, options: SearchOptions, search: S) -> SearchStart<T, E>
    where
        S: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut searches = self.searches.write().await;
        if let Some(entry) = searches.get(key) {
            debug!("Joining in-flight search for {}", key);
            return SearchStart {
                is_new: false,
                handle: entry.handle.clone(),
            };
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let handle = SearchHandle {
            key: key.to_string(),
            started_at: Utc::now(),
            options,
            result: Peekable::spawn(search()),
        };
        searches.insert(
            key.to_string(),
            Entry {
                generation,
                handle: handle.clone(),
            },
        );
        drop(searches);

        // Clear the entry once the search settles, independently of any caller
        let registry = self.clone();
        let watched = handle.clone();
        tokio::spawn(async move {
            watched.wait().await;
            registry.finish(watched.key(), generation).await;
        });

        SearchStart { is_new: true, handle }
    }

    /// Remove the search for `key` regardless of its state.
    ///
    /// Returns whether an entry was removed.
    pub async fn complete(&self, key: &str) -> bool {
        self.searches.write().await.remove(key).is_some()
    }

    async fn finish(&self, key: &str, generation: u64) {
        let mut searches = self.searches.write().await;
        if searches.get(key).map(|entry| entry.generation) == Some(generation) {
            searches.remove(key);
            debug!("Search for {} settled", key);
        }
    }

    /// Handle on the in-flight search for `key`, if any
    pub async fn get(&self, key: &str) -> Option<SearchHandle<T, E>> {
        self.searches.read().await.get(key).map(|entry| entry.handle.clone())
    }

    /// Details of the search for `key`, or empty defaults when none is in flight
    pub async fn details(&self, key: &str) -> SearchDetails {
        match self.get(key).await {
            Some(handle) => handle.details(),
            None => SearchDetails {
                key: key.to_string(),
                ..Default::default()
            },
        }
    }

    /// Details of every in-flight search
    pub async fn searches(&self) -> Vec<SearchDetails> {
        let searches = self.searches.read().await;
        let mut details: Vec<_> = searches.values().map(|entry| entry.handle.details()).collect();
        details.sort_by(|a, b| a.key.cmp(&b.key));
        details
    }

    /// Number of in-flight searches
    pub async fn len(&self) -> usize {
        self.searches.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.searches.read().await.is_empty()
    }

    /// Whether a search for `key` is in flight
    pub async fn contains(&self, key: &str) -> bool {
        self.searches.read().await.contains_key(key)
    }
}
