//! Announce scheduling
//!
//! Periodically publishes the content root of every tracked database so
//! other nodes can find this one as a provider.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::discovery::TrackedDatabase;
use crate::manager::DatabaseCatalog;
use crate::transport::DhtTransport;
use crate::{NetworkError, NetworkResult};

/// Summary of one announce pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnounceReport {
    /// Databases whose root was published
    pub announced: usize,
    /// Databases whose root could not be published
    pub failed: usize,
}

/// Publishes database roots on the DHT
#[derive(Clone)]
pub struct Announcer {
    transport: Arc<dyn DhtTransport>,
}

impl Announcer {
    pub fn new(transport: Arc<dyn DhtTransport>) -> Self {
        Self { transport }
    }

    /// Publish the root of one database
    pub async fn announce(&self, database: &TrackedDatabase) -> NetworkResult<()> {
        debug!("Announcing {} ({})", database.id, database.root);
        self.transport
            .provide(&database.root)
            .await
            .map_err(|e| NetworkError::AnnounceFailed {
                root: database.root.clone(),
                reason: e.to_string(),
            })
    }

    /// Publish every root in turn. A failure is logged and does not stop the pass.
    pub async fn announce_all(&self, databases: &[TrackedDatabase]) -> AnnounceReport {
        info!("Announcing {} databases", databases.len());
        let mut report = AnnounceReport::default();
        for database in databases {
            match self.announce(database).await {
                Ok(()) => report.announced += 1,
                Err(e) => {
                    warn!("{}", e);
                    report.failed += 1;
                }
            }
        }
        info!("Finished announcing: {} announced, {} failed", report.announced, report.failed);
        report
    }
}

/// Spawn the periodic announce pass, stopped through `shutdown`
pub fn spawn_announce_loop(
    announcer: Announcer,
    catalog: Arc<dyn DatabaseCatalog>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Starting announce task, every {:?}", period);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let databases = catalog.tracked_databases().await;
            announcer.announce_all(&databases).await;
        }

        info!("Announce task stopped");
    })
}
