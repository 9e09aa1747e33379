//! Connection orchestration
//!
//! Keeps the node connected to the peers of every tracked database. Only one
//! pass runs at a time; a trigger that arrives while a pass is running is
//! dropped, not queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use replimesh_core::{PeerId, PeerRecord};

use crate::directory::{DatabasePeerSet, PeerDirectory};
use crate::manager::{DatabaseCatalog, PeerManager};
use crate::resolver::PeerResolver;
use crate::transport::{DhtTransport, DialTarget};
use crate::{NetworkError, NetworkResult};

/// Summary of one connection pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectReport {
    /// Peers considered
    pub peers: usize,
    /// Already connected peers that were pinged
    pub probed: usize,
    /// Peers reached by direct dial
    pub direct: usize,
    /// Peers reached through a relay
    pub relayed: usize,
    /// Peers that could not be reached
    pub failed: usize,
}

/// Result of triggering a connection pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Another pass was already running
    Skipped,
    /// The pass ran to completion
    Completed(ConnectReport),
}

/// How a peer was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialRoute {
    Direct,
    Relayed,
}

/// Holds the pass flag and clears it when dropped, on every exit path
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Dials the peers of tracked databases
pub struct ConnectionOrchestrator {
    /// DHT transport
    transport: Arc<dyn DhtTransport>,
    /// Known peers
    directory: PeerDirectory,
    /// Peers per database
    peer_sets: DatabasePeerSet,
    /// Resolver used for peers without known addresses
    resolver: Arc<PeerResolver>,
    /// Set while a pass is running
    in_progress: AtomicBool,
}

impl ConnectionOrchestrator {
    /// Create a new orchestrator
    pub fn new(
        transport: Arc<dyn DhtTransport>,
        directory: PeerDirectory,
        peer_sets: DatabasePeerSet,
        resolver: Arc<PeerResolver>,
    ) -> Self {
        Self {
            transport,
            directory,
            peer_sets,
            resolver,
            in_progress: AtomicBool::new(false),
        }
    }

    /// Whether a pass is currently running
    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Run one connection pass unless one is already running
    pub async fn run_pass(&self) -> ConnectOutcome {
        let Some(_guard) = PassGuard::acquire(&self.in_progress) else {
            debug!("Connection pass already running, skipping");
            return ConnectOutcome::Skipped;
        };

        info!("Connecting database peers");
        let peers = self.peer_sets.all_peers().await;
        let connected = match self.transport.connections().await {
            Ok(connected) => connected,
            Err(e) => {
                warn!("Failed to get connected peers: {}", e);
                Vec::new()
            }
        };

        let mut report = ConnectReport {
            peers: peers.len(),
            ..Default::default()
        };
        for peer in peers {
            if connected.iter().any(|c| c.id.refers_to(&peer)) {
                self.probe(peer);
                report.probed += 1;
                continue;
            }

            match self.dial(&peer).await {
                Ok(DialRoute::Direct) => report.direct += 1,
                Ok(DialRoute::Relayed) => report.relayed += 1,
                Err(e) => {
                    warn!("{}", e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Finished connecting database peers: {} probed, {} direct, {} relayed, {} failed",
            report.probed, report.direct, report.relayed, report.failed
        );
        ConnectOutcome::Completed(report)
    }

    /// Fire-and-forget liveness probe
    fn probe(&self, peer: PeerId) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.ping(&peer).await {
                debug!("Ping to {} failed: {}", peer, e);
            }
        });
    }

    async fn dial(&self, peer: &PeerId) -> NetworkResult<DialRoute> {
        let direct_error = match self.dialable_record(peer).await {
            Ok(record) => match self.transport.connect(DialTarget::Direct(record)).await {
                Ok(()) => {
                    info!("Connected to peer {}", peer);
                    return Ok(DialRoute::Direct);
                }
                Err(e) => e,
            },
            Err(e) => e,
        };

        debug!("Direct dial to {} failed ({}), trying relay", peer, direct_error);
        match self.transport.connect(DialTarget::Relayed(peer.clone())).await {
            Ok(()) => {
                info!("Connected to peer {} through relay", peer);
                Ok(DialRoute::Relayed)
            }
            Err(relay_error) => Err(NetworkError::DialFailed {
                peer: peer.clone(),
                reason: format!("direct: {}; relayed: {}", direct_error, relay_error),
            }),
        }
    }

    async fn dialable_record(&self, peer: &PeerId) -> NetworkResult<PeerRecord> {
        if let Some(record) = self.directory.get(peer).await {
            if record.is_dialable() {
                return Ok(record);
            }
        }

        info!("Looking up peer {}", peer);
        match self.resolver.lookup(peer).await.handle.wait().await {
            Some(outcome) => outcome,
            None => Err(NetworkError::SearchAbandoned(peer.to_string())),
        }
    }
}

/// Spawn the periodic discover-then-connect cycle.
///
/// Each tick starts its own cycle, so a slow pass makes the next tick's
/// connection pass skip instead of piling up. The loop stops ticking when
/// `shutdown` changes or its sender is dropped, then waits for the cycles
/// still running before the returned task completes.
pub fn spawn_connect_loop(
    manager: Arc<PeerManager>,
    catalog: Arc<dyn DatabaseCatalog>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Starting connection task, every {:?}", period);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(finished) = cycles.join_next(), if !cycles.is_empty() => {
                    if let Err(e) = finished {
                        warn!("Connection cycle ended abnormally: {}", e);
                    }
                    continue;
                }
                _ = shutdown.changed() => break,
            }

            let manager = manager.clone();
            let catalog = catalog.clone();
            cycles.spawn(async move {
                let databases = catalog.tracked_databases().await;
                manager.discover_all(&databases).await;
                manager.connect_pass().await;
            });
        }

        if !cycles.is_empty() {
            debug!("Waiting for {} connection cycles to finish", cycles.len());
        }
        while let Some(finished) = cycles.join_next().await {
            if let Err(e) = finished {
                warn!("Connection cycle ended abnormally: {}", e);
            }
        }
        info!("Connection task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use multiaddr::Multiaddr;
    use tokio::time::sleep;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    async fn orchestrator(transport: &Arc<MockTransport>, peers: &[&str]) -> ConnectionOrchestrator {
        let directory = PeerDirectory::new();
        let peer_sets = DatabasePeerSet::new();
        peer_sets.track("chat").await;
        for peer in peers {
            peer_sets.insert("chat", &PeerId::new(*peer)).await;
        }
        let resolver = Arc::new(PeerResolver::new(transport.clone(), directory.clone()));
        ConnectionOrchestrator::new(transport.clone(), directory, peer_sets, resolver)
    }

    #[tokio::test]
    async fn test_connected_peers_are_pinged() {
        let transport = Arc::new(MockTransport::new().with_connection(PeerRecord::new("P1")));
        let orchestrator = orchestrator(&transport, &["P1"]).await;

        let outcome = orchestrator.run_pass().await;
        assert!(matches!(outcome, ConnectOutcome::Completed(ConnectReport { probed: 1, .. })));

        sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.pings(), vec![PeerId::new("P1")]);
        assert!(transport.dials().is_empty());
    }

    #[tokio::test]
    async fn test_direct_dial_with_known_addresses() {
        let transport = Arc::new(MockTransport::new().with_dialable("P1"));
        let orchestrator = orchestrator(&transport, &["P1"]).await;
        orchestrator
            .directory
            .merge(PeerRecord::with_addresses("P1", vec![addr("/ip4/10.0.0.1/tcp/4001")]))
            .await;

        let outcome = orchestrator.run_pass().await;
        assert!(matches!(outcome, ConnectOutcome::Completed(ConnectReport { direct: 1, .. })));
        // Addresses were already known, so no DHT lookup
        assert_eq!(transport.find_peer_calls(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_relay_fallback_and_isolated_failures() {
        let transport = Arc::new(
            MockTransport::new()
                .with_peer(PeerRecord::with_addresses("P1", vec![addr("/ip4/10.0.0.1/tcp/4001")]))
                .with_relayable("P1")
                .with_dialable("P3"),
        );
        let orchestrator = orchestrator(&transport, &["P1", "P2", "P3"]).await;
        orchestrator
            .directory
            .merge(PeerRecord::with_addresses("P3", vec![addr("/ip4/10.0.0.3/tcp/4001")]))
            .await;

        let outcome = orchestrator.run_pass().await;
        assert_eq!(
            outcome,
            ConnectOutcome::Completed(ConnectReport {
                peers: 3,
                probed: 0,
                direct: 1,
                relayed: 1,
                failed: 1,
            })
        );

        let dials = transport.dials();
        assert!(dials.contains(&DialTarget::Relayed("P1".into())));
        assert!(dials.contains(&DialTarget::Relayed("P2".into())));
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_skipped() {
        let transport = Arc::new(
            MockTransport::new()
                .with_peer(PeerRecord::with_addresses("P1", vec![addr("/ip4/10.0.0.1/tcp/4001")]))
                .with_dialable("P1")
                .with_dial_delay(Duration::from_millis(100)),
        );
        let orchestrator = Arc::new(orchestrator(&transport, &["P1"]).await);

        let first = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run_pass().await })
        };
        sleep(Duration::from_millis(30)).await;
        assert!(orchestrator.is_running());

        assert_eq!(orchestrator.run_pass().await, ConnectOutcome::Skipped);

        let first = first.await.unwrap();
        assert!(matches!(first, ConnectOutcome::Completed(ConnectReport { direct: 1, .. })));
        assert_eq!(transport.dials().len(), 1);

        // The flag is released, so the next trigger runs
        assert!(matches!(orchestrator.run_pass().await, ConnectOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_flag_released_when_pass_is_cancelled() {
        let transport = Arc::new(
            MockTransport::new()
                .with_relayable("P1")
                .with_dial_delay(Duration::from_millis(200)),
        );
        let orchestrator = Arc::new(orchestrator(&transport, &["P1"]).await);

        let pass = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run_pass().await })
        };
        sleep(Duration::from_millis(20)).await;
        pass.abort();
        let _ = pass.await;

        assert!(!orchestrator.is_running());
    }
}
