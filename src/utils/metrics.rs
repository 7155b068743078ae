use log::info;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct RelayMetrics {
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub handshakes_failed: u64,
    pub registrations_accepted: u64,
    pub registrations_rejected: u64,
    pub searches_relayed: u64,
    pub results_relayed: u64,
    pub downloads_relayed: u64,
    pub relays_dropped: u64,
    pub uptime: Duration,
    pub start_time: Instant,
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self {
            connections_accepted: 0,
            connections_closed: 0,
            handshakes_failed: 0,
            registrations_accepted: 0,
            registrations_rejected: 0,
            searches_relayed: 0,
            results_relayed: 0,
            downloads_relayed: 0,
            relays_dropped: 0,
            uptime: Duration::new(0, 0),
            start_time: Instant::now(),
        }
    }
}

/// Counters kept by the directory server.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    metrics: Arc<RwLock<RelayMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_connection_accepted(&self) {
        self.metrics.write().await.connections_accepted += 1;
    }

    pub async fn record_connection_closed(&self) {
        self.metrics.write().await.connections_closed += 1;
    }

    pub async fn record_handshake_failed(&self) {
        self.metrics.write().await.handshakes_failed += 1;
    }

    pub async fn record_registration(&self, accepted: bool) {
        let mut metrics = self.metrics.write().await;
        if accepted {
            metrics.registrations_accepted += 1;
        } else {
            metrics.registrations_rejected += 1;
        }
    }

    /// One search fanned out to `recipients` peers.
    pub async fn record_search(&self, recipients: u64) {
        self.metrics.write().await.searches_relayed += recipients;
    }

    pub async fn record_result(&self) {
        self.metrics.write().await.results_relayed += 1;
    }

    pub async fn record_download(&self) {
        self.metrics.write().await.downloads_relayed += 1;
    }

    pub async fn record_dropped(&self) {
        self.metrics.write().await.relays_dropped += 1;
    }

    pub async fn get_metrics(&self) -> RelayMetrics {
        let mut metrics = self.metrics.read().await.clone();
        metrics.uptime = metrics.start_time.elapsed();
        metrics
    }

    pub async fn log_stats(&self) {
        let metrics = self.get_metrics().await;

        info!("=== Directory Server Statistics ===");
        info!("Uptime: {:.2?}", metrics.uptime);
        info!(
            "Connections: {} accepted, {} closed, {} failed handshakes",
            metrics.connections_accepted, metrics.connections_closed, metrics.handshakes_failed
        );
        info!(
            "Registrations: {} accepted, {} rejected",
            metrics.registrations_accepted, metrics.registrations_rejected
        );
        info!(
            "Relayed: {} searches, {} results, {} downloads ({} dropped)",
            metrics.searches_relayed,
            metrics.results_relayed,
            metrics.downloads_relayed,
            metrics.relays_dropped
        );
    }
}
