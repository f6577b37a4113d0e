//! Lightweight Prometheus-compatible counters for the relay.
//!
//! Atomic counters keep the packet path lock-free. The capture-layer host
//! scrapes [`RelayMetrics::render`] wherever it exposes metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Packet and connection counters
pub struct RelayMetrics {
    /// Packets seen on the egress queue (counter)
    pub egress_packets: AtomicU64,
    /// Packets seen on the ingress queue (counter)
    pub ingress_packets: AtomicU64,
    /// ACCEPT verdicts (counter)
    pub accepted: AtomicU64,
    /// DROP verdicts (counter)
    pub dropped: AtomicU64,
    /// Packets forwarded untouched: non-TCP, non-IPv4, fragments (counter)
    pub passthrough: AtomicU64,
    /// Host retransmissions replayed from the rexmit cache (counter)
    pub retransmissions: AtomicU64,
    /// Remote duplicates resolved through unachk (counter)
    pub duplicates: AtomicU64,
    /// Protocol and ordering anomalies (counter)
    pub anomalies: AtomicU64,
    /// Cipher failures, payload forwarded unmodified (counter)
    pub cipher_failures: AtomicU64,
    /// State entries removed between lookup and merge (counter)
    pub state_races: AtomicU64,
    pub connections_opened: AtomicU64,
    pub connections_closed: AtomicU64,
    pub connections_evicted: AtomicU64,
    /// Diagnostic lines lost to a full channel (counter)
    pub diagnostics_dropped: AtomicU64,
    pub start_time: Instant,
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            egress_packets: AtomicU64::new(0),
            ingress_packets: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            passthrough: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            anomalies: AtomicU64::new(0),
            cipher_failures: AtomicU64::new(0),
            state_races: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            connections_evicted: AtomicU64::new(0),
            diagnostics_dropped: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Connections opened and not yet closed or evicted
    pub fn active_connections(&self) -> u64 {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let gone = self.connections_closed.load(Ordering::Relaxed)
            + self.connections_evicted.load(Ordering::Relaxed);
        opened.saturating_sub(gone)
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let counters: [(&str, &str, &AtomicU64); 14] = [
            ("relay_egress_packets_total", "Packets received on the egress queue", &self.egress_packets),
            ("relay_ingress_packets_total", "Packets received on the ingress queue", &self.ingress_packets),
            ("relay_accepted_total", "Packets accepted", &self.accepted),
            ("relay_dropped_total", "Packets dropped", &self.dropped),
            ("relay_passthrough_total", "Packets forwarded without rewriting", &self.passthrough),
            ("relay_retransmissions_total", "Host retransmissions replayed", &self.retransmissions),
            ("relay_duplicates_total", "Remote duplicate segments resolved", &self.duplicates),
            ("relay_anomalies_total", "Protocol and ordering anomalies", &self.anomalies),
            ("relay_cipher_failures_total", "Cipher failures (payload forwarded as-is)", &self.cipher_failures),
            ("relay_state_races_total", "Connection state removed before merge", &self.state_races),
            ("relay_connections_opened_total", "Connection state entries created", &self.connections_opened),
            ("relay_connections_closed_total", "Connections closed by FIN or RST", &self.connections_closed),
            ("relay_connections_evicted_total", "Connections evicted after idle timeout", &self.connections_evicted),
            ("relay_diagnostics_dropped_total", "Diagnostic lines lost to a full channel", &self.diagnostics_dropped),
        ];

        let mut out = String::new();
        for (name, help, counter) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
                counter.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "# HELP relay_active_connections Connections currently tracked\n\
             # TYPE relay_active_connections gauge\n\
             relay_active_connections {}\n\
             # HELP relay_uptime_seconds Relay uptime in seconds\n\
             # TYPE relay_uptime_seconds gauge\n\
             relay_uptime_seconds {}\n",
            self.active_connections(),
            self.start_time.elapsed().as_secs(),
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_format() {
        let m = RelayMetrics::new();
        m.accepted.fetch_add(5, Ordering::Relaxed);
        m.dropped.fetch_add(2, Ordering::Relaxed);
        let output = m.render();
        assert!(output.contains("relay_accepted_total 5"));
        assert!(output.contains("relay_dropped_total 2"));
        assert!(output.contains("# TYPE relay_accepted_total counter"));
        assert!(output.contains("# TYPE relay_uptime_seconds gauge"));
    }

    #[test]
    fn test_metrics_default_zero() {
        let m = RelayMetrics::default();
        assert_eq!(m.egress_packets.load(Ordering::Relaxed), 0);
        assert_eq!(m.anomalies.load(Ordering::Relaxed), 0);
        assert_eq!(m.active_connections(), 0);
    }

    #[test]
    fn test_active_connections_gauge() {
        let m = RelayMetrics::new();
        m.connections_opened.fetch_add(5, Ordering::Relaxed);
        m.connections_closed.fetch_add(2, Ordering::Relaxed);
        RelayMetrics::incr(&m.connections_evicted);
        assert_eq!(m.active_connections(), 2);
        assert!(m.render().contains("relay_active_connections 2"));
    }
}
