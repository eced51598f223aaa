//! Lightweight Prometheus-compatible metrics for a DUNDi node.
//!
//! Uses atomic counters for lock-free instrumentation. Renders metrics in
//! Prometheus text exposition format for the `show metrics` console command.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lightweight Prometheus-compatible metrics for a DUNDi node.
#[derive(Debug)]
pub struct Metrics {
    /// Datagrams received (counter)
    pub frames_in_total: AtomicU64,
    /// Datagrams sent, retransmissions included (counter)
    pub frames_out_total: AtomicU64,
    /// Packets retransmitted after a missing ACK (counter)
    pub retransmissions_total: AtomicU64,
    /// Transactions created, both directions (counter)
    pub transactions_created_total: AtomicU64,
    /// Transactions currently alive (gauge)
    pub active_transactions: AtomicU64,
    /// Lookups started, local API and forwarded (counter)
    pub lookups_total: AtomicU64,
    /// Peers answered from cache instead of asked (counter)
    pub cache_hits_total: AtomicU64,
    /// DPDISCOVER packets sent (counter)
    pub discovers_sent_total: AtomicU64,
    /// INVALID replies to frames matching no dialog (counter)
    pub rejects_total: AtomicU64,
    /// Peers that went from reachable to UNREACHABLE (counter)
    pub peers_unreachable_total: AtomicU64,
    /// Node start time (for uptime calculation)
    pub start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_in_total: AtomicU64::new(0),
            frames_out_total: AtomicU64::new(0),
            retransmissions_total: AtomicU64::new(0),
            transactions_created_total: AtomicU64::new(0),
            active_transactions: AtomicU64::new(0),
            lookups_total: AtomicU64::new(0),
            cache_hits_total: AtomicU64::new(0),
            discovers_sent_total: AtomicU64::new(0),
            rejects_total: AtomicU64::new(0),
            peers_unreachable_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP dundi_frames_in_total Total datagrams received\n\
             # TYPE dundi_frames_in_total counter\n\
             dundi_frames_in_total {}\n\
             # HELP dundi_frames_out_total Total datagrams sent\n\
             # TYPE dundi_frames_out_total counter\n\
             dundi_frames_out_total {}\n\
             # HELP dundi_retransmissions_total Total packets retransmitted\n\
             # TYPE dundi_retransmissions_total counter\n\
             dundi_retransmissions_total {}\n\
             # HELP dundi_transactions_created_total Total transactions created\n\
             # TYPE dundi_transactions_created_total counter\n\
             dundi_transactions_created_total {}\n\
             # HELP dundi_active_transactions Current number of live transactions\n\
             # TYPE dundi_active_transactions gauge\n\
             dundi_active_transactions {}\n\
             # HELP dundi_lookups_total Total lookups started\n\
             # TYPE dundi_lookups_total counter\n\
             dundi_lookups_total {}\n\
             # HELP dundi_cache_hits_total Total peers answered from cache\n\
             # TYPE dundi_cache_hits_total counter\n\
             dundi_cache_hits_total {}\n\
             # HELP dundi_discovers_sent_total Total DPDISCOVER packets sent\n\
             # TYPE dundi_discovers_sent_total counter\n\
             dundi_discovers_sent_total {}\n\
             # HELP dundi_rejects_total Total frames rejected as INVALID\n\
             # TYPE dundi_rejects_total counter\n\
             dundi_rejects_total {}\n\
             # HELP dundi_peers_unreachable_total Total peer transitions to UNREACHABLE\n\
             # TYPE dundi_peers_unreachable_total counter\n\
             dundi_peers_unreachable_total {}\n\
             # HELP dundi_uptime_seconds Node uptime in seconds\n\
             # TYPE dundi_uptime_seconds gauge\n\
             dundi_uptime_seconds {}\n",
            self.frames_in_total.load(Ordering::Relaxed),
            self.frames_out_total.load(Ordering::Relaxed),
            self.retransmissions_total.load(Ordering::Relaxed),
            self.transactions_created_total.load(Ordering::Relaxed),
            self.active_transactions.load(Ordering::Relaxed),
            self.lookups_total.load(Ordering::Relaxed),
            self.cache_hits_total.load(Ordering::Relaxed),
            self.discovers_sent_total.load(Ordering::Relaxed),
            self.rejects_total.load(Ordering::Relaxed),
            self.peers_unreachable_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}
