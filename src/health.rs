//! Connector statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Receives periodic statistics snapshots.
pub trait HealthHandler: Send + Sync {
    fn report(&self, stats: &HealthStats);
}

/// Snapshot of the connector counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthStats {
    pub connections: usize,
    pub records_received: u64,
    pub records_dropped: u64,
    pub records_sent: u64,
    pub handshakes_started: u64,
    pub handshakes_succeeded: u64,
    pub handshakes_failed: u64,
    pub hello_verify_requests: u64,
    pub retransmissions: u64,
    pub deferred_dropped: u64,
    pub connections_evicted: u64,
    pub connections_rejected: u64,
}

macro_rules! counters {
    ($($name:ident),* $(,)?) => {
        #[derive(Debug, Default)]
        pub(crate) struct Health {
            $($name: AtomicU64,)*
        }

        impl Health {
            $(
                pub fn $name(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self, connections: usize) -> HealthStats {
                HealthStats {
                    connections,
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters!(
    records_received,
    records_dropped,
    records_sent,
    handshakes_started,
    handshakes_succeeded,
    handshakes_failed,
    hello_verify_requests,
    retransmissions,
    deferred_dropped,
    connections_evicted,
    connections_rejected,
);
