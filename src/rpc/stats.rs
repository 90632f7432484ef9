//! Raw traffic counters shared by the servers of one node.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::MessageKind;

const KINDS: usize = MessageKind::ALL.len();

/// Statistics sink updated on every successful send and receive.
#[derive(Debug, Default)]
pub struct RpcStats {
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
    sent: [AtomicU64; KINDS],
    received: [AtomicU64; KINDS],
    timeouts: [AtomicU64; KINDS],
}

/// A point in time copy of [RpcStats].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub sent: [u64; KINDS],
    pub received: [u64; KINDS],
    pub timeouts: [u64; KINDS],
}

impl StatsSnapshot {
    pub fn sent(&self, kind: MessageKind) -> u64 {
        self.sent[kind.index()]
    }

    pub fn received(&self, kind: MessageKind) -> u64 {
        self.received[kind.index()]
    }

    pub fn timeouts(&self, kind: MessageKind) -> u64 {
        self.timeouts[kind.index()]
    }

    pub fn messages_sent(&self) -> u64 {
        self.sent.iter().sum()
    }

    pub fn messages_received(&self) -> u64 {
        self.received.iter().sum()
    }
}

impl RpcStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sent_bytes(&self, bytes: usize) {
        self.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_received_bytes(&self, bytes: usize) {
        self.received_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_sent(&self, kind: MessageKind) {
        self.sent[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_received(&self, kind: MessageKind) {
        self.received[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Counted by the kind of the request that went unanswered.
    pub fn add_timeout(&self, kind: MessageKind) {
        self.timeouts[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counters: &[AtomicU64; KINDS]| -> [u64; KINDS] {
            std::array::from_fn(|i| counters[i].load(Ordering::Relaxed))
        };

        StatsSnapshot {
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            sent: load(&self.sent),
            received: load(&self.received),
            timeouts: load(&self.timeouts),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counts_by_kind() {
        let stats = RpcStats::new();

        stats.add_sent(MessageKind::Ping);
        stats.add_sent(MessageKind::Ping);
        stats.add_received(MessageKind::Response);
        stats.add_timeout(MessageKind::FindNode);
        stats.add_sent_bytes(100);
        stats.add_received_bytes(40);

        let snapshot = stats.snapshot();

        assert_eq!(snapshot.sent(MessageKind::Ping), 2);
        assert_eq!(snapshot.received(MessageKind::Response), 1);
        assert_eq!(snapshot.timeouts(MessageKind::FindNode), 1);
        assert_eq!(snapshot.messages_sent(), 2);
        assert_eq!(snapshot.messages_received(), 1);
        assert_eq!(snapshot.sent_bytes, 100);
        assert_eq!(snapshot.received_bytes, 40);
    }
}
