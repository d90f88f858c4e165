//! Checkout journal
//!
//! In-memory sequence of working-tree deltas: each checkout records the
//! commit transition plus the changed and unclean paths. Subscribers watch
//! the latest sequence number and are cancelled at shutdown.

use crate::store::Hash;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::SystemTime;
use tokio::sync::watch;

/// Bound on retained deltas; older entries fall off the front
const MAX_DELTAS: usize = 1024;

/// One recorded working-tree transition
#[derive(Debug, Clone)]
pub struct JournalDelta {
    pub seq: u64,
    pub time: SystemTime,
    pub from: Option<Hash>,
    pub to: Hash,
    /// Paths the checkout mutated
    pub changed_paths: Vec<String>,
    /// Locally-modified paths observed by the pre-checkout diff
    pub unclean_paths: Vec<String>,
}

struct JournalState {
    deltas: VecDeque<JournalDelta>,
    next_seq: u64,
    subscribers: Vec<watch::Sender<u64>>,
}

/// Per-mount journal of changed paths
pub struct Journal {
    state: Mutex<JournalState>,
}

impl Default for Journal {
    fn default() -> Self {
        Journal::new()
    }
}

impl Journal {
    pub fn new() -> Self {
        Journal {
            state: Mutex::new(JournalState {
                deltas: VecDeque::new(),
                next_seq: 1,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Append a checkout delta, waking subscribers
    pub fn record_checkout(
        &self,
        from: Option<Hash>,
        to: Hash,
        changed_paths: Vec<String>,
        unclean_paths: Vec<String>,
    ) -> u64 {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.deltas.push_back(JournalDelta {
            seq,
            time: SystemTime::now(),
            from,
            to,
            changed_paths,
            unclean_paths,
        });
        while state.deltas.len() > MAX_DELTAS {
            state.deltas.pop_front();
        }
        state.subscribers.retain(|tx| tx.send(seq).is_ok());
        seq
    }

    /// Highest recorded sequence number, 0 when empty
    pub fn latest_seq(&self) -> u64 {
        self.state.lock().next_seq - 1
    }

    /// Deltas strictly after `seq`, oldest first
    pub fn deltas_since(&self, seq: u64) -> Vec<JournalDelta> {
        self.state
            .lock()
            .deltas
            .iter()
            .filter(|d| d.seq > seq)
            .cloned()
            .collect()
    }

    /// Watch the latest sequence number
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        let mut state = self.state.lock();
        let (tx, rx) = watch::channel(state.next_seq - 1);
        state.subscribers.push(tx);
        rx
    }

    /// Drop every subscriber; part of mount shutdown
    pub fn cancel_subscribers(&self) {
        self.state.lock().subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_read_back() {
        let journal = Journal::new();
        assert_eq!(journal.latest_seq(), 0);

        let to = Hash([1; 20]);
        let s1 = journal.record_checkout(None, to, vec!["a".into()], vec![]);
        let s2 = journal.record_checkout(Some(to), to, vec!["b".into()], vec!["c".into()]);
        assert!(s2 > s1);
        assert_eq!(journal.latest_seq(), s2);

        let since = journal.deltas_since(s1);
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].changed_paths, ["b"]);
        assert_eq!(since[0].unclean_paths, ["c"]);
    }

    #[tokio::test]
    async fn test_subscribers_wake_and_cancel() {
        let journal = Journal::new();
        let mut rx = journal.subscribe();

        let seq = journal.record_checkout(None, Hash([2; 20]), vec![], vec![]);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), seq);

        journal.cancel_subscribers();
        assert!(rx.changed().await.is_err());
    }
}
