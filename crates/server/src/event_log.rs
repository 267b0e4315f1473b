//! Bounded per-session event ring buffer.
//!
//! A reconnection cache, not a recovery log: each entry is a pre-serialized
//! frame with the revision injected at the top level. When a subscriber's
//! requested baseline has fallen off the ring, replay is refused and the
//! caller signals `lagged`.

use std::collections::VecDeque;
use std::sync::Arc;

/// Default ring capacity per session.
pub const EVENT_LOG_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct EventLogEntry {
    pub revision: u64,
    pub frame: Arc<str>,
}

#[derive(Debug)]
pub struct EventLog {
    entries: VecDeque<EventLogEntry>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        EventLog {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a frame; the oldest entry is discarded once full.
    pub fn push(&mut self, revision: u64, frame: Arc<str>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(EventLogEntry { revision, frame });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn oldest_revision(&self) -> Option<u64> {
        self.entries.front().map(|e| e.revision)
    }

    /// Events with revision greater than `since`, if the ring still covers
    /// that baseline. `None` means the gap exceeds the buffer — the
    /// subscriber must re-snapshot.
    pub fn replay_since(&self, since: u64, current_revision: u64) -> Option<Vec<Arc<str>>> {
        if since >= current_revision {
            // Nothing missed; attach live immediately.
            return Some(Vec::new());
        }
        match self.oldest_revision() {
            Some(oldest) if oldest <= since + 1 => Some(
                self.entries
                    .iter()
                    .filter(|e| e.revision > since)
                    .map(|e| e.frame.clone())
                    .collect(),
            ),
            _ => None,
        }
    }
}

impl Default for EventLog {
    fn default() -> Self {
        EventLog::new(EVENT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(revision: u64) -> Arc<str> {
        Arc::from(format!(r#"{{"revision":{revision}}}"#))
    }

    fn filled(from: u64, to: u64) -> EventLog {
        let mut log = EventLog::default();
        for r in from..=to {
            log.push(r, frame(r));
        }
        log
    }

    #[test]
    fn replay_returns_contiguous_tail() {
        let log = filled(1, 13);
        let events = log.replay_since(10, 13).expect("replay possible");
        assert_eq!(events.len(), 3);
        assert!(events[0].contains("11"));
        assert!(events[2].contains("13"));
    }

    #[test]
    fn replay_with_current_baseline_is_empty() {
        let log = filled(1, 5);
        assert_eq!(log.replay_since(5, 5).unwrap().len(), 0);
        // A baseline ahead of us (stale client clock) also attaches live.
        assert_eq!(log.replay_since(9, 5).unwrap().len(), 0);
    }

    #[test]
    fn wrap_discards_oldest_and_refuses_stale_baseline() {
        let mut log = EventLog::default();
        for r in 1..=(EVENT_LOG_CAPACITY as u64 + 1) {
            log.push(r, frame(r));
        }
        assert_eq!(log.len(), EVENT_LOG_CAPACITY);
        assert_eq!(log.oldest_revision(), Some(2));

        // Revision 1 fell off the ring: a subscriber at baseline 0 lost it.
        assert!(log
            .replay_since(0, EVENT_LOG_CAPACITY as u64 + 1)
            .is_none());
        // Baseline 1 is still servable (oldest entry is exactly 2).
        assert!(log
            .replay_since(1, EVENT_LOG_CAPACITY as u64 + 1)
            .is_some());
    }

    #[test]
    fn empty_log_refuses_nonzero_gap() {
        let log = EventLog::default();
        assert!(log.replay_since(3, 10).is_none());
        assert_eq!(log.replay_since(10, 10).unwrap().len(), 0);
    }
}
