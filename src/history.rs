//! Bounded, age-pruned retention of recent chat entries.

use crate::types::HistoryEntry;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;

/// Precompute the expiry lookup, indexed by the number of entries currently
/// in the buffer: `schedule[0] = 0`, `schedule[i] = base_ms * gain^(limit - i)`.
///
/// A full buffer expires its oldest entry after just `base_ms`, while the last
/// message in a quiet room sticks around for `base_ms * gain^(limit - 1)`.
pub fn expiry_schedule(limit: usize, base_ms: u64, gain: f64) -> Vec<u64> {
    let mut schedule = vec![0u64];
    for i in 1..=limit {
        let expiry = base_ms as f64 * gain.powi((limit - i) as i32);
        schedule.push(expiry as u64);
    }
    schedule
}

/// Ordered history of `(ChatEntry, media)` pairs.
///
/// Length is capped at `limit` on append; age-based expiry happens lazily on
/// read, against the precomputed schedule.
pub struct HistoryBuffer {
    entries: VecDeque<Arc<HistoryEntry>>,
    limit: usize,
    schedule: Vec<u64>,
}

impl HistoryBuffer {
    pub fn new(limit: usize, base_expiry_ms: u64, gain_factor: f64) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit),
            limit,
            schedule: expiry_schedule(limit, base_expiry_ms, gain_factor),
        }
    }

    /// Push to the back, evicting from the front while over capacity.
    pub fn append(&mut self, entry: Arc<HistoryEntry>) {
        self.entries.push_back(entry);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    /// Evict expired entries from the front, then return what remains in
    /// order. The expiry threshold depends on the current buffer length, so
    /// it is re-read after every eviction.
    pub fn snapshot(&mut self, now: DateTime<Utc>) -> Vec<Arc<HistoryEntry>> {
        while let Some(front) = self.entries.front() {
            let age_ms = now
                .signed_duration_since(front.chat.sent)
                .num_milliseconds()
                .max(0) as u64;
            if age_ms > self.schedule[self.entries.len()] {
                self.entries.pop_front();
            } else {
                break;
            }
        }
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatEntry, MediaVariants};
    use chrono::Duration;

    fn entry_sent_at(sent: DateTime<Utc>) -> Arc<HistoryEntry> {
        let mut chat = ChatEntry::new("user".to_string(), "hi", 10);
        chat.sent = sent;
        Arc::new(HistoryEntry {
            chat,
            media: MediaVariants::new(),
        })
    }

    #[test]
    fn schedule_starts_at_zero() {
        let schedule = expiry_schedule(15, 600_000, 1.2548346);
        assert_eq!(schedule.len(), 16);
        assert_eq!(schedule[0], 0);
    }

    #[test]
    fn fuller_buffers_expire_sooner() {
        // With gain > 1 the lookup shrinks as the buffer fills: a full buffer
        // expires its front after the base interval, a lone message lasts
        // gain^(limit-1) times longer.
        let base = 600_000u64;
        let schedule = expiry_schedule(15, base, 1.2548346);
        for i in 1..schedule.len() - 1 {
            assert!(schedule[i] >= schedule[i + 1], "index {i}");
        }
        assert_eq!(schedule[15], base);
        assert!(schedule[1] > base * 20);
    }

    #[test]
    fn length_never_exceeds_limit() {
        let mut history = HistoryBuffer::new(3, 600_000, 1.25);
        let now = Utc::now();
        for _ in 0..10 {
            history.append(entry_sent_at(now));
            assert!(history.len() <= 3);
        }
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn append_evicts_oldest_first() {
        let mut history = HistoryBuffer::new(2, 600_000, 1.25);
        let now = Utc::now();
        let a = entry_sent_at(now);
        let key_a = a.chat.key.clone();
        history.append(a);
        history.append(entry_sent_at(now));
        history.append(entry_sent_at(now));

        let snapshot = history.snapshot(now);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|e| e.chat.key != key_a));
    }

    #[test]
    fn snapshot_prunes_by_age() {
        // limit 2, base 1000ms, gain 2: schedule = [0, 2000, 1000]
        let mut history = HistoryBuffer::new(2, 1000, 2.0);
        let now = Utc::now();

        history.append(entry_sent_at(now - Duration::milliseconds(1500)));
        history.append(entry_sent_at(now - Duration::milliseconds(100)));

        // With two entries the threshold is 1000ms: the old front goes. After
        // that the single remaining entry is held against the 2000ms bound.
        let snapshot = history.snapshot(now);
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn lone_entries_survive_longer() {
        let mut history = HistoryBuffer::new(2, 1000, 2.0);
        let now = Utc::now();
        history.append(entry_sent_at(now - Duration::milliseconds(1500)));

        // One entry: threshold is schedule[1] = 2000ms, so 1500ms is kept.
        assert_eq!(history.snapshot(now).len(), 1);

        // But it does expire eventually.
        assert_eq!(history.snapshot(now + Duration::milliseconds(600)).len(), 0);
        assert!(history.is_empty());
    }
}
