//! Precache re-announcement queue
//!
//! Numbers we have pushed upstream are re-announced when the answers we
//! pushed expire. The queue is ordered by due time; an entry being worked
//! on has its due time set to 0 and is removed unless the precache run
//! reschedules it.

use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecacheEntry {
    pub number: String,
    pub context: String,
    /// Epoch second the entry is due, 0 while being processed
    pub expiration: u64,
}

#[derive(Debug, Default)]
pub struct PrecacheQueue {
    entries: VecDeque<PrecacheEntry>,
}

impl PrecacheQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or move `number@context` so it comes due `expiration` seconds from `now`
    pub fn reschedule(&mut self, number: &str, context: &str, expiration: u64, now: u64) {
        if let Some(idx) = self
            .entries
            .iter()
            .position(|e| e.number == number && e.context.eq_ignore_ascii_case(context))
        {
            self.entries.remove(idx);
        }
        let entry = PrecacheEntry {
            number: number.to_string(),
            context: context.to_string(),
            expiration: now + expiration,
        };
        let pos = self
            .entries
            .iter()
            .position(|e| e.expiration > entry.expiration)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
    }

    /// Take the next due entry, if any.
    ///
    /// A head whose processing finished without a reschedule is dropped
    /// first. Returns `(number, context)` of the entry to precache.
    pub fn next_due(&mut self, now: u64) -> Option<(String, String)> {
        let head = self.entries.front_mut()?;
        if head.expiration == 0 {
            self.entries.pop_front();
            return None;
        }
        if head.expiration < now {
            head.expiration = 0;
            return Some((head.number.clone(), head.context.clone()));
        }
        None
    }

    /// Whether the head needs attention: processed and finished, or due
    pub fn has_work(&self, now: u64) -> bool {
        self.entries
            .front()
            .map(|e| e.expiration == 0 || e.expiration < now)
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PrecacheEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_by_expiration() {
        let mut q = PrecacheQueue::new();
        q.reschedule("300", "e164", 30, 1000);
        q.reschedule("100", "e164", 10, 1000);
        q.reschedule("200", "e164", 20, 1000);
        let order: Vec<&str> = q.iter().map(|e| e.number.as_str()).collect();
        assert_eq!(order, vec!["100", "200", "300"]);
    }

    #[test]
    fn test_reschedule_moves_existing() {
        let mut q = PrecacheQueue::new();
        q.reschedule("100", "e164", 10, 1000);
        q.reschedule("200", "e164", 20, 1000);
        q.reschedule("100", "E164", 30, 1000);
        assert_eq!(q.len(), 2);
        assert_eq!(q.iter().next().map(|e| e.number.as_str()), Some("200"));
    }

    #[test]
    fn test_next_due_lifecycle() {
        let mut q = PrecacheQueue::new();
        q.reschedule("100", "e164", 5, 1000);
        assert!(!q.has_work(1000));
        assert_eq!(q.next_due(1000), None);

        assert!(q.has_work(1006));
        assert_eq!(q.next_due(1006), Some(("100".into(), "e164".into())));
        // Being processed: not handed out twice
        assert_eq!(q.iter().next().map(|e| e.expiration), Some(0));
        // Finished without reschedule: dropped
        assert_eq!(q.next_due(1007), None);
        assert!(q.is_empty());
    }

    #[test]
    fn test_processed_entry_rescheduled() {
        let mut q = PrecacheQueue::new();
        q.reschedule("100", "e164", 0, 1000);
        assert_eq!(q.next_due(1001), Some(("100".into(), "e164".into())));
        q.reschedule("100", "e164", 60, 1001);
        assert_eq!(q.len(), 1);
        assert_eq!(q.iter().next().map(|e| e.expiration), Some(1061));
    }
}
