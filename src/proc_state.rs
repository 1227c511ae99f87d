use std::collections::BTreeMap;

pub const DEFAULT_PROC_STATE_HISTORY_SIZE: usize = 200;

/// Process importance, most important first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProcessState {
    Persistent,
    PersistentUi,
    Top,
    BoundForegroundService,
    ForegroundService,
    ImportantForeground,
    ImportantBackground,
    Backup,
    Service,
    Receiver,
    TopSleeping,
    HeavyWeight,
    Home,
    LastActivity,
    CachedActivity,
    CachedActivityClient,
    CachedRecent,
    CachedEmpty,
    NonExistent,
}

impl ProcessState {
    pub fn is_foreground(self) -> bool {
        self <= Self::ForegroundService
    }
}

#[derive(Debug, Clone, Default)]
pub struct ForegroundTracker {
    states: BTreeMap<u32, ProcessState>,
}

impl ForegroundTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the latest state; returns true when foreground-ness flipped.
    pub fn update(&mut self, uid: u32, state: ProcessState) -> bool {
        let was = self.is_foreground(uid);
        self.states.insert(uid, state);
        was != state.is_foreground()
    }

    /// Forgets `uid`; returns true when it had been foreground.
    pub fn remove(&mut self, uid: u32) -> bool {
        self.states
            .remove(&uid)
            .is_some_and(ProcessState::is_foreground)
    }

    pub fn state(&self, uid: u32) -> Option<ProcessState> {
        self.states.get(&uid).copied()
    }

    pub fn is_foreground(&self, uid: u32) -> bool {
        self.state(uid).is_some_and(ProcessState::is_foreground)
    }

    pub fn foreground_uids(&self) -> Vec<u32> {
        self.states
            .iter()
            .filter(|(_, state)| state.is_foreground())
            .map(|(uid, _)| *uid)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStateSeqEntry {
    pub uid: u32,
    pub seq: u64,
}

/// Fixed-capacity ring of the last process-state sequence numbers seen.
#[derive(Debug, Clone)]
pub struct ProcStateSeqHistory {
    slots: Vec<ProcStateSeqEntry>,
    capacity: usize,
    written: u64,
}

impl ProcStateSeqHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            written: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn push(&mut self, uid: u32, seq: u64) {
        let entry = ProcStateSeqEntry { uid, seq };
        let index = (self.written % self.capacity as u64) as usize;
        if index < self.slots.len() {
            self.slots[index] = entry;
        } else {
            self.slots.push(entry);
        }
        self.written += 1;
    }

    /// Most recent first.
    pub fn recent(&self) -> impl Iterator<Item = ProcStateSeqEntry> + '_ {
        let len = self.slots.len() as u64;
        let capacity = self.capacity as u64;
        (1..=len).map(move |back| {
            let index = (self.written - back) % capacity;
            self.slots[index as usize]
        })
    }

    pub fn dump(&self) -> String {
        if self.is_empty() {
            return "NONE".to_string();
        }
        self.recent()
            .map(|e| format!("UID={} procStateSeq={}", e.uid, e.seq))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for ProcStateSeqHistory {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_STATE_HISTORY_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const CAPACITY: usize = 10;

    fn expected_dump(total: u64, capacity: usize) -> String {
        let shown = (total as usize).min(capacity) as u64;
        (0..shown)
            .map(|i| {
                let n = total - 1 - i;
                format!("UID={} procStateSeq={}", 10_000 + n, n * 3)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn filled(total: u64) -> ProcStateSeqHistory {
        let mut history = ProcStateSeqHistory::new(CAPACITY);
        for n in 0..total {
            history.push(10_000 + n as u32, n * 3);
        }
        history
    }

    #[test]
    fn foreground_is_foreground_service_or_better() {
        assert!(ProcessState::Persistent.is_foreground());
        assert!(ProcessState::Top.is_foreground());
        assert!(ProcessState::ForegroundService.is_foreground());
        assert!(!ProcessState::ImportantForeground.is_foreground());
        assert!(!ProcessState::CachedEmpty.is_foreground());
    }

    #[test]
    fn tracker_reports_foreground_flips() {
        let mut tracker = ForegroundTracker::new();
        assert!(tracker.update(10_001, ProcessState::Top));
        assert!(!tracker.update(10_001, ProcessState::ForegroundService));
        assert!(tracker.update(10_001, ProcessState::Service));
        assert!(!tracker.update(10_002, ProcessState::CachedEmpty));
        assert!(tracker.update(10_002, ProcessState::BoundForegroundService));

        assert_eq!(tracker.foreground_uids(), vec![10_002]);
        assert!(tracker.remove(10_002));
        assert!(!tracker.remove(10_002));
        assert!(!tracker.is_foreground(10_002));
        assert_eq!(tracker.state(10_001), Some(ProcessState::Service));
    }

    #[test]
    fn empty_history_dumps_none() {
        assert_eq!(filled(0).dump(), "NONE");
    }

    #[test]
    fn partial_history_dumps_most_recent_first() {
        let half = (CAPACITY / 2) as u64;
        let history = filled(half);
        assert_eq!(history.len(), CAPACITY / 2);
        assert_eq!(history.dump(), expected_dump(half, CAPACITY));
    }

    #[test]
    fn full_history_dumps_every_entry() {
        let history = filled(CAPACITY as u64);
        assert_eq!(history.dump(), expected_dump(CAPACITY as u64, CAPACITY));
        assert_eq!(history.dump().lines().count(), CAPACITY);
    }

    #[test]
    fn overflowing_history_keeps_latest_capacity_entries() {
        let total = (CAPACITY + CAPACITY / 2) as u64;
        let history = filled(total);
        assert_eq!(history.len(), CAPACITY);
        assert_eq!(history.dump(), expected_dump(total, CAPACITY));
        assert_eq!(
            history.recent().next(),
            Some(ProcStateSeqEntry {
                uid: 10_000 + total as u32 - 1,
                seq: (total - 1) * 3,
            })
        );
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut history = ProcStateSeqHistory::new(0);
        history.push(10_000, 1);
        history.push(10_001, 2);
        assert_eq!(history.capacity(), 1);
        assert_eq!(history.dump(), "UID=10001 procStateSeq=2");
    }
}
