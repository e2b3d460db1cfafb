//! Delayed phase work.
//!
//! A phase is never called directly. It is queued as a [`Work`] item with a [`Delay`] and run
//! once the caller's clock passes its due time. Each item carries the session token it was
//! queued under, so work left over from a cancelled session can be told apart from live work.

use heapless::Vec;

use crate::state::Phase;

/// Capacity of a [`WorkQueue`]. Each phase has at most one queued entry, so this never fills.
pub const QUEUE_DEPTH: usize = 8;

/// How long a phase waits before it runs again.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Delay {
    /// Run as soon as possible.
    None,
    /// Time for the source to apply a new contract.
    PpsUpdate,
    /// Spacing of software over-current samples.
    Ocp,
    /// Time for the ADC to reflect a change.
    AdcUpdate,
    /// Back-off after a transient fault.
    Retry,
    /// Period of a settled regulation loop.
    ChgLoop,
}

impl Delay {
    /// The delay in milliseconds.
    pub const fn as_millis(self) -> u64 {
        match self {
            Delay::None => 0,
            Delay::PpsUpdate => 250,
            Delay::Ocp => 1000,
            Delay::AdcUpdate => 1100,
            Delay::Retry => 2000,
            Delay::ChgLoop => 7500,
        }
    }
}

/// A queued phase.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Work {
    /// The phase to run.
    pub phase: Phase,
    /// Clock value at which the work becomes runnable, ms.
    pub due_ms: u64,
    /// Session token the work was queued under.
    pub token: u32,
}

/// A time-ordered set of [`Work`], at most one entry per phase.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    pending: Vec<Work, QUEUE_DEPTH>,
    now_ms: u64,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    /// An empty queue at time zero.
    pub const fn new() -> Self {
        WorkQueue {
            pending: Vec::new(),
            now_ms: 0,
        }
    }

    /// The latest clock value seen by [`WorkQueue::pop_due`].
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Queue `phase` to run `delay` after the current clock value.
    ///
    /// A phase that is already queued is moved to the earlier of the two due times. Returns
    /// `false` when the existing entry was due first and is kept as is.
    pub fn schedule(&mut self, phase: Phase, delay: Delay, token: u32) -> bool {
        let due_ms = self.now_ms + delay.as_millis();
        if let Some(existing) = self.pending.iter_mut().find(|w| w.phase == phase) {
            if due_ms >= existing.due_ms {
                return false;
            }
            existing.due_ms = due_ms;
            existing.token = token;
            return true;
        }
        let work = Work { phase, due_ms, token };
        // one entry per phase keeps this within capacity
        self.pending.push(work).is_ok()
    }

    /// Whether `phase` has a queued entry.
    pub fn is_queued(&self, phase: Phase) -> bool {
        self.pending.iter().any(|w| w.phase == phase)
    }

    /// Drop every queued entry and return how many there were.
    pub fn cancel_all(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }

    /// Advance the clock to `now_ms` and take the earliest entry that is due.
    pub fn pop_due(&mut self, now_ms: u64) -> Option<Work> {
        self.now_ms = self.now_ms.max(now_ms);
        let (idx, _) = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, w)| w.due_ms <= self.now_ms)
            .min_by_key(|(_, w)| w.due_ms)?;
        Some(self.pending.swap_remove(idx))
    }

    /// Due time of the earliest entry.
    pub fn next_due(&self) -> Option<u64> {
        self.pending.iter().map(|w| w.due_ms).min()
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_in_due_order() {
        let mut q = WorkQueue::new();
        assert!(q.schedule(Phase::Cc, Delay::ChgLoop, 1));
        assert!(q.schedule(Phase::UpdateBat, Delay::None, 1));
        assert_eq!(q.next_due(), Some(0));

        assert_eq!(q.pop_due(0).map(|w| w.phase), Some(Phase::UpdateBat));
        assert_eq!(q.pop_due(7499), None);
        let work = q.pop_due(7500).unwrap();
        assert_eq!(work.phase, Phase::Cc);
        assert_eq!(work.token, 1);
        assert!(q.is_empty());
    }

    #[test]
    fn delay_is_relative_to_last_poll() {
        let mut q = WorkQueue::new();
        assert_eq!(q.pop_due(10_000), None);
        q.schedule(Phase::PreCc, Delay::AdcUpdate, 3);
        assert_eq!(q.next_due(), Some(11_100));
    }

    #[test]
    fn clock_never_goes_back() {
        let mut q = WorkQueue::new();
        q.pop_due(5000);
        q.pop_due(1000);
        assert_eq!(q.now_ms(), 5000);
    }

    #[test]
    fn one_entry_per_phase() {
        let mut q = WorkQueue::new();
        assert!(q.schedule(Phase::Cv, Delay::AdcUpdate, 1));
        assert!(!q.schedule(Phase::Cv, Delay::ChgLoop, 1));
        assert_eq!(q.len(), 1);
        assert_eq!(q.next_due(), Some(1100));
    }

    #[test]
    fn requeue_pulls_entry_earlier() {
        let mut q = WorkQueue::new();
        assert!(q.schedule(Phase::Cc, Delay::ChgLoop, 1));
        assert!(q.schedule(Phase::Cc, Delay::None, 2));
        assert_eq!(q.len(), 1);
        assert_eq!(q.next_due(), Some(0));
        assert_eq!(q.pop_due(0).map(|w| w.token), Some(2));
    }

    #[test]
    fn cancel_clears_everything() {
        let mut q = WorkQueue::new();
        q.schedule(Phase::Cc, Delay::None, 1);
        q.schedule(Phase::Error, Delay::None, 1);
        assert_eq!(q.cancel_all(), 2);
        assert_eq!(q.pop_due(u64::MAX), None);
        assert_eq!(q.next_due(), None);
    }

    #[test]
    fn every_schedulable_phase_fits() {
        let mut q = WorkQueue::new();
        for phase in [
            Phase::CheckVbat,
            Phase::Preset,
            Phase::PreCc,
            Phase::UpdateBat,
            Phase::Cc,
            Phase::Cv,
            Phase::Error,
        ] {
            assert!(q.schedule(phase, Delay::Retry, 0));
        }
        assert_eq!(q.len(), 7);
    }
}
