//! Node timers
//!
//! Deadlines are plain [`Instant`]s supplied by the caller, so the state
//! machine can be driven by a real clock or a simulated one.

use std::collections::BTreeMap;
use std::time::Instant;

use canopy_core::PeerId;
use canopy_transport::ConnectionId;

/// What happens when a deadline passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// The upstream link `link` has not opened in time
    AttachTimeout { link: ConnectionId },
    /// Send the relocation instruction to a bumped occupant
    BumpSend {
        occupant: PeerId,
        link: ConnectionId,
        new_parent: PeerId,
    },
    /// Viewer-facing node with nothing left to serve
    Shutdown,
}

/// Handle used to cancel a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerKey {
    deadline: Instant,
    seq: u64,
}

impl TimerKey {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Pending timers, fired in deadline order
#[derive(Debug, Default)]
pub struct Timers {
    pending: BTreeMap<TimerKey, Timer>,
    next_seq: u64,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Instant, timer: Timer) -> TimerKey {
        self.next_seq += 1;
        let key = TimerKey {
            deadline,
            seq: self.next_seq,
        };
        self.pending.insert(key, timer);
        key
    }

    /// Returns false if the timer already fired or was cancelled
    pub fn cancel(&mut self, key: TimerKey) -> bool {
        self.pending.remove(&key).is_some()
    }

    pub fn is_pending(&self, key: TimerKey) -> bool {
        self.pending.contains_key(&key)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.keys().next().map(|k| k.deadline)
    }

    /// Remove and return the earliest timer due at `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerKey, Timer)> {
        let (&key, _) = self.pending.iter().next()?;
        if key.deadline > now {
            return None;
        }
        self.pending.remove(&key).map(|timer| (key, timer))
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fires_in_deadline_order() {
        let mut timers = Timers::new();
        let now = Instant::now();
        timers.schedule(now + Duration::from_millis(20), Timer::Shutdown);
        timers.schedule(
            now + Duration::from_millis(10),
            Timer::AttachTimeout {
                link: ConnectionId(1),
            },
        );

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(10)));
        assert!(timers.pop_due(now).is_none());

        let later = now + Duration::from_millis(30);
        let (_, first) = timers.pop_due(later).unwrap();
        let (_, second) = timers.pop_due(later).unwrap();
        assert_eq!(first, Timer::AttachTimeout { link: ConnectionId(1) });
        assert_eq!(second, Timer::Shutdown);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_equal_deadlines_keep_schedule_order() {
        let mut timers = Timers::new();
        let at = Instant::now();
        timers.schedule(at, Timer::Shutdown);
        timers.schedule(at, Timer::AttachTimeout { link: ConnectionId(4) });
        assert_eq!(timers.pop_due(at).unwrap().1, Timer::Shutdown);
    }

    #[test]
    fn test_cancel() {
        let mut timers = Timers::new();
        let key = timers.schedule(Instant::now(), Timer::Shutdown);
        assert!(timers.is_pending(key));
        assert!(timers.cancel(key));
        assert!(!timers.cancel(key));
        assert!(timers.pop_due(Instant::now()).is_none());
    }
}
