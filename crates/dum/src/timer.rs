use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    time::{Duration, Instant},
};

use crate::dialog::{DialogId, DialogSetId};

/// RTT estimate.
pub const T1: Duration = Duration::from_millis(500);

/// Maximum retransmit interval of a 2xx to INVITE.
pub const T2: Duration = Duration::from_secs(4);

/// 64*T1, how long a transaction may stay unanswered.
pub const TIMER_H: Duration = Duration::from_secs(32);

pub const STALE_REINVITE: Duration = Duration::from_secs(32);

pub const STALE_CALL: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    Dialog(DialogId),
    DialogSet(DialogSetId),
}

/// What a timeout is for. The `seq` fields guard against timers that were
/// superseded after being scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Retransmit200 { cseq: u32, interval: Duration },
    WaitForAck { cseq: u32 },
    CanDiscardAck { tid: String },
    Glare,
    StaleReInvite { seq: u32 },
    SessionExpiration { seq: u32 },
    SessionRefresh { seq: u32 },
    StaleCall { seq: u32 },
    Cancelled,
    Registration { seq: u32 },
    SubscriptionRefresh { handle: u64, seq: u32 },
    /// Drop finished dialogs and dialog sets.
    Reap,
}

#[derive(Debug, Clone)]
pub(crate) struct Timeout {
    pub target: Target,
    pub kind: TimerKind,
}

struct Entry {
    at: Instant,
    order: u64,
    timeout: Timeout,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.order == other.order
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed, the heap pops the earliest deadline first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Deadlines of every usage of a dialog usage manager.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Entry>,
    order: u64,
}

impl TimerQueue {
    pub fn schedule(&mut self, at: Instant, target: Target, kind: TimerKind) {
        self.order += 1;
        self.heap.push(Entry {
            timeout: Timeout { target, kind },
            order: self.order,
            at,
        });
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|it| it.at)
    }

    /// Remove the earliest timeout due at `now`, with its deadline.
    pub fn pop_due(&mut self, now: Instant) -> Option<(Instant, Timeout)> {
        if self.heap.peek()?.at > now {
            return None;
        }

        self.heap.pop().map(|it| (it.at, it.timeout))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Target {
        Target::DialogSet(DialogSetId {
            call_id: "a".to_string(),
            local_tag: "b".to_string(),
        })
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut timers = TimerQueue::default();
        let now = Instant::now();

        timers.schedule(now + T2, target(), TimerKind::Glare);
        timers.schedule(now + T1, target(), TimerKind::Cancelled);
        timers.schedule(now + T1, target(), TimerKind::Reap);

        assert_eq!(timers.next_deadline(), Some(now + T1));
        assert!(timers.pop_due(now).is_none());

        let due = std::iter::from_fn(|| timers.pop_due(now + T1))
            .map(|(_, it)| it.kind)
            .collect::<Vec<_>>();

        assert_eq!(due, vec![TimerKind::Cancelled, TimerKind::Reap]);
        assert_eq!(timers.len(), 1);
    }
}
