//! Deterministic timer scheduler. All protocol timers (heartbeats, SYNC,
//! consumer windows, negotiation and inhibit delays) live in one table owned
//! by the node and are driven from `Node::poll`, so timer callbacks and
//! frame handlers never race for the object dictionary.

use crate::prelude::*;

/// What a timer expiry means to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    HeartbeatProduce,
    SyncProduce,
    HeartbeatConsumerTimeout(u8),
    EmcyInhibitElapsed,
    NmtInhibitElapsed,
    FlyingMasterDelayElapsed,
    ActiveMasterDetectTimeout,
    FlyingMasterNegotiationTimeout,
    MultipleMasterDetect,
    BootSlaveTick(u8),
    BootTimeExpired,
    SdoClientTimeout(u8),
    SdoServerTimeout,
    TpdoInhibitElapsed(u8),
    RedundancyEvaluation,
}

/// Handle to an armed timer. Generation-tagged: once the slot is cancelled
/// or fires as a one-shot, stale handles stop matching, so cancellation is
/// idempotent and can never kill an unrelated re-used slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    slot: usize,
    generation: u32,
}

#[derive(Debug, Clone)]
struct Slot {
    deadline: u64,
    period: Option<u64>,
    event: TimerEvent,
    generation: u32,
    armed: bool,
}

#[derive(Debug, Default)]
pub struct TimerScheduler {
    slots: Vec<Slot>,
}

impl TimerScheduler {
    pub fn new() -> Self {
        TimerScheduler { slots: Vec::new() }
    }

    fn arm(&mut self, deadline: u64, period: Option<u64>, event: TimerEvent) -> TimerHandle {
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            if !entry.armed {
                entry.generation = entry.generation.wrapping_add(1);
                entry.deadline = deadline;
                entry.period = period;
                entry.event = event;
                entry.armed = true;
                return TimerHandle { slot, generation: entry.generation };
            }
        }
        self.slots.push(Slot { deadline, period, event, generation: 0, armed: true });
        TimerHandle { slot: self.slots.len() - 1, generation: 0 }
    }

    /// Fires once, `delay_ms` after `now_ms`.
    pub fn one_shot(&mut self, now_ms: u64, delay_ms: u64, event: TimerEvent) -> TimerHandle {
        self.arm(now_ms + delay_ms, None, event)
    }

    /// Fires every `period_ms`, first expiry one full period from `now_ms`.
    pub fn interval(&mut self, now_ms: u64, period_ms: u64, event: TimerEvent) -> TimerHandle {
        let period = period_ms.max(1);
        self.arm(now_ms + period, Some(period), event)
    }

    /// Idempotent; returns whether the timer was still armed. A cancel always
    /// beats a pending fire because expiries are only collected by `poll`.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.slots.get_mut(handle.slot) {
            Some(entry) if entry.armed && entry.generation == handle.generation => {
                entry.armed = false;
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for entry in self.slots.iter_mut() {
            entry.armed = false;
        }
    }

    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        matches!(
            self.slots.get(handle.slot),
            Some(entry) if entry.armed && entry.generation == handle.generation
        )
    }

    /// Collects every expiry due at `now_ms`, earliest deadline first.
    /// Periodic entries re-arm themselves; an entry yields at most one event
    /// per poll so a stalled caller does not observe a burst.
    pub fn poll(&mut self, now_ms: u64) -> Vec<TimerEvent> {
        let mut due: Vec<(u64, usize)> = Vec::new();
        for (slot, entry) in self.slots.iter().enumerate() {
            if entry.armed && entry.deadline <= now_ms {
                due.push((entry.deadline, slot));
            }
        }
        due.sort_unstable();

        let mut events = Vec::with_capacity(due.len());
        for (_, slot) in due {
            let entry = &mut self.slots[slot];
            events.push(entry.event);
            match entry.period {
                Some(period) => {
                    // Skip past missed periods instead of replaying them.
                    while entry.deadline <= now_ms {
                        entry.deadline += period;
                    }
                }
                None => {
                    entry.armed = false;
                    entry.generation = entry.generation.wrapping_add(1);
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot_fires_once() {
        let mut sched = TimerScheduler::new();
        sched.one_shot(0, 100, TimerEvent::HeartbeatProduce);
        assert!(sched.poll(99).is_empty());
        assert_eq!(sched.poll(100), vec![TimerEvent::HeartbeatProduce]);
        assert!(sched.poll(1000).is_empty());
    }

    #[test]
    fn test_interval_reschedules() {
        let mut sched = TimerScheduler::new();
        sched.interval(0, 50, TimerEvent::SyncProduce);
        assert_eq!(sched.poll(50), vec![TimerEvent::SyncProduce]);
        assert_eq!(sched.poll(100), vec![TimerEvent::SyncProduce]);
        // A long stall yields one event, not a backlog.
        assert_eq!(sched.poll(500), vec![TimerEvent::SyncProduce]);
        assert!(sched.poll(500).is_empty());
        assert_eq!(sched.poll(550), vec![TimerEvent::SyncProduce]);
    }

    #[test]
    fn test_cancel_is_idempotent_and_beats_fire() {
        let mut sched = TimerScheduler::new();
        let handle = sched.one_shot(0, 10, TimerEvent::EmcyInhibitElapsed);
        assert!(sched.cancel(handle));
        assert!(!sched.cancel(handle));
        assert!(sched.poll(1000).is_empty());
    }

    #[test]
    fn test_stale_handle_cannot_cancel_reused_slot() {
        let mut sched = TimerScheduler::new();
        let old = sched.one_shot(0, 10, TimerEvent::HeartbeatConsumerTimeout(1));
        sched.cancel(old);
        let new = sched.one_shot(0, 10, TimerEvent::HeartbeatConsumerTimeout(2));
        assert!(!sched.cancel(old));
        assert!(sched.is_armed(new));
        assert_eq!(sched.poll(10), vec![TimerEvent::HeartbeatConsumerTimeout(2)]);
    }

    #[test]
    fn test_expiry_ordering() {
        let mut sched = TimerScheduler::new();
        sched.one_shot(0, 30, TimerEvent::NmtInhibitElapsed);
        sched.one_shot(0, 10, TimerEvent::HeartbeatProduce);
        sched.one_shot(0, 20, TimerEvent::SyncProduce);
        assert_eq!(
            sched.poll(30),
            vec![
                TimerEvent::HeartbeatProduce,
                TimerEvent::SyncProduce,
                TimerEvent::NmtInhibitElapsed
            ]
        );
    }
}
