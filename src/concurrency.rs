//! Per-domain politeness slots.
//!
//! Each domain gets a slot tracking how many of its requests are in flight
//! and when the last one was dispatched. The scheduler consults the slots
//! while holding its queue lock, so checking eligibility and marking a
//! dispatch happen as one step.

use dashmap::DashMap;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Limits applied to every domain.
#[derive(Debug, Clone)]
pub struct DomainPolicy {
    /// Maximum concurrent requests per domain.
    pub concurrency: usize,
    /// Minimum gap between two dispatches to the same domain.
    pub delay: Duration,
    /// Scale each gap by a random factor in `[0.5, 1.5)`.
    pub randomize_delay: bool,
}

impl Default for DomainPolicy {
    fn default() -> Self {
        DomainPolicy {
            concurrency: 8,
            delay: Duration::ZERO,
            randomize_delay: false,
        }
    }
}

#[derive(Debug, Default)]
struct DomainSlot {
    active: usize,
    last_dispatch: Option<Instant>,
    /// Gap required after `last_dispatch`, fixed at dispatch time.
    gap: Duration,
}

/// Politeness state for all domains seen in a session.
#[derive(Debug)]
pub struct DomainSlots {
    slots: DashMap<String, DomainSlot>,
    policy: DomainPolicy,
}

impl DomainSlots {
    pub fn new(policy: DomainPolicy) -> Self {
        DomainSlots {
            slots: DashMap::new(),
            policy: DomainPolicy {
                concurrency: policy.concurrency.max(1),
                ..policy
            },
        }
    }

    pub fn policy(&self) -> &DomainPolicy {
        &self.policy
    }

    /// Time left before `domain` may be dispatched again, ignoring concurrency.
    pub fn delay_remaining(&self, domain: &str, now: Instant) -> Duration {
        self.slots
            .get(domain)
            .and_then(|slot| slot.last_dispatch.map(|last| (last + slot.gap).saturating_duration_since(now)))
            .unwrap_or(Duration::ZERO)
    }

    /// Whether a request for `domain` may be dispatched at `now`.
    pub fn is_eligible(&self, domain: &str, now: Instant) -> bool {
        match self.slots.get(domain) {
            None => true,
            Some(slot) => {
                if slot.active >= self.policy.concurrency {
                    return false;
                }
                match slot.last_dispatch {
                    Some(last) => now >= last + slot.gap,
                    None => true,
                }
            }
        }
    }

    /// Records a dispatch for `domain`.
    pub fn acquire(&self, domain: &str, now: Instant) {
        let gap = self.next_gap();
        let mut slot = self.slots.entry(domain.to_string()).or_default();
        slot.active += 1;
        slot.last_dispatch = Some(now);
        slot.gap = gap;
    }

    /// Releases one in-flight request for `domain`.
    pub fn release(&self, domain: &str) {
        if let Some(mut slot) = self.slots.get_mut(domain) {
            slot.active = slot.active.saturating_sub(1);
        }
    }

    pub fn active(&self, domain: &str) -> usize {
        self.slots.get(domain).map(|slot| slot.active).unwrap_or(0)
    }

    pub fn total_active(&self) -> usize {
        self.slots.iter().map(|slot| slot.active).sum()
    }

    pub fn last_dispatch(&self, domain: &str) -> Option<Instant> {
        self.slots.get(domain).and_then(|slot| slot.last_dispatch)
    }

    fn next_gap(&self) -> Duration {
        if self.policy.delay.is_zero() || !self.policy.randomize_delay {
            return self.policy.delay;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
        self.policy.delay.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_limit_gates_dispatch() {
        let slots = DomainSlots::new(DomainPolicy {
            concurrency: 2,
            ..DomainPolicy::default()
        });
        let now = Instant::now();

        assert!(slots.is_eligible("a.com", now));
        slots.acquire("a.com", now);
        slots.acquire("a.com", now);
        assert!(!slots.is_eligible("a.com", now));
        assert!(slots.is_eligible("b.com", now));

        slots.release("a.com");
        assert!(slots.is_eligible("a.com", now));
        assert_eq!(slots.active("a.com"), 1);
        assert_eq!(slots.total_active(), 1);
    }

    #[test]
    fn delay_gates_dispatch() {
        let slots = DomainSlots::new(DomainPolicy {
            concurrency: 4,
            delay: Duration::from_secs(2),
            randomize_delay: false,
        });
        let start = Instant::now();

        slots.acquire("a.com", start);
        slots.release("a.com");
        assert!(!slots.is_eligible("a.com", start + Duration::from_millis(1999)));
        assert!(slots.is_eligible("a.com", start + Duration::from_secs(2)));
        assert_eq!(
            slots.delay_remaining("a.com", start + Duration::from_millis(500)),
            Duration::from_millis(1500)
        );
        assert_eq!(slots.delay_remaining("b.com", start), Duration::ZERO);
    }

    #[test]
    fn randomized_gap_stays_in_range() {
        let slots = DomainSlots::new(DomainPolicy {
            concurrency: 1,
            delay: Duration::from_secs(2),
            randomize_delay: true,
        });
        for _ in 0..50 {
            let gap = slots.next_gap();
            assert!(gap >= Duration::from_secs(1) && gap < Duration::from_secs(3));
        }
    }

    #[test]
    fn release_never_underflows() {
        let slots = DomainSlots::new(DomainPolicy::default());
        slots.release("nowhere.com");
        slots.acquire("a.com", Instant::now());
        slots.release("a.com");
        slots.release("a.com");
        assert_eq!(slots.active("a.com"), 0);
    }
}
