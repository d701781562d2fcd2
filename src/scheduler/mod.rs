//! # Scheduler
//!
//! Owns the crawl frontier: the pending-request queue, the duplicate filter,
//! the offsite policy and the per-domain politeness slots.
//!
//! ## Lifecycle
//!
//! `Idle -> Running -> (Paused <-> Running) -> Draining -> Stopped`
//!
//! Requests are only handed out while `Running`. Once `Draining`, newly
//! discovered requests are salvaged for the checkpoint instead of queued, and
//! the scheduler moves to `Stopped` when nothing is in flight.
//!
//! ## Dispatch
//!
//! `next()` never blocks. It walks the queue in priority order and returns the
//! first request whose domain slot is under its concurrency limit and past its
//! download delay, marking the slot in the same critical section. When nothing
//! is eligible the engine waits on `notified()` or sleeps until
//! `next_wakeup()`.

pub mod queue;

use crate::checkpoint::SchedulerCheckpoint;
use crate::concurrency::{DomainPolicy, DomainSlots};
use crate::dupefilter::DupeFilter;
use crate::error::SpiderError;
use crate::fingerprint::Fingerprinter;
use crate::middleware::OffsitePolicy;
use crate::request::Request;
use crate::stats::StatCollector;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use queue::{OverflowPolicy, PushOutcome, QueueOrder, RequestQueue};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Longest single wait while blocked on a full queue; bounds lost wakeups.
const BLOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Paused,
    Draining,
    Stopped,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What `enqueue` did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Duplicate,
    Offsite,
    /// The queue was full under the configured overflow policy.
    Rejected,
    /// The crawl is stopping; the request is kept for the checkpoint.
    Salvaged,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub order: QueueOrder,
    /// 0 means unbounded.
    pub max_pending: usize,
    pub overflow: OverflowPolicy,
    /// How long `enqueue` may wait for space under `OverflowPolicy::Block`.
    pub block_timeout: Duration,
    pub domain_policy: DomainPolicy,
    pub fingerprinter: Fingerprinter,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            order: QueueOrder::Fifo,
            max_pending: 0,
            overflow: OverflowPolicy::Reject,
            block_timeout: Duration::from_secs(30),
            domain_policy: DomainPolicy::default(),
            fingerprinter: Fingerprinter::default(),
        }
    }
}

pub struct Scheduler {
    queue: Mutex<RequestQueue>,
    slots: DomainSlots,
    state: Mutex<SchedulerState>,
    dupefilter: Arc<dyn DupeFilter>,
    fingerprinter: Fingerprinter,
    offsite: Arc<OffsitePolicy>,
    salvaged: SegQueue<Request>,
    in_flight: AtomicUsize,
    ready: Notify,
    space: Notify,
    overflow: OverflowPolicy,
    block_timeout: Duration,
    stats: Arc<StatCollector>,
}

fn slot_key(request: &Request) -> String {
    request.domain().unwrap_or_default()
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        dupefilter: Arc<dyn DupeFilter>,
        offsite: Arc<OffsitePolicy>,
        stats: Arc<StatCollector>,
    ) -> Self {
        let max_pending = (config.max_pending > 0).then_some(config.max_pending);
        info!(
            "Scheduler configured: order {:?}, max pending {:?}, overflow {:?}, per-domain concurrency {}, delay {:?}",
            config.order,
            max_pending,
            config.overflow,
            config.domain_policy.concurrency,
            config.domain_policy.delay
        );
        Scheduler {
            queue: Mutex::new(RequestQueue::new(config.order, max_pending, config.overflow)),
            slots: DomainSlots::new(config.domain_policy),
            state: Mutex::new(SchedulerState::Idle),
            dupefilter,
            fingerprinter: config.fingerprinter,
            offsite,
            salvaged: SegQueue::new(),
            in_flight: AtomicUsize::new(0),
            ready: Notify::new(),
            space: Notify::new(),
            overflow: config.overflow,
            block_timeout: config.block_timeout,
            stats,
        }
    }

    /// Loads a checkpoint into an idle scheduler.
    ///
    /// Queued entries keep their original keys; salvaged requests are queued
    /// again behind them.
    pub fn restore(&self, checkpoint: SchedulerCheckpoint) -> Result<(), SpiderError> {
        if self.state() != SchedulerState::Idle {
            return Err(SpiderError::CorruptedState(
                "checkpoint restore attempted on a scheduler that already started".into(),
            ));
        }
        let mut queue = self.queue.lock();
        if checkpoint.order != queue.order() {
            warn!(
                "Checkpoint was taken with {:?} ordering, resuming with {:?}",
                checkpoint.order,
                queue.order()
            );
        }
        for fingerprint in checkpoint.seen {
            self.dupefilter.record(fingerprint);
        }
        let restored = checkpoint.queue.len();
        queue.restore(checkpoint.queue);
        let salvaged = checkpoint.salvaged.len();
        for request in checkpoint.salvaged {
            if let PushOutcome::Full(request) = queue.push(request) {
                warn!("Queue full while restoring; salvaged request {} kept aside", request.url);
                self.salvaged.push(*request);
            }
        }
        info!(
            "Scheduler restored {} queued and {} salvaged requests, {} fingerprints",
            restored,
            salvaged,
            self.dupefilter.len()
        );
        Ok(())
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    fn transition(&self, from: &[SchedulerState], to: SchedulerState) -> bool {
        let mut state = self.state.lock();
        if !from.contains(&state) {
            warn!("Rejected scheduler transition {} -> {}", *state, to);
            return false;
        }
        debug!("Scheduler state {} -> {}", *state, to);
        *state = to;
        drop(state);
        self.ready.notify_one();
        true
    }

    pub fn start(&self) -> bool {
        self.transition(&[SchedulerState::Idle], SchedulerState::Running)
    }

    pub fn pause(&self) -> bool {
        self.transition(&[SchedulerState::Running], SchedulerState::Paused)
    }

    pub fn resume(&self) -> bool {
        self.transition(&[SchedulerState::Paused], SchedulerState::Running)
    }

    /// Stops admitting work; in-flight requests are allowed to finish.
    pub fn request_stop(&self) -> bool {
        self.transition(
            &[SchedulerState::Running, SchedulerState::Paused],
            SchedulerState::Draining,
        )
    }

    /// Moves `Draining` to `Stopped` once nothing is in flight.
    pub fn try_finish(&self) -> bool {
        let mut state = self.state.lock();
        if *state != SchedulerState::Draining || self.in_flight() > 0 {
            return false;
        }
        debug!("Scheduler state {} -> {}", *state, SchedulerState::Stopped);
        *state = SchedulerState::Stopped;
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Stops immediately regardless of in-flight work.
    pub fn halt(&self) {
        let mut state = self.state.lock();
        if *state != SchedulerState::Stopped {
            warn!("Scheduler halted from state {}", *state);
            *state = SchedulerState::Stopped;
        }
        drop(state);
        self.ready.notify_one();
        self.space.notify_waiters();
    }

    /// Readiness signal: fires on enqueue, finish and state changes.
    pub fn notified(&self) -> Notified<'_> {
        self.ready.notified()
    }

    fn is_stopping(&self) -> bool {
        matches!(
            self.state(),
            SchedulerState::Draining | SchedulerState::Stopped
        )
    }

    /// Runs the offsite and duplicate checks. `Err` carries the verdict for
    /// requests that must not be queued.
    fn admit(&self, request: &Request) -> Result<(), EnqueueOutcome> {
        if self.offsite.rejects(request) {
            let domain = slot_key(request);
            if self.stats.record_offsite(&domain) {
                debug!("Filtered offsite request to '{}': {}", domain, request.url);
            }
            return Err(EnqueueOutcome::Offsite);
        }
        if !request.dont_filter {
            let fingerprint = self.fingerprinter.fingerprint(request);
            if !self.dupefilter.check_and_record(fingerprint) {
                trace!("Filtered duplicate request: {}", request.url);
                StatCollector::increment(&self.stats.requests_filtered_duplicate);
                return Err(EnqueueOutcome::Duplicate);
            }
        }
        if self.is_stopping() {
            trace!("Salvaging request while stopping: {}", request.url);
            StatCollector::increment(&self.stats.requests_salvaged);
            self.salvaged.push(request.clone());
            return Err(EnqueueOutcome::Salvaged);
        }
        Ok(())
    }

    fn forget(&self, request: &Request) {
        if !request.dont_filter {
            self.dupefilter.forget(&self.fingerprinter.fingerprint(request));
        }
    }

    /// Applies a push result; `Some` hands back a request that found no room.
    fn settle(&self, outcome: PushOutcome) -> Option<Request> {
        match outcome {
            PushOutcome::Queued => {
                StatCollector::increment(&self.stats.requests_enqueued);
                None
            }
            PushOutcome::QueuedEvicting(evicted) => {
                StatCollector::increment(&self.stats.requests_enqueued);
                StatCollector::increment(&self.stats.requests_dropped);
                warn!(
                    "Queue full, evicted lowest-ranked request {} (priority {})",
                    evicted.url, evicted.priority
                );
                self.forget(&evicted);
                None
            }
            PushOutcome::Full(request) => Some(*request),
        }
    }

    fn reject(&self, request: Request) -> EnqueueOutcome {
        warn!("Queue full, rejected request: {}", request.url);
        StatCollector::increment(&self.stats.requests_rejected);
        self.forget(&request);
        EnqueueOutcome::Rejected
    }

    async fn push_blocking(&self, mut request: Request) -> EnqueueOutcome {
        let deadline = Instant::now() + self.block_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline || self.is_stopping() {
                return self.reject(request);
            }
            let wait = (deadline - now).min(BLOCK_POLL_INTERVAL);
            let _ = tokio::time::timeout(wait, self.space.notified()).await;

            let outcome = self.queue.lock().push(request);
            match self.settle(outcome) {
                None => {
                    self.ready.notify_one();
                    return EnqueueOutcome::Enqueued;
                }
                Some(back) => request = back,
            }
        }
    }

    pub async fn enqueue(&self, request: Request) -> Result<EnqueueOutcome, SpiderError> {
        if let Err(verdict) = self.admit(&request) {
            return Ok(verdict);
        }
        let outcome = self.queue.lock().push(request);
        match self.settle(outcome) {
            None => {
                trace!("Enqueued request");
                self.ready.notify_one();
                Ok(EnqueueOutcome::Enqueued)
            }
            Some(request) if self.overflow == OverflowPolicy::Block => {
                Ok(self.push_blocking(request).await)
            }
            Some(request) => Ok(self.reject(request)),
        }
    }

    /// Enqueues requests yielded together by one callback.
    ///
    /// Under depth-first ordering siblings are pushed in reverse so the
    /// first-yielded sibling is dispatched first. All admitted siblings are
    /// pushed in one critical section, so dispatch never observes a partial
    /// batch. Outcomes are returned in input order.
    pub async fn enqueue_all(
        &self,
        requests: Vec<Request>,
    ) -> Result<Vec<EnqueueOutcome>, SpiderError> {
        let mut outcomes = vec![EnqueueOutcome::Enqueued; requests.len()];
        let mut admitted = Vec::with_capacity(requests.len());
        for (idx, request) in requests.into_iter().enumerate() {
            match self.admit(&request) {
                Ok(()) => admitted.push((idx, request)),
                Err(verdict) => outcomes[idx] = verdict,
            }
        }

        let mut overflow = Vec::new();
        {
            let mut queue = self.queue.lock();
            if queue.order() == QueueOrder::Lifo {
                admitted.reverse();
            }
            for (idx, request) in admitted {
                let outcome = queue.push(request);
                if let Some(back) = self.settle(outcome) {
                    overflow.push((idx, back));
                }
            }
        }
        self.ready.notify_one();

        for (idx, request) in overflow {
            outcomes[idx] = if self.overflow == OverflowPolicy::Block {
                self.push_blocking(request).await
            } else {
                self.reject(request)
            };
        }
        Ok(outcomes)
    }

    /// Hands out the next eligible request, if any. Never blocks.
    pub fn next(&self) -> Option<Request> {
        if self.state() != SchedulerState::Running {
            return None;
        }
        let now = Instant::now();
        let request = {
            let mut queue = self.queue.lock();
            let request = queue.pop_matching(|r| self.slots.is_eligible(&slot_key(r), now))?;
            self.slots.acquire(&slot_key(&request), now);
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            request
        };
        self.space.notify_waiters();
        trace!("Dispatching request: {}", request.url);
        Some(request)
    }

    /// Time until the earliest delay-gated domain becomes eligible.
    ///
    /// `None` when no queued domain is waiting on its delay. Domains held
    /// back only by their concurrency limit are woken by `finish`.
    pub fn next_wakeup(&self) -> Option<Duration> {
        let now = Instant::now();
        let queue = self.queue.lock();
        if queue.is_empty() {
            return None;
        }
        let mut checked = HashSet::new();
        let mut earliest: Option<Duration> = None;
        for request in queue.iter() {
            let domain = slot_key(request);
            if !checked.insert(domain.clone()) {
                continue;
            }
            let remaining = self.slots.delay_remaining(&domain, now);
            if remaining.is_zero() && self.slots.active(&domain) < self.slots.policy().concurrency {
                return Some(Duration::ZERO);
            }
            if !remaining.is_zero() {
                earliest = Some(earliest.map_or(remaining, |e| e.min(remaining)));
            }
        }
        earliest
    }

    /// Releases the domain slot of a dispatched request.
    pub fn finish(&self, request: &Request) {
        self.slots.release(&slot_key(request));
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.ready.notify_one();
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Nothing queued and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.is_empty() && self.in_flight() == 0
    }

    pub fn salvaged_len(&self) -> usize {
        self.salvaged.len()
    }

    pub fn slots(&self) -> &DomainSlots {
        &self.slots
    }

    pub fn snapshot(&self) -> SchedulerCheckpoint {
        let (order, queue) = {
            let queue = self.queue.lock();
            (queue.order(), queue.snapshot())
        };

        let mut salvaged = Vec::with_capacity(self.salvaged.len());
        while let Some(request) = self.salvaged.pop() {
            salvaged.push(request);
        }
        for request in &salvaged {
            self.salvaged.push(request.clone());
        }

        SchedulerCheckpoint {
            order,
            queue,
            seen: self.dupefilter.snapshot(),
            salvaged,
        }
    }
}
