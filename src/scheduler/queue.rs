//! Priority queue backing the scheduler.
//!
//! Requests are ordered by priority (higher first) and then by insertion
//! order. FIFO tie-breaking yields breadth-first traversal, LIFO yields
//! depth-first traversal; both use the same ordered map, only the sign of
//! the insertion sequence differs.

use crate::request::Request;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Tie-break policy among requests of equal priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueueOrder {
    /// Oldest first: breadth-first traversal.
    #[default]
    Fifo,
    /// Newest first: depth-first traversal.
    Lifo,
}

impl FromStr for QueueOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" | "bfo" | "breadth-first" | "breadth_first" => Ok(QueueOrder::Fifo),
            "lifo" | "dfo" | "depth-first" | "depth_first" => Ok(QueueOrder::Lifo),
            other => Err(format!("unknown scheduler order '{}'", other)),
        }
    }
}

/// What happens when a push would exceed the configured capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Refuse the new request.
    #[default]
    Reject,
    /// Evict the lowest-ranked pending request if the new one outranks it.
    DropLowest,
    /// Let the caller wait for space (handled by the scheduler).
    Block,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(OverflowPolicy::Reject),
            "drop-lowest" | "drop_lowest" | "droplowest" => Ok(OverflowPolicy::DropLowest),
            "block" => Ok(OverflowPolicy::Block),
            other => Err(format!("unknown overflow policy '{}'", other)),
        }
    }
}

/// Position of a request inside the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueKey {
    priority: Reverse<i32>,
    order: i64,
}

impl QueueKey {
    pub fn priority(&self) -> i32 {
        self.priority.0
    }
}

/// Result of a push.
#[derive(Debug)]
pub enum PushOutcome {
    Queued,
    /// The queue was full and the lowest-ranked request was evicted for this one.
    QueuedEvicting(Box<Request>),
    /// The queue was full; the request is handed back.
    Full(Box<Request>),
}

/// A queued request together with its key, as stored in checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub key: QueueKey,
    pub request: Request,
}

#[derive(Debug)]
pub struct RequestQueue {
    entries: BTreeMap<QueueKey, Request>,
    order: QueueOrder,
    next_seq: i64,
    capacity: Option<usize>,
    overflow: OverflowPolicy,
}

impl RequestQueue {
    /// `capacity` of `None` or zero means unbounded.
    pub fn new(order: QueueOrder, capacity: Option<usize>, overflow: OverflowPolicy) -> Self {
        RequestQueue {
            entries: BTreeMap::new(),
            order,
            next_seq: 0,
            capacity: capacity.filter(|c| *c > 0),
            overflow,
        }
    }

    pub fn order(&self) -> QueueOrder {
        self.order
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.capacity.is_some_and(|c| self.entries.len() >= c)
    }

    fn next_key(&mut self, priority: i32) -> QueueKey {
        let seq = self.next_seq;
        self.next_seq += 1;
        let order = match self.order {
            QueueOrder::Fifo => seq,
            QueueOrder::Lifo => -seq,
        };
        QueueKey {
            priority: Reverse(priority),
            order,
        }
    }

    pub fn push(&mut self, request: Request) -> PushOutcome {
        if !self.is_full() {
            let key = self.next_key(request.priority);
            self.entries.insert(key, request);
            return PushOutcome::Queued;
        }

        if self.overflow != OverflowPolicy::DropLowest {
            return PushOutcome::Full(Box::new(request));
        }

        // Only evict when the newcomer would be popped before the current last entry.
        let candidate = self.next_key(request.priority);
        let outranks = self
            .entries
            .last_key_value()
            .is_some_and(|(lowest, _)| candidate < *lowest);
        if !outranks {
            return PushOutcome::Full(Box::new(request));
        }
        match self.entries.pop_last() {
            Some((_, evicted)) => {
                self.entries.insert(candidate, request);
                PushOutcome::QueuedEvicting(Box::new(evicted))
            }
            None => PushOutcome::Full(Box::new(request)),
        }
    }

    pub fn pop(&mut self) -> Option<Request> {
        self.entries.pop_first().map(|(_, request)| request)
    }

    /// Removes and returns the first request, in queue order, accepted by `eligible`.
    ///
    /// Skipped requests keep their position.
    pub fn pop_matching<F>(&mut self, mut eligible: F) -> Option<Request>
    where
        F: FnMut(&Request) -> bool,
    {
        let key = self
            .entries
            .iter()
            .find(|(_, request)| eligible(request))
            .map(|(key, _)| *key)?;
        self.entries.remove(&key)
    }

    pub fn peek(&self) -> Option<&Request> {
        self.entries.first_key_value().map(|(_, request)| request)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.entries.values()
    }

    pub fn snapshot(&self) -> Vec<QueuedRequest> {
        self.entries
            .iter()
            .map(|(key, request)| QueuedRequest {
                key: *key,
                request: request.clone(),
            })
            .collect()
    }

    /// Re-inserts checkpointed entries under their original keys.
    ///
    /// Restored entries bypass the capacity limit; new sequence numbers
    /// continue after the largest restored one.
    pub fn restore(&mut self, entries: Vec<QueuedRequest>) {
        for entry in entries {
            let seq = entry.key.order.abs();
            if seq >= self.next_seq {
                self.next_seq = seq + 1;
            }
            self.entries.insert(entry.key, entry.request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(path: &str, priority: i32) -> Request {
        Request::get(&format!("http://example.com/{}", path))
            .unwrap()
            .with_priority(priority)
    }

    fn drain(queue: &mut RequestQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.pop())
            .map(|r| r.url.path().trim_start_matches('/').to_string())
            .collect()
    }

    #[test]
    fn priority_then_fifo() {
        let mut queue = RequestQueue::new(QueueOrder::Fifo, None, OverflowPolicy::Reject);
        queue.push(req("p5", 5));
        queue.push(req("p1", 1));
        queue.push(req("p3", 3));
        queue.push(req("p3b", 3));
        assert_eq!(drain(&mut queue), vec!["p5", "p3", "p3b", "p1"]);
    }

    #[test]
    fn priority_then_lifo() {
        let mut queue = RequestQueue::new(QueueOrder::Lifo, None, OverflowPolicy::Reject);
        queue.push(req("a", 0));
        queue.push(req("b", 0));
        queue.push(req("hi", 1));
        queue.push(req("c", 0));
        assert_eq!(drain(&mut queue), vec!["hi", "c", "b", "a"]);
    }

    #[test]
    fn reject_policy_hands_request_back() {
        let mut queue = RequestQueue::new(QueueOrder::Fifo, Some(2), OverflowPolicy::Reject);
        assert!(matches!(queue.push(req("a", 0)), PushOutcome::Queued));
        assert!(matches!(queue.push(req("b", 0)), PushOutcome::Queued));
        match queue.push(req("c", 10)) {
            PushOutcome::Full(r) => assert_eq!(r.url.path(), "/c"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn drop_lowest_evicts_only_when_outranked() {
        let mut queue = RequestQueue::new(QueueOrder::Fifo, Some(2), OverflowPolicy::DropLowest);
        queue.push(req("low", 1));
        queue.push(req("mid", 5));

        match queue.push(req("high", 9)) {
            PushOutcome::QueuedEvicting(evicted) => assert_eq!(evicted.url.path(), "/low"),
            other => panic!("unexpected {:?}", other),
        }
        // Equal priority to the lowest entry would pop after it under FIFO.
        assert!(matches!(queue.push(req("mid2", 5)), PushOutcome::Full(_)));
        assert_eq!(drain(&mut queue), vec!["high", "mid"]);
    }

    #[test]
    fn pop_matching_keeps_skipped_positions() {
        let mut queue = RequestQueue::new(QueueOrder::Fifo, None, OverflowPolicy::Reject);
        queue.push(req("a", 0));
        queue.push(req("b", 0));
        queue.push(req("c", 0));

        let picked = queue.pop_matching(|r| r.url.path() == "/b").unwrap();
        assert_eq!(picked.url.path(), "/b");
        assert_eq!(drain(&mut queue), vec!["a", "c"]);
    }

    #[test]
    fn snapshot_restore_preserves_order() {
        let mut queue = RequestQueue::new(QueueOrder::Lifo, None, OverflowPolicy::Reject);
        queue.push(req("a", 0));
        queue.push(req("b", 0));
        queue.push(req("top", 2));
        let snapshot = queue.snapshot();

        let mut restored = RequestQueue::new(QueueOrder::Lifo, None, OverflowPolicy::Reject);
        restored.restore(snapshot);
        restored.push(req("d", 0));
        assert_eq!(drain(&mut restored), vec!["top", "d", "b", "a"]);
    }

    #[test]
    fn parses_policies() {
        assert_eq!("dfo".parse::<QueueOrder>().unwrap(), QueueOrder::Lifo);
        assert_eq!("breadth-first".parse::<QueueOrder>().unwrap(), QueueOrder::Fifo);
        assert_eq!("drop-lowest".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::DropLowest);
        assert!("sideways".parse::<QueueOrder>().is_err());
    }
}
