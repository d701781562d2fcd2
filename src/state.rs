//! Activity counters the engine uses to detect that a crawl went idle.
//!
//! Requests in flight are tracked by the scheduler itself. These counters
//! cover the later stages: a response counts as parsing from the moment its
//! download finishes until every output it produced has been enqueued or
//! handed to the item channel, and an item counts until the last pipeline has
//! seen it. A download hands over to `parsing_responses` before it releases
//! its scheduler slot, so there is no window where the work is invisible.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct CrawlerState {
    pub parsing_responses: AtomicUsize,
    pub processing_items: AtomicUsize,
}

impl CrawlerState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_idle(&self) -> bool {
        self.parsing_responses.load(Ordering::SeqCst) == 0
            && self.processing_items.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn begin(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn end(counter: &AtomicUsize) {
        let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_only_when_both_stages_are_empty() {
        let state = CrawlerState::new();
        assert!(state.is_idle());
        CrawlerState::begin(&state.parsing_responses);
        assert!(!state.is_idle());
        CrawlerState::begin(&state.processing_items);
        CrawlerState::end(&state.parsing_responses);
        assert!(!state.is_idle());
        CrawlerState::end(&state.processing_items);
        assert!(state.is_idle());
        CrawlerState::end(&state.processing_items);
        assert_eq!(state.processing_items.load(Ordering::SeqCst), 0);
    }
}
