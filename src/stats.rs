//! Crawl statistics.
//!
//! `StatCollector` is shared by every stage of the engine. Counters are
//! atomics; keyed counters (status codes, offsite domains, failure kinds)
//! live in `DashMap`s. A `StatsSnapshot` is taken for every report so the
//! numbers printed together are read together.

use crate::error::SpiderError;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub requests_enqueued: usize,
    pub requests_sent: usize,
    pub requests_succeeded: usize,
    pub requests_retried: usize,
    pub requests_redirected: usize,
    pub requests_dropped: usize,
    pub requests_filtered_duplicate: usize,
    pub requests_filtered_offsite: usize,
    pub requests_rejected: usize,
    pub requests_salvaged: usize,
    pub requests_failed_permanently: usize,
    pub requests_aborted: usize,
    pub responses_received: usize,
    pub total_bytes_downloaded: usize,
    pub items_scraped: usize,
    pub items_processed: usize,
    pub items_dropped_by_pipeline: usize,
    pub response_status_counts: BTreeMap<u16, usize>,
    pub offsite_domains: BTreeMap<String, usize>,
    pub failure_kinds: BTreeMap<String, usize>,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl StatsSnapshot {
    fn per_second(&self, count: usize) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            count as f64 / secs
        } else {
            0.0
        }
    }

    fn formatted_bytes(&self) -> String {
        const KB: usize = 1024;
        const MB: usize = 1024 * KB;
        const GB: usize = 1024 * MB;

        let bytes = self.total_bytes_downloaded;
        if bytes >= GB {
            format!("{:.2} GB", bytes as f64 / GB as f64)
        } else if bytes >= MB {
            format!("{:.2} MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2} KB", bytes as f64 / KB as f64)
        } else {
            format!("{} B", bytes)
        }
    }
}

fn join_counts<K: std::fmt::Display>(counts: &BTreeMap<K, usize>) -> String {
    if counts.is_empty() {
        return "none".to_string();
    }
    counts
        .iter()
        .map(|(key, count)| format!("{}: {}", key, count))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug)]
pub struct StatCollector {
    start_time: Instant,

    pub requests_enqueued: AtomicUsize,
    pub requests_sent: AtomicUsize,
    pub requests_succeeded: AtomicUsize,
    pub requests_retried: AtomicUsize,
    pub requests_redirected: AtomicUsize,
    /// Dropped by a middleware or a scheduler overflow eviction.
    pub requests_dropped: AtomicUsize,
    pub requests_filtered_duplicate: AtomicUsize,
    pub requests_filtered_offsite: AtomicUsize,
    pub requests_rejected: AtomicUsize,
    pub requests_salvaged: AtomicUsize,
    pub requests_failed_permanently: AtomicUsize,
    /// Aborted by an internal middleware error.
    pub requests_aborted: AtomicUsize,

    pub responses_received: AtomicUsize,
    pub total_bytes_downloaded: AtomicUsize,
    response_status_counts: DashMap<u16, usize>,

    pub items_scraped: AtomicUsize,
    pub items_processed: AtomicUsize,
    pub items_dropped_by_pipeline: AtomicUsize,

    offsite_domains: DashMap<String, usize>,
    failure_kinds: DashMap<String, usize>,
}

impl Default for StatCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatCollector {
    pub fn new() -> Self {
        StatCollector {
            start_time: Instant::now(),
            requests_enqueued: AtomicUsize::new(0),
            requests_sent: AtomicUsize::new(0),
            requests_succeeded: AtomicUsize::new(0),
            requests_retried: AtomicUsize::new(0),
            requests_redirected: AtomicUsize::new(0),
            requests_dropped: AtomicUsize::new(0),
            requests_filtered_duplicate: AtomicUsize::new(0),
            requests_filtered_offsite: AtomicUsize::new(0),
            requests_rejected: AtomicUsize::new(0),
            requests_salvaged: AtomicUsize::new(0),
            requests_failed_permanently: AtomicUsize::new(0),
            requests_aborted: AtomicUsize::new(0),
            responses_received: AtomicUsize::new(0),
            total_bytes_downloaded: AtomicUsize::new(0),
            response_status_counts: DashMap::new(),
            items_scraped: AtomicUsize::new(0),
            items_processed: AtomicUsize::new(0),
            items_dropped_by_pipeline: AtomicUsize::new(0),
            offsite_domains: DashMap::new(),
            failure_kinds: DashMap::new(),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicUsize| counter.load(Ordering::SeqCst);
        StatsSnapshot {
            requests_enqueued: load(&self.requests_enqueued),
            requests_sent: load(&self.requests_sent),
            requests_succeeded: load(&self.requests_succeeded),
            requests_retried: load(&self.requests_retried),
            requests_redirected: load(&self.requests_redirected),
            requests_dropped: load(&self.requests_dropped),
            requests_filtered_duplicate: load(&self.requests_filtered_duplicate),
            requests_filtered_offsite: load(&self.requests_filtered_offsite),
            requests_rejected: load(&self.requests_rejected),
            requests_salvaged: load(&self.requests_salvaged),
            requests_failed_permanently: load(&self.requests_failed_permanently),
            requests_aborted: load(&self.requests_aborted),
            responses_received: load(&self.responses_received),
            total_bytes_downloaded: load(&self.total_bytes_downloaded),
            items_scraped: load(&self.items_scraped),
            items_processed: load(&self.items_processed),
            items_dropped_by_pipeline: load(&self.items_dropped_by_pipeline),
            response_status_counts: self
                .response_status_counts
                .iter()
                .map(|e| (*e.key(), *e.value()))
                .collect(),
            offsite_domains: self
                .offsite_domains
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            failure_kinds: self
                .failure_kinds
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            elapsed: self.start_time.elapsed(),
        }
    }

    pub(crate) fn increment(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_response(&self, status: u16, bytes: usize) {
        Self::increment(&self.responses_received);
        self.total_bytes_downloaded.fetch_add(bytes, Ordering::SeqCst);
        *self.response_status_counts.entry(status).or_insert(0) += 1;
    }

    /// Counts an offsite drop; returns true the first time `domain` is seen.
    pub(crate) fn record_offsite(&self, domain: &str) -> bool {
        Self::increment(&self.requests_filtered_offsite);
        let mut count = self.offsite_domains.entry(domain.to_string()).or_insert(0);
        *count += 1;
        let first = *count == 1;
        first
    }

    pub(crate) fn record_failure(&self, kind: &str) {
        Self::increment(&self.requests_failed_permanently);
        *self.failure_kinds.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn offsite_count(&self, domain: &str) -> usize {
        self.offsite_domains.get(domain).map(|c| *c).unwrap_or(0)
    }

    pub fn status_count(&self, status: u16) -> usize {
        self.response_status_counts.get(&status).map(|c| *c).unwrap_or(0)
    }

    pub fn to_json_string(&self) -> Result<String, SpiderError> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    pub fn to_json_string_pretty(&self) -> Result<String, SpiderError> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    pub fn to_markdown_string(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"# Crawl Statistics Report

- **Duration**: {:?}
- **Average Speed**: {:.2} req/s, {:.2} item/s

## Requests
| Metric              | Count |
|---------------------|-------|
| Enqueued            | {} |
| Sent                | {} |
| Succeeded           | {} |
| Retried             | {} |
| Redirected          | {} |
| Dropped             | {} |
| Duplicate           | {} |
| Offsite             | {} |
| Rejected (overflow) | {} |
| Salvaged            | {} |
| Failed permanently  | {} |
| Aborted             | {} |

## Responses
| Metric     | Count |
|------------|-------|
| Received   | {} |
| Downloaded | {} |

## Items
| Metric    | Count |
|-----------|-------|
| Scraped   | {} |
| Processed | {} |
| Dropped   | {} |

## Status Codes
{}

## Offsite Domains
{}
"#,
            s.elapsed,
            s.per_second(s.requests_sent),
            s.per_second(s.items_scraped),
            s.requests_enqueued,
            s.requests_sent,
            s.requests_succeeded,
            s.requests_retried,
            s.requests_redirected,
            s.requests_dropped,
            s.requests_filtered_duplicate,
            s.requests_filtered_offsite,
            s.requests_rejected,
            s.requests_salvaged,
            s.requests_failed_permanently,
            s.requests_aborted,
            s.responses_received,
            s.formatted_bytes(),
            s.items_scraped,
            s.items_processed,
            s.items_dropped_by_pipeline,
            join_counts(&s.response_status_counts),
            join_counts(&s.offsite_domains),
        )
    }
}

impl std::fmt::Display for StatCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.snapshot();

        writeln!(f, "\nCrawl Statistics")?;
        writeln!(f, "----------------")?;
        writeln!(f, "  duration : {:?}", s.elapsed)?;
        writeln!(
            f,
            "  speed    : req/s: {:.2}, item/s: {:.2}",
            s.per_second(s.requests_sent),
            s.per_second(s.items_scraped)
        )?;
        writeln!(
            f,
            "  requests : enqueued: {}, sent: {}, ok: {}, retry: {}, redirect: {}, drop: {}",
            s.requests_enqueued,
            s.requests_sent,
            s.requests_succeeded,
            s.requests_retried,
            s.requests_redirected,
            s.requests_dropped
        )?;
        writeln!(
            f,
            "  filtered : duplicate: {}, offsite: {}, rejected: {}, salvaged: {}",
            s.requests_filtered_duplicate,
            s.requests_filtered_offsite,
            s.requests_rejected,
            s.requests_salvaged
        )?;
        writeln!(
            f,
            "  failures : permanent: {} ({}), aborted: {}",
            s.requests_failed_permanently,
            join_counts(&s.failure_kinds),
            s.requests_aborted
        )?;
        writeln!(
            f,
            "  response : received: {}, downloaded: {}",
            s.responses_received,
            s.formatted_bytes()
        )?;
        writeln!(
            f,
            "  items    : scraped: {}, processed: {}, dropped: {}",
            s.items_scraped, s.items_processed, s.items_dropped_by_pipeline
        )?;
        writeln!(f, "  status   : {}", join_counts(&s.response_status_counts))?;
        writeln!(f, "  offsite  : {}\n", join_counts(&s.offsite_domains))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsite_first_sighting_is_reported_once() {
        let stats = StatCollector::new();
        assert!(stats.record_offsite("evil.com"));
        assert!(!stats.record_offsite("evil.com"));
        assert!(stats.record_offsite("other.com"));
        assert_eq!(stats.offsite_count("evil.com"), 2);
        assert_eq!(stats.snapshot().requests_filtered_offsite, 3);
    }

    #[test]
    fn json_export_contains_counters() {
        let stats = StatCollector::new();
        stats.record_response(200, 512);
        stats.record_response(404, 10);
        stats.record_failure("retry_exhausted");

        let json: serde_json::Value = serde_json::from_str(&stats.to_json_string().unwrap()).unwrap();
        assert_eq!(json["responses_received"], 2);
        assert_eq!(json["total_bytes_downloaded"], 522);
        assert_eq!(json["response_status_counts"]["404"], 1);
        assert_eq!(json["failure_kinds"]["retry_exhausted"], 1);
    }

    #[test]
    fn text_reports_render() {
        let stats = StatCollector::new();
        stats.record_offsite("evil.com");
        assert!(stats.to_string().contains("evil.com: 1"));
        assert!(stats.to_markdown_string().contains("| Offsite             | 1 |"));
    }
}
