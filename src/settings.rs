//! Crawl settings.
//!
//! Every knob has a default; `--set KEY=VALUE` pairs from the command line
//! override them through [`Settings::set`]. Keys are case-insensitive.
//! Unknown keys and values that do not parse are configuration errors.

use crate::error::SpiderError;
use crate::fingerprint::DEFAULT_IGNORED_HEADERS;
use crate::middleware::redirect::{DEFAULT_REDIRECT_MAX_TIMES, DEFAULT_REDIRECT_PRIORITY_ADJUST};
use crate::middleware::retry::{
    DEFAULT_RETRY_HTTP_CODES, DEFAULT_RETRY_PRIORITY_ADJUST, DEFAULT_RETRY_TIMES,
};
use crate::pipeline::sampler::DEFAULT_ITEMSAMPLER_COUNT;
use crate::pipeline::FeedFormat;
use crate::scheduler::queue::{OverflowPolicy, QueueOrder};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONCURRENT_REQUESTS: usize = 16;
pub const DEFAULT_CONCURRENT_REQUESTS_PER_DOMAIN: usize = 8;
pub const DEFAULT_CONCURRENT_ITEMS: usize = 100;

const LOG_LEVELS: &[&str] = &["off", "error", "warn", "warning", "info", "debug", "trace"];

#[derive(Debug, Clone)]
pub struct Settings {
    pub download_delay: Duration,
    pub randomize_download_delay: bool,
    pub scheduler_order: QueueOrder,
    /// Zero means unbounded.
    pub scheduler_max_pending: usize,
    pub scheduler_overflow: OverflowPolicy,
    pub scheduler_block_timeout: Duration,
    pub concurrent_requests: usize,
    pub concurrent_requests_per_domain: usize,
    pub concurrent_items: usize,
    pub parser_workers: usize,
    pub download_timeout: Duration,
    pub cookies_enabled: bool,
    pub cookies_debug: bool,
    pub retry_enabled: bool,
    pub retry_times: u64,
    pub retry_http_codes: Vec<u16>,
    pub retry_priority_adjust: i32,
    pub redirect_enabled: bool,
    pub redirect_max_times: u64,
    pub redirect_priority_adjust: i32,
    /// Overrides `Spider::allowed_domains` when not empty.
    pub allowed_domains: Vec<String>,
    pub offsite_enabled: bool,
    pub proxy_list: Vec<String>,
    pub http_auth_user: Option<String>,
    pub http_auth_pass: Option<String>,
    pub http_auth_domain: Option<String>,
    pub user_agent: String,
    /// Bounded duplicate filter capacity; `None` keeps every fingerprint.
    pub dupefilter_capacity: Option<u64>,
    pub fingerprint_ignored_headers: Vec<String>,
    /// Directory holding the crawl checkpoint.
    pub jobdir: Option<PathBuf>,
    pub checkpoint_interval: Option<Duration>,
    pub feed_uri: Option<String>,
    pub feed_format: FeedFormat,
    pub feed_store_empty: bool,
    pub feed_export_fields: Option<Vec<String>>,
    /// File collecting item samples per spider.
    pub itemsampler_file: Option<PathBuf>,
    pub itemsampler_count: usize,
    /// Seeded in addition to the spider's own start requests.
    pub start_urls: Vec<String>,
    pub log_level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            download_delay: Duration::ZERO,
            randomize_download_delay: false,
            scheduler_order: QueueOrder::Fifo,
            scheduler_max_pending: 0,
            scheduler_overflow: OverflowPolicy::Reject,
            scheduler_block_timeout: Duration::from_secs(30),
            concurrent_requests: DEFAULT_CONCURRENT_REQUESTS,
            concurrent_requests_per_domain: DEFAULT_CONCURRENT_REQUESTS_PER_DOMAIN,
            concurrent_items: DEFAULT_CONCURRENT_ITEMS,
            parser_workers: num_cpus::get().clamp(4, 16),
            download_timeout: crate::downloader::DEFAULT_DOWNLOAD_TIMEOUT,
            cookies_enabled: true,
            cookies_debug: false,
            retry_enabled: true,
            retry_times: DEFAULT_RETRY_TIMES,
            retry_http_codes: DEFAULT_RETRY_HTTP_CODES.to_vec(),
            retry_priority_adjust: DEFAULT_RETRY_PRIORITY_ADJUST,
            redirect_enabled: true,
            redirect_max_times: DEFAULT_REDIRECT_MAX_TIMES,
            redirect_priority_adjust: DEFAULT_REDIRECT_PRIORITY_ADJUST,
            allowed_domains: Vec::new(),
            offsite_enabled: true,
            proxy_list: Vec::new(),
            http_auth_user: None,
            http_auth_pass: None,
            http_auth_domain: None,
            user_agent: crate::downloader::DEFAULT_USER_AGENT.to_string(),
            dupefilter_capacity: None,
            fingerprint_ignored_headers: DEFAULT_IGNORED_HEADERS
                .iter()
                .map(|h| h.to_string())
                .collect(),
            jobdir: None,
            checkpoint_interval: None,
            feed_uri: None,
            feed_format: FeedFormat::JsonLines,
            feed_store_empty: false,
            feed_export_fields: None,
            itemsampler_file: None,
            itemsampler_count: DEFAULT_ITEMSAMPLER_COUNT,
            start_urls: Vec::new(),
            log_level: None,
        }
    }
}

fn invalid(key: &str, value: &str, expected: &str) -> SpiderError {
    SpiderError::ConfigurationError(format!(
        "invalid value '{}' for {}: expected {}",
        value, key, expected
    ))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, SpiderError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value, "a boolean")),
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str, expected: &str) -> Result<T, SpiderError> {
    value.trim().parse().map_err(|_| invalid(key, value, expected))
}

/// Seconds as a non-negative float.
fn parse_secs(key: &str, value: &str) -> Result<Duration, SpiderError> {
    let secs: f64 = parse_num(key, value, "a number of seconds")?;
    Duration::try_from_secs_f64(secs).map_err(|_| invalid(key, value, "a non-negative number of seconds"))
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Splits `KEY=VALUE`. The value may itself contain `=`.
pub fn parse_pair(pair: &str) -> Result<(String, String), SpiderError> {
    match pair.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(SpiderError::ConfigurationError(format!(
            "expected KEY=VALUE, got '{}'",
            pair
        ))),
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `KEY=VALUE` pairs, applied in order.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, SpiderError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut settings = Settings::default();
        for pair in pairs {
            let (key, value) = parse_pair(pair.as_ref())?;
            settings.set(&key, &value)?;
        }
        Ok(settings)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), SpiderError> {
        let name = key.trim().to_ascii_uppercase();
        let k = name.as_str();
        match k {
            "DOWNLOAD_DELAY" => self.download_delay = parse_secs(k, value)?,
            "RANDOMIZE_DOWNLOAD_DELAY" => self.randomize_download_delay = parse_bool(k, value)?,
            "SCHEDULER_ORDER" => {
                self.scheduler_order = value
                    .parse()
                    .map_err(|_| invalid(k, value, "bfo, breadth-first, fifo, dfo, depth-first or lifo"))?
            }
            "SCHEDULER_MAX_PENDING" => {
                self.scheduler_max_pending = parse_num(k, value, "a non-negative integer")?
            }
            "SCHEDULER_OVERFLOW" => {
                self.scheduler_overflow = value
                    .parse()
                    .map_err(|_| invalid(k, value, "reject, drop-lowest or block"))?
            }
            "SCHEDULER_BLOCK_TIMEOUT" => self.scheduler_block_timeout = parse_secs(k, value)?,
            "CONCURRENT_REQUESTS" => {
                self.concurrent_requests = parse_num(k, value, "a positive integer")?
            }
            "CONCURRENT_REQUESTS_PER_DOMAIN" => {
                self.concurrent_requests_per_domain = parse_num(k, value, "a positive integer")?
            }
            "CONCURRENT_ITEMS" => self.concurrent_items = parse_num(k, value, "a positive integer")?,
            "PARSER_WORKERS" => self.parser_workers = parse_num(k, value, "a positive integer")?,
            "DOWNLOAD_TIMEOUT" => self.download_timeout = parse_secs(k, value)?,
            "COOKIES_ENABLED" => self.cookies_enabled = parse_bool(k, value)?,
            "COOKIES_DEBUG" => self.cookies_debug = parse_bool(k, value)?,
            "RETRY_ENABLED" => self.retry_enabled = parse_bool(k, value)?,
            "RETRY_TIMES" => self.retry_times = parse_num(k, value, "a non-negative integer")?,
            "RETRY_HTTP_CODES" => {
                self.retry_http_codes = parse_list(value)
                    .iter()
                    .map(|code| parse_num(k, code, "a comma-separated list of status codes"))
                    .collect::<Result<_, _>>()?
            }
            "RETRY_PRIORITY_ADJUST" => {
                self.retry_priority_adjust = parse_num(k, value, "an integer")?
            }
            "REDIRECT_ENABLED" => self.redirect_enabled = parse_bool(k, value)?,
            "REDIRECT_MAX_TIMES" => {
                self.redirect_max_times = parse_num(k, value, "a non-negative integer")?
            }
            "REDIRECT_PRIORITY_ADJUST" => {
                self.redirect_priority_adjust = parse_num(k, value, "an integer")?
            }
            "ALLOWED_DOMAINS" => self.allowed_domains = parse_list(value),
            "OFFSITE_ENABLED" => self.offsite_enabled = parse_bool(k, value)?,
            "PROXY_LIST" => self.proxy_list = parse_list(value),
            "HTTP_AUTH_USER" => self.http_auth_user = non_empty(value),
            "HTTP_AUTH_PASS" => self.http_auth_pass = Some(value.to_string()),
            "HTTP_AUTH_DOMAIN" => self.http_auth_domain = non_empty(value),
            "USER_AGENT" => self.user_agent = value.trim().to_string(),
            "DUPEFILTER_CAPACITY" => {
                let capacity: u64 = parse_num(k, value, "a non-negative integer")?;
                self.dupefilter_capacity = (capacity > 0).then_some(capacity);
            }
            "FINGERPRINT_IGNORED_HEADERS" => self.fingerprint_ignored_headers = parse_list(value),
            "JOBDIR" => self.jobdir = non_empty(value).map(PathBuf::from),
            "CHECKPOINT_INTERVAL" => {
                let interval = parse_secs(k, value)?;
                self.checkpoint_interval = (!interval.is_zero()).then_some(interval);
            }
            "FEED_URI" => self.feed_uri = non_empty(value),
            "FEED_FORMAT" => self.feed_format = value.parse()?,
            "FEED_STORE_EMPTY" => self.feed_store_empty = parse_bool(k, value)?,
            "FEED_EXPORT_FIELDS" => {
                let fields = parse_list(value);
                self.feed_export_fields = (!fields.is_empty()).then_some(fields);
            }
            "ITEMSAMPLER_FILE" => self.itemsampler_file = non_empty(value).map(PathBuf::from),
            "ITEMSAMPLER_COUNT" => {
                self.itemsampler_count = parse_num(k, value, "a positive integer")?
            }
            "START_URLS" => self.start_urls = parse_list(value),
            "LOG_LEVEL" => {
                let level = value.trim().to_ascii_lowercase();
                if !LOG_LEVELS.contains(&level.as_str()) {
                    return Err(invalid(k, value, "one of off, error, warn, info, debug, trace"));
                }
                self.log_level = Some(if level == "warning" { "warn".into() } else { level });
            }
            _ => {
                return Err(SpiderError::ConfigurationError(format!(
                    "unknown setting '{}'",
                    key.trim()
                )))
            }
        }
        Ok(())
    }

    /// Checks values that parse but cannot run a crawl.
    pub fn validate(&self) -> Result<(), SpiderError> {
        for (key, value) in [
            ("CONCURRENT_REQUESTS", self.concurrent_requests),
            ("CONCURRENT_REQUESTS_PER_DOMAIN", self.concurrent_requests_per_domain),
            ("CONCURRENT_ITEMS", self.concurrent_items),
            ("PARSER_WORKERS", self.parser_workers),
            ("ITEMSAMPLER_COUNT", self.itemsampler_count),
        ] {
            if value == 0 {
                return Err(SpiderError::ConfigurationError(format!(
                    "{} must be greater than 0",
                    key
                )));
            }
        }
        if self.download_timeout.is_zero() {
            return Err(SpiderError::ConfigurationError(
                "DOWNLOAD_TIMEOUT must be greater than 0".into(),
            ));
        }
        if self.http_auth_pass.is_some() && self.http_auth_user.is_none() {
            return Err(SpiderError::ConfigurationError(
                "HTTP_AUTH_PASS is set without HTTP_AUTH_USER".into(),
            ));
        }
        Ok(())
    }
}
