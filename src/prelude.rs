//! A "prelude" for users of the `spider-engine` crate.
//!
//! Re-exports what a spider, a custom middleware or a custom pipeline
//! usually needs.
//!
//! # Example
//!
//! ```
//! use spider_engine::prelude::*;
//! ```

pub use crate::{
    async_trait, CrawlHandle, Crawler, CrawlerBuilder, Downloader, PipelineError, Settings,
    Spider, SpiderError,
};

pub use crate::item::{Output, ParseOutput, ScrapedItem};
pub use crate::middleware::{Middleware, MiddlewareAction};
pub use crate::pipeline::{FeedExportPipeline, FeedFormat, FeedSettings, Pipeline};
pub use crate::request::{Headers, Request};
pub use crate::response::Response;
pub use crate::scheduler::{EnqueueOutcome, SchedulerState};
