//! Item pipelines.
//!
//! Scraped items flow through the configured pipelines in order. A pipeline
//! may transform an item, drop it (`Ok(None)`), or fail on it; failures drop
//! the item and are logged by the item processor.

pub mod feed;
pub mod sampler;

pub use feed::{FeedExportPipeline, FeedFormat, FeedSettings};
pub use sampler::ItemSamplerPipeline;

use crate::error::{PipelineError, SpiderError};
use crate::item::ScrapedItem;
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait Pipeline<I: ScrapedItem>: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn process_item(&self, item: I) -> Result<Option<I>, PipelineError>;

    /// Flushes and releases resources at the end of the crawl.
    async fn close(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    /// State to persist in checkpoints, if any.
    async fn get_state(&self) -> Result<Option<Value>, SpiderError> {
        Ok(None)
    }

    async fn restore_state(&self, _state: Value) -> Result<(), SpiderError> {
        Ok(())
    }
}
