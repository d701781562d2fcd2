//! Keeps a small sample of each spider's items.
//!
//! The sample file is a JSON object mapping spider names to their sampled
//! items. Each crawl replaces its own spider's entry and leaves the others in
//! place, so one file collects samples across many spiders.

use super::Pipeline;
use crate::error::{PipelineError, SpiderError};
use crate::item::ScrapedItem;
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

pub const DEFAULT_ITEMSAMPLER_COUNT: usize = 1;

pub struct ItemSamplerPipeline<I> {
    path: PathBuf,
    count: usize,
    spider_name: String,
    samples: Mutex<Vec<Value>>,
    _item: PhantomData<fn(I)>,
}

impl<I: ScrapedItem> ItemSamplerPipeline<I> {
    pub fn new(path: impl Into<PathBuf>, count: usize, spider_name: &str) -> Self {
        ItemSamplerPipeline {
            path: path.into(),
            count,
            spider_name: spider_name.to_string(),
            samples: Mutex::new(Vec::new()),
            _item: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sampled(&self) -> usize {
        self.samples.lock().len()
    }

    fn load_existing(&self) -> Map<String, Value> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(_) => return Map::new(),
        };
        match serde_json::from_slice(&bytes) {
            Ok(Value::Object(map)) => map,
            _ => {
                warn!(
                    "Item sample file {} is not a JSON object; rewriting it",
                    self.path.display()
                );
                Map::new()
            }
        }
    }
}

#[async_trait]
impl<I: ScrapedItem> Pipeline<I> for ItemSamplerPipeline<I> {
    fn name(&self) -> &str {
        "ItemSamplerPipeline"
    }

    async fn process_item(&self, item: I) -> Result<Option<I>, PipelineError> {
        let mut samples = self.samples.lock();
        if samples.len() < self.count {
            samples.push(serde_json::to_value(&item)?);
            if samples.len() == self.count {
                debug!("Sampled {} items from spider '{}'", self.count, self.spider_name);
            }
        }
        Ok(Some(item))
    }

    async fn close(&self) -> Result<(), PipelineError> {
        let samples = self.samples.lock().clone();
        if samples.is_empty() {
            warn!("Spider '{}' produced no items to sample", self.spider_name);
            return Ok(());
        }

        let mut all = self.load_existing();
        let sampled = samples.len();
        all.insert(self.spider_name.clone(), Value::Array(samples));

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&Value::Object(all))?)?;
        fs::rename(&tmp, &self.path)?;
        info!(
            "Stored {} sampled items for '{}' in {}",
            sampled,
            self.spider_name,
            self.path.display()
        );
        Ok(())
    }

    async fn get_state(&self) -> Result<Option<Value>, SpiderError> {
        Ok(Some(json!({ "samples": *self.samples.lock() })))
    }

    async fn restore_state(&self, state: Value) -> Result<(), SpiderError> {
        if let Some(Value::Array(saved)) = state.get("samples") {
            let mut samples = self.samples.lock();
            *samples = saved.iter().take(self.count).cloned().collect();
        }
        Ok(())
    }
}
