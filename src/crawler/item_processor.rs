//! Contains the item processor functionality for the crawler.
//! Items go through the configured pipelines in order, several items at a time.

use crate::item::ScrapedItem;
use crate::pipeline::Pipeline;
use crate::state::CrawlerState;
use crate::stats::StatCollector;
use kanal::AsyncReceiver;
use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

type PipelineTimings = Arc<Mutex<HashMap<String, (Duration, usize)>>>;

pub(crate) fn spawn_item_processor_task<I: ScrapedItem>(
    state: Arc<CrawlerState>,
    item_rx: AsyncReceiver<I>,
    pipelines: Arc<Vec<Box<dyn Pipeline<I>>>>,
    max_concurrent_pipelines: usize,
    stats: Arc<StatCollector>,
) -> tokio::task::JoinHandle<()> {
    let mut tasks = JoinSet::new();
    let semaphore = Arc::new(Semaphore::new(max_concurrent_pipelines));
    let timings: PipelineTimings = Arc::default();

    trace!(
        "Starting item processor with max_concurrent_pipelines: {}",
        max_concurrent_pipelines
    );
    tokio::spawn(async move {
        while let Ok(item) = item_rx.recv().await {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    warn!("Semaphore closed, shutting down item processor.");
                    CrawlerState::end(&state.processing_items);
                    break;
                }
            };

            let state = Arc::clone(&state);
            let pipelines = Arc::clone(&pipelines);
            let stats = Arc::clone(&stats);
            let timings = Arc::clone(&timings);

            tasks.spawn(async move {
                if run_pipelines(item, &pipelines, &stats, &timings).await {
                    StatCollector::increment(&stats.items_processed);
                }
                CrawlerState::end(&state.processing_items);
                drop(permit);
            });
        }

        trace!("Waiting for active item processing tasks to complete");
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!("An item processing task failed: {:?}", e);
            }
        }
        for (name, (total, count)) in timings.lock().iter() {
            debug!(
                "Pipeline '{}' handled {} items, {:?} on average",
                name,
                count,
                *total / (*count).max(1) as u32
            );
        }
        trace!("Item processor finished");
    })
}

/// Runs `item` through every pipeline; false when one of them dropped it.
async fn run_pipelines<I: ScrapedItem>(
    item: I,
    pipelines: &[Box<dyn Pipeline<I>>],
    stats: &StatCollector,
    timings: &PipelineTimings,
) -> bool {
    let mut current = item;
    for pipeline in pipelines {
        let started = Instant::now();
        let result = pipeline.process_item(current).await;
        {
            let mut timings = timings.lock();
            let entry = timings
                .entry(pipeline.name().to_string())
                .or_insert((Duration::ZERO, 0));
            entry.0 += started.elapsed();
            entry.1 += 1;
        }
        match result {
            Ok(Some(next)) => current = next,
            Ok(None) => {
                debug!("Pipeline '{}' dropped item", pipeline.name());
                StatCollector::increment(&stats.items_dropped_by_pipeline);
                return false;
            }
            Err(e) => {
                error!("Pipeline '{}' error: {}", pipeline.name(), e);
                StatCollector::increment(&stats.items_dropped_by_pipeline);
                return false;
            }
        }
    }
    true
}
