//! Parser workers.
//!
//! A fixed pool of workers takes downloaded responses off the response
//! channel and runs them through `Spider::parse`. The output is consumed
//! eagerly: follow-up requests are enqueued as one batch so depth-first
//! ordering sees siblings together, and items are sent to the item channel.

use crate::item::ParseOutput;
use crate::response::Response;
use crate::scheduler::{EnqueueOutcome, Scheduler};
use crate::spider::Spider;
use crate::state::CrawlerState;
use crate::stats::StatCollector;
use kanal::{AsyncReceiver, AsyncSender};
use log::{debug, error, trace, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

pub(crate) fn spawn_parser_task<S: Spider>(
    scheduler: Arc<Scheduler>,
    spider: Arc<S>,
    state: Arc<CrawlerState>,
    res_rx: AsyncReceiver<Response>,
    item_tx: AsyncSender<S::Item>,
    parser_workers: usize,
    stats: Arc<StatCollector>,
) -> tokio::task::JoinHandle<()> {
    let mut workers = JoinSet::new();
    for worker in 0..parser_workers {
        let scheduler = Arc::clone(&scheduler);
        let spider = Arc::clone(&spider);
        let state = Arc::clone(&state);
        let res_rx = res_rx.clone();
        let item_tx = item_tx.clone();
        let stats = Arc::clone(&stats);

        workers.spawn(async move {
            trace!("Parser worker {} started", worker);
            while let Ok(response) = res_rx.recv().await {
                let url = response.url.clone();
                let started = Instant::now();
                match spider.parse(response).await {
                    Ok(outputs) => {
                        trace!("Parsed {} in {:?}", url, started.elapsed());
                        process_crawl_outputs::<S>(outputs, &scheduler, &item_tx, &state, &stats)
                            .await;
                    }
                    Err(e) => error!("Spider '{}' failed to parse {}: {}", spider.name(), url, e),
                }
                CrawlerState::end(&state.parsing_responses);
            }
            trace!("Parser worker {} finished", worker);
        });
    }
    drop(item_tx);

    tokio::spawn(async move {
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!("A parsing worker task failed: {:?}", e);
            }
        }
        trace!("All parser workers finished");
    })
}

pub(crate) async fn process_crawl_outputs<S: Spider>(
    outputs: ParseOutput<S::Item>,
    scheduler: &Scheduler,
    item_tx: &AsyncSender<S::Item>,
    state: &CrawlerState,
    stats: &StatCollector,
) {
    let (items, requests) = outputs.into_parts();
    let items_len = items.len();
    let requests_len = requests.len();
    if requests_len == 0 && items_len == 0 {
        trace!("Spider output contained no requests or items");
        return;
    }
    debug!(
        "Processing {} requests and {} items from spider output.",
        requests_len, items_len
    );

    if requests_len > 0 {
        match scheduler.enqueue_all(requests).await {
            Ok(outcomes) => {
                let queued = outcomes
                    .iter()
                    .filter(|o| **o == EnqueueOutcome::Enqueued)
                    .count();
                trace!("Enqueued {} of {} follow-up requests", queued, requests_len);
            }
            Err(e) => error!("Failed to enqueue follow-up requests: {}", e),
        }
    }

    let mut item_error_total = 0;
    for (idx, item) in items.into_iter().enumerate() {
        StatCollector::increment(&stats.items_scraped);
        CrawlerState::begin(&state.processing_items);
        if item_tx.send(item).await.is_err() {
            CrawlerState::end(&state.processing_items);
            item_error_total = items_len - idx;
            break;
        }
    }
    if item_error_total > 0 {
        warn!(
            "Item channel closed; lost {} of {} scraped items.",
            item_error_total, items_len
        );
    }
}
