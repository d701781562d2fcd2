//! # Crawler Module
//!
//! The engine. `Crawler::start_crawl` seeds the scheduler and runs four kinds
//! of tasks until the scheduler reaches `Stopped`:
//!
//! - the dispatch loop with its download tasks (`request_handler`)
//! - the parser worker pool (`response_parser`)
//! - the item processor (`item_processor`)
//! - an optional periodic checkpoint writer
//!
//! Responses travel to the parsers and items to the pipelines over bounded
//! `kanal` channels. New requests go straight to the scheduler.

mod core;
mod item_processor;
mod middleware_manager;
mod request_handler;
mod response_parser;

pub use core::{CrawlHandle, Crawler};
pub use middleware_manager::{Disposition, MiddlewareManager, MAX_CHAIN_RESTARTS};
pub(crate) use item_processor::spawn_item_processor_task;
pub(crate) use request_handler::{spawn_downloader_task, DownloadContext, MeteredDownloader};
pub(crate) use response_parser::spawn_parser_task;
