//! CLI entry point.
//!
//! Exit codes: 0 when the crawl completes, 2 for configuration and startup
//! errors (unknown spider, bad setting), 1 for anything else.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use spider_engine::{CrawlerBuilder, Settings, SpiderError};
use tracing::{debug, error, info};

mod cli;
mod links;

use cli::{Args, Command};

const SPIDERS: &[&str] = &["links"];

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    let Command::Run { spider, set } = &args.command;
    let settings = Settings::from_pairs(set);

    // Priority: RUST_LOG env var > -q/-v flags > LOG_LEVEL setting > info
    let level = args.log_level(
        settings
            .as_ref()
            .ok()
            .and_then(|s| s.log_level.as_deref()),
    );
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    debug!(?args, "CLI arguments parsed");

    let result = match settings {
        Ok(settings) => run(spider, settings).await,
        Err(e) => Err(e.into()),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            match e.downcast_ref::<SpiderError>() {
                Some(SpiderError::ConfigurationError(_)) => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}

async fn run(spider: &str, settings: Settings) -> Result<()> {
    let crawler = match spider {
        "links" => {
            if settings.start_urls.is_empty() {
                return Err(SpiderError::ConfigurationError(
                    "the links spider needs START_URLS".into(),
                )
                .into());
            }
            CrawlerBuilder::new(links::LinksSpider)
                .settings(settings)
                .build()
                .await?
        }
        other => {
            return Err(SpiderError::ConfigurationError(format!(
                "unknown spider '{}' (available: {})",
                other,
                SPIDERS.join(", ")
            ))
            .into())
        }
    };

    info!("Spider '{}' ready", spider);
    crawler.start_crawl().await?;
    Ok(())
}
