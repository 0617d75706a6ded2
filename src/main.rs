mod cache;
mod cli;
mod config;
mod credits;
mod error;
mod llm;
mod pipeline;
mod search;
mod text;

pub const USER_AGENT: &str = concat!("deepquery/", env!("CARGO_PKG_VERSION"));

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use cache::CacheService;
use cache::store::MemoryStore;
use cli::{Cli, Printer};
use config::Config;
use credits::CreditClient;
use credits::ledger::MemoryLedger;
use llm::ProviderChain;
use pipeline::{Pipeline, QueryRequest};
use search::TavilyClient;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("deepquery=info".parse()?),
        )
        .init();

    let mut config = Config::from_env();
    if let Some(provider) = cli.provider.clone() {
        config.provider = provider;
    }
    config.pipeline.proofread &= !cli.no_proofread;

    let http = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()?;
    let llm = ProviderChain::from_env(
        http.clone(),
        &config.provider,
        config.fallback_provider.as_deref(),
    )?;
    let search = TavilyClient::from_env(http)?;
    let cache = CacheService::new(config.cache.clone(), Some(Arc::new(MemoryStore::new())))
        .with_sweeper();

    let mut ledger = MemoryLedger::new();
    if let Some(user) = &cli.user {
        ledger = ledger.with_balance(user, cli.balance);
    }
    let credits = CreditClient::new(Arc::new(ledger), config.pipeline.settle_timeout);

    info!(provider = %config.provider, mode = %cli.mode, "starting deepquery");

    let pipeline = Pipeline::new(
        Arc::new(llm),
        Arc::new(search),
        Arc::new(cache),
        credits,
        config.pipeline,
    );
    let request = QueryRequest {
        query: cli.query,
        mode: cli.mode,
        user_id: cli.user,
        provider: None,
    };

    let mut run = match pipeline.start(request).await {
        Ok(run) => run,
        Err(e) => {
            error!(error = %e, "query rejected");
            return Ok(ExitCode::from(exit_status(&e)));
        }
    };
    let mut printer = Printer::terminal(cli.json);
    while let Some(event) = run.next_event().await {
        printer.print(&event)?;
    }
    if printer.failed() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// 2 when the caller has to change something before retrying, 1 otherwise.
fn exit_status(e: &error::PipelineError) -> u8 {
    if e.is_client_error() { 2 } else { 1 }
}
