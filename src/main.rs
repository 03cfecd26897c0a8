use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::{LoggingConfig, TollgateConfig};
use tollgate::ratelimit::{
    Action, HeaderSet, InMemoryCounterStore, RateLimiter, RequestContext, ResponseControl, Scope,
};

/// Replay simulated requests through the rate limiter.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Configuration file (YAML, JSON or TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Requests sent by each worker
    #[arg(short = 'n', long, default_value_t = 1)]
    requests: u32,

    /// Concurrent workers sharing the same counters
    #[arg(short, long, default_value_t = 1)]
    workers: u32,

    /// Client address of the simulated caller
    #[arg(long, default_value = "127.0.0.1")]
    client: String,

    /// Request path
    #[arg(long, default_value = "/")]
    path: String,

    /// Request header, as NAME=VALUE (repeatable)
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Route the limiter is attached to
    #[arg(long, default_value = "")]
    route_id: String,

    /// Service the limiter is attached to
    #[arg(long, default_value = "")]
    service_id: String,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .ok_or_else(|| format!("expected NAME=VALUE, got {:?}", raw))
}

/// One request/response exchange driven by the CLI.
struct SimulatedExchange {
    headers: HashMap<String, String>,
    path: String,
    client: String,
    scope: Scope,
    status: u16,
    response_headers: HeaderSet,
}

impl SimulatedExchange {
    fn new(cli: &Cli) -> Self {
        Self {
            headers: cli.headers.iter().cloned().collect(),
            path: cli.path.clone(),
            client: cli.client.clone(),
            scope: Scope::new(cli.route_id.clone(), cli.service_id.clone()),
            status: 0,
            response_headers: Vec::new(),
        }
    }
}

impl RequestContext for SimulatedExchange {
    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    fn path(&self) -> Option<String> {
        Some(self.path.clone())
    }

    fn client_address(&self) -> Option<String> {
        Some(self.client.clone())
    }

    fn scope(&self) -> Scope {
        self.scope.clone()
    }
}

impl ResponseControl for SimulatedExchange {
    fn send_early_response(&mut self, status: u16, headers: HeaderSet, _body: &[u8]) {
        self.status = status;
        self.response_headers = headers;
    }

    fn continue_pipeline(&mut self) {
        // The simulated upstream always answers 200.
        self.status = 200;
        self.response_headers = vec![("Content-Type".to_string(), "text/plain".to_string())];
    }

    fn response_headers(&self) -> HeaderSet {
        self.response_headers.clone()
    }

    fn replace_response_headers(&mut self, headers: HeaderSet) {
        self.response_headers = headers;
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TollgateConfig::load(&cli.config)?;

    init_tracing(&config.logging);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        limit_by = ?config.rate_limiting.limit_by,
        fault_tolerant = config.rate_limiting.fault_tolerant,
        "Configuration loaded"
    );

    let store = Arc::new(InMemoryCounterStore::new());
    let limiter = Arc::new(RateLimiter::new(config.rate_limiting, store.clone()));
    let cli = Arc::new(cli);

    let workers: Vec<_> = (0..cli.workers)
        .map(|worker| {
            let limiter = limiter.clone();
            let cli = cli.clone();
            tokio::spawn(async move { run_worker(worker, &limiter, &cli).await })
        })
        .collect();

    for worker in futures::future::join_all(workers).await {
        worker??;
    }

    info!(counters = store.len(), "Simulation finished");
    Ok(())
}

async fn run_worker(worker: u32, limiter: &RateLimiter, cli: &Cli) -> anyhow::Result<()> {
    for request in 1..=cli.requests {
        let mut exchange = SimulatedExchange::new(cli);
        let mut ctx = limiter.context();

        match ctx.on_request_headers(&mut exchange).await {
            Ok(Action::Continue) => {
                ctx.on_response_headers(&mut exchange);
            }
            Ok(Action::Pause) => {}
            Err(e) => {
                // Without fault tolerance the host answers with a server error.
                tracing::error!(worker, request, error = %e, "Request failed");
                exchange.status = 500;
                exchange.response_headers.clear();
            }
        }

        let headers: Vec<String> = exchange
            .response_headers
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect();
        println!(
            "worker={} request={} status={} {}",
            worker,
            request,
            exchange.status,
            headers.join("; ")
        );
    }
    Ok(())
}
