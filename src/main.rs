use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use ratewarden::config::LimiterConfig;
use ratewarden::ratelimit::{Algorithm, RateLimitRequest, RateLimiter, SystemClock};
use ratewarden::store::{MemoryStore, RedisStore, ScriptRegistry, Store};

#[derive(Parser, Debug)]
#[command(name = "ratewarden", version, about = "Distributed rate limiting engine")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "RATEWARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Redis URL, overrides `store.url`
    #[arg(long, conflicts_with = "memory")]
    redis_url: Option<String>,

    /// Use a process-local store instead of Redis
    #[arg(long)]
    memory: bool,

    #[arg(long, value_parser = parse_algorithm)]
    algorithm: Option<Algorithm>,

    #[arg(long)]
    max_requests: Option<u32>,

    #[arg(long)]
    window_ms: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report whether one more request would be admitted, without recording it
    Check { key: String },
    /// Record requests and report each decision
    Increment {
        key: String,
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
    /// Show the current state of a key
    Status { key: String },
    /// Delete all state for a key
    Reset { key: String },
    /// Evaluate a JSON array of requests from a file
    Batch { file: PathBuf },
}

fn parse_algorithm(value: &str) -> Result<Algorithm, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| format!("unknown algorithm `{}`", value))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    if let Err(err) = run(cli).await {
        error!(error = %format!("{:#}", err), "Command failed");
        std::process::exit(1);
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => LimiterConfig::from_file(path)?,
        None => LimiterConfig::default(),
    };
    if let Some(url) = cli.redis_url {
        config.store.url = url;
    }
    if let Some(algorithm) = cli.algorithm {
        config.limits.algorithm = algorithm;
    }
    if let Some(max_requests) = cli.max_requests {
        config.limits.max_requests = max_requests;
    }
    if let Some(window_ms) = cli.window_ms {
        config.limits.window_ms = window_ms;
    }
    config.validate()?;
    debug!(?config, "Configuration loaded");

    let clock = Arc::new(SystemClock);
    let store: Arc<dyn Store> = if cli.memory {
        info!("Using in-memory store");
        Arc::new(MemoryStore::new(clock.clone()))
    } else {
        Arc::new(
            RedisStore::connect(&config.store.url)
                .await
                .context("connecting to Redis")?,
        )
    };

    let limiter = config.build_limiter(store, Arc::new(ScriptRegistry::new()), clock);
    limiter.initialize().await.context("registering scripts")?;

    execute(&limiter, cli.command).await
}

async fn execute(limiter: &RateLimiter, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Check { key } => print(&limiter.check(&key).await?),
        Command::Increment { key, count } => {
            let mut results = Vec::with_capacity(count as usize);
            for _ in 0..count {
                results.push(limiter.increment(&key).await?);
            }
            print(&results)
        }
        Command::Status { key } => print(&limiter.get_status(&key).await?),
        Command::Reset { key } => {
            let removed = limiter.reset(&key).await?;
            print(&serde_json::json!({ "key": key, "removed": removed }))
        }
        Command::Batch { file } => {
            let contents = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let requests: Vec<RateLimitRequest> = serde_json::from_str(&contents)
                .with_context(|| format!("parsing {}", file.display()))?;
            print(&limiter.process_batch(&requests).await?)
        }
    }
}

fn print<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
