use clap::Parser;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quotadb::{Algorithm, LimitOptions, LimiterConfig, QuotaError, RateLimiter, TimeUnit};

/// Run rate limit checks against a counter store.
#[derive(Debug, Parser)]
#[command(name = "quotadb", version, about)]
struct Args {
    /// YAML limiter configuration; flags below override its fields
    #[arg(long)]
    config: Option<String>,

    /// Store connection string
    #[arg(long, env = "QUOTADB_URL")]
    url: Option<String>,

    /// Store credential
    #[arg(long, env = "QUOTADB_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// Counter table name
    #[arg(long, env = "QUOTADB_TABLE")]
    table: Option<String>,

    /// Identifier to check
    #[arg(long)]
    key: String,

    /// Namespace joined in front of the key
    #[arg(long)]
    prefix: Option<String>,

    /// Maximum actions per window
    #[arg(long, default_value_t = 10)]
    limit: i64,

    /// Window length
    #[arg(long, default_value_t = 60.0)]
    window: f64,

    /// Unit of the window: ms, seconds, minutes, hours, days
    #[arg(long, default_value = "seconds")]
    unit: TimeUnit,

    /// fixed, sliding or tokenBucket
    #[arg(long, default_value = "fixed")]
    algorithm: Algorithm,

    #[arg(long)]
    capacity: Option<i64>,

    /// Tokens per second
    #[arg(long)]
    refill_rate: Option<f64>,

    #[arg(long)]
    tokens: Option<i64>,

    /// Number of consecutive checks to run
    #[arg(long, default_value_t = 1)]
    repeat: u32,

    /// Print the stored counter row after the checks
    #[arg(long)]
    show_record: bool,
}

impl Args {
    fn limiter_config(&self) -> anyhow::Result<LimiterConfig> {
        let mut config = match &self.config {
            Some(path) => LimiterConfig::from_file(path)?,
            None => LimiterConfig::new(String::new()),
        };
        if let Some(url) = &self.url {
            config.url = url.clone();
        }
        if let Some(token) = &self.auth_token {
            config.auth_token = Some(token.clone());
        }
        if let Some(table) = &self.table {
            config.table_name = table.clone();
        }
        config.validate()?;
        Ok(config)
    }

    fn limit_options(&self) -> LimitOptions {
        LimitOptions {
            key: self.key.clone(),
            limit: self.limit,
            window: self.window,
            time_unit: self.unit,
            algorithm: self.algorithm,
            capacity: self.capacity,
            refill_rate: self.refill_rate,
            tokens_to_consume: self.tokens,
            prefix: self.prefix.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = args.limiter_config()?;
    let options = args.limit_options();

    info!(table = %config.table_name, "Starting quotadb {}", env!("CARGO_PKG_VERSION"));

    let limiter = RateLimiter::connect(&config).await?;
    let mut rejected = false;

    for _ in 0..args.repeat {
        match limiter.limit(&options).await {
            Ok(result) => println!("{}", serde_json::to_string(&result)?),
            Err(QuotaError::InsufficientTokens {
                requested,
                available,
            }) => {
                rejected = true;
                println!(
                    "{}",
                    json!({
                        "success": false,
                        "error": "insufficient_tokens",
                        "requested": requested,
                        "available": available,
                    })
                );
            }
            Err(e) => {
                limiter.close().await;
                return Err(e.into());
            }
        }
    }

    if args.show_record {
        let record = limiter
            .record(&options.key, options.prefix.as_deref())
            .await?;
        println!("{}", serde_json::to_string(&record)?);
    }

    limiter.close().await;

    if rejected {
        std::process::exit(1);
    }
    Ok(())
}
