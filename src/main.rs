use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{StoreBackend, TurnstileConfig};
use turnstile::ratelimit::{CompositeController, Outcome, RequestContext, Tier, TierCatalog};
use turnstile::store::{CounterStore, MemoryCounterStore, RedisCounterStore, RedisStoreConfig};

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Tiered admission control")]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Use the in-memory counter store regardless of configuration
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and print the effective limits
    Validate,

    /// Evaluate one request against a route tier
    Check {
        /// Tier name (strict, moderate, lenient, auth, create, global)
        #[arg(long)]
        tier: Tier,

        /// Caller address
        #[arg(long)]
        ip: IpAddr,

        /// Authenticated caller identity
        #[arg(long)]
        identity: Option<String>,

        /// Report the guarded operation as failed (auth tier)
        #[arg(long)]
        failed: bool,
    },

    /// Evaluate one map-generation request against every scope
    MapCheck {
        /// Caller address
        #[arg(long)]
        ip: IpAddr,

        /// Authenticated caller identity
        #[arg(long)]
        identity: Option<String>,

        /// Image the caller already holds
        #[arg(long)]
        supplied_output: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = TurnstileConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if cli.memory {
        config.store.backend = StoreBackend::Memory;
    }
    info!(backend = ?config.store.backend, "Configuration loaded");

    match cli.command {
        Command::Validate => {
            print!("{}", config.to_yaml()?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Check {
            tier,
            ip,
            identity,
            failed,
        } => {
            let store = connect_store(&config).await?;
            let catalog = TierCatalog::new(&config.tiers, store, config.store.timeout())?;
            let limiter = catalog.get(tier);
            let ctx = request(ip, identity, None);

            let admission = limiter.precheck(&ctx).await;
            let counted = if admission.is_allowed() {
                let outcome = if failed { Outcome::failure() } else { Outcome::success() };
                limiter.record(&ctx, &admission, &outcome).await
            } else {
                admission.holds_hit()
            };
            let decision = admission.decision();

            let headers: serde_json::Map<String, serde_json::Value> = decision
                .headers(Utc::now())
                .into_iter()
                .map(|(name, value)| (name.to_string(), json!(value)))
                .collect();
            let report = if decision.allowed {
                json!({ "tier": tier.as_str(), "decision": decision, "counted": counted, "headers": headers })
            } else {
                json!({
                    "tier": tier.as_str(),
                    "decision": decision,
                    "counted": counted,
                    "headers": headers,
                    "rejection": limiter.rejection(decision).to_body(),
                })
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(exit_code(decision.allowed))
        }
        Command::MapCheck {
            ip,
            identity,
            supplied_output,
        } => {
            let store = connect_store(&config).await?;
            let controller =
                CompositeController::map_generation(&config.map_generation, store, config.store.timeout())?;
            let ctx = request(ip, identity, supplied_output);

            let outcome = controller.evaluate(&ctx).await;
            let mut report = serde_json::to_value(&outcome)?;
            if let Some(rejection) = &outcome.rejection {
                report["status"] = json!(rejection.status);
                report["body"] = rejection.to_body();
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(exit_code(outcome.is_admitted()))
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.with_thread_ids(true).init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn connect_store(config: &TurnstileConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory counter store; counters are local to this process");
            Ok(Arc::new(MemoryCounterStore::new()))
        }
        StoreBackend::Redis => {
            let store_config = RedisStoreConfig {
                key_prefix: config.store.key_prefix.clone(),
            };
            let store = RedisCounterStore::connect_with_config(&config.store.url, store_config)
                .await
                .with_context(|| format!("failed to connect to {}", config.store.url))?;
            info!(url = %config.store.url, "Connected to counter store");
            Ok(Arc::new(store))
        }
    }
}

fn request(ip: IpAddr, identity: Option<String>, supplied_output: Option<String>) -> RequestContext {
    let mut ctx = RequestContext::new(ip);
    if let Some(identity) = identity {
        ctx = ctx.with_identity(identity);
    }
    if let Some(output) = supplied_output {
        ctx = ctx.with_supplied_output(output);
    }
    ctx
}

fn exit_code(allowed: bool) -> ExitCode {
    if allowed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    }
}
