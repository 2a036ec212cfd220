use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratekeeper::config::Settings;
use ratekeeper::enforcement::translate;
use ratekeeper::ratelimit::{IdentityContext, RateLimiter};

/// Evaluate rate limit rules against the configured counter store.
#[derive(Debug, Parser)]
#[command(name = "ratekeeper", version, about)]
struct Cli {
    /// Settings file (YAML, TOML or JSON)
    #[arg(long, short, env = "RATEKEEPER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one or more checks and print each decision as a JSON line
    Check {
        /// Rule name or request path
        #[arg(long)]
        rule: String,

        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        company: Option<String>,

        /// Client address
        #[arg(long)]
        ip: String,

        /// Number of checks to run
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Print the rule catalog
    Rules,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    init_tracing(&settings)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Ratekeeper");

    let limiter = settings.build_limiter()?;

    match cli.command {
        Command::Check {
            rule,
            user,
            company,
            ip,
            count,
        } => {
            let identity = IdentityContext {
                user_id: user,
                company_id: company,
                client_ip: ip,
            };

            tokio::select! {
                result = run_checks(&limiter, &identity, &rule, count) => result?,
                _ = shutdown_signal() => {}
            }

            if limiter.fail_open_total() > 0 {
                warn!(
                    fail_open_total = limiter.fail_open_total(),
                    "Some checks failed open"
                );
            }
        }
        Command::Rules => {
            for binding in limiter.catalog().bindings() {
                println!("{}", serde_json::to_string(binding)?);
            }
        }
    }

    Ok(())
}

fn init_tracing(settings: &Settings) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&settings.logging.level)?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if settings.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn run_checks(
    limiter: &RateLimiter,
    identity: &IdentityContext,
    rule: &str,
    count: u32,
) -> anyhow::Result<()> {
    let rule_name = limiter.catalog().resolve(rule).name.clone();

    for attempt in 1..=count {
        let decision = limiter.check(identity, rule).await;
        let now = limiter.clock().now();

        let headers = match translate(&rule_name, &decision, now) {
            Ok(admission) => {
                let mut headers = http::HeaderMap::new();
                admission.apply_headers(&mut headers);
                headers
            }
            Err(rejection) => rejection.headers(),
        };
        let headers: BTreeMap<&str, &str> = headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|value| (name.as_str(), value)))
            .collect();

        let line = serde_json::json!({
            "attempt": attempt,
            "rule": rule_name,
            "decision": decision,
            "headers": headers,
        });
        println!("{}", line);
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
