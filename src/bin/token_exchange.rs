//! token-exchange: exchange an external token for an internal one.
//!
//! ## Usage
//! ```text
//! token-exchange [--config path.yaml] <applicant> <user-id> <original-token>
//! ```
//!
//! ## Configuration
//! - TOKEN_EXCHANGE_CONFIG: YAML config file (optional)
//! - TOKEN_EXCHANGE__EXCHANGE__ADDRESS: exchange service address
//! - DATABASE_URL: PostgreSQL for change notifications (optional; without it
//!   the coordinator only polls)
//! - TOKEN_EXCHANGE_LOG: log filter (default: info)
//!
//! Ctrl-C cancels a pending exchange.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use token_exchange::config::Config;
use token_exchange::exchange::GrpcExchangeClient;
use token_exchange::notify::{ListenerFactory, PgListenerFactory};
use token_exchange::utils::bootstrap::{init_tracing, parse_config_path};
use token_exchange::{ExchangeCoordinator, ExchangeRequest};

const USAGE: &str = "usage: token-exchange [--config path] <applicant> <user-id> <original-token>";

/// Arguments that are not part of a `--config` flag.
fn positional(args: &[String]) -> Vec<&str> {
    let mut out = Vec::new();
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
        } else if arg == "--config" {
            skip_next = true;
        } else if !arg.starts_with("--config=") {
            out.push(arg.as_str());
        }
    }
    out
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let request = match positional(&args).as_slice() {
        [applicant, user_id, token] => ExchangeRequest::new(*applicant, *user_id, *token),
        _ => return Err(USAGE.into()),
    };

    let config = Config::load(parse_config_path(args.iter().cloned()).as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let client = GrpcExchangeClient::connect_with_retry(&config.exchange).await?;

    let mut listeners: Vec<Arc<dyn ListenerFactory>> = Vec::new();
    match &config.database.url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database.max_connections)
                .acquire_timeout(config.database.acquire_timeout())
                .connect(url)
                .await?;
            listeners.push(Arc::new(PgListenerFactory::new(
                pool,
                config.listener.clone(),
            )));
        }
        None => warn!("No database configured, relying on polling only"),
    }

    let coordinator = ExchangeCoordinator::new(
        Arc::new(client),
        config.retry.clone(),
        config.fan_in.clone(),
    );

    let lifetime = CancellationToken::new();
    let on_signal = lifetime.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling exchange");
            on_signal.cancel();
        }
    });

    info!(
        subject_id = %request.subject_id,
        max_attempts = config.retry.attempts(),
        worst_case = ?config.retry.worst_case(),
        "Starting token exchange"
    );

    let result = coordinator.exchange(&lifetime, &request, &listeners).await?;
    println!("{}", result.token);

    Ok(())
}
