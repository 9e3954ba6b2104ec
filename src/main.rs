//! Binary entry point: initializes tracing, loads configuration, opens the
//! store, constructs the broker adapter and Supervisor, then runs until a
//! shutdown signal arrives. Adapted from this codebase's
//! `execution-router/src/main.rs` startup sequence.

use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use intraday_ctl::broker::HttpBroker;
use intraday_ctl::clock::{Clock, SystemClock};
use intraday_ctl::config::Config;
use intraday_ctl::secrets::SecretStore;
use intraday_ctl::store::Store;
use intraday_ctl::supervisor::Supervisor;

const SERVICE_NAME: &str = "intraday-ctl";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("starting {} v{}", SERVICE_NAME, env!("CARGO_PKG_VERSION"));

    let config = Config::load();

    let api_password = match &config.broker_api_password_file {
        Some(path) => {
            let master = std::env::var("SECRET_MASTER_PASSWORD")
                .map_err(|_| anyhow::anyhow!("SECRET_MASTER_PASSWORD must be set to unseal broker credentials"))?;
            SecretStore::new(path).unseal(&master)?
        }
        None => std::env::var("BROKER_API_PASSWORD").unwrap_or_default(),
    };

    let store = Arc::new(Store::connect(&config.database_url).await?);
    let audit_pool = sqlx::sqlite::SqlitePoolOptions::new()
        .connect(&config.database_url)
        .await?;
    let audit = Arc::new(intraday_ctl::audit::AuditTrail::new(audit_pool).await?);
    let broker: Arc<dyn intraday_ctl::broker::BrokerAdapter> = Arc::new(HttpBroker::new(
        config.broker_base_url.clone(),
        api_password,
        config.retry_max_attempts,
    ));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let supervisor = Arc::new(Supervisor::new(store, audit, broker, clock, &config));
    let shutdown = supervisor.shutdown_handle();

    let run_handle = tokio::spawn(supervisor.clone().run());

    tokio::select! {
        result = run_handle => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
            let _ = shutdown.send(());
        }
    }

    info!("{} shut down", SERVICE_NAME);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", SERVICE_NAME.replace('-', "_")).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true).with_line_number(true))
        .init();
}
