//!
//! classgate server binary
//! ------------------------
//! Command-line entry point. Resolves configuration from `CLASSGATE_*` environment
//! variables and CLI flags, picks a storage backend and starts the HTTP server.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use classgate::config::{has_flag, PortalConfig, USAGE};
use classgate::storage::{MemoryStore, PgStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("{}", USAGE);
        return Ok(());
    }

    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("building log filter")?;
    fmt().with_env_filter(filter).init();

    let cfg = PortalConfig::from_env_and_args(&args);

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "classgate",
        "classgate starting: RUST_LOG='{}', bind={}:{}, database={}, session_ttl={}s, fetch_timeout={}ms, secure_cookies={}",
        rust_log,
        cfg.bind_addr,
        cfg.http_port,
        cfg.redacted_database_url().unwrap_or_else(|| "<in-memory>".to_string()),
        cfg.session_ttl.as_secs(),
        cfg.fetch_timeout.as_millis(),
        cfg.secure_cookies,
    );
    if !cfg.secure_cookies {
        warn!("session cookies are sent without the Secure attribute");
    }

    match cfg.database_url.clone() {
        Some(url) => {
            let store = PgStore::connect(&url).await.context("While connecting to Postgres")?;
            store.ensure_schema().await.context("While ensuring the portal schema")?;
            classgate::server::run_with_config(Arc::new(store), cfg).await
        }
        None => {
            let store = MemoryStore::new();
            if cfg.demo_data {
                store.seed_demo();
                info!("in-memory store seeded with demo classes 10A, 10B, 11A");
            }
            classgate::server::run_with_config(Arc::new(store), cfg).await
        }
    }
}
