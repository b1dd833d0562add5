use anyhow::{Context, Result};
use rollcall_core::enrollment::EnrollmentOrchestrator;
use rollcall_core::ledger::Ledger;
use rollcall_core::scan::ScanController;
use rollcall_core::EuclideanMatcher;
use rollcall_store::SqliteStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod enroller;
mod evidence;
mod extractor;
mod recognizer;
mod scanner;

#[cfg(test)]
mod testing;

use config::{BusKind, Config};
use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::load().context("loading configuration")?;
    let offset = config.utc_offset()?;
    tracing::info!(
        db = %config.db_path.display(),
        evidence = %config.evidence_dir.display(),
        extractor = %config.extractor_url,
        threshold = config.match_threshold,
        utc_offset_minutes = config.utc_offset_minutes,
        bus = ?config.bus,
        "configuration loaded"
    );

    let store = Arc::new(SqliteStore::open(&config.db_path).context("opening database")?);
    let ledger = Arc::new(Ledger::new(Arc::clone(&store), offset));
    let evidence = Arc::new(evidence::EvidenceStore::new(config.evidence_dir.clone()));
    let extractor = Arc::new(
        extractor::HttpExtractor::new(&config.extractor_url, config.extractor_timeout())
            .context("building extractor client")?,
    );
    tracing::info!(endpoint = extractor.endpoint(), "descriptor extractor configured");

    let recognizer = Arc::new(recognizer::Recognizer::new(
        Arc::clone(&extractor),
        Arc::clone(&store),
        Arc::clone(&evidence),
        EuclideanMatcher::new(config.match_threshold),
    ));
    let scanner = scanner::spawn_scanner(
        ScanController::new(config.scan_timing()),
        recognizer,
        Arc::clone(&ledger),
    );

    let orchestrator = Arc::new(EnrollmentOrchestrator::new(
        Arc::clone(&store),
        config.enrollment_settings(),
    ));
    let enroller = Arc::new(enroller::Enroller::new(orchestrator, extractor));

    let service = RollcallService::new(scanner, enroller, ledger, store, evidence);

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
