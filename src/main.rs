//! Composition root: load config, wire storage/signing/pipeline, serve HTTP.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use eyre::{Context, Result};
use p256::ecdsa::SigningKey;
use tracing_subscriber::EnvFilter;

use transparency_log::checkpoint::CheckpointSigner;
use transparency_log::config::Config;
use transparency_log::cose::CoseSigner;
use transparency_log::http::{build_router, AppState};
use transparency_log::metrics::run_metrics_server;
use transparency_log::registrar::{Registrar, RegistrarConfig, ServiceKeyStoreResolver};
use transparency_log::storage::blob_fs::FsBlobStore;
use transparency_log::storage::meta_sqlite::SqliteMetaStore;
use transparency_log::storage::{BlobStore, PrefixedBlobStore};
use transparency_log::tilelog::TileLog;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(origin = %config.origin, bind_addr = %config.bind_addr, "starting transparency log service");

    let signing_key = load_signing_key(&config.service_key_path).wrap_err("loading service signing key")?;
    let kid = hex::encode(signing_key.verifying_key().to_sec1_bytes());

    let fs_blobs = FsBlobStore::open(&config.blob_store_path)
        .await
        .wrap_err("opening blob store")?;
    let blobs: Arc<dyn BlobStore> = if config.storage_prefix.is_empty() {
        Arc::new(fs_blobs)
    } else {
        Arc::new(PrefixedBlobStore::new(Arc::new(fs_blobs), config.storage_prefix.clone()))
    };

    let meta = Arc::new(
        SqliteMetaStore::open(&config.meta_store_url)
            .await
            .wrap_err("opening meta store")?,
    );

    let tile_log = Arc::new(TileLog::new(blobs.clone()));

    let committed_size = meta.read_tree_size().await.wrap_err("reading committed tree size at startup")?;
    match tile_log.reconcile_orphaned_tiles(committed_size).await {
        Ok(0) => {}
        Ok(orphaned) => tracing::warn!(
            committed_size,
            orphaned,
            "startup reconciliation found tile bytes beyond the committed tree size; already inert, no action taken"
        ),
        Err(e) => tracing::warn!(err = ?e, "startup reconciliation check failed, continuing"),
    }

    let checkpoint_signer = Arc::new(CheckpointSigner::new(
        CoseSigner::new(signing_key, kid.into_bytes()),
        config.origin.clone(),
    ));
    let key_resolver = Arc::new(ServiceKeyStoreResolver::new(meta.clone()));

    let registrar_config = RegistrarConfig {
        max_statement_bytes: config.max_statement_bytes,
        ..RegistrarConfig::default()
    };
    let registrar = Arc::new(Registrar::new(
        meta.clone(),
        tile_log.clone(),
        checkpoint_signer.clone(),
        key_resolver,
        registrar_config,
    ));

    let state = Arc::new(AppState {
        registrar,
        tile_log,
        blobs,
        meta,
        checkpoint_signer,
        admission: Arc::new(tokio::sync::Semaphore::new(config.registration_concurrency)),
        write_disabled: Arc::new(AtomicBool::new(false)),
        origin: config.origin.clone(),
    });

    let metrics_addr: SocketAddr = config.metrics_addr.parse().wrap_err("parsing metrics_addr")?;
    if let Err(e) = run_metrics_server(metrics_addr) {
        tracing::warn!(err = ?e, "failed to start metrics exporter, continuing without it");
    }

    let bind_addr: SocketAddr = config.bind_addr.parse().wrap_err("parsing bind_addr")?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .wrap_err("binding HTTP listener")?;
    tracing::info!(%bind_addr, "HTTP surface listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("HTTP server exited")?;
    Ok(())
}

/// Waits for `SIGINT` (or `SIGTERM` on unix) so in-flight requests finish
/// before the process exits (spec §5: no long-running work should be cut off
/// mid-write).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining in-flight requests");
}

/// Load the service's ES256 signing key: a raw 32-byte scalar on disk,
/// hex-encoded or binary (spec §6.3 `service_key_path`; key management itself
/// is out of scope, spec §1).
fn load_signing_key(path: &std::path::Path) -> Result<SigningKey> {
    let bytes = std::fs::read(path).wrap_err("reading service key file")?;
    if bytes.len() == 32 {
        return SigningKey::from_slice(&bytes).wrap_err("parsing raw signing key bytes");
    }
    let text = String::from_utf8(bytes).wrap_err("service key file is neither 32 raw bytes nor hex text")?;
    let decoded = hex::decode(text.trim()).wrap_err("hex-decoding service key")?;
    SigningKey::from_slice(&decoded).wrap_err("parsing hex-decoded signing key bytes")
}
