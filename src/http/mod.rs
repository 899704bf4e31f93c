//! C7: the HTTP surface (spec §6.1). Maps the external protocol onto
//! `Registrar`/`TileLog`/`CheckpointSigner` calls; owns no log logic itself.

pub mod dto;
pub mod handlers;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::checkpoint::CheckpointSigner;
use crate::registrar::Registrar;
use crate::storage::meta_sqlite::SqliteMetaStore;
use crate::storage::BlobStore;
use crate::tilelog::TileLog;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Everything a handler needs to serve a request, shared behind one `Arc`
/// (spec §9 concurrency shape: OS threads over a shared, internally
/// synchronized state rather than a single cooperative loop).
pub struct AppState {
    pub registrar: Arc<Registrar>,
    pub tile_log: Arc<TileLog>,
    pub blobs: Arc<dyn BlobStore>,
    pub meta: Arc<SqliteMetaStore>,
    pub checkpoint_signer: Arc<CheckpointSigner>,
    pub admission: Arc<tokio::sync::Semaphore>,
    /// Set by the integrity-violation path (spec §7): once true, writes are
    /// refused and `/health` reports unhealthy until an operator restarts.
    pub write_disabled: Arc<AtomicBool>,
    pub origin: String,
}

/// Build the router for the spec §6.1 protocol surface, with the ambient
/// middleware stack the donor gateway wires around every route (request-id
/// propagation, structured request tracing, panic catching).
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/entries", post(handlers::post_entries))
        .route("/entries/:position", get(handlers::get_entry))
        .route("/entries/:position/receipt", get(handlers::get_entry_receipt))
        .route("/checkpoint", get(handlers::get_checkpoint))
        .route("/tile/:level/*rest", get(handlers::get_tile))
        .route(
            "/.well-known/transparency-configuration",
            get(handlers::get_transparency_configuration),
        )
        .route("/health", get(handlers::get_health))
        .with_state(state)
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}
