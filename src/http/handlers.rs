//! C7 handlers: map the external protocol (spec §6.1) onto
//! Registrar/TileLog/CheckpointSigner calls. No log logic lives here.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::errors::LogError;
use crate::hash::sha256;
use crate::http::dto::{HealthResponse, RegistrationJson, TransparencyConfiguration};
use crate::http::AppState;
use crate::metrics::ApiMetrics;
use crate::proof;
use crate::registrar::RegistrationOutcome;
use crate::storage::CheckpointRow;
use crate::tile::{self, TileAddr};
use crate::tilelog::TileReader;

const COSE_CONTENT_TYPE: &str = "application/cose";
const OCTET_STREAM: &str = "application/octet-stream";

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

fn cose_response(status: StatusCode, bytes: Vec<u8>) -> Response {
    (status, [(header::CONTENT_TYPE, COSE_CONTENT_TYPE)], bytes).into_response()
}

fn octet_response(bytes: Vec<u8>) -> Response {
    (StatusCode::OK, [(header::CONTENT_TYPE, OCTET_STREAM)], bytes).into_response()
}

/// A routing-layer rejection (wrong `Content-Type`), distinct from
/// [`LogError`]'s domain errors — spec §6.1/§7 map it to `415` specifically,
/// separate from `400 UnsupportedAlgorithm` for an in-envelope `alg` problem.
#[derive(serde::Serialize)]
struct UnsupportedMediaTypeBody {
    #[serde(rename = "type")]
    kind: &'static str,
    title: &'static str,
    status: u16,
    detail: String,
}

fn unsupported_media_type(detail: String) -> Response {
    let body = UnsupportedMediaTypeBody {
        kind: "unsupported-media-type",
        title: "unsupported-media-type",
        status: StatusCode::UNSUPPORTED_MEDIA_TYPE.as_u16(),
        detail,
    };
    (StatusCode::UNSUPPORTED_MEDIA_TYPE, Json(body)).into_response()
}

/// Flips the service-wide write-disable flag reported on `/health` (spec
/// §7: an `Integrity` error is not retryable and must stop further writes
/// until an operator intervenes).
fn note_integrity<T>(state: &AppState, result: &Result<T, LogError>) {
    if let Err(LogError::Integrity(detail)) = result {
        if !state.write_disabled.swap(true, std::sync::atomic::Ordering::Relaxed) {
            tracing::error!(%detail, "integrity violation detected, disabling further writes");
        }
    }
}

/// `POST /entries`. Responds with the signed COSE receipt by default; a
/// client sending `Accept: application/json` instead gets the
/// `{entry_id, statement_hash}` schema some clients use (spec §6.1).
pub async fn post_entries(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, LogError> {
    let result = post_entries_inner(state.clone(), headers, body).await;
    note_integrity(&state, &result);
    result
}

async fn post_entries_inner(
    state: Arc<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, LogError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with(COSE_CONTENT_TYPE) {
        return Ok(unsupported_media_type(format!(
            "Content-Type {content_type} is not application/cose"
        )));
    }
    if state.write_disabled.load(std::sync::atomic::Ordering::Relaxed) {
        return Err(LogError::Storage(
            "writes are disabled after a detected integrity violation".into(),
        ));
    }
    let wants_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"));

    let _permit = state
        .admission
        .clone()
        .try_acquire_owned()
        .map_err(|_| LogError::Transient("registration concurrency limit reached".into()))?;

    let statement_hash = sha256(&body);
    let started = std::time::Instant::now();
    let outcome = state.registrar.register(body.to_vec(), now_unix()).await;
    ApiMetrics::observe_registration_duration(started.elapsed());

    let (position, receipt_bytes, metric_label) = match outcome {
        RegistrationOutcome::Accepted { position, receipt_bytes } => (position, receipt_bytes, "accepted"),
        RegistrationOutcome::Duplicate { position, receipt_bytes } => (position, receipt_bytes, "duplicate"),
        RegistrationOutcome::Rejected(e) => {
            ApiMetrics::increment_registrations("rejected");
            return Err(e);
        }
    };
    ApiMetrics::increment_registrations(metric_label);

    if wants_json {
        return Ok((
            StatusCode::CREATED,
            Json(RegistrationJson {
                entry_id: position,
                statement_hash: hex::encode(statement_hash),
            }),
        )
            .into_response());
    }

    match receipt_bytes {
        Some(bytes) => Ok(cose_response(StatusCode::CREATED, bytes)),
        None => Ok((
            StatusCode::CREATED,
            Json(RegistrationJson {
                entry_id: position,
                statement_hash: hex::encode(statement_hash),
            }),
        )
            .into_response()),
    }
}

/// `GET /entries/{position}`.
pub async fn get_entry(
    State(state): State<Arc<AppState>>,
    Path(position): Path<u64>,
) -> Result<Response, LogError> {
    let result = get_entry_inner(&state, position).await;
    note_integrity(&state, &result);
    result
}

async fn get_entry_inner(state: &AppState, position: u64) -> Result<Response, LogError> {
    let entry = state
        .meta
        .lookup_entry(position)
        .await?
        .ok_or(LogError::NotFound)?;
    Ok(cose_response(StatusCode::OK, entry.statement_bytes))
}

/// `GET /entries/{position}/receipt`.
pub async fn get_entry_receipt(
    State(state): State<Arc<AppState>>,
    Path(position): Path<u64>,
) -> Result<Response, LogError> {
    let result = get_entry_receipt_inner(&state, position).await;
    note_integrity(&state, &result);
    result
}

async fn get_entry_receipt_inner(state: &AppState, position: u64) -> Result<Response, LogError> {
    state.meta.lookup_entry(position).await?.ok_or(LogError::NotFound)?;

    let size = position + 1;
    let current_size = state.meta.read_tree_size().await?;
    if size > current_size {
        return Err(LogError::OutOfRange(format!(
            "position {position} not yet covered by tree_size {current_size}"
        )));
    }

    let inclusion_path = proof::inclusion_proof(state.tile_log.as_ref(), position, size).await?;
    let root = state.tile_log.root_at(size).await?;

    if state.meta.get_checkpoint(size).await?.is_none() {
        let checkpoint_bytes = state.checkpoint_signer.make_checkpoint(size, root, now_unix())?;
        state
            .meta
            .insert_checkpoint(&CheckpointRow {
                tree_size: size,
                root_hash: root,
                cose_sign1_bytes: checkpoint_bytes,
                created_at: now_unix() as i64,
            })
            .await?;
        ApiMetrics::set_checkpoint_tree_size(size);
    }

    let payload = crate::cose::ReceiptPayload {
        leaf_index: position,
        inclusion_path,
    };
    let receipt_bytes = state.checkpoint_signer.sign_receipt(size, &payload)?;
    Ok(cose_response(StatusCode::OK, receipt_bytes))
}

/// `GET /checkpoint`.
pub async fn get_checkpoint(State(state): State<Arc<AppState>>) -> Result<Response, LogError> {
    let result = get_checkpoint_inner(&state).await;
    note_integrity(&state, &result);
    result
}

async fn get_checkpoint_inner(state: &AppState) -> Result<Response, LogError> {
    let checkpoint = state.meta.get_latest_checkpoint().await?.ok_or(LogError::NotFound)?;
    Ok(cose_response(StatusCode::OK, checkpoint.cose_sign1_bytes))
}

/// `GET /tile/{level}/{rest}` and `GET /tile/entries/{rest}`, where `rest`
/// is the zero-padded grouped index, optionally followed by `.p/{w}`.
pub async fn get_tile(
    State(state): State<Arc<AppState>>,
    Path((level, rest)): Path<(String, String)>,
) -> Result<Response, LogError> {
    let (index_path, width) = match rest.split_once(".p/") {
        Some((index_path, width)) => {
            let width: u64 = width
                .parse()
                .map_err(|_| LogError::OutOfRange(format!("invalid partial tile width {width:?}")))?;
            if width == 0 || width > tile::WIDTH - 1 {
                return Err(LogError::OutOfRange(format!("partial tile width {width} out of range")));
            }
            (index_path, width)
        }
        None => (rest.as_str(), tile::WIDTH),
    };
    let index = tile::decode_index(index_path).ok_or_else(|| LogError::NotFound)?;

    let addr = if level == "entries" {
        TileAddr::entries(index)
    } else {
        let level: u8 = level.parse().map_err(|_| LogError::NotFound)?;
        TileAddr::node(level, index)
    };

    let bytes = state
        .blobs
        .get(&addr.blob_key(width))
        .await
        .map_err(|_| LogError::NotFound)?;
    Ok(octet_response(bytes))
}

/// `GET /.well-known/transparency-configuration`.
pub async fn get_transparency_configuration(
    State(state): State<Arc<AppState>>,
) -> Json<TransparencyConfiguration> {
    Json(TransparencyConfiguration {
        origin: state.origin.clone(),
        hash_algorithm: "sha256",
        verifiable_data_structure: crate::cose::VDS_RFC9162_SHA256,
        tile_height: tile::HEIGHT,
    })
}

/// `GET /health`.
pub async fn get_health(State(state): State<Arc<AppState>>) -> Response {
    let write_disabled = state.write_disabled.load(std::sync::atomic::Ordering::Relaxed);
    let tree_size = state.meta.read_tree_size().await.unwrap_or(0);
    let status = if write_disabled { "write-disabled" } else { "ok" };
    let code = if write_disabled { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK };
    (code, Json(HealthResponse { status, tree_size })).into_response()
}
