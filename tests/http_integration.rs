//! End-to-end exercises of the HTTP surface (spec §6.1), built as whole
//! requests through the real `axum::Router` rather than calling handlers
//! directly, so routing and content-type checks are covered too.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use coset::cbor::value::Value;
use coset::{iana, CoseSign1Builder, HeaderBuilder};
use ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use rand_core::OsRng;
use tower::ServiceExt;

use transparency_log::checkpoint::CheckpointSigner;
use transparency_log::cose::CoseSigner;
use transparency_log::hash::sha256;
use transparency_log::http::{build_router, AppState};
use transparency_log::registrar::{Registrar, RegistrarConfig, ServiceKeyStoreResolver};
use transparency_log::storage::blob_fs::FsBlobStore;
use transparency_log::storage::meta_sqlite::SqliteMetaStore;
use transparency_log::storage::{BlobStore, ServiceKeyRow};
use transparency_log::tilelog::TileLog;

async fn test_state() -> (tempfile::TempDir, Arc<AppState>, SigningKey) {
    let dir = tempfile::tempdir().unwrap();
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::open(dir.path().join("blobs")).await.unwrap());
    let meta_path = dir.path().join("meta.sqlite3");
    let meta = Arc::new(
        SqliteMetaStore::open(&format!("sqlite://{}?mode=rwc", meta_path.display()))
            .await
            .unwrap(),
    );

    let signing_key = SigningKey::random(&mut OsRng);
    let kid = b"test-issuer".to_vec();
    meta.insert_service_key(&ServiceKeyRow {
        kid: String::from_utf8(kid.clone()).unwrap(),
        cose_key: signing_key.verifying_key().to_sec1_bytes().to_vec(),
        status: "active".to_string(),
        created_at: 0,
    })
    .await
    .unwrap();

    let tile_log = Arc::new(TileLog::new(blobs.clone()));
    let checkpoint_signer = Arc::new(CheckpointSigner::new(
        CoseSigner::new(SigningKey::random(&mut OsRng), b"service-key".to_vec()),
        "test-origin",
    ));
    let key_resolver = Arc::new(ServiceKeyStoreResolver::new(meta.clone()));
    let registrar = Arc::new(Registrar::new(
        meta.clone(),
        tile_log.clone(),
        checkpoint_signer.clone(),
        key_resolver,
        RegistrarConfig::default(),
    ));

    let state = Arc::new(AppState {
        registrar,
        tile_log,
        blobs,
        meta,
        checkpoint_signer,
        admission: Arc::new(tokio::sync::Semaphore::new(8)),
        write_disabled: Arc::new(AtomicBool::new(false)),
        origin: "test-origin".to_string(),
    });

    (dir, state, signing_key)
}

/// Build a statement COSE Sign1 signed by `issuer_key` with the headers
/// `Registrar::validate` requires: `alg=ES256`, `kid`, and a
/// `payload_hash_alg` hash-envelope claim (spec §4.6 step 1).
fn build_statement(issuer_key: &SigningKey, kid: &[u8], payload: Vec<u8>) -> Vec<u8> {
    let protected = HeaderBuilder::new()
        .algorithm(iana::Algorithm::ES256)
        .key_id(kid.to_vec())
        .text_value("payload_hash_alg".to_string(), Value::Text("sha-256".to_string()))
        .build();
    let sign1 = CoseSign1Builder::new()
        .protected(protected)
        .payload(payload)
        .create_signature(&[], |data| {
            let sig: Signature = issuer_key.sign(data);
            sig.to_bytes().to_vec()
        })
        .build();
    coset::CborSerializable::to_vec(sign1).unwrap()
}

#[tokio::test]
async fn post_entries_then_get_entry_and_receipt() {
    let (_dir, state, issuer_key) = test_state().await;
    let app = build_router(state);

    let statement = build_statement(&issuer_key, b"test-issuer", b"hello transparency log".to_vec());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/entries")
                .header("content-type", "application/cose")
                .body(Body::from(statement))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let content_type = response.headers().get("content-type").unwrap().clone();
    assert_eq!(content_type, "application/cose");

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/entries/0").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/entries/0/receipt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(Request::builder().uri("/checkpoint").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn post_entries_rejects_unknown_kid() {
    let (_dir, state, _issuer_key) = test_state().await;
    let app = build_router(state);

    let stranger = SigningKey::random(&mut OsRng);
    let statement = build_statement(&stranger, b"never-registered", b"payload".to_vec());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/entries")
                .header("content-type", "application/cose")
                .body(Body::from(statement))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn post_entries_rejects_wrong_content_type() {
    let (_dir, state, _issuer_key) = test_state().await;
    let app = build_router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/entries")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn duplicate_statement_is_idempotent_on_tree_size() {
    let (_dir, state, issuer_key) = test_state().await;
    let app = build_router(state.clone());

    let statement = build_statement(&issuer_key, b"test-issuer", b"same bytes twice".to_vec());

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/entries")
                    .header("content-type", "application/cose")
                    .body(Body::from(statement.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    assert_eq!(state.meta.read_tree_size().await.unwrap(), 1);
}

#[tokio::test]
async fn write_disabled_flag_rejects_new_registrations() {
    let (_dir, state, issuer_key) = test_state().await;
    state
        .write_disabled
        .store(true, std::sync::atomic::Ordering::Relaxed);
    let app = build_router(state.clone());

    let statement = build_statement(&issuer_key, b"test-issuer", b"should be refused".to_vec());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/entries")
                .header("content-type", "application/cose")
                .body(Body::from(statement))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn health_reports_tree_size() {
    let (_dir, state, _issuer_key) = test_state().await;
    let app = build_router(state);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["tree_size"], 0);
    assert_eq!(parsed["status"], "ok");
}

#[tokio::test]
async fn get_entries_tile_returns_flat_statement_hashes() {
    let (_dir, state, issuer_key) = test_state().await;
    let app = build_router(state);

    let payloads: Vec<Vec<u8>> = vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()];
    let mut statements = Vec::new();
    for payload in &payloads {
        let statement = build_statement(&issuer_key, b"test-issuer", payload.clone());
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/entries")
                    .header("content-type", "application/cose")
                    .body(Body::from(statement.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        statements.push(statement);
    }

    let response = app
        .oneshot(
            Request::builder()
                .uri("/tile/entries/000.p/3")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.len(), 3 * 32);
    for (i, statement) in statements.iter().enumerate() {
        let expected = sha256(statement);
        assert_eq!(&body[i * 32..(i + 1) * 32], &expected[..]);
    }
}

#[tokio::test]
async fn transparency_configuration_reflects_origin() {
    let (_dir, state, _issuer_key) = test_state().await;
    let app = build_router(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/.well-known/transparency-configuration")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["origin"], "test-origin");
    assert_eq!(parsed["tile_height"], 8);
}
