use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use metrics::counter;
use roster_core::Manifest;
use roster_schema::{parse_slice, DecodeError, TypeRegistry};
use roster_store::{Payload, Pool};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Body returned for any method other than `POST`.
pub const POST_ONLY: &str = "this endpoint only allows POST requests";

type DecodeFn<S, T> = dyn Fn(&[u8]) -> Result<Manifest<S, T>, DecodeError> + Send + Sync;

struct Endpoint<S, T> {
    pool: Pool<S, T>,
    decode: Arc<DecodeFn<S, T>>,
}

impl<S, T> Clone for Endpoint<S, T> {
    fn clone(&self) -> Self { Self { pool: self.pool.clone(), decode: Arc::clone(&self.decode) } }
}

/// Router serving `POST path`, decoding bodies into `S`/`T` payloads.
pub fn manifest_router<S, T>(path: &str, pool: Pool<S, T>) -> Router
where
    S: Payload + Serialize + DeserializeOwned + Default,
    T: Payload + Serialize + DeserializeOwned + Default,
{
    let decode: Arc<DecodeFn<S, T>> = Arc::new(|body: &[u8]| parse_slice::<S, T>(body));
    router(path, Endpoint { pool, decode })
}

/// Router serving `POST path`, resolving payload shapes through `registry`.
pub fn auto_manifest_router(path: &str, pool: Pool, registry: Arc<TypeRegistry>) -> Router {
    let decode: Arc<DecodeFn<_, _>> = Arc::new(move |body: &[u8]| registry.auto_parse(body));
    router(path, Endpoint { pool, decode })
}

fn router<S, T>(path: &str, endpoint: Endpoint<S, T>) -> Router
where
    S: Payload + Serialize,
    T: Payload + Serialize,
{
    Router::new()
        .route(path, post(handle_manifest::<S, T>).fallback(method_not_allowed))
        .layer(TraceLayer::new_for_http())
        .with_state(endpoint)
}

async fn handle_manifest<S, T>(State(endpoint): State<Endpoint<S, T>>, body: Bytes) -> Response
where
    S: Payload + Serialize,
    T: Payload + Serialize,
{
    let manifest = match (endpoint.decode)(&body) {
        Ok(m) => m,
        Err(e) => {
            counter!("roster_http_rejected_total", 1u64);
            warn!(error = %e, "rejecting manifest");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };
    let action = endpoint.pool.apply(manifest.clone());
    debug!(key = %manifest.key(), action = %action, errors = manifest.errors.len(), "manifest received");
    (StatusCode::OK, Json(manifest)).into_response()
}

async fn method_not_allowed() -> (StatusCode, &'static str) {
    (StatusCode::METHOD_NOT_ALLOWED, POST_ONLY)
}
