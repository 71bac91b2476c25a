use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use envspot_auth::{AuthError, CallerToken, IdentityClient};
use envspot_contracts::ErrorKind;
use envspot_store::{PgStore, RowStream};
use serde::Serialize;
use tokio_stream::StreamExt;
use tracing::Instrument;
use ulid::Ulid;

use crate::config::{RegistryConfig, StartupError};
use crate::service::{RegistryService, ServiceError};

mod applications;
mod contours;

const REQUEST_ID_HEADER: &str = "x-envspot-request-id";

#[derive(Clone)]
pub struct AppState {
    service: RegistryService,
}

impl AppState {
    pub fn new(service: RegistryService) -> Self {
        Self { service }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn router(config: RegistryConfig) -> Result<Router, StartupError> {
    let store = PgStore::connect_and_migrate(&config.db_url, config.store_options())
        .await
        .map_err(|err| StartupError {
            code: "ERR_DB_UNAVAILABLE",
            message: format!("failed to initialize store: {}", err),
        })?;

    let identity =
        IdentityClient::new(config.identity_client_config()).map_err(|err| StartupError {
            code: "ERR_IDENTITY_UNAVAILABLE",
            message: format!("failed to initialize identity client: {}", err),
        })?;

    let store = Arc::new(store);
    let service = RegistryService::new(store.clone(), store, Arc::new(identity));
    Ok(router_with_state(AppState::new(service)))
}

pub fn router_with_state(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route(
            "/v1/applications",
            post(applications::create).get(applications::list),
        )
        .route(
            "/v1/applications/{id}",
            get(applications::get_one)
                .put(applications::update)
                .delete(applications::remove),
        )
        .route(
            "/v1/applications/{app_id}/contours",
            post(contours::create).get(contours::list),
        )
        .route(
            "/v1/applications/{app_id}/contours/{id}",
            delete(contours::remove),
        )
        .route(
            "/v1/contours/{id}",
            get(contours::get_one).put(contours::update),
        )
        .route("/v1/contours/{id}/services", post(contours::add_services))
        .route(
            "/v1/contours/{id}/services/{service_id}",
            delete(contours::remove_service),
        )
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("store", state.service.store_ready().await);
    checks.insert("identity", state.service.identity_ready().await);

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
    retryable: bool,
}

#[derive(Serialize)]
struct StreamErrorLine {
    error: ErrorResponse,
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    retryable: bool,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            retryable,
        }),
    )
}

fn kind_error(kind: ErrorKind, message: impl Into<String>) -> ApiError {
    let status =
        StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_error(status, kind.as_str(), message, kind.is_retryable())
}

fn service_error(err: ServiceError) -> ApiError {
    kind_error(err.kind, err.message)
}

fn auth_error(err: AuthError) -> ApiError {
    kind_error(err.kind(), err.message)
}

fn invalid_argument(message: impl Into<String>) -> ApiError {
    kind_error(ErrorKind::InvalidArgument, message)
}

/// Runs one request under a span, records metrics, and echoes the request id.
async fn instrumented<F, Fut>(
    route: &'static str,
    method: &'static str,
    headers: &HeaderMap,
    handler: F,
) -> Response
where
    F: FnOnce(CallerToken) -> Fut,
    Fut: Future<Output = Result<Response, ApiError>>,
{
    let request_id = extract_request_id(headers);
    let span = tracing::info_span!(
        "registry.request",
        request_id = %request_id,
        route,
        method,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async {
        let token = CallerToken::from_headers(headers).map_err(auth_error)?;
        handler(token).await
    }
    .instrument(span.clone())
    .await;

    let mut response = match result {
        Ok(response) => {
            span.record("outcome", "ok");
            response
        }
        Err((status, Json(body))) => {
            span.record("outcome", body.code.as_str());
            if status.is_server_error() {
                tracing::warn!(parent: &span, code = %body.code, "request failed");
            }
            (status, Json(body)).into_response()
        }
    };
    span.record("latency_ms", started.elapsed().as_millis() as u64);

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    crate::metrics::observe_http_request(
        route,
        method,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

/// Streams rows as newline-delimited JSON. A store failure becomes the last line.
fn ndjson<T>(operation: &'static str, rows: RowStream<T>) -> Response
where
    T: Serialize + Send + 'static,
{
    let lines = rows.map(move |row| {
        let encoded = match row {
            Ok(item) => serde_json::to_vec(&item),
            Err(err) => {
                crate::metrics::inc_store_error(operation, err.kind.as_str());
                serde_json::to_vec(&StreamErrorLine {
                    error: ErrorResponse {
                        code: err.kind.as_str().to_string(),
                        message: err.message,
                        retryable: err.kind.is_retryable(),
                    },
                })
            }
        };
        let mut line = encoded.unwrap_or_else(|_| {
            br#"{"error":{"code":"INTERNAL","message":"row encoding failed","retryable":false}}"#
                .to_vec()
        });
        line.push(b'\n');
        Ok::<_, Infallible>(Bytes::from(line))
    });

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response()
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}
