use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use envspot_contracts::{ListApplicationsQuery, NameAndDescription, NameConfirmation};

use super::{AppState, instrumented, invalid_argument, ndjson, service_error};

pub(super) async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<NameAndDescription>, JsonRejection>,
) -> Response {
    instrumented("/v1/applications", "POST", &headers, |token| async move {
        let Json(req) = req.map_err(|_| invalid_argument("invalid JSON body"))?;
        let app = state
            .service
            .create_application(&token, req)
            .await
            .map_err(service_error)?;
        Ok((StatusCode::CREATED, Json(app)).into_response())
    })
    .await
}

pub(super) async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ListApplicationsQuery>, QueryRejection>,
) -> Response {
    instrumented("/v1/applications", "GET", &headers, |token| async move {
        let Query(query) =
            query.map_err(|_| invalid_argument("added must be true or false"))?;
        let operation = if query.added {
            "applications.list_added"
        } else {
            "applications.list_available"
        };
        let rows = state
            .service
            .list_applications(&token, query.added)
            .await
            .map_err(service_error)?;
        Ok(ndjson(operation, rows))
    })
    .await
}

pub(super) async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    instrumented("/v1/applications/{id}", "GET", &headers, |token| async move {
        let app = state
            .service
            .get_application(&token, &id)
            .await
            .map_err(service_error)?;
        Ok(Json(app).into_response())
    })
    .await
}

pub(super) async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    req: Result<Json<NameAndDescription>, JsonRejection>,
) -> Response {
    instrumented("/v1/applications/{id}", "PUT", &headers, |token| async move {
        let Json(req) = req.map_err(|_| invalid_argument("invalid JSON body"))?;
        let app = state
            .service
            .update_application(&token, &id, req)
            .await
            .map_err(service_error)?;
        Ok(Json(app).into_response())
    })
    .await
}

pub(super) async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    confirmation: Result<Query<NameConfirmation>, QueryRejection>,
) -> Response {
    instrumented("/v1/applications/{id}", "DELETE", &headers, |token| async move {
        let Query(confirmation) = confirmation
            .map_err(|_| invalid_argument("name query parameter is required"))?;
        state
            .service
            .delete_application(&token, &id, &confirmation.name)
            .await
            .map_err(service_error)?;
        Ok(StatusCode::NO_CONTENT.into_response())
    })
    .await
}
