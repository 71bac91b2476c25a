use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use envspot_contracts::{AddServicesRequest, NameAndDescription, NameConfirmation};

use super::{AppState, instrumented, invalid_argument, ndjson, service_error};

pub(super) async fn create(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
    req: Result<Json<NameAndDescription>, JsonRejection>,
) -> Response {
    instrumented(
        "/v1/applications/{app_id}/contours",
        "POST",
        &headers,
        |token| async move {
            let Json(req) = req.map_err(|_| invalid_argument("invalid JSON body"))?;
            let contour = state
                .service
                .create_contour(&token, &app_id, req)
                .await
                .map_err(service_error)?;
            Ok((StatusCode::CREATED, Json(contour)).into_response())
        },
    )
    .await
}

pub(super) async fn list(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    instrumented(
        "/v1/applications/{app_id}/contours",
        "GET",
        &headers,
        |token| async move {
            let rows = state
                .service
                .list_contours(&token, &app_id)
                .await
                .map_err(service_error)?;
            Ok(ndjson("contours.list", rows))
        },
    )
    .await
}

pub(super) async fn remove(
    State(state): State<AppState>,
    Path((app_id, id)): Path<(String, String)>,
    headers: HeaderMap,
    confirmation: Result<Query<NameConfirmation>, QueryRejection>,
) -> Response {
    instrumented(
        "/v1/applications/{app_id}/contours/{id}",
        "DELETE",
        &headers,
        |token| async move {
            let Query(confirmation) = confirmation
                .map_err(|_| invalid_argument("name query parameter is required"))?;
            state
                .service
                .delete_contour(&token, &app_id, &id, &confirmation.name)
                .await
                .map_err(service_error)?;
            Ok(StatusCode::NO_CONTENT.into_response())
        },
    )
    .await
}

pub(super) async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    instrumented("/v1/contours/{id}", "GET", &headers, |token| async move {
        let contour = state
            .service
            .get_contour(&token, &id)
            .await
            .map_err(service_error)?;
        Ok(Json(contour).into_response())
    })
    .await
}

pub(super) async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    req: Result<Json<NameAndDescription>, JsonRejection>,
) -> Response {
    instrumented("/v1/contours/{id}", "PUT", &headers, |token| async move {
        let Json(req) = req.map_err(|_| invalid_argument("invalid JSON body"))?;
        let contour = state
            .service
            .update_contour(&token, &id, req)
            .await
            .map_err(service_error)?;
        Ok(Json(contour).into_response())
    })
    .await
}

pub(super) async fn add_services(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    req: Result<Json<AddServicesRequest>, JsonRejection>,
) -> Response {
    instrumented(
        "/v1/contours/{id}/services",
        "POST",
        &headers,
        |token| async move {
            let Json(req) = req.map_err(|_| invalid_argument("invalid JSON body"))?;
            state
                .service
                .add_services(&token, &id, req.services)
                .await
                .map_err(service_error)?;
            Ok(StatusCode::NO_CONTENT.into_response())
        },
    )
    .await
}

pub(super) async fn remove_service(
    State(state): State<AppState>,
    Path((id, service_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    instrumented(
        "/v1/contours/{id}/services/{service_id}",
        "DELETE",
        &headers,
        |token| async move {
            state
                .service
                .remove_service(&token, &id, &service_id)
                .await
                .map_err(service_error)?;
            Ok(StatusCode::NO_CONTENT.into_response())
        },
    )
    .await
}
