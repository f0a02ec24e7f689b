use std::{collections::HashMap, sync::Arc};

use axum::{
    Json,
    body::Bytes,
    extract::{self, Path, Query},
    http::{StatusCode, header::SET_COOKIE},
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::{
    error::AppError,
    models::{CategoryWithServices, Service},
    session::SessionUser,
    state::State,
    utils::parse_json,
};

type AppState = extract::State<Arc<State>>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendCodeRequest {
    phone_number: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyCodeRequest {
    phone_number: String,
    code: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceIdsRequest {
    service_ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicesQuery {
    category_id: Option<String>,
}

pub async fn health_handler(extract::State(state): AppState) -> impl IntoResponse {
    match state.database.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => {
            error!("Health check failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
        }
    }
}

pub async fn send_code_handler(
    extract::State(state): AppState,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let payload: SendCodeRequest = parse_json(&body)?;
    let phone_number = state.auth.send_code(&payload.phone_number).await?;

    Ok(Json(json!({ "success": true, "phoneNumber": phone_number })))
}

pub async fn verify_code_handler(
    extract::State(state): AppState,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let payload: VerifyCodeRequest = parse_json(&body)?;
    let verified = state
        .auth
        .verify_code(&payload.phone_number, &payload.code)
        .await?;

    let token = state.sessions.issue(verified.user.id, Utc::now());

    Ok((
        [(SET_COOKIE, state.sessions.cookie(&token))],
        Json(json!({ "user": verified.user, "isNewUser": verified.is_new_user })),
    ))
}

pub async fn logout_handler(extract::State(state): AppState) -> impl IntoResponse {
    (
        StatusCode::NO_CONTENT,
        [(SET_COOKIE, state.sessions.clear_cookie())],
    )
}

pub async fn session_handler(SessionUser(user): SessionUser) -> impl IntoResponse {
    Json(json!({ "user": user }))
}

pub async fn categories_handler(
    extract::State(state): AppState,
) -> Result<impl IntoResponse, AppError> {
    let categories = state.database.list_categories().await?;
    let services = state.database.list_services(None).await?;

    let mut by_category: HashMap<String, Vec<Service>> = HashMap::new();
    for service in services {
        by_category
            .entry(service.category_id.clone())
            .or_default()
            .push(service);
    }

    let catalog: Vec<CategoryWithServices> = categories
        .into_iter()
        .map(|category| CategoryWithServices {
            services: by_category.remove(&category.id).unwrap_or_default(),
            category,
        })
        .collect();

    Ok(Json(catalog))
}

pub async fn category_handler(
    extract::State(state): AppState,
    Path(category_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let category = state
        .database
        .get_category(&category_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Category {category_id}")))?;
    let services = state.database.list_services(Some(category_id.as_str())).await?;

    Ok(Json(CategoryWithServices { category, services }))
}

pub async fn services_handler(
    extract::State(state): AppState,
    Query(query): Query<ServicesQuery>,
) -> Result<impl IntoResponse, AppError> {
    let services = state
        .database
        .list_services(query.category_id.as_deref())
        .await?;

    Ok(Json(services))
}

pub async fn user_services_handler(
    extract::State(state): AppState,
    SessionUser(user): SessionUser,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.selection.list(user.id).await?))
}

pub async fn select_services_handler(
    extract::State(state): AppState,
    SessionUser(user): SessionUser,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let payload: ServiceIdsRequest = parse_json(&body)?;
    let outcome = state.selection.select(user.id, &payload.service_ids).await?;

    Ok(Json(outcome))
}

pub async fn set_category_services_handler(
    extract::State(state): AppState,
    SessionUser(user): SessionUser,
    Path(category_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let payload: ServiceIdsRequest = parse_json(&body)?;
    let selection = state
        .selection
        .set_category_selections(user.id, &category_id, &payload.service_ids)
        .await?;

    Ok(Json(selection))
}

pub async fn deselect_service_handler(
    extract::State(state): AppState,
    SessionUser(user): SessionUser,
    Path(service_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let removed = state.selection.deselect(user.id, &service_id).await?;

    if removed {
        info!("User {} deselected {service_id}", user.id);
    }

    Ok(Json(json!({ "removed": removed })))
}

pub async fn progress_handler(
    extract::State(state): AppState,
    SessionUser(user): SessionUser,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.progress.for_user(user.id).await?))
}
