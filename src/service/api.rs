//! # Management API
//!
//! REST surface over the store: `/v1/{bundles|sources|stacks|secrets}` CRUD
//! plus `/v1/sources/{name}/data/*` for per-source data. Authentication is
//! a bearer token matching a `tokens.api_key` row; authorization happens in
//! the store, scoped per row.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, put},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::config::{Bundle, Secret, Source, Stack};
use crate::store::{Caller, ListOptions, PatchOp, Store, StoreError};

use super::Service;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<Store>,
    pub service: Arc<Service>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/bundles", get(list_bundles))
        .route(
            "/v1/bundles/{name}",
            get(get_bundle).put(put_bundle).delete(delete_bundle),
        )
        .route("/v1/sources", get(list_sources))
        .route(
            "/v1/sources/{name}",
            get(get_source).put(put_source).delete(delete_source),
        )
        .route("/v1/stacks", get(list_stacks))
        .route(
            "/v1/stacks/{name}",
            get(get_stack).put(put_stack).delete(delete_stack),
        )
        .route("/v1/secrets", get(list_secrets))
        .route(
            "/v1/secrets/{name}",
            put(put_secret).delete(delete_secret),
        )
        .route(
            "/v1/sources/{name}/data/{*path}",
            get(get_data)
                .put(put_data)
                .post(put_data)
                .patch(patch_data)
                .delete(delete_data),
        )
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            StoreError::NotFound => (StatusCode::NOT_FOUND, json!({"error": "not found"})),
            StoreError::NotAuthorized => {
                (StatusCode::FORBIDDEN, json!({"error": "not authorized"}))
            }
            StoreError::DataConflict { paths } => (
                StatusCode::CONFLICT,
                json!({"error": "data conflict", "paths": paths}),
            ),
            StoreError::ReferencedSource { .. } => {
                (StatusCode::CONFLICT, json!({"error": self.0.to_string()}))
            }
            StoreError::Validation(message) => {
                (StatusCode::BAD_REQUEST, json!({"error": message}))
            }
            _ => {
                tracing::error!(error = %self.0, "internal error serving API request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": "internal error"}),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

async fn authenticate(State(state): State<ApiState>, mut request: Request, next: Next) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));
    let Some(token) = token else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "missing bearer token"})),
        )
            .into_response();
    };
    match state.store.caller_by_api_key(token).await {
        Ok(Some(caller)) => {
            request.extensions_mut().insert(caller);
            next.run(request).await
        }
        Ok(None) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unknown api key"})),
        )
            .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    cursor: Option<String>,
}

impl ListQuery {
    fn options(self) -> ListOptions {
        ListOptions {
            limit: self.limit,
            cursor: self.cursor,
        }
    }
}

fn page_body<T: serde::Serialize>(page: crate::store::Page<T>) -> Json<Value> {
    let mut body = json!({"result": page.items});
    if let Some(cursor) = page.next_cursor {
        body["next_cursor"] = json!(cursor);
    }
    Json(body)
}

// ---- bundles -------------------------------------------------------------

async fn list_bundles(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let page = state.store.list_bundles(&caller, &query.options()).await?;
    Ok(page_body(page))
}

async fn get_bundle(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let bundle = state.store.get_bundle(&caller, &name).await?;
    let status = state.store.get_bundle_status(&caller, &name).await?;
    Ok(Json(json!({"result": bundle, "status": status})))
}

async fn put_bundle(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
    Json(mut bundle): Json<Bundle>,
) -> Result<Json<Value>, ApiError> {
    bundle.name = name;
    state.store.upsert_bundle(&caller, &bundle).await?;
    state.service.notify_reload();
    Ok(Json(json!({})))
}

async fn delete_bundle(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.store.delete_bundle(&caller, &name).await?;
    state.service.notify_reload();
    Ok(Json(json!({})))
}

// ---- sources -------------------------------------------------------------

async fn list_sources(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let page = state.store.list_sources(&caller, &query.options()).await?;
    Ok(page_body(page))
}

async fn get_source(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let source = state.store.get_source(&caller, &name).await?;
    Ok(Json(json!({"result": source})))
}

async fn put_source(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
    Json(mut source): Json<Source>,
) -> Result<Json<Value>, ApiError> {
    source.name = name;
    state.store.upsert_source(&caller, &source).await?;
    state.service.notify_reload();
    Ok(Json(json!({})))
}

async fn delete_source(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.store.delete_source(&caller, &name).await?;
    state.service.notify_reload();
    Ok(Json(json!({})))
}

// ---- stacks --------------------------------------------------------------

async fn list_stacks(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let page = state.store.list_stacks(&caller, &query.options()).await?;
    Ok(page_body(page))
}

async fn get_stack(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let stack = state.store.get_stack(&caller, &name).await?;
    Ok(Json(json!({"result": stack})))
}

async fn put_stack(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
    Json(mut stack): Json<Stack>,
) -> Result<Json<Value>, ApiError> {
    stack.name = name;
    state.store.upsert_stack(&caller, &stack).await?;
    state.service.notify_reload();
    Ok(Json(json!({})))
}

async fn delete_stack(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.store.delete_stack(&caller, &name).await?;
    state.service.notify_reload();
    Ok(Json(json!({})))
}

// ---- secrets -------------------------------------------------------------

async fn list_secrets(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let page = state.store.list_secrets(&caller, &query.options()).await?;
    Ok(page_body(page))
}

async fn put_secret(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
    Json(mut secret): Json<Secret>,
) -> Result<Json<Value>, ApiError> {
    secret.name = name;
    state.store.upsert_secret(&caller, &secret).await?;
    Ok(Json(json!({})))
}

async fn delete_secret(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.store.delete_secret(&caller, &name).await?;
    Ok(Json(json!({})))
}

// ---- per-source data -----------------------------------------------------

async fn get_data(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Path((name, path)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let value = state.store.get_source_data(&caller, &name, &path).await?;
    Ok(Json(json!({"result": value})))
}

async fn put_data(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Path((name, path)): Path<(String, String)>,
    Json(value): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .put_source_data(&caller, &name, &path, &value)
        .await?;
    state.service.trigger_source(&caller.tenant, &name);
    Ok(Json(json!({})))
}

async fn patch_data(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Path((name, path)): Path<(String, String)>,
    Json(ops): Json<Vec<PatchOp>>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .patch_source_data(&caller, &name, &path, &ops)
        .await?;
    state.service.trigger_source(&caller.tenant, &name);
    Ok(Json(json!({})))
}

async fn delete_data(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Path((name, path)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .delete_source_data(&caller, &name, &path)
        .await?;
    state.service.trigger_source(&caller.tenant, &name);
    Ok(Json(json!({})))
}
