//! HTTP surface: webhook ingestion, cache reads for devices, and admin-only
//! device and configuration management.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tagsync_core::{decode_event, TagId};
use tagsync_storage::{DeviceAssignment, DeviceRecord, ReconciliationStore, StoreError};
use tagsync_sync::{EventProcessor, Secret, SyncConfig, SyncServices};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "tagsync-web";

const ADMIN_REALM: &str = "Basic realm=\"tagsync admin\"";

#[derive(Clone)]
pub struct AppState {
    pub store: ReconciliationStore,
    pub events: Arc<EventProcessor>,
    webhook_token: Secret,
    admin_token: Secret,
    config: Option<Arc<SyncConfig>>,
}

impl AppState {
    pub fn new(store: ReconciliationStore, events: Arc<EventProcessor>, webhook_token: Secret) -> Self {
        Self {
            store,
            events,
            webhook_token,
            admin_token: Secret::default(),
            config: None,
        }
    }

    pub fn from_services(services: &SyncServices, webhook_token: Secret) -> Self {
        Self::new(services.store.clone(), Arc::clone(&services.events), webhook_token)
    }

    /// Without an admin token every admin route answers 401.
    pub fn with_admin_token(mut self, admin_token: Secret) -> Self {
        self.admin_token = admin_token;
        self
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = Some(Arc::new(config));
        self
    }

    fn token_matches(&self, presented: &str) -> bool {
        secret_matches(&self.webhook_token, presented)
    }
}

fn secret_matches(expected: &Secret, presented: &str) -> bool {
    let expected = expected.expose().as_bytes();
    let presented = presented.as_bytes();
    !expected.is_empty()
        && expected.len() == presented.len()
        && expected.iter().zip(presented).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

/// Basic credentials from the `Authorization` header: `(username, password)`.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(BASE64.decode(encoded.trim()).ok()?).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

#[derive(Debug, Deserialize)]
struct WebhookQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisterDevice {
    ip_address: String,
    mac_address: String,
}

#[derive(Debug, Serialize)]
struct AuthenticatedTag {
    tag_id: TagId,
    is_admin: bool,
    labels: Vec<String>,
}

struct DeviceRow {
    mac_address: String,
    ip_address: String,
    label_text: String,
    training_text: &'static str,
}

impl From<DeviceRecord> for DeviceRow {
    fn from(record: DeviceRecord) -> Self {
        Self {
            mac_address: record.mac_address,
            ip_address: record.ip_address,
            label_text: record.label.unwrap_or_else(|| "unassigned".to_string()),
            training_text: if record.requires_training { "required" } else { "not required" },
        }
    }
}

#[derive(Template)]
#[template(path = "devices.html")]
struct DevicesTemplate {
    devices: Vec<DeviceRow>,
    labels: Vec<String>,
}

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);

    let admin = Router::new()
        .route("/devices", get(devices_page_handler))
        .route("/api/devices/assignments", post(assign_devices_handler))
        .route("/api/config", get(config_handler))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), admin_guard));

    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/webhooks", post(webhook_handler))
        .route("/api/cache/tags", get(active_tags_handler))
        .route("/api/cache/labels/{label}", get(label_tags_handler))
        .route("/api/authenticate", post(authenticate_handler))
        .route("/api/devices/register", post(register_device_handler))
        .merge(admin)
        .with_state(state)
}

/// Admin routes take HTTP Basic credentials: an administrator's tag id as the
/// username and the configured admin token as the password.
async fn admin_guard(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let Some((user, password)) = basic_credentials(request.headers()) else {
        return admin_challenge();
    };
    if !secret_matches(&state.admin_token, &password) {
        warn!("admin request rejected: bad admin token");
        return admin_challenge();
    }
    let tag_id = match user.trim().parse::<TagId>() {
        Ok(tag) if tag > 0 => tag,
        _ => return api_error(StatusCode::FORBIDDEN, "username must be an administrator tag id"),
    };

    match state.store.cached_member(tag_id).await {
        Ok(Some(member)) if member.is_admin => {
            debug!(tag_id, member_id = member.external_id, "admin access granted");
            next.run(request).await
        }
        Ok(_) => {
            warn!(tag_id, "admin request rejected: tag is not an active administrator");
            api_error(StatusCode::FORBIDDEN, "administrator tag required")
        }
        Err(err) => store_error(err),
    }
}

fn admin_challenge() -> Response {
    let mut response = api_error(StatusCode::UNAUTHORIZED, "admin credentials required");
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, header::HeaderValue::from_static(ADMIN_REALM));
    response
}

/// Bind `bind_addr` and serve until `shutdown` resolves.
pub async fn serve<F>(bind_addr: &str, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving http")?;
    Ok(())
}

pub async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => error!(error = %err, "failed to listen for shutdown signal"),
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WebhookQuery>,
    body: Bytes,
) -> Response {
    if !query.token.as_deref().is_some_and(|t| state.token_matches(t)) {
        warn!("webhook rejected: bad or missing token");
        return api_error(StatusCode::UNAUTHORIZED, "invalid webhook token");
    }

    let event = match decode_event(&body) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "webhook rejected");
            return api_error(StatusCode::BAD_REQUEST, &err.to_string());
        }
    };

    info!(member_id = event.member_id(), kind = event.kind(), "webhook accepted");
    state.events.spawn(event);
    (StatusCode::OK, Json(json!({ "accepted": true }))).into_response()
}

async fn active_tags_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.all_active_tag_ids().await {
        Ok(tags) => Json(tags).into_response(),
        Err(err) => store_error(err),
    }
}

async fn label_tags_handler(State(state): State<Arc<AppState>>, Path(label): Path<String>) -> Response {
    match state.store.tag_ids_for_label(&label).await {
        Ok(tags) => Json(tags).into_response(),
        Err(err) => store_error(err),
    }
}

async fn authenticate_handler(State(state): State<Arc<AppState>>, body: String) -> Response {
    let raw = body.trim();
    let tag_id = match raw.parse::<TagId>() {
        Ok(tag) if tag > 0 => tag,
        _ => return api_error(StatusCode::BAD_REQUEST, "body must be a positive tag id"),
    };

    match state.store.cached_member(tag_id).await {
        Ok(Some(member)) => Json(AuthenticatedTag {
            tag_id,
            is_admin: member.is_admin,
            labels: member.labels,
        })
        .into_response(),
        Ok(None) => api_error(StatusCode::UNAUTHORIZED, "tag is not active"),
        Err(err) => store_error(err),
    }
}

async fn register_device_handler(
    State(state): State<Arc<AppState>>,
    Json(device): Json<RegisterDevice>,
) -> Response {
    if device.mac_address.trim().is_empty() || device.ip_address.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "mac_address and ip_address are required");
    }
    match state
        .store
        .devices()
        .register_device(&device.mac_address, &device.ip_address)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(json!({ "registered": device.mac_address.trim() }))).into_response(),
        Err(err) => store_error(err),
    }
}

async fn assign_devices_handler(
    State(state): State<Arc<AppState>>,
    Json(assignments): Json<Vec<DeviceAssignment>>,
) -> Response {
    if assignments
        .iter()
        .any(|a| a.mac_address.trim().is_empty() || a.label.trim().is_empty())
    {
        return api_error(StatusCode::BAD_REQUEST, "every assignment needs a mac_address and label");
    }
    match state.store.devices().assign_labels(&assignments).await {
        Ok(updated) => Json(json!({ "updated": updated })).into_response(),
        Err(err) => store_error(err),
    }
}

async fn devices_page_handler(State(state): State<Arc<AppState>>) -> Response {
    let devices = match state.store.devices().devices_with_labels().await {
        Ok(devices) => devices,
        Err(err) => return server_error(err.into()),
    };
    let labels = match state.store.permission_labels().await {
        Ok(labels) => labels,
        Err(err) => return server_error(err.into()),
    };
    render_html(DevicesTemplate {
        devices: devices.into_iter().map(DeviceRow::from).collect(),
        labels,
    })
}

async fn config_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.config.as_deref() {
        Some(config) => Json(config.view()).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "configuration view not enabled"),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

fn api_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "store query failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "store unavailable")
}
