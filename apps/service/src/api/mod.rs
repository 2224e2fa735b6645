//! Minimal HTTP surface: health, validation-guarded monitor and channel
//! CRUD, probe history and incident listings. The full team/auth surface
//! lives outside this service.

use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{App, HttpResponse, HttpServer, ResponseError, delete, get, post, web};
use anyhow::Result;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;

use crate::clock::Clock;
use crate::database::models::{MonitorKind, NotificationKind};
use crate::database::{NewMonitor, Store};
use crate::error::ServiceError;
use crate::monitoring::validation;

pub struct ApiState {
    pub store: Arc<Store>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("not found")]
    NotFound,
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if let ApiError::Internal(error) = self {
            tracing::error!(%error, "api request failed");
        }
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::Validation(msg) => ApiError::BadRequest(msg),
            ServiceError::NotFound(_) => ApiError::NotFound,
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<ServiceError>() {
            Ok(service_error) => service_error.into(),
            Err(other) => ApiError::Internal(other),
        }
    }
}

#[get("/healthz")]
async fn healthz() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

#[get("/regions")]
async fn list_regions(state: web::Data<ApiState>) -> Result<HttpResponse, ApiError> {
    let regions = state.store.list_regions().await?;
    Ok(HttpResponse::Ok().json(regions))
}

#[get("/teams/{team_id}/monitors")]
async fn list_monitors(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let monitors = state.store.list_monitors(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(monitors))
}

#[derive(Debug, Deserialize)]
struct CreateMonitorRequest {
    name: String,
    kind: MonitorKind,
    config: serde_json::Value,
    #[serde(default = "default_interval")]
    interval_seconds: i64,
    #[serde(default = "default_threshold")]
    failure_threshold: i64,
    #[serde(default = "default_threshold")]
    recovery_threshold: i64,
    region_ids: Vec<i64>,
    #[serde(default)]
    notification_ids: Vec<i64>,
}

fn default_interval() -> i64 {
    60
}

fn default_threshold() -> i64 {
    1
}

#[post("/teams/{team_id}/monitors")]
async fn create_monitor(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
    body: web::Json<CreateMonitorRequest>,
) -> Result<HttpResponse, ApiError> {
    let req = body.into_inner();

    validation::validate_monitor_fields(
        &req.name,
        req.interval_seconds,
        req.failure_threshold,
        req.recovery_threshold,
        &req.region_ids,
    )?;
    validation::validate_monitor_config(req.kind, &req.config)?;

    let monitor = state
        .store
        .create_monitor(
            NewMonitor {
                team_id: path.into_inner(),
                name: req.name,
                kind: req.kind,
                config: req.config,
                interval_seconds: req.interval_seconds,
                failure_threshold: req.failure_threshold,
                recovery_threshold: req.recovery_threshold,
                region_ids: req.region_ids,
                notification_ids: req.notification_ids,
            },
            state.clock.now(),
        )
        .await?;
    Ok(HttpResponse::Created().json(monitor))
}

#[delete("/teams/{team_id}/monitors/{monitor_id}")]
async fn delete_monitor(
    state: web::Data<ApiState>,
    path: web::Path<(i64, i64)>,
) -> Result<HttpResponse, ApiError> {
    let (team_id, monitor_id) = path.into_inner();
    if state.store.delete_monitor(team_id, monitor_id).await? {
        Ok(HttpResponse::NoContent().finish())
    } else {
        Err(ApiError::NotFound)
    }
}

#[derive(Debug, Deserialize)]
struct PingsQuery {
    limit: Option<usize>,
}

#[get("/monitors/{monitor_id}/pings")]
async fn list_pings(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
    query: web::Query<PingsQuery>,
) -> Result<HttpResponse, ApiError> {
    let limit = query.limit.unwrap_or(50).min(500);
    let pings = state.store.recent_pings(path.into_inner(), limit).await?;
    Ok(HttpResponse::Ok().json(pings))
}

#[derive(Debug, Deserialize)]
struct IncidentsQuery {
    monitor_id: Option<i64>,
}

#[get("/incidents")]
async fn list_incidents(
    state: web::Data<ApiState>,
    query: web::Query<IncidentsQuery>,
) -> Result<HttpResponse, ApiError> {
    let incidents = state.store.list_incidents(query.monitor_id).await?;
    Ok(HttpResponse::Ok().json(incidents))
}

#[get("/incidents/{incident_id}/events")]
async fn list_incident_events(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let events = state.store.incident_events(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(events))
}

#[get("/teams/{team_id}/notifications")]
async fn list_notifications(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let notifications = state.store.list_notifications(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(notifications))
}

#[derive(Debug, Deserialize)]
struct CreateNotificationRequest {
    name: String,
    kind: NotificationKind,
    config: serde_json::Value,
}

#[post("/teams/{team_id}/notifications")]
async fn create_notification(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
    body: web::Json<CreateNotificationRequest>,
) -> Result<HttpResponse, ApiError> {
    let req = body.into_inner();
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name cannot be empty".to_string()));
    }
    validation::validate_notification_config(req.kind, &req.config)?;

    let notification = state
        .store
        .create_notification(path.into_inner(), req.kind, &req.name, req.config, state.clock.now())
        .await?;
    Ok(HttpResponse::Created().json(notification))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(healthz)
        .service(list_regions)
        .service(list_monitors)
        .service(create_monitor)
        .service(delete_monitor)
        .service(list_pings)
        .service(list_incidents)
        .service(list_incident_events)
        .service(list_notifications)
        .service(create_notification);
}

pub async fn run(
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let state = web::Data::new(ApiState { store, clock });

    let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(routes))
        .bind(("0.0.0.0", port))?
        .disable_signals()
        .run();

    tracing::info!(port, "api listening");

    let handle = server.handle();
    let stopper = tokio::spawn(async move {
        loop {
            if shutdown.changed().await.is_err() || *shutdown.borrow() {
                break;
            }
        }
        handle.stop(true).await;
    });

    server.await?;
    stopper.abort();
    Ok(())
}
