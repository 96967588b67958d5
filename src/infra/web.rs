use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use log::error;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    domain::{archive::ArchiveRequest, model::App, DeployService},
    error::Error,
};

pub fn router(service: DeployService) -> Router {
    Router::new()
        .route("/deploy", post(deploy))
        .route("/deploy/archive", post(deploy_archive))
        .route("/events/:id/cancel", post(cancel_deploy))
        .route("/images", get(all_images))
        .route("/apps/:app_name/images", get(list_images).delete(delete_images))
        .route("/apps/:app_name/images/:version/rollback", post(rollback_image))
        .route("/apps/:app_name/processes", get(list_processes))
        .route("/units/add", post(add_units))
        .route("/units/remove", post(remove_units))
        .route("/processes/:action", post(change_processes))
        .route("/run", post(run))
        .route("/migrations/exposed-ports", post(migrate_exposed_ports))
        .route(
            "/platforms/:platform/images",
            get(platform_images)
                .post(add_platform_image)
                .delete(delete_platform_images),
        )
        .with_state(Arc::new(service))
}

fn status_of(err: &Error) -> StatusCode {
    if err.is_canceled() {
        StatusCode::CONFLICT
    } else if err.is_invalid_input() {
        StatusCode::BAD_REQUEST
    } else if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn failure(operation: &str, err: Error) -> (StatusCode, String) {
    error!("Error during {} {:?}", operation, err);
    (status_of(&err), err.to_string())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploySource {
    Url(String),
    Rebuild,
    Redeploy,
    Image(String),
}

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub app: App,
    pub source: DeploySource,
    /// Id to cancel the deploy with while it runs.
    #[serde(default)]
    pub event: Option<Uuid>,
}

async fn deploy(
    State(service): State<Arc<DeployService>>,
    Json(payload): Json<DeployRequest>,
) -> impl IntoResponse {
    let request = match payload.source {
        DeploySource::Image(image) => {
            return service
                .deploy_image(&payload.app, &image, payload.event)
                .await
                .map(Json)
                .map_err(|e| failure("deploy_image", e))
        }
        DeploySource::Url(url) => ArchiveRequest {
            url: Some(url),
            ..Default::default()
        },
        DeploySource::Rebuild => ArchiveRequest {
            rebuild: true,
            ..Default::default()
        },
        DeploySource::Redeploy => ArchiveRequest {
            redeploy: true,
            ..Default::default()
        },
    };
    service
        .deploy(&payload.app, request, payload.event)
        .await
        .map(Json)
        .map_err(|e| failure("deploy", e))
}

#[derive(Debug, Deserialize)]
pub struct ArchiveQuery {
    pub name: String,
    pub platform: String,
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub deploys: u64,
    #[serde(default)]
    pub event: Option<Uuid>,
}

async fn deploy_archive(
    State(service): State<Arc<DeployService>>,
    Query(query): Query<ArchiveQuery>,
    body: Bytes,
) -> impl IntoResponse {
    let app = App {
        pool: query.pool,
        deploys: query.deploys,
        ..App::new(&query.name, &query.platform)
    };
    let request = ArchiveRequest {
        file_size: body.len() as u64,
        file: Some(body),
        ..Default::default()
    };
    service
        .deploy(&app, request, query.event)
        .await
        .map(Json)
        .map_err(|e| failure("deploy_archive", e))
}

async fn cancel_deploy(
    State(service): State<Arc<DeployService>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    if service.cancel(&id) {
        Ok((StatusCode::OK, "Deploy canceled"))
    } else {
        Err((StatusCode::NOT_FOUND, format!("no deploy in progress with id {id}")))
    }
}

async fn list_images(
    State(service): State<Arc<DeployService>>,
    Path(app_name): Path<String>,
) -> impl IntoResponse {
    service
        .list_images(&app_name)
        .await
        .map(Json)
        .map_err(|e| failure("list_images", e))
}

async fn delete_images(
    State(service): State<Arc<DeployService>>,
    Path(app_name): Path<String>,
) -> impl IntoResponse {
    service
        .delete_images(&app_name)
        .await
        .map(|_| (StatusCode::OK, "Images deleted"))
        .map_err(|e| failure("delete_images", e))
}

async fn all_images(State(service): State<Arc<DeployService>>) -> impl IntoResponse {
    service
        .all_images()
        .await
        .map(Json)
        .map_err(|e| failure("all_images", e))
}

async fn list_processes(
    State(service): State<Arc<DeployService>>,
    Path(app_name): Path<String>,
) -> impl IntoResponse {
    service
        .processes(&app_name)
        .await
        .map(Json)
        .map_err(|e| failure("list_processes", e))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RollbackRequest {
    pub reason: String,
    pub disabled: bool,
}

async fn rollback_image(
    State(service): State<Arc<DeployService>>,
    Path((app_name, version)): Path<(String, String)>,
    Json(payload): Json<RollbackRequest>,
) -> impl IntoResponse {
    service
        .rollback_image(&app_name, &version, &payload.reason, payload.disabled)
        .await
        .map(|image| Json(json!({ "image": image, "disabled": payload.disabled })))
        .map_err(|e| failure("rollback_image", e))
}

#[derive(Debug, Deserialize)]
pub struct UnitsRequest {
    pub app: App,
    pub units: u32,
    #[serde(default)]
    pub process: String,
}

async fn add_units(
    State(service): State<Arc<DeployService>>,
    Json(payload): Json<UnitsRequest>,
) -> impl IntoResponse {
    service
        .add_units(&payload.app, payload.units, &payload.process)
        .await
        .map(Json)
        .map_err(|e| failure("add_units", e))
}

async fn remove_units(
    State(service): State<Arc<DeployService>>,
    Json(payload): Json<UnitsRequest>,
) -> impl IntoResponse {
    service
        .remove_units(&payload.app, payload.units, &payload.process)
        .await
        .map(Json)
        .map_err(|e| failure("remove_units", e))
}

#[derive(Debug, Deserialize)]
pub struct ProcessRequest {
    pub app: App,
    #[serde(default)]
    pub process: String,
}

async fn change_processes(
    State(service): State<Arc<DeployService>>,
    Path(action): Path<String>,
    Json(payload): Json<ProcessRequest>,
) -> impl IntoResponse {
    let result = match action.as_str() {
        "start" => service.start(&payload.app, &payload.process).await,
        "stop" => service.stop(&payload.app, &payload.process).await,
        "restart" => service.restart(&payload.app, &payload.process).await,
        other => {
            return Err((
                StatusCode::NOT_FOUND,
                format!("unknown process action {other:?}"),
            ))
        }
    };
    result.map(Json).map_err(|e| failure(&action, e))
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub app: App,
    pub cmds: Vec<String>,
}

async fn run(
    State(service): State<Arc<DeployService>>,
    Json(payload): Json<RunRequest>,
) -> impl IntoResponse {
    service
        .run(&payload.app, &payload.cmds)
        .await
        .map_err(|e| failure("run", e))
}

async fn migrate_exposed_ports(State(service): State<Arc<DeployService>>) -> impl IntoResponse {
    service
        .migrate_exposed_ports()
        .await
        .map(|migrated| Json(json!({ "migrated": migrated })))
        .map_err(|e| failure("migrate_exposed_ports", e))
}

async fn platform_images(
    State(service): State<Arc<DeployService>>,
    Path(platform): Path<String>,
) -> impl IntoResponse {
    service
        .platform_images(&platform)
        .await
        .map(Json)
        .map_err(|e| failure("platform_images", e))
}

async fn add_platform_image(
    State(service): State<Arc<DeployService>>,
    Path(platform): Path<String>,
) -> impl IntoResponse {
    service
        .add_platform_image(&platform)
        .await
        .map(|image| Json(json!({ "image": image })))
        .map_err(|e| failure("add_platform_image", e))
}

async fn delete_platform_images(
    State(service): State<Arc<DeployService>>,
    Path(platform): Path<String>,
) -> impl IntoResponse {
    service
        .delete_platform_images(&platform)
        .await
        .map(|_| (StatusCode::OK, "Platform images deleted"))
        .map_err(|e| failure("delete_platform_images", e))
}
