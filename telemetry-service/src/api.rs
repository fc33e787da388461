//! Device-management HTTP API.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use energy_client::domain::{Device, DevicePatch, DeviceStatus, VoltageRange};
use serde::{Deserialize, Serialize};

use crate::{
    broadcast::BroadcastHub,
    fleet,
    registry::{DeviceRegistry, RegistryError},
    scheduler::SimulationScheduler,
};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
    pub hub: Arc<BroadcastHub>,
    pub scheduler: Arc<SimulationScheduler>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/devices", post(register_device))
        .route("/api/devices/active", get(active_devices))
        .route("/api/devices/:id", patch(update_device).delete(remove_device))
        .route("/api/devices/:id/status", get(device_status))
        .route("/api/health", get(health))
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    Registry(RegistryError),
    BadRequest(String),
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            Self::Registry(e @ RegistryError::DuplicateDevice(_)) => (StatusCode::CONFLICT, e.to_string()),
            Self::Registry(e @ RegistryError::NotFound(_)) => (StatusCode::NOT_FOUND, e.to_string()),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

/// Registration payload. Omitted load parameters are drawn at random.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDevice {
    pub device_id: String,
    #[serde(default)]
    pub location: String,
    pub status: Option<DeviceStatus>,
    pub base_load: Option<f64>,
    pub variation: Option<f64>,
    pub voltage_range: Option<VoltageRange>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub device_id: String,
    pub status: DeviceStatus,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthView {
    pub status: String,
    pub simulation_running: bool,
    pub subscribers: usize,
    pub devices: usize,
}

async fn register_device(
    State(state): State<AppState>,
    Json(req): Json<RegisterDevice>,
) -> Result<(StatusCode, Json<Device>), ApiError> {
    metrics::counter!("api_requests_total", "route" => "register").increment(1);

    let device_id = req.device_id.trim().to_string();
    if device_id.is_empty() {
        return Err(ApiError::BadRequest("deviceId must not be empty".to_string()));
    }

    let device = {
        let mut rng = rand::thread_rng();
        Device {
            device_id,
            location: req.location,
            status: req.status.unwrap_or(DeviceStatus::Active),
            base_load: req.base_load.unwrap_or_else(|| fleet::draw_base_load(&mut rng)),
            variation: req.variation.unwrap_or_else(|| fleet::draw_variation(&mut rng)),
            voltage_range: req.voltage_range.unwrap_or_default(),
        }
    };

    state.registry.register(device.clone())?;
    Ok((StatusCode::CREATED, Json(device)))
}

async fn update_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<DevicePatch>,
) -> Result<Json<Device>, ApiError> {
    metrics::counter!("api_requests_total", "route" => "update").increment(1);
    let device = state.registry.update(&id, patch)?;
    Ok(Json(device))
}

async fn remove_device(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    metrics::counter!("api_requests_total", "route" => "remove").increment(1);
    state.registry.remove(&id);
    StatusCode::NO_CONTENT
}

async fn active_devices(State(state): State<AppState>) -> Json<Vec<Device>> {
    let mut devices = state.registry.list_active();
    devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
    Json(devices)
}

/// Reports `active` only for devices the simulator is producing readings for.
async fn device_status(State(state): State<AppState>, Path(id): Path<String>) -> Json<StatusView> {
    let status = state.registry.status_of(&id);
    Json(StatusView { device_id: id, status })
}

async fn health(State(state): State<AppState>) -> Json<HealthView> {
    Json(HealthView {
        status: "ok".to_string(),
        simulation_running: state.scheduler.is_running(),
        subscribers: state.hub.subscriber_count(),
        devices: state.registry.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{generator::ReadingGenerator, pipeline::TickSink};
    use axum::{body::Body, http::Request};
    use std::time::Duration;
    use time::UtcOffset;
    use tower::ServiceExt;

    fn state() -> AppState {
        let registry = Arc::new(DeviceRegistry::new());
        let hub = Arc::new(BroadcastHub::new(Duration::from_secs(1)));
        let scheduler = Arc::new(SimulationScheduler::new(
            ReadingGenerator::seeded(registry.clone(), 1),
            vec![hub.clone() as Arc<dyn TickSink>],
            Duration::from_secs(5),
            UtcOffset::UTC,
        ));
        AppState { registry, hub, scheduler }
    }

    fn request(device_id: &str) -> RegisterDevice {
        RegisterDevice {
            device_id: device_id.to_string(),
            location: "plant-a".to_string(),
            status: None,
            base_load: None,
            variation: None,
            voltage_range: None,
        }
    }

    #[tokio::test]
    async fn register_fills_missing_load_profile() {
        let state = state();
        let (code, Json(device)) = register_device(State(state.clone()), Json(request("D1"))).await.unwrap();

        assert_eq!(code, StatusCode::CREATED);
        assert!(device.is_active());
        assert!(fleet::DEFAULT_BASE_LOAD.contains(&device.base_load));
        assert!(fleet::DEFAULT_VARIATION.contains(&device.variation));
        assert_eq!(state.registry.get("D1"), Some(device));
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let state = state();
        register_device(State(state.clone()), Json(request("D1"))).await.unwrap();

        let err = register_device(State(state.clone()), Json(request("D1"))).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);

        let err = register_device(State(state), Json(request("  "))).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn patch_out_of_active_changes_status_view() {
        let state = state();
        register_device(State(state.clone()), Json(request("D1"))).await.unwrap();

        let patch = DevicePatch {
            status: Some(DeviceStatus::Maintenance),
            ..Default::default()
        };
        let Json(updated) = update_device(State(state.clone()), Path("D1".to_string()), Json(patch))
            .await
            .unwrap();
        assert_eq!(updated.status, DeviceStatus::Maintenance);

        let Json(view) = device_status(State(state.clone()), Path("D1".to_string())).await;
        assert_eq!(view.status, DeviceStatus::Inactive);

        let Json(active) = active_devices(State(state.clone())).await;
        assert!(active.is_empty());

        let err = update_device(State(state), Path("nope".to_string()), Json(DevicePatch::default()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let state = state();
        register_device(State(state.clone()), Json(request("D1"))).await.unwrap();

        assert_eq!(remove_device(State(state.clone()), Path("D1".to_string())).await, StatusCode::NO_CONTENT);
        assert_eq!(remove_device(State(state.clone()), Path("D1".to_string())).await, StatusCode::NO_CONTENT);
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn router_serves_health_and_status() {
        let state = state();
        register_device(State(state.clone()), Json(request("D1"))).await.unwrap();
        let app = router(state);

        let res = app
            .clone()
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let view: HealthView = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            view,
            HealthView {
                status: "ok".to_string(),
                simulation_running: false,
                subscribers: 0,
                devices: 1,
            }
        );

        let res = app
            .oneshot(Request::get("/api/devices/D1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let view: StatusView = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            view,
            StatusView {
                device_id: "D1".to_string(),
                status: DeviceStatus::Active,
            }
        );
    }

    #[tokio::test]
    async fn router_maps_registry_errors_to_status_codes() {
        let app = router(state());
        let post = |json: &'static str| {
            Request::post("/api/devices")
                .header("content-type", "application/json")
                .body(Body::from(json))
                .unwrap()
        };

        let res = app.clone().oneshot(post(r#"{"deviceId":"D1","baseLoad":500}"#)).await.unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let res = app.clone().oneshot(post(r#"{"deviceId":"D1"}"#)).await.unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);

        let res = app
            .clone()
            .oneshot(
                Request::patch("/api/devices/nope")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = app
            .oneshot(Request::delete("/api/devices/D1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
    }
}
