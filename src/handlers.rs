// handlers.rs

use crate::{
    address::DeviceAddress,
    commands::PresetCatalog,
    error::AppError,
    models::{AppState, DeviceId, DeviceView, ErrorBody, Rgb, WsMessage},
    proxy::{Endpoint, UpstreamResponse},
    registry::DevicePatch,
};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/wled/info", get(proxy_info))
        .route("/api/wled/state", get(proxy_state_get).post(proxy_state_post))
        .route("/api/presets", get(list_presets))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/reset", post(reset_devices))
        .route("/api/devices/{id}", get(get_device).patch(patch_device))
        .route("/api/devices/{id}/test", post(test_device))
        .route("/api/devices/{id}/disconnect", post(disconnect_device))
        .route("/api/devices/{id}/refresh", post(refresh_device))
        .route("/api/devices/{id}/power", post(set_power))
        .route("/api/devices/{id}/brightness", post(set_brightness))
        .route("/api/devices/{id}/color", post(set_color))
        .route("/api/devices/{id}/preset", post(apply_preset))
        .route("/ws/client", get(handle_client_ws_upgrade))
        .with_state(state)
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct BaseUrlQuery {
    /// Device base address, e.g. `http://192.168.1.50`.
    pub base_url: Option<String>,
}

impl BaseUrlQuery {
    fn address(&self) -> Result<DeviceAddress, AppError> {
        let raw = self
            .base_url
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .ok_or_else(|| AppError::Validation("Missing baseUrl".into()))?;
        Ok(DeviceAddress::parse(raw)?)
    }
}

fn passthrough(upstream: UpstreamResponse) -> Response {
    let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(upstream.body)).into_response()
}

fn device_id(raw: &str) -> Result<DeviceId, AppError> {
    DeviceId::parse(raw).ok_or(AppError::DeviceNotFound)
}

#[utoipa::path(
    get,
    path = "/api/wled/info",
    params(BaseUrlQuery),
    responses(
        (status = 200, description = "Device info, status mirrors the device"),
        (status = 400, description = "Missing or invalid baseUrl", body = ErrorBody),
        (status = 502, description = "Device unreachable", body = ErrorBody)
    )
)]
pub async fn proxy_info(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BaseUrlQuery>,
) -> Result<Response, AppError> {
    let address = query.address()?;
    let upstream = state.gateway.fetch(address.as_str(), Endpoint::Info).await?;
    Ok(passthrough(upstream))
}

#[utoipa::path(
    get,
    path = "/api/wled/state",
    params(BaseUrlQuery),
    responses(
        (status = 200, description = "Device state, status mirrors the device"),
        (status = 400, description = "Missing or invalid baseUrl", body = ErrorBody),
        (status = 502, description = "Device unreachable", body = ErrorBody)
    )
)]
pub async fn proxy_state_get(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BaseUrlQuery>,
) -> Result<Response, AppError> {
    let address = query.address()?;
    let upstream = state.gateway.fetch(address.as_str(), Endpoint::State).await?;
    Ok(passthrough(upstream))
}

#[utoipa::path(
    post,
    path = "/api/wled/state",
    params(BaseUrlQuery),
    request_body(content = Object, content_type = "application/json", description = "Partial WLED state"),
    responses(
        (status = 200, description = "Device acknowledgement (`{}` if unparsable), status mirrors the device"),
        (status = 400, description = "Invalid baseUrl or body", body = ErrorBody),
        (status = 502, description = "Device unreachable", body = ErrorBody)
    )
)]
pub async fn proxy_state_post(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BaseUrlQuery>,
    body: Bytes,
) -> Result<Response, AppError> {
    let address = query.address()?;
    let patch: Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("Request body is not JSON: {e}")))?;
    let upstream = state
        .gateway
        .send(address.as_str(), Endpoint::State, &patch)
        .await?;
    Ok(passthrough(upstream))
}

#[utoipa::path(get, path = "/api/presets", responses((status = 200, body = PresetCatalog)))]
pub async fn list_presets(State(state): State<Arc<AppState>>) -> Json<PresetCatalog> {
    Json(state.presets.clone())
}

#[utoipa::path(get, path = "/api/devices", responses((status = 200, body = Vec<DeviceView>)))]
pub async fn list_devices(State(state): State<Arc<AppState>>) -> Json<Vec<DeviceView>> {
    Json(state.views().await)
}

#[utoipa::path(
    post,
    path = "/api/devices/reset",
    responses((status = 200, body = Vec<DeviceView>))
)]
pub async fn reset_devices(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DeviceView>>, AppError> {
    state.registry.reset().await?;
    state.probe.clear();
    for controller in state.controllers() {
        controller.publish().await;
    }
    Ok(Json(state.views().await))
}

#[utoipa::path(
    get,
    path = "/api/devices/{id}",
    params(("id" = String, Path, description = "esp1, esp2 or esp3")),
    responses((status = 200, body = DeviceView), (status = 404, body = ErrorBody))
)]
pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeviceView>, AppError> {
    Ok(Json(state.view(device_id(&id)?).await?))
}

/// Settings edit. `connected` is deliberately absent: only a connectivity
/// test can set it.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct DeviceEdit {
    #[validate(length(min = 1, max = 64))]
    pub name: Option<String>,
    pub address: Option<String>,
}

#[utoipa::path(
    patch,
    path = "/api/devices/{id}",
    params(("id" = String, Path, description = "esp1, esp2 or esp3")),
    request_body = DeviceEdit,
    responses((status = 200, body = DeviceView), (status = 400, body = ErrorBody))
)]
pub async fn patch_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(edit): Json<DeviceEdit>,
) -> Result<Json<DeviceView>, AppError> {
    let id = device_id(&id)?;
    edit.validate()?;

    let address_changed = edit.address.is_some();
    state
        .registry
        .patch(
            id,
            DevicePatch {
                name: edit.name,
                address: edit.address,
                ..Default::default()
            },
        )
        .await?;
    if address_changed {
        state.probe.clear_device(id);
    }

    let snapshot = state.controller(id)?.publish().await;
    Ok(Json(state.view_of(snapshot)))
}

#[utoipa::path(
    post,
    path = "/api/devices/{id}/test",
    params(("id" = String, Path, description = "esp1, esp2 or esp3")),
    responses((status = 200, body = DeviceView), (status = 400, body = ErrorBody))
)]
pub async fn test_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeviceView>, AppError> {
    let id = device_id(&id)?;
    state.probe.test_device(id).await?;

    // A device that just became reachable shows its real state right away.
    let controller = state.controller(id)?;
    let snapshot = controller.refresh().await;
    Ok(Json(state.view_of(snapshot)))
}

#[utoipa::path(
    post,
    path = "/api/devices/{id}/disconnect",
    params(("id" = String, Path, description = "esp1, esp2 or esp3")),
    responses((status = 200, body = DeviceView))
)]
pub async fn disconnect_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeviceView>, AppError> {
    let id = device_id(&id)?;
    state.probe.disconnect(id).await?;
    let snapshot = state.controller(id)?.publish().await;
    Ok(Json(state.view_of(snapshot)))
}

#[utoipa::path(
    post,
    path = "/api/devices/{id}/refresh",
    params(("id" = String, Path, description = "esp1, esp2 or esp3")),
    responses((status = 200, body = DeviceView))
)]
pub async fn refresh_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeviceView>, AppError> {
    let snapshot = state.controller(device_id(&id)?)?.refresh().await;
    Ok(Json(state.view_of(snapshot)))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PowerBody {
    pub on: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BrightnessBody {
    /// Clamped to 0-100.
    pub percent: i32,
}

/// `[r, g, b]` or `"#rrggbb"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ColorInput {
    Channels([u8; 3]),
    Hex(String),
}

impl ColorInput {
    fn into_rgb(self) -> Result<Rgb, AppError> {
        match self {
            ColorInput::Channels(rgb) => Ok(Rgb(rgb)),
            ColorInput::Hex(hex) => Rgb::from_hex(&hex)
                .ok_or_else(|| AppError::Validation(format!("Not a #rrggbb color: {hex}"))),
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ColorBody {
    #[schema(value_type = Object)]
    pub color: ColorInput,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PresetBody {
    pub ps: u16,
}

#[utoipa::path(
    post,
    path = "/api/devices/{id}/power",
    params(("id" = String, Path, description = "esp1, esp2 or esp3")),
    request_body = PowerBody,
    responses((status = 200, body = DeviceView), (status = 409, body = ErrorBody))
)]
pub async fn set_power(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<PowerBody>,
) -> Result<Json<DeviceView>, AppError> {
    let snapshot = state.controller(device_id(&id)?)?.set_power(body.on).await?;
    Ok(Json(state.view_of(snapshot)))
}

#[utoipa::path(
    post,
    path = "/api/devices/{id}/brightness",
    params(("id" = String, Path, description = "esp1, esp2 or esp3")),
    request_body = BrightnessBody,
    responses((status = 200, body = DeviceView), (status = 409, body = ErrorBody))
)]
pub async fn set_brightness(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<BrightnessBody>,
) -> Result<Json<DeviceView>, AppError> {
    let snapshot = state
        .controller(device_id(&id)?)?
        .set_brightness(body.percent)
        .await?;
    Ok(Json(state.view_of(snapshot)))
}

#[utoipa::path(
    post,
    path = "/api/devices/{id}/color",
    params(("id" = String, Path, description = "esp1, esp2 or esp3")),
    request_body = ColorBody,
    responses((status = 200, body = DeviceView), (status = 400, body = ErrorBody), (status = 409, body = ErrorBody))
)]
pub async fn set_color(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ColorBody>,
) -> Result<Json<DeviceView>, AppError> {
    let controller = state.controller(device_id(&id)?)?;
    let snapshot = controller.set_color(body.color.into_rgb()?).await?;
    Ok(Json(state.view_of(snapshot)))
}

#[utoipa::path(
    post,
    path = "/api/devices/{id}/preset",
    params(("id" = String, Path, description = "esp1, esp2 or esp3")),
    request_body = PresetBody,
    responses((status = 200, body = DeviceView), (status = 409, body = ErrorBody))
)]
pub async fn apply_preset(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<PresetBody>,
) -> Result<Json<DeviceView>, AppError> {
    let snapshot = state.controller(device_id(&id)?)?.apply_preset(body.ps).await?;
    Ok(Json(state.view_of(snapshot)))
}

pub async fn handle_client_ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("Client connection attempt");
    ws.on_upgrade(|socket| handle_client(socket, state))
}

async fn handle_client(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let client_id = Uuid::new_v4();
    let mut updates = state.updates.subscribe();
    let (tx, mut rx) = mpsc::channel::<WsMessage>(100);

    for view in state.views().await {
        let _ = tx.send(WsMessage::Snapshot(view.snapshot)).await;
    }

    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                update = updates.recv() => match update {
                    Ok(snapshot) => WsMessage::Snapshot(snapshot),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(%client_id, skipped, "Client lagging behind updates");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                direct = rx.recv() => match direct {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn({
        let state = Arc::clone(&state);
        async move {
            while let Some(Ok(msg)) = receiver.next().await {
                let Ok(text) = msg.to_text() else {
                    continue;
                };
                let command = match serde_json::from_str::<WsMessage>(text) {
                    Ok(command) => command,
                    Err(e) => {
                        debug!(%client_id, "Invalid message format: {}", e);
                        let _ = tx
                            .send(WsMessage::Error {
                                message: format!("Invalid message: {e}"),
                                code: 400,
                            })
                            .await;
                        continue;
                    }
                };

                if let Err(e) = handle_ws_command(&state, command).await {
                    let _ = tx
                        .send(WsMessage::Error {
                            message: e.to_string(),
                            code: e.status_code().as_u16(),
                        })
                        .await;
                }
            }
        }
    });

    tokio::pin!(send_task, recv_task);
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    };

    info!(%client_id, "Client disconnected");
}

/// Results reach the client through the snapshot broadcast.
async fn handle_ws_command(state: &AppState, command: WsMessage) -> Result<(), AppError> {
    match command {
        WsMessage::SetPower { device_id, power } => {
            state.controller(device_id)?.set_power(power).await?;
        }
        WsMessage::SetBrightness { device_id, percent } => {
            state.controller(device_id)?.set_brightness(percent).await?;
        }
        WsMessage::SetColor { device_id, color } => {
            state.controller(device_id)?.set_color(color).await?;
        }
        WsMessage::ApplyPreset { device_id, preset } => {
            state.controller(device_id)?.apply_preset(preset).await?;
        }
        WsMessage::Refresh { device_id } => {
            state.controller(device_id)?.refresh().await;
        }
        WsMessage::Snapshot(_) | WsMessage::Error { .. } => {
            return Err(AppError::Validation("Unsupported command".into()));
        }
    }
    Ok(())
}
