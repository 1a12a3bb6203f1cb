use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::sync::broadcast;
use utoipa::ToSchema;

use crate::{
    commands::PresetCatalog,
    connectivity::{ConnectivityProbe, ProbeOutcome},
    devices::DeviceController,
    error::AppError,
    proxy::{DeviceApi, ProxyGateway},
    registry::{DeviceRecord, DeviceRegistry},
};

/// The fixed set of controllers the dashboard knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeviceId {
    Esp1,
    Esp2,
    Esp3,
}

impl DeviceId {
    pub const ALL: [DeviceId; 3] = [DeviceId::Esp1, DeviceId::Esp2, DeviceId::Esp3];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceId::Esp1 => "esp1",
            DeviceId::Esp2 => "esp2",
            DeviceId::Esp3 => "esp3",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.as_str() == raw)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rgb(pub [u8; 3]);

impl Rgb {
    pub const WHITE: Rgb = Rgb([255, 255, 255]);

    pub fn to_hex(&self) -> String {
        let [r, g, b] = self.0;
        format!("#{r:02x}{g:02x}{b:02x}")
    }

    /// Parses `#rrggbb` (leading `#` optional).
    pub fn from_hex(hex: &str) -> Option<Self> {
        let v = hex.trim().trim_start_matches('#');
        if v.len() != 6 || !v.is_ascii() {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&v[i..i + 2], 16).ok();
        Some(Rgb([channel(0)?, channel(2)?, channel(4)?]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ControllerStatus {
    Idle,
    Loading,
    Ready,
    Error,
}

/// Local mirror of what the device last reported, plus optimistic edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DisplayState {
    pub power: bool,
    pub brightness_percent: u8,
    #[schema(value_type = Vec<u8>)]
    pub color: Rgb,
    pub status: ControllerStatus,
    pub last_error: Option<String>,
}

impl Default for DisplayState {
    fn default() -> Self {
        Self {
            power: true,
            brightness_percent: 50,
            color: Rgb::WHITE,
            status: ControllerStatus::Idle,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DeviceSnapshot {
    pub id: DeviceId,
    pub record: DeviceRecord,
    pub display: DisplayState,
}

/// What a device card shows: the snapshot plus the last settings test.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DeviceView {
    #[serde(flatten)]
    pub snapshot: DeviceSnapshot,
    pub probe: ProbeOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    Snapshot(DeviceSnapshot),
    SetPower { device_id: DeviceId, power: bool },
    SetBrightness { device_id: DeviceId, percent: i32 },
    SetColor { device_id: DeviceId, color: Rgb },
    ApplyPreset { device_id: DeviceId, preset: u16 },
    Refresh { device_id: DeviceId },
    Error { message: String, code: u16 },
}

pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
    pub gateway: Arc<ProxyGateway>,
    pub probe: ConnectivityProbe,
    pub presets: PresetCatalog,
    pub updates: broadcast::Sender<DeviceSnapshot>,
    controllers: HashMap<DeviceId, DeviceController>,
}

impl AppState {
    pub fn new(registry: Arc<DeviceRegistry>, gateway: Arc<ProxyGateway>, debounce: Duration) -> Self {
        let api: Arc<dyn DeviceApi> = gateway.clone();
        Self::with_api(registry, gateway, api, debounce)
    }

    /// Controllers and the probe talk to `api`; the proxy routes always use
    /// `gateway`.
    pub fn with_api(
        registry: Arc<DeviceRegistry>,
        gateway: Arc<ProxyGateway>,
        api: Arc<dyn DeviceApi>,
        debounce: Duration,
    ) -> Self {
        let (updates, _) = broadcast::channel(100);
        let controllers = DeviceId::ALL
            .into_iter()
            .map(|id| {
                let controller = DeviceController::new(
                    id,
                    registry.clone(),
                    api.clone(),
                    debounce,
                    updates.clone(),
                );
                (id, controller)
            })
            .collect();

        Self {
            probe: ConnectivityProbe::new(registry.clone(), api),
            registry,
            gateway,
            presets: PresetCatalog::default(),
            updates,
            controllers,
        }
    }

    pub fn controller(&self, id: DeviceId) -> Result<&DeviceController, AppError> {
        self.controllers.get(&id).ok_or(AppError::DeviceNotFound)
    }

    pub fn controllers(&self) -> impl Iterator<Item = &DeviceController> {
        DeviceId::ALL
            .into_iter()
            .filter_map(move |id| self.controllers.get(&id))
    }

    pub async fn view(&self, id: DeviceId) -> Result<DeviceView, AppError> {
        let snapshot = self.controller(id)?.snapshot().await;
        Ok(self.view_of(snapshot))
    }

    pub fn view_of(&self, snapshot: DeviceSnapshot) -> DeviceView {
        DeviceView {
            probe: self.probe.outcome(snapshot.id),
            snapshot,
        }
    }

    pub async fn views(&self) -> Vec<DeviceView> {
        let mut views = Vec::with_capacity(DeviceId::ALL.len());
        for controller in self.controllers() {
            views.push(self.view_of(controller.snapshot().await));
        }
        views
    }

    pub async fn shutdown(&self) {
        for controller in self.controllers() {
            controller.shutdown().await;
        }
    }
}
