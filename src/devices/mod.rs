// devices/mod.rs
//! Per-device reconciliation engine.
//!
//! A [`DeviceController`] keeps the displayed state of one WLED device,
//! overwrites it with what the device reports on refresh, and pushes user
//! commands back out. Brightness input is coalesced through a single-slot
//! timer so a slider drag costs one request per pause.

pub mod wled;

use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    address::DeviceAddress,
    commands::DeviceCommand,
    error::AppError,
    models::{ControllerStatus, DeviceId, DeviceSnapshot, DisplayState, Rgb},
    proxy::DeviceApi,
    registry::{DevicePatch, DeviceRegistry},
};
use wled::{RemoteState, clamp_percent, percent_to_bri};

pub const DEFAULT_BRIGHTNESS_DEBOUNCE: Duration = Duration::from_millis(90);

/// Last local write per field, stamped from a per-controller counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Revisions {
    power: u64,
    brightness: u64,
    color: u64,
}

#[derive(Debug)]
struct ControllerState {
    display: DisplayState,
    clock: u64,
    revisions: Revisions,
    pending_brightness: Option<u8>,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
}

impl ControllerState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn fail(&mut self, message: String) {
        self.display.status = ControllerStatus::Error;
        self.display.last_error = Some(message);
    }

    /// Applies what the device reported, skipping any field written locally
    /// since `started` was captured.
    fn reconcile(&mut self, remote: RemoteState, started: Revisions) {
        if let Some(on) = remote.on {
            if self.revisions.power == started.power {
                self.display.power = on;
            }
        }
        if let Some(percent) = remote.brightness_percent {
            if self.revisions.brightness == started.brightness {
                self.display.brightness_percent = percent;
            }
        }
        if let Some(color) = remote.color {
            if self.revisions.color == started.color {
                self.display.color = color;
            }
        }
        self.display.status = ControllerStatus::Ready;
        self.display.last_error = None;
    }
}

struct Inner {
    id: DeviceId,
    registry: Arc<DeviceRegistry>,
    api: Arc<dyn DeviceApi>,
    debounce: Duration,
    state: Mutex<ControllerState>,
    updates: broadcast::Sender<DeviceSnapshot>,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct DeviceController {
    inner: Arc<Inner>,
}

impl DeviceController {
    pub fn new(
        id: DeviceId,
        registry: Arc<DeviceRegistry>,
        api: Arc<dyn DeviceApi>,
        debounce: Duration,
        updates: broadcast::Sender<DeviceSnapshot>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                id,
                registry,
                api,
                debounce,
                state: Mutex::new(ControllerState {
                    display: DisplayState::default(),
                    clock: 0,
                    revisions: Revisions::default(),
                    pending_brightness: None,
                    timer: None,
                    timer_generation: 0,
                }),
                updates,
                shutdown,
            }),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.inner.id
    }

    pub async fn snapshot(&self) -> DeviceSnapshot {
        self.inner.snapshot().await
    }

    /// Pushes the current snapshot to subscribers.
    pub async fn publish(&self) -> DeviceSnapshot {
        self.inner.publish().await
    }

    /// Replaces the displayed state with the device's reported state.
    ///
    /// Does nothing unless the device is marked connected. On failure the
    /// previously displayed values stay visible next to the error.
    pub async fn refresh(&self) -> DeviceSnapshot {
        let inner = &self.inner;
        if inner.is_shut_down() {
            return inner.snapshot().await;
        }

        let record = inner.registry.get(inner.id).await;
        let Some(address) = record.reachable_address().cloned() else {
            debug!(id = %inner.id, "Skipping refresh, device not connected");
            return inner.snapshot().await;
        };

        let started = {
            let mut state = inner.state.lock().await;
            state.display.status = ControllerStatus::Loading;
            state.display.last_error = None;
            state.revisions
        };
        inner.publish().await;

        let mut shutdown = inner.shutdown.subscribe();
        let cancelled = async move {
            let _ = shutdown.wait_for(|closed| *closed).await;
        };
        let result = tokio::select! {
            result = inner.api.get_device_state(address.as_str()) => result,
            _ = cancelled => {
                debug!(id = %inner.id, "Discarding refresh result after shutdown");
                return inner.snapshot().await;
            }
        };

        match result {
            Ok(remote) => {
                let remote = RemoteState::from_json(&remote);
                inner.state.lock().await.reconcile(remote, started);
                info!(id = %inner.id, %address, "Device state refreshed");

                let checked = DevicePatch {
                    last_checked_at: Some(Utc::now()),
                    ..Default::default()
                };
                if let Err(e) = inner.registry.patch(inner.id, checked).await {
                    warn!(id = %inner.id, "Failed to record check time: {}", e);
                }
            }
            Err(e) => {
                warn!(id = %inner.id, %address, "Refresh failed: {}", e);
                inner.state.lock().await.fail(e.to_string());
            }
        }

        inner.publish().await
    }

    /// Shows the new power state right away, then tells the device.
    /// A failed send leaves the optimistic value in place.
    pub async fn set_power(&self, on: bool) -> Result<DeviceSnapshot, AppError> {
        let address = self.inner.connected_address().await?;
        {
            let mut state = self.inner.state.lock().await;
            state.display.power = on;
            let revision = state.tick();
            state.revisions.power = revision;
        }
        self.inner.publish().await;
        self.inner.dispatch(&address, DeviceCommand::Power(on)).await;
        Ok(self.inner.snapshot().await)
    }

    /// Updates the displayed brightness and (re)arms the coalescing timer.
    /// Only the value current when the timer fires is sent.
    pub async fn set_brightness(&self, percent: i32) -> Result<DeviceSnapshot, AppError> {
        self.inner.connected_address().await?;
        let percent = clamp_percent(percent);
        {
            let mut state = self.inner.state.lock().await;
            state.display.brightness_percent = percent;
            let revision = state.tick();
            state.revisions.brightness = revision;
            state.pending_brightness = Some(percent);

            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.timer_generation += 1;
            let generation = state.timer_generation;
            let inner = Arc::clone(&self.inner);
            state.timer = Some(tokio::spawn(inner.fire_brightness(generation)));
        }
        Ok(self.inner.publish().await)
    }

    pub async fn set_color(&self, rgb: Rgb) -> Result<DeviceSnapshot, AppError> {
        let address = self.inner.connected_address().await?;
        {
            let mut state = self.inner.state.lock().await;
            state.display.color = rgb;
            let revision = state.tick();
            state.revisions.color = revision;
        }
        self.inner.publish().await;
        self.inner.dispatch(&address, DeviceCommand::Color(rgb)).await;
        Ok(self.inner.snapshot().await)
    }

    /// Presets may touch any field, so nothing is changed locally; the next
    /// refresh shows the result.
    pub async fn apply_preset(&self, ps: u16) -> Result<DeviceSnapshot, AppError> {
        let address = self.inner.connected_address().await?;
        self.inner.dispatch(&address, DeviceCommand::Preset(ps)).await;
        Ok(self.inner.snapshot().await)
    }

    /// Cancels the pending brightness send and drops any in-flight refresh.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let mut state = self.inner.state.lock().await;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.pending_brightness = None;
        debug!(id = %self.inner.id, "Controller shut down");
    }
}

impl Inner {
    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn connected_address(&self) -> Result<DeviceAddress, AppError> {
        if self.is_shut_down() {
            return Err(AppError::NotConnected);
        }
        let record = self.registry.get(self.id).await;
        record
            .reachable_address()
            .cloned()
            .ok_or(AppError::NotConnected)
    }

    async fn snapshot(&self) -> DeviceSnapshot {
        let record = self.registry.get(self.id).await;
        let display = self.state.lock().await.display.clone();
        DeviceSnapshot {
            id: self.id,
            record,
            display,
        }
    }

    async fn publish(&self) -> DeviceSnapshot {
        let snapshot = self.snapshot().await;
        // No subscribers is fine.
        let _ = self.updates.send(snapshot.clone());
        snapshot
    }

    async fn dispatch(&self, address: &DeviceAddress, command: DeviceCommand) {
        metrics::counter!("wled_device_commands_total", "kind" => command.kind()).increment(1);

        match self
            .api
            .set_device_state(address.as_str(), &command.to_patch())
            .await
        {
            Ok(_) => debug!(id = %self.id, kind = command.kind(), "Command sent"),
            Err(e) => {
                warn!(id = %self.id, kind = command.kind(), "Command failed: {}", e);
                self.state.lock().await.fail(e.to_string());
                self.publish().await;
            }
        }
    }

    async fn fire_brightness(self: Arc<Self>, generation: u64) {
        tokio::time::sleep(self.debounce).await;

        let percent = {
            let mut state = self.state.lock().await;
            if state.timer_generation != generation {
                return;
            }
            // Detach: from here on a newer input arms a fresh timer instead of
            // aborting this send.
            state.timer = None;
            state.pending_brightness.take()
        };
        let Some(percent) = percent else {
            return;
        };

        match self.connected_address().await {
            Ok(address) => {
                self.dispatch(&address, DeviceCommand::Brightness(percent_to_bri(percent)))
                    .await
            }
            Err(_) => debug!(id = %self.id, "Dropping brightness, device no longer connected"),
        }
    }
}
