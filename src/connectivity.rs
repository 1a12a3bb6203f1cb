// connectivity.rs
//! Settings-side Test/Disconnect flows. A passing test is the only way a
//! device becomes `connected`.

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::{
    error::{AppError, ProxyError},
    models::DeviceId,
    proxy::DeviceApi,
    registry::{DevicePatch, DeviceRecord, DeviceRegistry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Idle,
    Testing,
    Ok,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ProbeOutcome {
    pub status: ProbeStatus,
    pub error: Option<String>,
}

impl ProbeOutcome {
    fn new(status: ProbeStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }
}

/// One read of the device state; any answer the gateway accepts counts.
pub async fn test_connection(api: &dyn DeviceApi, address: &str) -> Result<(), ProxyError> {
    api.get_device_state(address).await.map(|_| ())
}

pub struct ConnectivityProbe {
    registry: Arc<DeviceRegistry>,
    api: Arc<dyn DeviceApi>,
    outcomes: DashMap<DeviceId, ProbeOutcome>,
}

impl ConnectivityProbe {
    pub fn new(registry: Arc<DeviceRegistry>, api: Arc<dyn DeviceApi>) -> Self {
        Self {
            registry,
            api,
            outcomes: DashMap::new(),
        }
    }

    pub fn outcome(&self, id: DeviceId) -> ProbeOutcome {
        self.outcomes
            .get(&id)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| ProbeOutcome::new(ProbeStatus::Idle))
    }

    /// Probes the device's stored address and records the result on the
    /// registry record (`connected`, `last_checked_at`).
    pub async fn test_device(&self, id: DeviceId) -> Result<ProbeOutcome, AppError> {
        let record = self.registry.get(id).await;
        let Some(address) = record.address else {
            return Err(AppError::Validation(format!("{id} has no address")));
        };

        self.outcomes.insert(id, ProbeOutcome::new(ProbeStatus::Testing));
        let result = test_connection(self.api.as_ref(), address.as_str()).await;

        let (connected, outcome) = match result {
            Ok(()) => {
                info!(%id, %address, "Connectivity test passed");
                (true, ProbeOutcome::new(ProbeStatus::Ok))
            }
            Err(e) => {
                warn!(%id, %address, "Connectivity test failed: {}", e);
                (
                    false,
                    ProbeOutcome {
                        status: ProbeStatus::Fail,
                        error: Some(e.to_string()),
                    },
                )
            }
        };

        let patch = DevicePatch {
            connected: Some(connected),
            last_checked_at: Some(Utc::now()),
            ..Default::default()
        };
        match self.registry.patch_if_address(id, &address, patch).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(%id, %address, "Address changed while testing, ignoring result");
                let outcome = ProbeOutcome::new(ProbeStatus::Idle);
                self.outcomes.insert(id, outcome.clone());
                return Ok(outcome);
            }
            Err(e) => {
                self.outcomes.remove(&id);
                return Err(e);
            }
        }

        self.outcomes.insert(id, outcome.clone());
        Ok(outcome)
    }

    pub async fn disconnect(&self, id: DeviceId) -> Result<DeviceRecord, AppError> {
        let record = self
            .registry
            .patch(
                id,
                DevicePatch {
                    connected: Some(false),
                    ..Default::default()
                },
            )
            .await?;
        self.outcomes.remove(&id);
        info!(%id, "Device disconnected");
        Ok(record)
    }

    /// A new address invalidates the previous result.
    pub fn clear_device(&self, id: DeviceId) {
        self.outcomes.remove(&id);
    }

    /// Forgets every test result, e.g. after the registry is reset.
    pub fn clear(&self) {
        self.outcomes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{registry::MemoryStore, test_support::RecordingApi};

    fn probe() -> (ConnectivityProbe, Arc<RecordingApi>, Arc<DeviceRegistry>) {
        let registry = Arc::new(DeviceRegistry::load(Arc::new(MemoryStore::default())));
        let api = RecordingApi::new();
        (
            ConnectivityProbe::new(registry.clone(), api.clone()),
            api,
            registry,
        )
    }

    #[tokio::test]
    async fn passing_test_connects() {
        let (probe, _, registry) = probe();

        let outcome = probe.test_device(DeviceId::Esp1).await.unwrap();

        assert_eq!(outcome, ProbeOutcome::new(ProbeStatus::Ok));
        assert_eq!(probe.outcome(DeviceId::Esp1).status, ProbeStatus::Ok);
        let record = registry.get(DeviceId::Esp1).await;
        assert!(record.connected);
        assert!(record.last_checked_at.is_some());
    }

    #[tokio::test]
    async fn failing_test_disconnects_and_keeps_message() {
        let (probe, api, registry) = probe();
        probe.test_device(DeviceId::Esp2).await.unwrap();
        api.respond_with(Err(ProxyError::UpstreamUnreachable {
            message: "no route to host".into(),
        }));

        let outcome = probe.test_device(DeviceId::Esp2).await.unwrap();

        assert_eq!(outcome.status, ProbeStatus::Fail);
        assert_eq!(
            outcome.error.as_deref(),
            Some("Device unreachable: no route to host")
        );
        let record = registry.get(DeviceId::Esp2).await;
        assert!(!record.connected);
        assert!(record.last_checked_at.is_some());
    }

    #[tokio::test]
    async fn device_without_address_cannot_be_tested() {
        let (probe, api, registry) = probe();
        registry
            .patch(
                DeviceId::Esp3,
                DevicePatch {
                    address: Some(String::new()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = probe.test_device(DeviceId::Esp3).await.unwrap_err();

        assert!(matches!(err, AppError::Validation(_)));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn address_edit_during_test_wins() {
        let (probe, api, registry) = probe();
        let probe = Arc::new(probe);
        let release = api.hold_next_read();

        let testing = tokio::spawn({
            let probe = probe.clone();
            async move { probe.test_device(DeviceId::Esp1).await }
        });
        while api.calls().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(probe.outcome(DeviceId::Esp1).status, ProbeStatus::Testing);

        registry
            .patch(
                DeviceId::Esp1,
                DevicePatch {
                    address: Some("10.9.9.9".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        release.send(()).unwrap();

        let outcome = testing.await.unwrap().unwrap();
        assert_eq!(outcome.status, ProbeStatus::Idle);
        assert!(!registry.get(DeviceId::Esp1).await.connected);
    }

    #[tokio::test]
    async fn disconnect_resets_status() {
        let (probe, _, registry) = probe();
        probe.test_device(DeviceId::Esp1).await.unwrap();

        let record = probe.disconnect(DeviceId::Esp1).await.unwrap();

        assert!(!record.connected);
        assert!(!registry.get(DeviceId::Esp1).await.connected);
        assert_eq!(probe.outcome(DeviceId::Esp1).status, ProbeStatus::Idle);
    }
}
