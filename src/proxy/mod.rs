// proxy/mod.rs
//! The single egress point towards WLED devices.
//!
//! Every request re-validates the address it is given, so callers holding raw
//! user text cannot reach anything but `scheme://host[:port]/json/...`.

use async_trait::async_trait;
use reqwest::{Method, header::CACHE_CONTROL};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::{address::DeviceAddress, error::ProxyError};

/// Read/write access to a device's JSON state, as seen by the reconciliation
/// engine and the connectivity probe.
#[async_trait]
pub trait DeviceApi: Send + Sync {
    async fn get_device_state(&self, address: &str) -> Result<Value, ProxyError>;
    async fn set_device_state(&self, address: &str, patch: &Value) -> Result<Value, ProxyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    State,
    Info,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::State => "/json/state",
            Endpoint::Info => "/json/info",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Endpoint::State => "state",
            Endpoint::Info => "info",
        }
    }
}

/// Raw upstream answer: status is passed through untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Value,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn into_success(self) -> Result<Value, ProxyError> {
        if self.is_success() {
            Ok(self.body)
        } else {
            Err(ProxyError::UpstreamHttp {
                status: self.status,
            })
        }
    }
}

pub struct ProxyGateway {
    client: reqwest::Client,
}

impl ProxyGateway {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// GET `{address}{endpoint}`. A success response that is not JSON is an
    /// error; a failure response that is not JSON keeps its status with an
    /// empty body.
    pub async fn fetch(&self, address: &str, endpoint: Endpoint) -> Result<UpstreamResponse, ProxyError> {
        self.execute(Method::GET, address, endpoint, None).await
    }

    /// POST `patch` to `{address}{endpoint}`. The acknowledgement body is
    /// advisory, so anything unparsable becomes `{}`.
    pub async fn send(
        &self,
        address: &str,
        endpoint: Endpoint,
        patch: &Value,
    ) -> Result<UpstreamResponse, ProxyError> {
        self.execute(Method::POST, address, endpoint, Some(patch)).await
    }

    async fn execute(
        &self,
        method: Method,
        address: &str,
        endpoint: Endpoint,
        patch: Option<&Value>,
    ) -> Result<UpstreamResponse, ProxyError> {
        let result = self.execute_inner(&method, address, endpoint, patch).await;

        let outcome = match &result {
            Ok(response) if response.is_success() => "ok",
            Ok(_) => "upstream_status",
            Err(ProxyError::InvalidAddress(_)) => "invalid_address",
            Err(ProxyError::MalformedResponse(_)) => "malformed",
            Err(_) => "unreachable",
        };
        metrics::counter!(
            "wled_proxy_requests_total",
            "endpoint" => endpoint.label(),
            "method" => method.as_str().to_string(),
            "outcome" => outcome
        )
        .increment(1);

        result
    }

    async fn execute_inner(
        &self,
        method: &Method,
        address: &str,
        endpoint: Endpoint,
        patch: Option<&Value>,
    ) -> Result<UpstreamResponse, ProxyError> {
        let address = DeviceAddress::parse(address)?;
        let url = address.endpoint(endpoint.path());

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(CACHE_CONTROL, "no-store");
        if let Some(patch) = patch {
            request = request.json(patch);
        }

        debug!(%method, %url, "Forwarding device request");
        let response = request.send().await.map_err(unreachable)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(unreachable)?;

        let body = match serde_json::from_slice::<Value>(&bytes) {
            Ok(body) => body,
            Err(e) if *method == Method::GET && status.is_success() => {
                warn!(%url, "Device returned a non-JSON body: {}", e);
                return Err(ProxyError::MalformedResponse(e.to_string()));
            }
            Err(_) => Value::Object(Map::new()),
        };

        Ok(UpstreamResponse {
            status: status.as_u16(),
            body,
        })
    }
}

fn unreachable(e: reqwest::Error) -> ProxyError {
    ProxyError::UpstreamUnreachable {
        message: e.to_string(),
    }
}

#[async_trait]
impl DeviceApi for ProxyGateway {
    async fn get_device_state(&self, address: &str) -> Result<Value, ProxyError> {
        self.fetch(address, Endpoint::State).await?.into_success()
    }

    async fn set_device_state(&self, address: &str, patch: &Value) -> Result<Value, ProxyError> {
        self.send(address, Endpoint::State, patch).await?.into_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeDevice;
    use serde_json::json;

    fn gateway() -> ProxyGateway {
        ProxyGateway::new(Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn invalid_address_never_leaves_the_process() {
        let device = FakeDevice::start().await;
        let with_path = format!("{}/json/state", device.address);

        let err = gateway().get_device_state(&with_path).await.unwrap_err();

        assert!(matches!(err, ProxyError::InvalidAddress(_)));
        assert!(device.requests().is_empty());
    }

    #[tokio::test]
    async fn reads_current_state() {
        let device = FakeDevice::start().await;
        let state = gateway().get_device_state(&device.address).await.unwrap();

        assert_eq!(state["bri"], json!(128));
        let requests = device.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "GET");
        assert_eq!(requests[0].path, "/json/state");
        assert_eq!(requests[0].cache_control.as_deref(), Some("no-store"));
    }

    #[tokio::test]
    async fn every_read_hits_the_device() {
        let device = FakeDevice::start().await;
        let gateway = gateway();
        gateway.get_device_state(&device.address).await.unwrap();
        gateway.get_device_state(&device.address).await.unwrap();
        assert_eq!(device.requests().len(), 2);
    }

    #[tokio::test]
    async fn writes_send_json_bodies() {
        let device = FakeDevice::start().await;
        gateway()
            .set_device_state(&device.address, &json!({"on": true}))
            .await
            .unwrap();

        let requests = device.requests();
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].path, "/json/state");
        assert_eq!(requests[0].body, Some(json!({"on": true})));
        assert_eq!(requests[0].content_type.as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn non_success_status_is_surfaced() {
        let device = FakeDevice::with_response(503, r#"{"error":"busy"}"#).await;
        let err = gateway().get_device_state(&device.address).await.unwrap_err();
        assert_eq!(err, ProxyError::UpstreamHttp { status: 503 });

        let raw = gateway().fetch(&device.address, Endpoint::State).await.unwrap();
        assert_eq!(raw.status, 503);
        assert_eq!(raw.body, json!({"error": "busy"}));
    }

    #[tokio::test]
    async fn malformed_write_ack_degrades_to_empty_object() {
        let device = FakeDevice::with_response(200, "OK").await;
        let ack = gateway()
            .set_device_state(&device.address, &json!({"ps": 3}))
            .await
            .unwrap();
        assert_eq!(ack, json!({}));
    }

    #[tokio::test]
    async fn malformed_read_is_reported() {
        let device = FakeDevice::with_response(200, "<html>").await;
        let err = gateway().get_device_state(&device.address).await.unwrap_err();
        assert!(matches!(err, ProxyError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn unreachable_device_is_a_transport_error() {
        let address = FakeDevice::closed_address().await;
        let err = gateway().get_device_state(&address).await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamUnreachable { .. }));
    }

    #[tokio::test]
    async fn silent_device_hits_the_timeout() {
        let device = FakeDevice::unresponsive().await;
        let gateway = ProxyGateway::new(Duration::from_millis(200)).unwrap();

        let started = std::time::Instant::now();
        let read = gateway.get_device_state(&device.address).await.unwrap_err();
        let write = gateway
            .set_device_state(&device.address, &json!({"on": false}))
            .await
            .unwrap_err();

        assert!(matches!(read, ProxyError::UpstreamUnreachable { .. }));
        assert!(matches!(write, ProxyError::UpstreamUnreachable { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn out_of_range_port_is_an_invalid_address() {
        let err = gateway()
            .set_device_state("http://10.0.0.5:99999", &json!({"on": true}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn info_is_passed_through() {
        let device = FakeDevice::start().await;
        let info = gateway().fetch(&device.address, Endpoint::Info).await.unwrap();
        assert_eq!(info.status, 200);
        assert_eq!(info.body["name"], json!("WLED"));
        assert_eq!(device.requests()[0].path, "/json/info");
    }
}
