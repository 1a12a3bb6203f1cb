// test_support.rs
//! In-process fakes: an HTTP WLED device and a recording `DeviceApi`.

use async_trait::async_trait;
use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::IntoResponse,
};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

use crate::{error::ProxyError, proxy::DeviceApi};

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: Option<Value>,
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
}

struct FakeState {
    status: u16,
    state_body: String,
    requests: Mutex<Vec<RecordedRequest>>,
}

pub struct FakeDevice {
    pub address: String,
    state: Arc<FakeState>,
    server: JoinHandle<()>,
}

pub fn sample_state() -> Value {
    json!({
        "on": true,
        "bri": 128,
        "ps": -1,
        "seg": [{ "id": 0, "col": [[255, 160, 60], [0, 0, 0], [0, 0, 0]] }]
    })
}

impl FakeDevice {
    pub async fn start() -> Self {
        Self::with_response(200, &sample_state().to_string()).await
    }

    /// Every `/json/state` request is answered with `status` and `body`.
    pub async fn with_response(status: u16, body: &str) -> Self {
        let state = Arc::new(FakeState {
            status,
            state_body: body.to_string(),
            requests: Mutex::new(Vec::new()),
        });
        let app = Router::new().fallback(record).with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            address: format!("http://127.0.0.1:{port}"),
            state,
            server,
        }
    }

    /// Accepts connections and never answers them.
    pub async fn unresponsive() -> Self {
        let state = Arc::new(FakeState {
            status: 200,
            state_body: String::new(),
            requests: Mutex::new(Vec::new()),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        Self {
            address: format!("http://127.0.0.1:{port}"),
            state,
            server,
        }
    }

    /// An address nothing is listening on.
    pub async fn closed_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{port}")
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn record(
    State(state): State<Arc<FakeState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let header_value = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    state.requests.lock().unwrap().push(RecordedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        body: serde_json::from_slice(&body).ok(),
        content_type: header_value(header::CONTENT_TYPE),
        cache_control: header_value(header::CACHE_CONTROL),
    });

    let (status, body) = match uri.path() {
        "/json/info" => (200, json!({"name": "WLED", "ver": "0.14.4"}).to_string()),
        _ => (state.status, state.state_body.clone()),
    };
    (
        StatusCode::from_u16(status).unwrap(),
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    Get(String),
    Set(String, Value),
}

/// Scripted `DeviceApi` that records every call.
pub struct RecordingApi {
    state: Mutex<Result<Value, ProxyError>>,
    set_result: Mutex<Result<Value, ProxyError>>,
    get_gate: Mutex<Option<oneshot::Receiver<()>>>,
    calls: Mutex<Vec<ApiCall>>,
}

impl RecordingApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Ok(sample_state())),
            set_result: Mutex::new(Ok(json!({}))),
            get_gate: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn respond_with(&self, state: Result<Value, ProxyError>) {
        *self.state.lock().unwrap() = state;
    }

    pub fn fail_writes(&self, err: ProxyError) {
        *self.set_result.lock().unwrap() = Err(err);
    }

    /// The next read waits until the returned sender fires (or is dropped).
    pub fn hold_next_read(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.get_gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ApiCall::Set(_, patch) => Some(patch),
                ApiCall::Get(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl DeviceApi for RecordingApi {
    async fn get_device_state(&self, address: &str) -> Result<Value, ProxyError> {
        self.calls.lock().unwrap().push(ApiCall::Get(address.to_string()));
        let gate = self.get_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.state.lock().unwrap().clone()
    }

    async fn set_device_state(&self, address: &str, patch: &Value) -> Result<Value, ProxyError> {
        self.calls
            .lock()
            .unwrap()
            .push(ApiCall::Set(address.to_string(), patch.clone()));
        self.set_result.lock().unwrap().clone()
    }
}
