// metrics/mod.rs
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;

/// Serves `/metrics` on its own port.
pub fn setup_metrics(port: u16) -> Result<(), BuildError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    ::metrics::describe_counter!(
        "wled_proxy_requests_total",
        "Device requests forwarded by the proxy gateway"
    );
    ::metrics::describe_counter!(
        "wled_device_commands_total",
        "Commands dispatched by device controllers"
    );
    Ok(())
}
