use utoipa::OpenApi;
use crate::{commands, connectivity, handlers, models, registry};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::proxy_info,
        handlers::proxy_state_get,
        handlers::proxy_state_post,
        handlers::list_presets,
        handlers::list_devices,
        handlers::reset_devices,
        handlers::get_device,
        handlers::patch_device,
        handlers::test_device,
        handlers::disconnect_device,
        handlers::refresh_device,
        handlers::set_power,
        handlers::set_brightness,
        handlers::set_color,
        handlers::apply_preset,
    ),
    components(
        schemas(
            models::DeviceId,
            models::ControllerStatus,
            models::DisplayState,
            models::DeviceSnapshot,
            models::DeviceView,
            models::ErrorBody,
            registry::DeviceRecord,
            connectivity::ProbeStatus,
            connectivity::ProbeOutcome,
            commands::PresetCatalog,
            handlers::DeviceEdit,
            handlers::PowerBody,
            handlers::BrightnessBody,
            handlers::ColorBody,
            handlers::PresetBody,
        )
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_state_post_documents_a_json_body() {
        let doc = serde_json::to_value(ApiDoc::openapi()).unwrap();
        let post = &doc["paths"]["/api/wled/state"]["post"];
        assert!(post["requestBody"]["content"]["application/json"].is_object());
        assert!(doc["paths"]["/api/devices/{id}/brightness"]["post"].is_object());
    }
}
