// commands/mod.rs
use serde::Serialize;
use serde_json::{Value, json};
use utoipa::ToSchema;

use crate::models::Rgb;

/// One outbound write to a device's `/json/state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    Power(bool),
    /// Raw 0-255 device brightness.
    Brightness(u8),
    Color(Rgb),
    Preset(u16),
}

impl DeviceCommand {
    pub fn to_patch(&self) -> Value {
        match self {
            DeviceCommand::Power(on) => json!({ "on": on }),
            DeviceCommand::Brightness(bri) => json!({ "bri": bri }),
            DeviceCommand::Color(rgb) => json!({ "seg": [{ "id": 0, "col": [rgb.0] }] }),
            DeviceCommand::Preset(ps) => json!({ "ps": ps }),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DeviceCommand::Power(_) => "power",
            DeviceCommand::Brightness(_) => "brightness",
            DeviceCommand::Color(_) => "color",
            DeviceCommand::Preset(_) => "preset",
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PresetButton {
    #[schema(value_type = String)]
    pub label: &'static str,
    pub ps: u16,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ColorChip {
    #[schema(value_type = String)]
    pub label: &'static str,
    #[schema(value_type = Vec<u8>)]
    pub rgb: Rgb,
    pub hex: String,
}

/// Buttons every device card offers.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PresetCatalog {
    pub solid: Vec<PresetButton>,
    pub animated: Vec<PresetButton>,
    pub colors: Vec<ColorChip>,
}

impl Default for PresetCatalog {
    fn default() -> Self {
        let button = |label, ps| PresetButton { label, ps };
        let chip = |label, rgb: [u8; 3]| ColorChip {
            label,
            rgb: Rgb(rgb),
            hex: Rgb(rgb).to_hex(),
        };

        Self {
            solid: vec![
                button("1", 1),
                button("2", 2),
                button("3", 3),
                button("4", 4),
                button("5", 5),
                button("6", 6),
            ],
            animated: vec![button("1", 7), button("2", 8), button("3", 9)],
            colors: vec![
                chip("Warm", [255, 160, 60]),
                chip("Cool", [180, 220, 255]),
                chip("Red", [255, 0, 0]),
                chip("Green", [0, 255, 0]),
                chip("Blue", [0, 0, 255]),
                chip("White", [255, 255, 255]),
            ],
        }
    }
}
