// wled.rs
//! Typed view over the few `/json/state` fields the dashboard reads.

use serde_json::Value;

use crate::models::Rgb;

pub fn clamp_percent(percent: i32) -> u8 {
    percent.clamp(0, 100) as u8
}

/// 0-100 % to the device's 0-255 scale.
pub fn percent_to_bri(percent: u8) -> u8 {
    (f64::from(percent.min(100)) / 100.0 * 255.0).round() as u8
}

/// Device brightness (any number, clamped to 0-255) to a rounded percentage.
pub fn bri_to_percent(bri: f64) -> u8 {
    (bri.clamp(0.0, 255.0) / 255.0 * 100.0).round() as u8
}

/// Fields parsed out of a state document. `None` means absent or unusable,
/// in which case the displayed value is kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteState {
    pub on: Option<bool>,
    pub brightness_percent: Option<u8>,
    pub color: Option<Rgb>,
}

impl RemoteState {
    pub fn from_json(state: &Value) -> Self {
        let brightness_percent = state
            .get("bri")
            .and_then(Value::as_f64)
            .filter(|bri| bri.is_finite())
            .map(bri_to_percent);

        Self {
            on: state.get("on").and_then(Value::as_bool),
            brightness_percent,
            color: primary_color(state),
        }
    }
}

/// `seg[0].col[0]`, the first segment's primary color.
fn primary_color(state: &Value) -> Option<Rgb> {
    let channels = state
        .get("seg")?
        .get(0)?
        .get("col")?
        .get(0)?
        .as_array()?;
    if channels.len() < 3 {
        return None;
    }

    let mut rgb = [0u8; 3];
    for (slot, channel) in rgb.iter_mut().zip(channels) {
        let value = channel.as_f64().filter(|v| v.is_finite())?;
        *slot = value.clamp(0.0, 255.0).round() as u8;
    }
    Some(Rgb(rgb))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn brightness_round_trip_is_within_one_step() {
        for bri in 0..=255u8 {
            let back = percent_to_bri(bri_to_percent(f64::from(bri)));
            assert!(
                (i16::from(back) - i16::from(bri)).abs() <= 1,
                "bri {bri} came back as {back}"
            );
        }
    }

    #[test]
    fn conversions_clamp() {
        assert_eq!(clamp_percent(150), 100);
        assert_eq!(clamp_percent(-5), 0);
        assert_eq!(percent_to_bri(100), 255);
        assert_eq!(percent_to_bri(200), 255);
        assert_eq!(percent_to_bri(50), 128);
        assert_eq!(bri_to_percent(300.0), 100);
        assert_eq!(bri_to_percent(-1.0), 0);
        assert_eq!(bri_to_percent(128.0), 50);
    }

    #[test]
    fn parses_full_state() {
        let state = json!({
            "on": false,
            "bri": 255,
            "seg": [{ "col": [[10, 20, 30], [0, 0, 0]] }]
        });
        assert_eq!(
            RemoteState::from_json(&state),
            RemoteState {
                on: Some(false),
                brightness_percent: Some(100),
                color: Some(Rgb([10, 20, 30])),
            }
        );
    }

    #[test]
    fn missing_or_malformed_fields_are_none() {
        assert_eq!(RemoteState::from_json(&json!({})), RemoteState::default());

        let state = json!({
            "on": "yes",
            "bri": "high",
            "seg": [{ "col": [[10, 20]] }]
        });
        assert_eq!(RemoteState::from_json(&state), RemoteState::default());

        let state = json!({ "seg": [{ "col": [["r", 0, 0]] }] });
        assert_eq!(RemoteState::from_json(&state).color, None);
    }

    #[test]
    fn color_channels_are_clamped() {
        let state = json!({ "seg": [{ "col": [[300, -4, 12.6, 99]] }] });
        assert_eq!(RemoteState::from_json(&state).color, Some(Rgb([255, 0, 13])));
    }
}
