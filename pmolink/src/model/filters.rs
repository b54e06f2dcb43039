//! Audio filters applied by the node.
//!
//! Every field is optional; an absent field means "no filter of that kind".
//! Presets only touch the fields they need so they can be combined.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EqualizerBand {
    /// 0 - 14
    pub band: u8,
    /// -0.25 - 1.0
    pub gain: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Karaoke {
    pub level: Option<f64>,
    pub mono_level: Option<f64>,
    pub filter_band: Option<f64>,
    pub filter_width: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timescale {
    pub speed: f64,
    pub pitch: f64,
    pub rate: f64,
}

impl Default for Timescale {
    fn default() -> Self {
        Self {
            speed: 1.0,
            pitch: 1.0,
            rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Oscillation {
    pub frequency: f64,
    pub depth: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rotation {
    pub rotation_hz: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distortion {
    pub sin_offset: Option<f64>,
    pub sin_scale: Option<f64>,
    pub cos_offset: Option<f64>,
    pub cos_scale: Option<f64>,
    pub tan_offset: Option<f64>,
    pub tan_scale: Option<f64>,
    pub offset: Option<f64>,
    pub scale: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMix {
    pub left_to_left: f64,
    pub left_to_right: f64,
    pub right_to_left: f64,
    pub right_to_right: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowPass {
    pub smoothing: f64,
}

/// Filter payload sent in player updates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equalizer: Option<Vec<EqualizerBand>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub karaoke: Option<Karaoke>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timescale: Option<Timescale>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tremolo: Option<Oscillation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vibrato: Option<Oscillation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Rotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distortion: Option<Distortion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_mix: Option<ChannelMix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_pass: Option<LowPass>,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Filters::default()
    }

    /// Boost the lowest bands; `level` is clamped to 0.0 - 1.0
    pub fn bass_boost(mut self, level: f64) -> Self {
        let level = level.clamp(0.0, 1.0);
        let bands = (0u8..6)
            .map(|band| EqualizerBand {
                band,
                gain: level * (1.0 - f64::from(band) * 0.15),
            })
            .collect();
        self.equalizer = Some(bands);
        self
    }

    pub fn nightcore(mut self) -> Self {
        self.timescale = Some(Timescale {
            speed: 1.2,
            pitch: 1.2,
            rate: 1.0,
        });
        self
    }

    pub fn vaporwave(mut self) -> Self {
        self.timescale = Some(Timescale {
            speed: 0.85,
            pitch: 0.8,
            rate: 1.0,
        });
        self.equalizer = Some(vec![
            EqualizerBand { band: 1, gain: 0.3 },
            EqualizerBand { band: 0, gain: 0.3 },
        ]);
        self.tremolo = Some(Oscillation {
            frequency: 14.0,
            depth: 0.3,
        });
        self
    }

    /// Audio panning around the listener
    pub fn eight_d(mut self) -> Self {
        self.rotation = Some(Rotation { rotation_hz: 0.2 });
        self
    }

    pub fn karaoke(mut self) -> Self {
        self.karaoke = Some(Karaoke {
            level: Some(1.0),
            mono_level: Some(1.0),
            filter_band: Some(220.0),
            filter_width: Some(100.0),
        });
        self
    }

    pub fn clear(&mut self) {
        *self = Filters::default();
    }
}
