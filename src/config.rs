//! Capture configuration.
//!
//! Devices are described in TOML:
//!
//! ```toml
//! [[devices]]
//! path = "/dev/video0"
//! resolution = "1280x720"
//! quality = 80
//! fps = 30
//!
//! [devices.controls]
//! brightness = "auto"
//! contrast = 40
//! exposure = "aperture-priority"
//! power_line = "50hz"
//! ```
//!
//! Hardware knobs are applied through [`KNOBS`], a table binding each
//! configuration key to the controls it drives.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

use crate::control::cid;
use crate::traits::{CaptureError, Result};

/// Requested capture size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Resolution {
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
}

impl Resolution {
    /// Create a resolution.
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CaptureError::InvalidValue {
            what: "resolution",
            value: s.to_owned(),
        };
        let (width, height) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        Ok(Self {
            width: width.parse().map_err(|_| invalid())?,
            height: height.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for Resolution {
    type Error = CaptureError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Knob input as it appears in TOML: a bare integer or a keyword.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawKnob {
    /// Integer literal.
    Int(i64),
    /// Keyword or numeric string.
    Text(String),
}

fn knob_int(what: &'static str, value: i64) -> Result<i32> {
    i32::try_from(value).map_err(|_| CaptureError::InvalidValue {
        what,
        value: value.to_string(),
    })
}

/// Integer setting that may instead hand control to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawKnob")]
pub enum AutoOr {
    /// Device-controlled.
    Auto,
    /// Fixed value.
    Manual(i32),
}

impl FromStr for AutoOr {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        s.trim()
            .parse()
            .map(Self::Manual)
            .map_err(|_| CaptureError::InvalidValue {
                what: "integer or 'auto'",
                value: s.to_owned(),
            })
    }
}

impl TryFrom<RawKnob> for AutoOr {
    type Error = CaptureError;

    fn try_from(raw: RawKnob) -> Result<Self> {
        match raw {
            RawKnob::Int(value) => knob_int("integer or 'auto'", value).map(Self::Manual),
            RawKnob::Text(text) => text.parse(),
        }
    }
}

/// Exposure mode; manual carries the absolute exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawKnob")]
pub enum ExposureMode {
    /// Fully automatic.
    Auto,
    /// Fixed shutter, automatic aperture.
    ShutterPriority,
    /// Fixed aperture, automatic shutter.
    AperturePriority,
    /// Manual with the given absolute exposure.
    Manual(i32),
}

impl ExposureMode {
    /// Menu index of the exposure-mode control.
    pub const fn menu_index(self) -> i32 {
        match self {
            Self::Auto => 0,
            Self::Manual(_) => 1,
            Self::ShutterPriority => 2,
            Self::AperturePriority => 3,
        }
    }
}

impl FromStr for ExposureMode {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_ascii_lowercase();
        match key.as_str() {
            "auto" => Ok(Self::Auto),
            "shutter-priority" => Ok(Self::ShutterPriority),
            "aperture-priority" => Ok(Self::AperturePriority),
            other => other
                .parse()
                .map(Self::Manual)
                .map_err(|_| CaptureError::InvalidValue {
                    what: "exposure mode",
                    value: s.to_owned(),
                }),
        }
    }
}

impl TryFrom<RawKnob> for ExposureMode {
    type Error = CaptureError;

    fn try_from(raw: RawKnob) -> Result<Self> {
        match raw {
            RawKnob::Int(value) => knob_int("exposure mode", value).map(Self::Manual),
            RawKnob::Text(text) => text.parse(),
        }
    }
}

/// Power-line flicker filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum PowerLineFilter {
    /// No filtering.
    Disabled,
    /// 50 Hz mains.
    Hz50,
    /// 60 Hz mains.
    Hz60,
    /// Driver detects the mains frequency.
    Auto,
}

impl PowerLineFilter {
    /// Menu index of the power-line-frequency control.
    pub const fn menu_index(self) -> i32 {
        match self {
            Self::Disabled => 0,
            Self::Hz50 => 1,
            Self::Hz60 => 2,
            Self::Auto => 3,
        }
    }
}

impl FromStr for PowerLineFilter {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" => Ok(Self::Disabled),
            "50hz" => Ok(Self::Hz50),
            "60hz" => Ok(Self::Hz60),
            "auto" => Ok(Self::Auto),
            _ => Err(CaptureError::InvalidValue {
                what: "power line filter",
                value: s.to_owned(),
            }),
        }
    }
}

impl TryFrom<String> for PowerLineFilter {
    type Error = CaptureError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Analog TV norm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum TvNorm {
    /// PAL.
    Pal,
    /// NTSC.
    Ntsc,
    /// SECAM.
    Secam,
    /// Unrecognised; leaves the standard undetermined.
    Unknown,
}

impl TvNorm {
    /// Standard bit set passed to the driver.
    pub const fn std_id(self) -> u64 {
        match self {
            Self::Pal => 0x0000_00ff,
            Self::Ntsc => 0x0000_b000,
            Self::Secam => 0x00ff_0000,
            Self::Unknown => 0,
        }
    }
}

impl From<&str> for TvNorm {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "pal" => Self::Pal,
            "ntsc" => Self::Ntsc,
            "secam" => Self::Secam,
            _ => Self::Unknown,
        }
    }
}

impl From<String> for TvNorm {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

/// Optional hardware knobs. Unset knobs leave the device alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlSettings {
    /// Brightness, or automatic brightness.
    pub brightness: Option<AutoOr>,
    /// Contrast.
    pub contrast: Option<i32>,
    /// Saturation.
    pub saturation: Option<i32>,
    /// Hue (color balance), or automatic hue.
    pub hue: Option<AutoOr>,
    /// Sharpness.
    pub sharpness: Option<i32>,
    /// White balance temperature, or automatic white balance.
    pub white_balance: Option<AutoOr>,
    /// Backlight compensation.
    pub backlight_compensation: Option<i32>,
    /// Rotation in degrees.
    pub rotate: Option<i32>,
    /// Vertical flip.
    pub vflip: Option<bool>,
    /// Gain, or automatic gain.
    pub gain: Option<AutoOr>,
    /// Chroma gain, or chroma AGC.
    pub chroma_gain: Option<AutoOr>,
    /// Exposure mode.
    pub exposure: Option<ExposureMode>,
    /// Power-line filter.
    pub power_line: Option<PowerLineFilter>,
    /// TV norm.
    pub tvnorm: Option<TvNorm>,
}

/// A configured value, before it is bound to controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnobValue {
    /// Integer.
    Int(i32),
    /// Flag.
    Bool(bool),
    /// Integer or automatic.
    AutoOr(AutoOr),
    /// Exposure mode.
    Exposure(ExposureMode),
    /// Power-line filter.
    PowerLine(PowerLineFilter),
    /// TV norm.
    TvNorm(TvNorm),
}

/// How a knob maps onto device controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// One integer control.
    Plain(u32),
    /// One boolean control.
    Toggle(u32),
    /// Auto toggle followed, when manual, by the value control.
    WithAuto {
        /// Boolean auto control.
        auto: u32,
        /// Value control.
        value: u32,
    },
    /// One menu control.
    Menu(u32),
    /// Exposure mode menu plus absolute exposure.
    Exposure {
        /// Mode menu control.
        mode: u32,
        /// Absolute exposure control.
        absolute: u32,
    },
    /// Video standard selection.
    Standard,
}

/// One device write produced by a knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlWrite {
    /// Integer or boolean control value.
    Value {
        /// Control identifier.
        id: u32,
        /// Value.
        value: i32,
    },
    /// Menu control index.
    Menu {
        /// Control identifier.
        id: u32,
        /// Menu index.
        index: i32,
    },
    /// Video standard.
    Standard(u64),
}

/// Table entry binding a configuration key to controls.
#[derive(Clone, Copy)]
pub struct Knob {
    /// Configuration key.
    pub key: &'static str,
    /// Controls driven.
    pub binding: Binding,
    read: fn(&ControlSettings) -> Option<KnobValue>,
}

impl fmt::Debug for Knob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Knob")
            .field("key", &self.key)
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

impl Knob {
    /// Configured value, if set.
    pub fn value(&self, settings: &ControlSettings) -> Option<KnobValue> {
        (self.read)(settings)
    }
}

/// Every configurable knob, in application order.
pub static KNOBS: [Knob; 14] = [
    Knob {
        key: "sharpness",
        binding: Binding::Plain(cid::SHARPNESS),
        read: |s| s.sharpness.map(KnobValue::Int),
    },
    Knob {
        key: "contrast",
        binding: Binding::Plain(cid::CONTRAST),
        read: |s| s.contrast.map(KnobValue::Int),
    },
    Knob {
        key: "saturation",
        binding: Binding::Plain(cid::SATURATION),
        read: |s| s.saturation.map(KnobValue::Int),
    },
    Knob {
        key: "backlight_compensation",
        binding: Binding::Plain(cid::BACKLIGHT_COMPENSATION),
        read: |s| s.backlight_compensation.map(KnobValue::Int),
    },
    Knob {
        key: "rotate",
        binding: Binding::Plain(cid::ROTATE),
        read: |s| s.rotate.map(KnobValue::Int),
    },
    Knob {
        key: "vflip",
        binding: Binding::Toggle(cid::VFLIP),
        read: |s| s.vflip.map(KnobValue::Bool),
    },
    Knob {
        key: "brightness",
        binding: Binding::WithAuto {
            auto: cid::AUTOBRIGHTNESS,
            value: cid::BRIGHTNESS,
        },
        read: |s| s.brightness.map(KnobValue::AutoOr),
    },
    Knob {
        key: "white_balance",
        binding: Binding::WithAuto {
            auto: cid::AUTO_WHITE_BALANCE,
            value: cid::WHITE_BALANCE_TEMPERATURE,
        },
        read: |s| s.white_balance.map(KnobValue::AutoOr),
    },
    Knob {
        key: "gain",
        binding: Binding::WithAuto {
            auto: cid::AUTOGAIN,
            value: cid::GAIN,
        },
        read: |s| s.gain.map(KnobValue::AutoOr),
    },
    Knob {
        key: "chroma_gain",
        binding: Binding::WithAuto {
            auto: cid::CHROMA_AGC,
            value: cid::CHROMA_GAIN,
        },
        read: |s| s.chroma_gain.map(KnobValue::AutoOr),
    },
    Knob {
        key: "hue",
        binding: Binding::WithAuto {
            auto: cid::HUE_AUTO,
            value: cid::HUE,
        },
        read: |s| s.hue.map(KnobValue::AutoOr),
    },
    Knob {
        key: "exposure",
        binding: Binding::Exposure {
            mode: cid::EXPOSURE_AUTO,
            absolute: cid::EXPOSURE_ABSOLUTE,
        },
        read: |s| s.exposure.map(KnobValue::Exposure),
    },
    Knob {
        key: "power_line",
        binding: Binding::Menu(cid::POWER_LINE_FREQUENCY),
        read: |s| s.power_line.map(KnobValue::PowerLine),
    },
    Knob {
        key: "tvnorm",
        binding: Binding::Standard,
        read: |s| s.tvnorm.map(KnobValue::TvNorm),
    },
];

/// Expand one configured value into device writes.
///
/// Returns an empty list when the value kind does not fit the binding.
pub fn expand(binding: Binding, value: KnobValue) -> Vec<ControlWrite> {
    match (binding, value) {
        (Binding::Plain(id), KnobValue::Int(value)) => vec![ControlWrite::Value { id, value }],
        (Binding::Toggle(id), KnobValue::Bool(flag)) => vec![ControlWrite::Value {
            id,
            value: i32::from(flag),
        }],
        (Binding::WithAuto { auto, .. }, KnobValue::AutoOr(AutoOr::Auto)) => {
            vec![ControlWrite::Value { id: auto, value: 1 }]
        }
        (Binding::WithAuto { auto, value: id }, KnobValue::AutoOr(AutoOr::Manual(value))) => vec![
            ControlWrite::Value { id: auto, value: 0 },
            ControlWrite::Value { id, value },
        ],
        (Binding::Menu(id), KnobValue::PowerLine(filter)) => vec![ControlWrite::Menu {
            id,
            index: filter.menu_index(),
        }],
        (Binding::Exposure { mode, absolute }, KnobValue::Exposure(exposure)) => {
            let mut writes = vec![ControlWrite::Menu {
                id: mode,
                index: exposure.menu_index(),
            }];
            if let ExposureMode::Manual(value) = exposure {
                writes.push(ControlWrite::Value {
                    id: absolute,
                    value,
                });
            }
            writes
        }
        (Binding::Standard, KnobValue::TvNorm(norm)) => vec![ControlWrite::Standard(norm.std_id())],
        _ => Vec::new(),
    }
}

impl ControlSettings {
    /// Every write the configured knobs produce, keyed by knob.
    pub fn writes(&self) -> Vec<(&'static str, ControlWrite)> {
        KNOBS
            .iter()
            .filter_map(|knob| knob.value(self).map(|value| (knob, value)))
            .flat_map(|(knob, value)| {
                expand(knob.binding, value)
                    .into_iter()
                    .map(move |write| (knob.key, write))
            })
            .collect()
    }
}

fn default_path() -> String {
    "/dev/video0".to_owned()
}

const fn default_quality() -> u8 {
    80
}

const fn default_fps() -> u8 {
    u8::MAX
}

// Eight-bit settings saturate instead of rejecting larger values.
fn saturating_u8<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let value = i64::deserialize(deserializer)?;
    Ok(u8::try_from(value.clamp(0, i64::from(u8::MAX))).unwrap_or(u8::MAX))
}

fn default_name() -> String {
    "Unknown".to_owned()
}

/// Configuration of one capture device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    /// Device node.
    #[serde(default = "default_path")]
    pub path: String,
    /// Requested resolution; the driver may substitute another.
    #[serde(default)]
    pub resolution: Resolution,
    /// JPEG quality hint, clamped to 0-100 at negotiation.
    #[serde(default = "default_quality", deserialize_with = "saturating_u8")]
    pub quality: u8,
    /// Requested frame rate, best-effort. 0 keeps the driver rate.
    #[serde(default = "default_fps", deserialize_with = "saturating_u8")]
    pub fps: u8,
    /// Horizontal flip.
    #[serde(default)]
    pub hflip: bool,
    /// Display name until the driver reports one.
    #[serde(default = "default_name")]
    pub name: String,
    /// Hardware knobs.
    #[serde(default)]
    pub controls: ControlSettings,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            resolution: Resolution::default(),
            quality: default_quality(),
            fps: default_fps(),
            hflip: false,
            name: default_name(),
            controls: ControlSettings::default(),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Devices to register at startup.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl EngineConfig {
    /// Load a TOML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        text.parse()
    }
}

impl FromStr for EngineConfig {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}
