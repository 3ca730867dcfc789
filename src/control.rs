//! Hardware control catalog.
//!
//! A catalog is built by enumerating every control a device exposes, either
//! through the next-control iteration protocol or, for drivers without it, by
//! scanning the standard and private identifier ranges. Reads and writes go
//! through the simple control path for user-class controls and the extended
//! batch path for every other class.

use log::{debug, warn};

use crate::traits::{
    CaptureError, ControlInfo, ControlType, ExtValue, Result, VideoDevice,
};

/// Control identifiers used by the engine.
#[allow(missing_docs)]
pub mod cid {
    /// Mask selecting the class bits of an identifier.
    pub const CLASS_MASK: u32 = 0xffff_0000;
    /// User control class.
    pub const CLASS_USER: u32 = 0x0098_0000;
    /// Query flag requesting the control after the given identifier.
    pub const FLAG_NEXT_CTRL: u32 = 0x8000_0000;

    /// First standard user control.
    pub const BASE: u32 = CLASS_USER | 0x900;
    /// One past the last standard user control.
    pub const LASTP1: u32 = BASE + 44;
    /// First driver-private control.
    pub const PRIVATE_BASE: u32 = 0x0800_0000;

    pub const BRIGHTNESS: u32 = BASE;
    pub const CONTRAST: u32 = BASE + 1;
    pub const SATURATION: u32 = BASE + 2;
    pub const HUE: u32 = BASE + 3;
    pub const AUTO_WHITE_BALANCE: u32 = BASE + 12;
    pub const AUTOGAIN: u32 = BASE + 18;
    pub const GAIN: u32 = BASE + 19;
    pub const HFLIP: u32 = BASE + 20;
    pub const VFLIP: u32 = BASE + 21;
    pub const POWER_LINE_FREQUENCY: u32 = BASE + 24;
    pub const HUE_AUTO: u32 = BASE + 25;
    pub const WHITE_BALANCE_TEMPERATURE: u32 = BASE + 26;
    pub const SHARPNESS: u32 = BASE + 27;
    pub const BACKLIGHT_COMPENSATION: u32 = BASE + 28;
    pub const CHROMA_AGC: u32 = BASE + 29;
    pub const AUTOBRIGHTNESS: u32 = BASE + 32;
    pub const ROTATE: u32 = BASE + 34;
    pub const CHROMA_GAIN: u32 = BASE + 36;

    /// Camera control class base.
    pub const CAMERA_CLASS_BASE: u32 = 0x009a_0900;
    pub const EXPOSURE_AUTO: u32 = CAMERA_CLASS_BASE + 1;
    pub const EXPOSURE_ABSOLUTE: u32 = CAMERA_CLASS_BASE + 2;
    pub const PAN_RESET: u32 = CAMERA_CLASS_BASE + 6;
    pub const TILT_RESET: u32 = CAMERA_CLASS_BASE + 7;

    /// JPEG compression quality.
    pub const JPEG_COMPRESSION_QUALITY: u32 = 0x009d_0903;
}

/// Which read/write path a control uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlClass {
    /// Simple path with local range checking.
    User,
    /// Extended batch path; carries the class bits of the identifier.
    Extended(u32),
}

/// Result of [`ControlCatalog::is_controllable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Controllability {
    /// Usable as an on/off value.
    Boolean,
    /// Usable as an integer value.
    Integer,
    /// Disabled, or of a type the simple path does not handle.
    Unsupported,
}

/// One hardware setting discovered on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlDescriptor {
    /// Control identifier.
    pub id: u32,
    /// Driver-supplied name.
    pub name: String,
    /// Read/write path.
    pub class: ControlClass,
    /// Declared type.
    pub control_type: ControlType,
    /// Lower bound (meaningful for user-class controls).
    pub minimum: i32,
    /// Upper bound (meaningful for user-class controls).
    pub maximum: i32,
    /// Step between valid values.
    pub step: i32,
    /// Default value.
    pub default_value: i32,
    /// Raw control flags.
    pub flags: u32,
    /// Last known value; `None` when it could not be read.
    pub value: Option<i64>,
}

/// How a device's controls are discovered and classified.
pub trait EnumerationStrategy {
    /// Short protocol name for diagnostics.
    fn name(&self) -> &'static str;

    /// Discover every control the device exposes, in driver order.
    fn discover(&self, device: &dyn VideoDevice) -> Vec<ControlInfo>;

    /// Read/write class of a discovered control.
    fn classify(&self, id: u32) -> ControlClass;
}

/// Walks controls with the next-control query flag.
#[derive(Debug, Default)]
pub struct NextControlWalk;

impl EnumerationStrategy for NextControlWalk {
    fn name(&self) -> &'static str {
        "next-control"
    }

    fn discover(&self, device: &dyn VideoDevice) -> Vec<ControlInfo> {
        let mut found = Vec::new();
        let mut query = cid::FLAG_NEXT_CTRL;
        while let Ok(info) = device.query_control(query) {
            // A driver that does not advance would loop forever.
            if found.last().is_some_and(|last: &ControlInfo| info.id <= last.id) {
                warn!("driver repeated control {:#010x}, stopping walk", info.id);
                break;
            }
            query = info.id | cid::FLAG_NEXT_CTRL;
            found.push(info);
        }
        found
    }

    fn classify(&self, id: u32) -> ControlClass {
        match id & cid::CLASS_MASK {
            cid::CLASS_USER => ControlClass::User,
            class => ControlClass::Extended(class),
        }
    }
}

/// Probes the standard range, then the private range until the first gap.
#[derive(Debug, Default)]
pub struct RangeScan;

impl EnumerationStrategy for RangeScan {
    fn name(&self) -> &'static str {
        "range-scan"
    }

    fn discover(&self, device: &dyn VideoDevice) -> Vec<ControlInfo> {
        let mut found: Vec<ControlInfo> = (cid::BASE..cid::LASTP1)
            .filter_map(|id| device.query_control(id).ok())
            .collect();
        found.extend(
            (cid::PRIVATE_BASE..=u32::MAX)
                .map_while(|id| device.query_control(id).ok()),
        );
        found
    }

    // Identifier bits are meaningless without the next-control protocol.
    fn classify(&self, _id: u32) -> ControlClass {
        ControlClass::User
    }
}

/// Pick the protocol the device supports.
pub fn select_strategy(device: &dyn VideoDevice) -> Box<dyn EnumerationStrategy> {
    if device.query_control(cid::FLAG_NEXT_CTRL).is_ok() {
        Box::new(NextControlWalk)
    } else {
        Box::new(RangeScan)
    }
}

/// All controls discovered for one device.
#[derive(Debug, Clone, Default)]
pub struct ControlCatalog {
    protocol: &'static str,
    controls: Vec<ControlDescriptor>,
}

impl ControlCatalog {
    /// Enumerate every control on `device`, reading current values.
    pub fn enumerate(device: &dyn VideoDevice) -> Self {
        let strategy = select_strategy(device);
        Self::enumerate_with(device, strategy.as_ref())
    }

    /// Enumerate with an explicit strategy.
    pub fn enumerate_with(device: &dyn VideoDevice, strategy: &dyn EnumerationStrategy) -> Self {
        let controls: Vec<ControlDescriptor> = strategy
            .discover(device)
            .into_iter()
            .map(|info| {
                let class = strategy.classify(info.id);
                describe(device, info, class)
            })
            .collect();
        debug!(
            "enumerated {} controls via {}",
            controls.len(),
            strategy.name()
        );
        Self {
            protocol: strategy.name(),
            controls,
        }
    }

    /// Discard the cached catalog and enumerate again.
    pub fn refresh(&mut self, device: &dyn VideoDevice) {
        *self = Self::enumerate(device);
    }

    /// Name of the protocol used for the last enumeration.
    pub const fn protocol(&self) -> &'static str {
        self.protocol
    }

    /// Cached descriptors in discovery order.
    pub fn descriptors(&self) -> &[ControlDescriptor] {
        &self.controls
    }

    /// Cached descriptor for `id`.
    pub fn find(&self, id: u32) -> Option<&ControlDescriptor> {
        self.controls.iter().find(|c| c.id == id)
    }

    /// Number of cached controls.
    pub fn len(&self) -> usize {
        self.controls.len()
    }

    /// Whether no controls were discovered.
    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }

    /// Query whether `id` can be driven through [`get`](Self::get) and
    /// [`set`](Self::set).
    pub fn is_controllable(device: &dyn VideoDevice, id: u32) -> Result<Controllability> {
        let info = device.query_control(id)?;
        if info.is_disabled() {
            debug!("control {} disabled", info.name);
            return Ok(Controllability::Unsupported);
        }
        Ok(match info.control_type {
            ControlType::Boolean => Controllability::Boolean,
            ControlType::Integer => Controllability::Integer,
            _ => {
                debug!("control {} unsupported", info.name);
                Controllability::Unsupported
            }
        })
    }

    /// Read the current value of a controllable control.
    pub fn get(&self, device: &dyn VideoDevice, id: u32) -> Result<i32> {
        require_controllable(device, id)?;
        device.get_control(id)
    }

    /// Write a controllable control.
    ///
    /// User-class values are checked against the cached bounds and update the
    /// cached value. Other classes go to the driver unchecked.
    pub fn set(&mut self, device: &dyn VideoDevice, id: u32, value: i32) -> Result<()> {
        require_controllable(device, id).inspect_err(|_| {
            debug!("tried to set invalid control id {id:#010x}");
        })?;
        let control = self
            .controls
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(CaptureError::UnknownControl(id))?;

        match control.class {
            ControlClass::User => {
                check_range(control, value)?;
                device.set_control(id, value)?;
                control.value = Some(i64::from(value));
            }
            ControlClass::Extended(_) => {
                let value = marshal(control, value)?;
                device.set_ext_control(id, value)?;
            }
        }
        Ok(())
    }

    /// Restore the driver-reported default of `id`.
    pub fn reset(&mut self, device: &dyn VideoDevice, id: u32) -> Result<()> {
        require_controllable(device, id)?;
        let info = device.query_control(id)?;
        self.set(device, id, info.default_value)
    }

    /// Select entry `index` of a menu control.
    pub fn set_menu(&mut self, device: &dyn VideoDevice, id: u32, index: i32) -> Result<()> {
        let info = device.query_control(id)?;
        let control = self
            .controls
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(CaptureError::UnknownControl(id))?;
        let is_menu = matches!(
            info.control_type,
            ControlType::Menu | ControlType::IntegerMenu
        );
        if info.is_disabled() || !is_menu {
            return Err(CaptureError::ControlUnsupported {
                id,
                name: info.name,
            });
        }
        check_range(control, index)?;

        match control.class {
            ControlClass::User => device.set_control(id, index)?,
            ControlClass::Extended(_) => device.set_ext_control(id, ExtValue::Int(index))?,
        }
        control.value = Some(i64::from(index));
        Ok(())
    }
}

fn require_controllable(device: &dyn VideoDevice, id: u32) -> Result<()> {
    match ControlCatalog::is_controllable(device, id)? {
        Controllability::Unsupported => {
            let name = device
                .query_control(id)
                .map(|info| info.name)
                .unwrap_or_default();
            Err(CaptureError::ControlUnsupported { id, name })
        }
        Controllability::Boolean | Controllability::Integer => Ok(()),
    }
}

fn check_range(control: &ControlDescriptor, value: i32) -> Result<()> {
    if (control.minimum..=control.maximum).contains(&value) {
        Ok(())
    } else {
        debug!(
            "value {value} for control {:#010x} out of range {}-{}",
            control.id, control.minimum, control.maximum
        );
        Err(CaptureError::ControlOutOfRange {
            id: control.id,
            value,
            min: control.minimum,
            max: control.maximum,
        })
    }
}

// Covers every extended type; `set` currently admits only integer and
// boolean controls.
fn marshal(control: &ControlDescriptor, value: i32) -> Result<ExtValue> {
    match control.control_type {
        ControlType::Integer64 => Ok(ExtValue::Int64(i64::from(value))),
        ControlType::String => Err(CaptureError::UnsupportedControlType {
            id: control.id,
            control_type: control.control_type,
        }),
        _ => Ok(ExtValue::Int(value)),
    }
}

fn describe(device: &dyn VideoDevice, info: ControlInfo, class: ControlClass) -> ControlDescriptor {
    let value = match class {
        ControlClass::User => match device.get_control(info.id) {
            Ok(value) => Some(i64::from(value)),
            Err(err) => {
                debug!("unable to get the value of control {}: {err}", info.name);
                None
            }
        },
        ControlClass::Extended(_) => read_extended(device, &info),
    };

    ControlDescriptor {
        id: info.id,
        name: info.name,
        class,
        control_type: info.control_type,
        minimum: info.minimum,
        maximum: info.maximum,
        step: info.step,
        default_value: info.default_value,
        flags: info.flags,
        value,
    }
}

fn read_extended(device: &dyn VideoDevice, info: &ControlInfo) -> Option<i64> {
    if info.control_type == ControlType::String {
        debug!("control {} is a string control, value not read", info.name);
        return None;
    }
    match device.get_ext_control(info.id, info.control_type) {
        Ok(value) => Some(value.as_i64()),
        Err(_) if matches!(info.id, cid::PAN_RESET | cid::TILT_RESET) => Some(1),
        Err(err) => {
            debug!(
                "control id {:#010x} failed to get value: {err}",
                info.id
            );
            None
        }
    }
}
