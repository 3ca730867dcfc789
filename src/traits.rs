//! Core traits and types for the capture engine.
//!
//! Every kernel interaction goes through [`VideoDevice`], so the session,
//! catalog, registry and multiplexer layers run unchanged against the real
//! V4L2 driver or a scripted fake.

use std::collections::TryReserveError;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

use crate::region::FrameBuffer;
use crate::registry::DeviceHandle;

/// Pixel format representation (e.g., MJPG, JPEG, YUYV).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// Motion JPEG.
    pub const MJPG: Self = Self::new(b"MJPG");
    /// Plain JPEG, reported by some drivers instead of MJPG.
    pub const JPEG: Self = Self::new(b"JPEG");
    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");

    /// Whether frames in this format are self-contained JPEG images.
    pub fn is_jpeg(self) -> bool {
        self == Self::MJPG || self == Self::JPEG
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Negotiated or requested capture format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
}

impl Format {
    /// Create a new format specification.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        Self {
            width,
            height,
            fourcc,
        }
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

/// Location of a driver-owned buffer, as reported by the buffer query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    /// Buffer index within the driver queue.
    pub index: u32,
    /// Length of the buffer in bytes.
    pub length: u32,
    /// Offset to pass to `mmap`.
    pub offset: u32,
}

/// A completed buffer handed back by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    /// Buffer index within the driver queue.
    pub index: u32,
    /// Bytes of frame data written by the driver.
    pub bytes_used: u32,
    /// Driver frame sequence counter.
    pub sequence: u32,
}

/// Declared type of a hardware control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    /// Signed 32-bit value.
    Integer,
    /// On/off.
    Boolean,
    /// Index into a list of named entries.
    Menu,
    /// Write-only trigger.
    Button,
    /// Signed 64-bit value.
    Integer64,
    /// Class marker, carries no value.
    CtrlClass,
    /// Character string.
    String,
    /// Bit set.
    Bitmask,
    /// Index into a list of integers.
    IntegerMenu,
    /// Any other type code.
    Other(u32),
}

impl ControlType {
    /// Decode the kernel type code.
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Integer,
            2 => Self::Boolean,
            3 => Self::Menu,
            4 => Self::Button,
            5 => Self::Integer64,
            6 => Self::CtrlClass,
            7 => Self::String,
            8 => Self::Bitmask,
            9 => Self::IntegerMenu,
            other => Self::Other(other),
        }
    }
}

/// Raw control description returned by the driver query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlInfo {
    /// Control identifier.
    pub id: u32,
    /// Declared type.
    pub control_type: ControlType,
    /// Driver-supplied name.
    pub name: String,
    /// Lower bound.
    pub minimum: i32,
    /// Upper bound.
    pub maximum: i32,
    /// Step between valid values.
    pub step: i32,
    /// Default value.
    pub default_value: i32,
    /// Raw control flags.
    pub flags: u32,
}

impl ControlInfo {
    /// Control is permanently disabled by the driver.
    pub const FLAG_DISABLED: u32 = 0x0001;

    /// Whether the driver flagged this control as disabled.
    pub const fn is_disabled(&self) -> bool {
        self.flags & Self::FLAG_DISABLED != 0
    }
}

/// Value carried through the extended control path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtValue {
    /// Plain 32-bit field.
    Int(i32),
    /// 64-bit field.
    Int64(i64),
    /// Size field, reported for string controls.
    Size(u32),
}

impl ExtValue {
    /// Widen to the catalog's cached value representation.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Int(value) => i64::from(value),
            Self::Int64(value) => value,
            Self::Size(size) => i64::from(size),
        }
    }
}

/// Error type for capture operations.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// Failed to open the device node.
    #[error("failed to open device {path}: {source}")]
    Open {
        /// Device path.
        path: String,
        /// Underlying error.
        source: io::Error,
    },
    /// A device control call failed.
    #[error("{request} failed: {source}")]
    Ioctl {
        /// Request name.
        request: &'static str,
        /// Underlying error.
        source: io::Error,
    },
    /// The driver substituted a codec that is not a JPEG variant.
    #[error("device {path} does not deliver JPEG frames (driver chose {fourcc})")]
    NotJpeg {
        /// Device path.
        path: String,
        /// Format the driver returned.
        fourcc: FourCC,
    },
    /// The driver granted no capture buffers.
    #[error("device {0} did not allocate a capture buffer")]
    NoBuffers(String),
    /// Mapping the capture buffer failed.
    #[error("failed to map capture buffer: {0}")]
    Map(io::Error),
    /// The session has no bound output region.
    #[error("device {0} is not streaming")]
    NotStreaming(String),
    /// Control is disabled or of a type the simple path cannot handle.
    #[error("control {id:#010x} ({name}) is not controllable")]
    ControlUnsupported {
        /// Control identifier.
        id: u32,
        /// Driver-supplied name.
        name: String,
    },
    /// Control is missing from the cached catalog.
    #[error("control {0:#010x} is not in the catalog")]
    UnknownControl(u32),
    /// Value outside the cached bounds.
    #[error("value {value} for control {id:#010x} out of range {min}-{max}")]
    ControlOutOfRange {
        /// Control identifier.
        id: u32,
        /// Rejected value.
        value: i32,
        /// Lower bound.
        min: i32,
        /// Upper bound.
        max: i32,
    },
    /// Control type has no marshalling on the extended path.
    #[error("control {id:#010x} has unsupported type {control_type:?}")]
    UnsupportedControlType {
        /// Control identifier.
        id: u32,
        /// Declared type.
        control_type: ControlType,
    },
    /// Handle does not name a live registry entry.
    #[error("invalid device handle {0}")]
    InvalidHandle(DeviceHandle),
    /// Positional index past the end of the registry.
    #[error("registry index {index} out of range (length {len})")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Registry length.
        len: usize,
    },
    /// Registry already holds the maximum number of devices.
    #[error("registry is full ({0} devices)")]
    RegistryFull(usize),
    /// Growing registry storage failed.
    #[error("could not grow registry storage: {0}")]
    Alloc(#[from] TryReserveError),
    /// Multi-descriptor wait failed.
    #[error("readiness wait failed: {0}")]
    Wait(io::Error),
    /// A lock holder panicked.
    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
    /// Configuration file could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
    /// A configuration value could not be parsed.
    #[error("invalid {what} '{value}'")]
    InvalidValue {
        /// Kind of value.
        what: &'static str,
        /// Offending input.
        value: String,
    },
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Per-device driver operations.
///
/// Mirrors the V4L2 requests the engine issues. Implementations apply their
/// own transient-error retry policy.
pub trait VideoDevice: Send + Sync {
    /// Query driver identity and capability flags.
    fn capabilities(&self) -> Result<DeviceCapabilities>;

    /// Request a capture format. Returns the format the driver actually set.
    fn set_format(&self, format: &Format) -> Result<Format>;

    /// Whether the driver accepts a frame interval.
    fn supports_frame_interval(&self) -> Result<bool>;

    /// Request `fps` frames per second.
    fn set_frame_rate(&self, fps: u32) -> Result<()>;

    /// Request `count` memory-mapped buffers. Returns the granted count.
    fn request_buffers(&self, count: u32) -> Result<u32>;

    /// Query length and mapping offset of buffer `index`.
    fn query_buffer(&self, index: u32) -> Result<BufferInfo>;

    /// Map a queried buffer into process memory.
    fn map_buffer(&self, info: &BufferInfo) -> Result<FrameBuffer>;

    /// Hand buffer `index` to the driver's capture queue.
    fn queue_buffer(&self, index: u32) -> Result<()>;

    /// Take the next completed buffer from the driver.
    fn dequeue_buffer(&self) -> Result<DequeuedBuffer>;

    /// Display name of input `index`.
    fn input_name(&self, index: u32) -> Result<String>;

    /// Select a video standard.
    fn set_standard(&self, standard: u64) -> Result<()>;

    /// Start the capture stream.
    fn stream_on(&self) -> Result<()>;

    /// Stop the capture stream.
    fn stream_off(&self) -> Result<()>;

    /// Describe control `id`. The next-control flag may be or'ed into `id`.
    fn query_control(&self, id: u32) -> Result<ControlInfo>;

    /// Read a control through the simple path.
    fn get_control(&self, id: u32) -> Result<i32>;

    /// Write a control through the simple path.
    fn set_control(&self, id: u32, value: i32) -> Result<()>;

    /// Read a control through a single-element extended batch.
    fn get_ext_control(&self, id: u32, control_type: ControlType) -> Result<ExtValue>;

    /// Write a control through a single-element extended batch.
    fn set_ext_control(&self, id: u32, value: ExtValue) -> Result<()>;

    /// Descriptor used for readiness waits.
    fn raw_fd(&self) -> RawFd;
}

/// Opens devices by path.
pub trait DeviceOpener: Send + Sync {
    /// The device type produced.
    type Device: VideoDevice;

    /// Open the device at `path`.
    fn open(&self, path: &str) -> Result<Self::Device>;
}

/// Blocking wait for read readiness across several descriptors.
pub trait Readiness {
    /// Block until at least one of `fds` is readable or errored. Returns one
    /// flag per descriptor, in order.
    fn wait(&mut self, fds: &[RawFd]) -> io::Result<Vec<bool>>;
}
