//! mjpeg-capture: a multi-device V4L2 MJPEG capture engine
//!
//! Each registered device streams into a single memory-mapped buffer that is
//! cycled through dequeue, publish and re-queue. Readers watch the device's
//! [`OutputRegion`] update counter for new frames. Hardware settings are
//! exposed through a per-device [`ControlCatalog`].
//!
//! All kernel access goes through the [`VideoDevice`] trait, so the engine
//! runs against real hardware or scripted fakes.

pub mod config;
pub mod control;
pub mod device;
pub mod multiplex;
pub mod region;
pub mod registry;
pub mod session;
pub mod traits;

mod sys;

#[cfg(test)]
pub mod mock;

pub use config::{DeviceConfig, EngineConfig, Resolution};
pub use control::{ControlCatalog, ControlDescriptor};
pub use device::{V4L2Device, V4l2Opener};
pub use multiplex::{FaultPolicy, Multiplexer, PollReadiness};
pub use region::{FrameMeta, OutputRegion};
pub use registry::{DeviceHandle, DeviceRegistry};
pub use session::{CaptureContext, CaptureSession};
pub use traits::{CaptureError, DeviceOpener, FourCC, VideoDevice};
