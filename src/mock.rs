//! Scripted device fakes for testing without hardware.
//!
//! A [`MockDevice`] is a cheap handle onto shared state, so a test keeps a
//! clone to push frames, inject failures and inspect what the engine did
//! after the device has been moved into a session.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::control::cid;
use crate::region::{FrameBuffer, OutputRegion};
use crate::traits::{
    BufferInfo, CaptureError, ControlInfo, ControlType, DequeuedBuffer, DeviceCapabilities,
    DeviceOpener, ExtValue, Format, FourCC, Readiness, Result, VideoDevice,
};

static NEXT_FD: AtomicI32 = AtomicI32::new(100);

const BUFFER_LEN: u32 = 64 * 1024;

fn ioctl_error(request: &'static str, errno: i32) -> CaptureError {
    CaptureError::Ioctl {
        request,
        source: io::Error::from_raw_os_error(errno),
    }
}

/// A control exposed by a [`MockDevice`].
#[derive(Debug, Clone)]
pub struct MockControl {
    info: ControlInfo,
    value: i64,
    failing_ext_read: bool,
}

impl MockControl {
    /// Control of any type.
    pub fn new(
        id: u32,
        name: &str,
        control_type: ControlType,
        minimum: i32,
        maximum: i32,
        default_value: i32,
    ) -> Self {
        Self {
            info: ControlInfo {
                id,
                control_type,
                name: name.to_owned(),
                minimum,
                maximum,
                step: 1,
                default_value,
                flags: 0,
            },
            value: i64::from(default_value),
            failing_ext_read: false,
        }
    }

    /// Integer control.
    pub fn integer(id: u32, name: &str, minimum: i32, maximum: i32, default_value: i32) -> Self {
        Self::new(id, name, ControlType::Integer, minimum, maximum, default_value)
    }

    /// Start at `value` instead of the default.
    #[must_use]
    pub const fn with_value(mut self, value: i64) -> Self {
        self.value = value;
        self
    }

    /// Extended reads of this control fail.
    #[must_use]
    pub const fn failing_ext_read(mut self) -> Self {
        self.failing_ext_read = true;
        self
    }

    /// Flag the control as disabled.
    #[must_use]
    pub const fn disabled(mut self) -> Self {
        self.info.flags |= ControlInfo::FLAG_DISABLED;
        self
    }
}

/// Driver calls that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockFailure {
    /// Capability query.
    QueryCap,
    /// Stream start.
    StreamOn,
    /// Stream stop.
    StreamOff,
    /// Buffer request.
    RequestBuffers,
    /// Buffer mapping.
    Map,
    /// Dequeue.
    Dequeue,
    /// Re-queue.
    Queue,
}

#[derive(Debug)]
struct MockState {
    capabilities: DeviceCapabilities,
    format: Format,
    frame_interval: bool,
    frame_rate: Option<u32>,
    granted_buffers: u32,
    input_name: String,
    standard: Option<u64>,
    streaming: bool,
    queued: bool,
    pending: VecDeque<u32>,
    sequence: u32,
    next_control: bool,
    controls: Vec<MockControl>,
    rejected_ext: HashSet<u32>,
    failures: HashSet<MockFailure>,
    events: Vec<&'static str>,
    probe: Option<Arc<OutputRegion>>,
    probe_results: Vec<(&'static str, bool)>,
}

impl MockState {
    fn control(&self, request: &'static str, id: u32) -> Result<&MockControl> {
        self.controls
            .iter()
            .find(|c| c.info.id == id)
            .ok_or_else(|| ioctl_error(request, libc::EINVAL))
    }

    fn control_mut(&mut self, request: &'static str, id: u32) -> Result<&mut MockControl> {
        self.controls
            .iter_mut()
            .find(|c| c.info.id == id)
            .ok_or_else(|| ioctl_error(request, libc::EINVAL))
    }

    fn check(&self, failure: MockFailure, request: &'static str) -> Result<()> {
        if self.failures.contains(&failure) {
            Err(ioctl_error(request, libc::EIO))
        } else {
            Ok(())
        }
    }

    fn record_probe(&mut self, call: &'static str) {
        if let Some(region) = &self.probe {
            let unlocked = region.try_meta().is_some();
            self.probe_results.push((call, unlocked));
        }
    }
}

/// Fake V4L2 device.
#[derive(Debug, Clone)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
    fd: RawFd,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// A streaming 640x480 MJPG camera with no controls.
    #[must_use]
    pub fn new() -> Self {
        let state = MockState {
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
            },
            format: Format::new(640, 480, FourCC::MJPG),
            frame_interval: true,
            frame_rate: None,
            granted_buffers: 1,
            input_name: "Mock Input".to_owned(),
            standard: None,
            streaming: false,
            queued: false,
            pending: VecDeque::new(),
            sequence: 0,
            next_control: true,
            controls: Vec::new(),
            rejected_ext: HashSet::new(),
            failures: HashSet::new(),
            events: Vec::new(),
            probe: None,
            probe_results: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            fd: NEXT_FD.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    /// The only resolution the driver accepts.
    #[must_use]
    pub fn with_resolution(self, width: u32, height: u32) -> Self {
        {
            let mut state = self.state();
            state.format.width = width;
            state.format.height = height;
        }
        self
    }

    /// The only pixel format the driver accepts.
    #[must_use]
    pub fn with_fourcc(self, fourcc: FourCC) -> Self {
        self.state().format.fourcc = fourcc;
        self
    }

    /// Replace the reported capabilities.
    #[must_use]
    pub fn with_capabilities(self, capabilities: DeviceCapabilities) -> Self {
        self.state().capabilities = capabilities;
        self
    }

    /// Driver rejects frame interval changes.
    #[must_use]
    pub fn without_frame_interval(self) -> Self {
        self.state().frame_interval = false;
        self
    }

    /// Number of buffers granted per request.
    #[must_use]
    pub fn with_buffer_grant(self, count: u32) -> Self {
        self.state().granted_buffers = count;
        self
    }

    /// Name reported for input 0; empty means the query fails.
    #[must_use]
    pub fn with_input_name(self, name: &str) -> Self {
        name.clone_into(&mut self.state().input_name);
        self
    }

    /// Exposed controls.
    #[must_use]
    pub fn with_controls(self, controls: Vec<MockControl>) -> Self {
        self.replace_controls(controls);
        self
    }

    /// Driver rejects the next-control query flag.
    #[must_use]
    pub fn without_next_control(self) -> Self {
        self.state().next_control = false;
        self
    }

    /// Make a driver call fail.
    #[must_use]
    pub fn failing(self, failure: MockFailure) -> Self {
        self.fail(failure);
        self
    }

    /// Make a driver call fail from now on.
    pub fn fail(&self, failure: MockFailure) {
        self.state().failures.insert(failure);
    }

    /// Let a previously failing call succeed.
    pub fn recover(&self, failure: MockFailure) {
        self.state().failures.remove(&failure);
    }

    /// Swap the exposed controls.
    pub fn replace_controls(&self, mut controls: Vec<MockControl>) {
        controls.sort_by_key(|c| c.info.id);
        self.state().controls = controls;
    }

    /// Extended writes to `id` fail.
    pub fn reject_ext_writes(&self, id: u32) {
        self.state().rejected_ext.insert(id);
    }

    /// Current driver-side value of `id`.
    pub fn control_value(&self, id: u32) -> Option<i64> {
        self.state()
            .controls
            .iter()
            .find(|c| c.info.id == id)
            .map(|c| c.value)
    }

    /// Complete a frame of `bytes_used` bytes.
    pub fn push_frame(&self, bytes_used: u32) {
        self.state().pending.push_back(bytes_used);
    }

    /// Whether a completed frame or an injected dequeue failure is waiting.
    pub fn is_readable(&self) -> bool {
        let state = self.state();
        !state.pending.is_empty() || state.failures.contains(&MockFailure::Dequeue)
    }

    /// Driver calls made so far.
    pub fn events(&self) -> Vec<&'static str> {
        self.state().events.clone()
    }

    /// Whether the stream is on.
    pub fn is_streaming(&self) -> bool {
        self.state().streaming
    }

    /// Whether the capture buffer is with the driver.
    pub fn is_queued(&self) -> bool {
        self.state().queued
    }

    /// Last frame rate set.
    pub fn frame_rate(&self) -> Option<u32> {
        self.state().frame_rate
    }

    /// Last video standard set.
    pub fn standard(&self) -> Option<u64> {
        self.state().standard
    }

    /// Record, on each dequeue and queue, whether `region` was unlocked.
    pub fn set_lock_probe(&self, region: Arc<OutputRegion>) {
        self.state().probe = Some(region);
    }

    /// Probe observations in call order.
    pub fn probe_results(&self) -> Vec<(&'static str, bool)> {
        self.state().probe_results.clone()
    }
}

impl VideoDevice for MockDevice {
    fn capabilities(&self) -> Result<DeviceCapabilities> {
        let state = self.state();
        state.check(MockFailure::QueryCap, "VIDIOC_QUERYCAP")?;
        Ok(state.capabilities.clone())
    }

    fn set_format(&self, _format: &Format) -> Result<Format> {
        let mut state = self.state();
        state.events.push("set_format");
        Ok(state.format.clone())
    }

    fn supports_frame_interval(&self) -> Result<bool> {
        Ok(self.state().frame_interval)
    }

    fn set_frame_rate(&self, fps: u32) -> Result<()> {
        let mut state = self.state();
        if !state.frame_interval {
            return Err(ioctl_error("VIDIOC_S_PARM", libc::EINVAL));
        }
        state.events.push("set_frame_rate");
        state.frame_rate = Some(fps);
        Ok(())
    }

    fn request_buffers(&self, _count: u32) -> Result<u32> {
        let mut state = self.state();
        state.check(MockFailure::RequestBuffers, "VIDIOC_REQBUFS")?;
        state.events.push("request_buffers");
        Ok(state.granted_buffers)
    }

    fn query_buffer(&self, index: u32) -> Result<BufferInfo> {
        let state = self.state();
        if index >= state.granted_buffers {
            return Err(ioctl_error("VIDIOC_QUERYBUF", libc::EINVAL));
        }
        Ok(BufferInfo {
            index,
            length: BUFFER_LEN,
            offset: index * BUFFER_LEN,
        })
    }

    fn map_buffer(&self, info: &BufferInfo) -> Result<FrameBuffer> {
        let mut state = self.state();
        if state.failures.contains(&MockFailure::Map) {
            return Err(CaptureError::Map(io::Error::from_raw_os_error(libc::ENOMEM)));
        }
        state.events.push("map_buffer");
        Ok(FrameBuffer::heap(info.length as usize))
    }

    fn queue_buffer(&self, _index: u32) -> Result<()> {
        let mut state = self.state();
        state.record_probe("queue");
        state.check(MockFailure::Queue, "VIDIOC_QBUF")?;
        state.events.push("queue_buffer");
        state.queued = true;
        Ok(())
    }

    fn dequeue_buffer(&self) -> Result<DequeuedBuffer> {
        let mut state = self.state();
        state.record_probe("dequeue");
        state.check(MockFailure::Dequeue, "VIDIOC_DQBUF")?;
        if !state.streaming {
            return Err(ioctl_error("VIDIOC_DQBUF", libc::EINVAL));
        }
        if !state.queued {
            return Err(ioctl_error("VIDIOC_DQBUF", libc::EAGAIN));
        }
        let bytes_used = state
            .pending
            .pop_front()
            .ok_or_else(|| ioctl_error("VIDIOC_DQBUF", libc::EAGAIN))?;
        state.events.push("dequeue_buffer");
        state.queued = false;
        state.sequence += 1;
        Ok(DequeuedBuffer {
            index: 0,
            bytes_used,
            sequence: state.sequence,
        })
    }

    fn input_name(&self, index: u32) -> Result<String> {
        let state = self.state();
        if index != 0 || state.input_name.is_empty() {
            return Err(ioctl_error("VIDIOC_ENUMINPUT", libc::EINVAL));
        }
        Ok(state.input_name.clone())
    }

    fn set_standard(&self, standard: u64) -> Result<()> {
        let mut state = self.state();
        state.events.push("set_standard");
        state.standard = Some(standard);
        Ok(())
    }

    fn stream_on(&self) -> Result<()> {
        let mut state = self.state();
        state.check(MockFailure::StreamOn, "VIDIOC_STREAMON")?;
        state.events.push("stream_on");
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&self) -> Result<()> {
        let mut state = self.state();
        state.check(MockFailure::StreamOff, "VIDIOC_STREAMOFF")?;
        state.events.push("stream_off");
        state.streaming = false;
        state.queued = false;
        Ok(())
    }

    fn query_control(&self, id: u32) -> Result<ControlInfo> {
        let state = self.state();
        if id & cid::FLAG_NEXT_CTRL == 0 {
            return state
                .control("VIDIOC_QUERYCTRL", id)
                .map(|c| c.info.clone());
        }
        if !state.next_control {
            return Err(ioctl_error("VIDIOC_QUERYCTRL", libc::EINVAL));
        }
        let after = id & !cid::FLAG_NEXT_CTRL;
        state
            .controls
            .iter()
            .find(|c| c.info.id > after)
            .map(|c| c.info.clone())
            .ok_or_else(|| ioctl_error("VIDIOC_QUERYCTRL", libc::EINVAL))
    }

    fn get_control(&self, id: u32) -> Result<i32> {
        let state = self.state();
        let control = state.control("VIDIOC_G_CTRL", id)?;
        i32::try_from(control.value).map_err(|_| ioctl_error("VIDIOC_G_CTRL", libc::ERANGE))
    }

    fn set_control(&self, id: u32, value: i32) -> Result<()> {
        let mut state = self.state();
        state.control_mut("VIDIOC_S_CTRL", id)?.value = i64::from(value);
        Ok(())
    }

    fn get_ext_control(&self, id: u32, control_type: ControlType) -> Result<ExtValue> {
        let state = self.state();
        let control = state.control("VIDIOC_G_EXT_CTRLS", id)?;
        if control.failing_ext_read {
            return Err(ioctl_error("VIDIOC_G_EXT_CTRLS", libc::EACCES));
        }
        Ok(match control_type {
            ControlType::Integer64 => ExtValue::Int64(control.value),
            ControlType::String => ExtValue::Size(control.info.maximum.unsigned_abs() + 1),
            _ => ExtValue::Int(
                i32::try_from(control.value)
                    .map_err(|_| ioctl_error("VIDIOC_G_EXT_CTRLS", libc::ERANGE))?,
            ),
        })
    }

    fn set_ext_control(&self, id: u32, value: ExtValue) -> Result<()> {
        let mut state = self.state();
        if state.rejected_ext.contains(&id) {
            return Err(ioctl_error("VIDIOC_S_EXT_CTRLS", libc::EINVAL));
        }
        state.control_mut("VIDIOC_S_EXT_CTRLS", id)?.value = value.as_i64();
        Ok(())
    }

    fn raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// Opens [`MockDevice`]s registered by path.
#[derive(Debug, Default)]
pub struct MockOpener {
    devices: Mutex<HashMap<String, MockDevice>>,
}

impl MockOpener {
    /// Empty opener; every path fails to open.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `device` available at `path`. Returns a handle for the test.
    pub fn insert(&self, path: &str, device: MockDevice) -> MockDevice {
        self.devices
            .lock()
            .expect("mock opener poisoned")
            .insert(path.to_owned(), device.clone());
        device
    }
}

impl DeviceOpener for MockOpener {
    type Device = MockDevice;

    fn open(&self, path: &str) -> Result<MockDevice> {
        self.devices
            .lock()
            .expect("mock opener poisoned")
            .get(path)
            .cloned()
            .ok_or_else(|| CaptureError::Open {
                path: path.to_owned(),
                source: io::Error::from_raw_os_error(libc::ENOENT),
            })
    }
}

/// Reports a descriptor ready when its device has a frame waiting.
#[derive(Debug, Default)]
pub struct MockReadiness {
    devices: Vec<MockDevice>,
    fail_next: bool,
    waits: Vec<Vec<RawFd>>,
}

impl MockReadiness {
    /// Watch readiness of `devices`.
    #[must_use]
    pub fn new(devices: Vec<MockDevice>) -> Self {
        Self {
            devices,
            fail_next: false,
            waits: Vec::new(),
        }
    }

    /// The next wait fails.
    pub fn fail_next(&mut self) {
        self.fail_next = true;
    }

    /// Descriptor sets passed to each wait.
    pub fn waits(&self) -> &[Vec<RawFd>] {
        &self.waits
    }
}

impl Readiness for MockReadiness {
    fn wait(&mut self, fds: &[RawFd]) -> io::Result<Vec<bool>> {
        self.waits.push(fds.to_vec());
        if std::mem::take(&mut self.fail_next) {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        Ok(fds
            .iter()
            .map(|fd| {
                self.devices
                    .iter()
                    .any(|d| d.raw_fd() == *fd && d.is_readable())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_control_walk_is_ordered() {
        let device = MockDevice::new().with_controls(vec![
            MockControl::integer(cid::CONTRAST, "Contrast", 0, 10, 5),
            MockControl::integer(cid::BRIGHTNESS, "Brightness", 0, 10, 5),
        ]);
        let first = device.query_control(cid::FLAG_NEXT_CTRL).expect("first");
        assert_eq!(first.id, cid::BRIGHTNESS);
        let second = device
            .query_control(first.id | cid::FLAG_NEXT_CTRL)
            .expect("second");
        assert_eq!(second.id, cid::CONTRAST);
        assert!(device
            .query_control(second.id | cid::FLAG_NEXT_CTRL)
            .is_err());
    }

    #[test]
    fn test_dequeue_needs_queued_buffer_and_frame() {
        let device = MockDevice::new();
        device.stream_on().expect("stream on");
        device.push_frame(100);
        assert!(device.dequeue_buffer().is_err(), "buffer not queued");

        device.queue_buffer(0).expect("queue");
        let buffer = device.dequeue_buffer().expect("dequeue");
        assert_eq!(buffer.bytes_used, 100);
        assert!(!device.is_queued());
    }
}
