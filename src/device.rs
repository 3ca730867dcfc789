//! V4L2 device implementation.
//!
//! Capability and format negotiation go through the `v4l` crate. Streaming,
//! buffer, input, standard and control requests are issued directly, since
//! the engine maps a single driver buffer and publishes it in place.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

use bytemuck::Zeroable;
use log::debug;
use v4l::capability::Flags;
use v4l::video::Capture;
use v4l::Device;

use crate::region::FrameBuffer;
use crate::sys::{
    self, V4l2Buffer, V4l2Control, V4l2ExtControl, V4l2ExtControls, V4l2ExtValue, V4l2Input,
    V4l2Queryctrl, V4l2RequestBuffers, V4l2StreamParm,
};
use crate::traits::{
    BufferInfo, CaptureError, ControlInfo, ControlType, DequeuedBuffer, DeviceCapabilities,
    DeviceOpener, ExtValue, Format, FourCC, Result, VideoDevice,
};

fn request_error(request: &'static str) -> impl FnOnce(io::Error) -> CaptureError {
    move |source| CaptureError::Ioctl { request, source }
}

/// V4L2 capture device opened read/write and non-blocking.
pub struct V4L2Device {
    device: Device,
    path: String,
}

impl V4L2Device {
    /// Open the device node at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let device = Device::with_path(path).map_err(|source| CaptureError::Open {
            path: path.to_owned(),
            source,
        })?;
        debug!("opened {path}");
        Ok(Self {
            device,
            path: path.to_owned(),
        })
    }

    /// Device node path.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn fd(&self) -> RawFd {
        self.device.handle().fd()
    }

    fn stream_type(&self, request: libc::c_ulong, name: &'static str) -> Result<()> {
        let mut kind = libc::c_int::try_from(sys::V4L2_BUF_TYPE_VIDEO_CAPTURE)
            .map_err(|err| CaptureError::Ioctl {
                request: name,
                source: io::Error::new(io::ErrorKind::InvalidInput, err),
            })?;
        sys::xioctl(self.fd(), request, &mut kind).map_err(request_error(name))
    }

    fn ext_controls(
        &self,
        request: libc::c_ulong,
        name: &'static str,
        control: &mut V4l2ExtControl,
    ) -> Result<()> {
        let mut batch = V4l2ExtControls {
            which: control.id & crate::control::cid::CLASS_MASK,
            count: 1,
            controls: ptr::from_mut(control),
            ..V4l2ExtControls::zeroed()
        };
        sys::xioctl(self.fd(), request, &mut batch).map_err(request_error(name))
    }
}

impl std::fmt::Debug for V4L2Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V4L2Device")
            .field("path", &self.path)
            .field("fd", &self.fd())
            .finish_non_exhaustive()
    }
}

impl VideoDevice for V4L2Device {
    fn capabilities(&self) -> Result<DeviceCapabilities> {
        let caps = self
            .device
            .query_caps()
            .map_err(request_error("VIDIOC_QUERYCAP"))?;

        Ok(DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(Flags::STREAMING),
        })
    }

    fn set_format(&self, format: &Format) -> Result<Format> {
        let mut fmt = self
            .device
            .format()
            .map_err(request_error("VIDIOC_G_FMT"))?;

        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();

        let fmt = self
            .device
            .set_format(&fmt)
            .map_err(request_error("VIDIOC_S_FMT"))?;

        Ok(Format::new(fmt.width, fmt.height, FourCC::from(fmt.fourcc)))
    }

    fn supports_frame_interval(&self) -> Result<bool> {
        let mut parm = V4l2StreamParm::capture();
        sys::xioctl(self.fd(), sys::VIDIOC_G_PARM, &mut parm)
            .map_err(request_error("VIDIOC_G_PARM"))?;
        Ok(parm.capture_parm().capability & sys::V4L2_CAP_TIMEPERFRAME != 0)
    }

    fn set_frame_rate(&self, fps: u32) -> Result<()> {
        let mut parm = V4l2StreamParm::capture();
        sys::xioctl(self.fd(), sys::VIDIOC_G_PARM, &mut parm)
            .map_err(request_error("VIDIOC_G_PARM"))?;
        let mut capture = parm.capture_parm();
        capture.timeperframe.numerator = 1;
        capture.timeperframe.denominator = fps;
        parm.parm.capture = capture;
        sys::xioctl(self.fd(), sys::VIDIOC_S_PARM, &mut parm)
            .map_err(request_error("VIDIOC_S_PARM"))
    }

    fn request_buffers(&self, count: u32) -> Result<u32> {
        let mut req = V4l2RequestBuffers {
            count,
            type_: sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: sys::V4L2_MEMORY_MMAP,
            ..V4l2RequestBuffers::zeroed()
        };
        sys::xioctl(self.fd(), sys::VIDIOC_REQBUFS, &mut req)
            .map_err(request_error("VIDIOC_REQBUFS"))?;
        Ok(req.count)
    }

    fn query_buffer(&self, index: u32) -> Result<BufferInfo> {
        let mut buf = V4l2Buffer::capture(index);
        sys::xioctl(self.fd(), sys::VIDIOC_QUERYBUF, &mut buf)
            .map_err(request_error("VIDIOC_QUERYBUF"))?;
        Ok(BufferInfo {
            index: buf.index,
            length: buf.length,
            offset: buf.offset(),
        })
    }

    fn map_buffer(&self, info: &BufferInfo) -> Result<FrameBuffer> {
        let map = sys::map_buffer(self.fd(), info.offset, info.length).map_err(CaptureError::Map)?;
        Ok(FrameBuffer::mapped(map))
    }

    fn queue_buffer(&self, index: u32) -> Result<()> {
        let mut buf = V4l2Buffer::capture(index);
        sys::xioctl(self.fd(), sys::VIDIOC_QBUF, &mut buf).map_err(request_error("VIDIOC_QBUF"))
    }

    fn dequeue_buffer(&self) -> Result<DequeuedBuffer> {
        let mut buf = V4l2Buffer::capture(0);
        sys::xioctl(self.fd(), sys::VIDIOC_DQBUF, &mut buf)
            .map_err(request_error("VIDIOC_DQBUF"))?;
        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: buf.bytesused,
            sequence: buf.sequence,
        })
    }

    fn input_name(&self, index: u32) -> Result<String> {
        let mut input = V4l2Input {
            index,
            ..V4l2Input::zeroed()
        };
        sys::xioctl(self.fd(), sys::VIDIOC_ENUMINPUT, &mut input)
            .map_err(request_error("VIDIOC_ENUMINPUT"))?;
        Ok(sys::c_name(&input.name))
    }

    fn set_standard(&self, standard: u64) -> Result<()> {
        let mut id = standard;
        sys::xioctl(self.fd(), sys::VIDIOC_S_STD, &mut id).map_err(request_error("VIDIOC_S_STD"))
    }

    fn stream_on(&self) -> Result<()> {
        self.stream_type(sys::VIDIOC_STREAMON, "VIDIOC_STREAMON")
    }

    fn stream_off(&self) -> Result<()> {
        self.stream_type(sys::VIDIOC_STREAMOFF, "VIDIOC_STREAMOFF")
    }

    fn query_control(&self, id: u32) -> Result<ControlInfo> {
        let mut query = V4l2Queryctrl {
            id,
            ..V4l2Queryctrl::zeroed()
        };
        sys::xioctl(self.fd(), sys::VIDIOC_QUERYCTRL, &mut query)
            .map_err(request_error("VIDIOC_QUERYCTRL"))?;
        Ok(ControlInfo {
            id: query.id,
            control_type: ControlType::from_raw(query.type_),
            name: sys::c_name(&query.name),
            minimum: query.minimum,
            maximum: query.maximum,
            step: query.step,
            default_value: query.default_value,
            flags: query.flags,
        })
    }

    fn get_control(&self, id: u32) -> Result<i32> {
        let mut control = V4l2Control { id, value: 0 };
        sys::xioctl(self.fd(), sys::VIDIOC_G_CTRL, &mut control)
            .map_err(request_error("VIDIOC_G_CTRL"))?;
        Ok(control.value)
    }

    fn set_control(&self, id: u32, value: i32) -> Result<()> {
        let mut control = V4l2Control { id, value };
        sys::xioctl(self.fd(), sys::VIDIOC_S_CTRL, &mut control)
            .map_err(request_error("VIDIOC_S_CTRL"))
    }

    fn get_ext_control(&self, id: u32, control_type: ControlType) -> Result<ExtValue> {
        let mut control = V4l2ExtControl {
            id,
            ..V4l2ExtControl::zeroed()
        };
        self.ext_controls(sys::VIDIOC_G_EXT_CTRLS, "VIDIOC_G_EXT_CTRLS", &mut control)?;
        Ok(match control_type {
            ControlType::Integer64 => ExtValue::Int64(control.value64()),
            ControlType::String => ExtValue::Size(control.size),
            _ => ExtValue::Int(control.value()),
        })
    }

    fn set_ext_control(&self, id: u32, value: ExtValue) -> Result<()> {
        let value = match value {
            ExtValue::Int(value) => V4l2ExtValue { value },
            ExtValue::Int64(value64) => V4l2ExtValue { value64 },
            ExtValue::Size(_) => {
                return Err(CaptureError::UnsupportedControlType {
                    id,
                    control_type: ControlType::String,
                })
            }
        };
        let mut control = V4l2ExtControl {
            id,
            value,
            ..V4l2ExtControl::zeroed()
        };
        self.ext_controls(sys::VIDIOC_S_EXT_CTRLS, "VIDIOC_S_EXT_CTRLS", &mut control)
    }

    fn raw_fd(&self) -> RawFd {
        self.fd()
    }
}

/// Opens V4L2 device nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct V4l2Opener;

impl DeviceOpener for V4l2Opener {
    type Device = V4L2Device;

    fn open(&self, path: &str) -> Result<V4L2Device> {
        V4L2Device::open(path)
    }
}
