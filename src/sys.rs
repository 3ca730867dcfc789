//! Raw V4L2 request payloads and ioctl plumbing.
//!
//! Layouts follow `linux/videodev2.h` on LP64 targets. Requests the `v4l`
//! crate covers (capability query, format negotiation) are not duplicated
//! here.

#![allow(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
// Payload layouts keep fields the engine never reads.
#![allow(dead_code)]

use std::io;
use std::mem::size_of;
use std::os::unix::io::RawFd;

use bytemuck::Zeroable;
use libc::{c_ulong, c_void};
use memmap2::{MmapMut, MmapOptions};

/// Attempts made for a request failing with a transient errno.
pub const IOCTL_RETRY: usize = 4;

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_CAP_TIMEPERFRAME: u32 = 0x1000;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, nr: u32, size: usize) -> c_ulong {
    ((dir << 30) | ((size as u32) << 16) | ((b'V' as u32) << 8) | nr) as c_ulong
}

const fn iow(nr: u32, size: usize) -> c_ulong {
    ioc(IOC_WRITE, nr, size)
}

const fn iowr(nr: u32, size: usize) -> c_ulong {
    ioc(IOC_READ | IOC_WRITE, nr, size)
}

pub const VIDIOC_REQBUFS: c_ulong = iowr(8, size_of::<V4l2RequestBuffers>());
pub const VIDIOC_QUERYBUF: c_ulong = iowr(9, size_of::<V4l2Buffer>());
pub const VIDIOC_QBUF: c_ulong = iowr(15, size_of::<V4l2Buffer>());
pub const VIDIOC_DQBUF: c_ulong = iowr(17, size_of::<V4l2Buffer>());
pub const VIDIOC_STREAMON: c_ulong = iow(18, size_of::<libc::c_int>());
pub const VIDIOC_STREAMOFF: c_ulong = iow(19, size_of::<libc::c_int>());
pub const VIDIOC_G_PARM: c_ulong = iowr(21, size_of::<V4l2StreamParm>());
pub const VIDIOC_S_PARM: c_ulong = iowr(22, size_of::<V4l2StreamParm>());
pub const VIDIOC_S_STD: c_ulong = iow(24, size_of::<u64>());
pub const VIDIOC_ENUMINPUT: c_ulong = iowr(26, size_of::<V4l2Input>());
pub const VIDIOC_G_CTRL: c_ulong = iowr(27, size_of::<V4l2Control>());
pub const VIDIOC_S_CTRL: c_ulong = iowr(28, size_of::<V4l2Control>());
pub const VIDIOC_QUERYCTRL: c_ulong = iowr(36, size_of::<V4l2Queryctrl>());
pub const VIDIOC_G_EXT_CTRLS: c_ulong = iowr(71, size_of::<V4l2ExtControls>());
pub const VIDIOC_S_EXT_CTRLS: c_ulong = iowr(72, size_of::<V4l2ExtControls>());

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct V4l2RequestBuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct V4l2Timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2BufferM {
    pub offset: u32,
    pub userptr: c_ulong,
    pub planes: *mut c_void,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: V4l2Timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: V4l2BufferM,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

impl V4l2Buffer {
    /// Capture/mmap buffer at `index`, everything else zeroed.
    pub fn capture(index: u32) -> Self {
        Self {
            index,
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: V4L2_MEMORY_MMAP,
            ..Self::zeroed()
        }
    }

    pub fn offset(&self) -> u32 {
        // SAFETY: every variant of the mmap union starts with the 32-bit offset
        // and the buffer was zero-initialised.
        unsafe { self.m.offset }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct V4l2Fract {
    pub numerator: u32,
    pub denominator: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct V4l2CaptureParm {
    pub capability: u32,
    pub capturemode: u32,
    pub timeperframe: V4l2Fract,
    pub extendedmode: u32,
    pub readbuffers: u32,
    pub reserved: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2StreamParmUnion {
    pub capture: V4l2CaptureParm,
    pub raw_data: [u8; 200],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2StreamParm {
    pub type_: u32,
    pub parm: V4l2StreamParmUnion,
}

impl V4l2StreamParm {
    pub fn capture() -> Self {
        Self {
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            ..Self::zeroed()
        }
    }

    pub fn capture_parm(&self) -> V4l2CaptureParm {
        // SAFETY: the union is plain data; any bit pattern is a valid
        // `V4l2CaptureParm`.
        unsafe { self.parm.capture }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct V4l2Input {
    pub index: u32,
    pub name: [u8; 32],
    pub type_: u32,
    pub audioset: u32,
    pub tuner: u32,
    pub std: u64,
    pub status: u32,
    pub capabilities: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct V4l2Queryctrl {
    pub id: u32,
    pub type_: u32,
    pub name: [u8; 32],
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default_value: i32,
    pub flags: u32,
    pub reserved: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct V4l2Control {
    pub id: u32,
    pub value: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2ExtValue {
    pub value: i32,
    pub value64: i64,
    pub ptr: *mut c_void,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct V4l2ExtControl {
    pub id: u32,
    pub size: u32,
    pub reserved2: [u32; 1],
    pub value: V4l2ExtValue,
}

impl V4l2ExtControl {
    pub fn value(&self) -> i32 {
        let value = self.value;
        // SAFETY: plain integer view of a zero-initialised union.
        unsafe { value.value }
    }

    pub fn value64(&self) -> i64 {
        let value = self.value;
        // SAFETY: plain integer view of a zero-initialised union.
        unsafe { value.value64 }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2ExtControls {
    pub which: u32,
    pub count: u32,
    pub error_idx: u32,
    pub request_fd: i32,
    pub reserved: [u32; 1],
    pub controls: *mut V4l2ExtControl,
}

// SAFETY: all of these are C payloads for which the all-zero bit pattern is
// the documented initial state (the kernel API expects memset(0)).
unsafe impl Zeroable for V4l2RequestBuffers {}
unsafe impl Zeroable for V4l2Timecode {}
unsafe impl Zeroable for V4l2BufferM {}
unsafe impl Zeroable for V4l2Buffer {}
unsafe impl Zeroable for V4l2Fract {}
unsafe impl Zeroable for V4l2CaptureParm {}
unsafe impl Zeroable for V4l2StreamParmUnion {}
unsafe impl Zeroable for V4l2StreamParm {}
unsafe impl Zeroable for V4l2Input {}
unsafe impl Zeroable for V4l2Queryctrl {}
unsafe impl Zeroable for V4l2Control {}
unsafe impl Zeroable for V4l2ExtValue {}
unsafe impl Zeroable for V4l2ExtControl {}
unsafe impl Zeroable for V4l2ExtControls {}

/// Marks a payload as the argument type of specific requests.
///
/// # Safety
///
/// Implementors must be the exact `repr(C)` layout the kernel expects for
/// every request they are passed with.
pub unsafe trait IoctlArg: Sized {}

// SAFETY: layouts above mirror videodev2.h; each type is only paired with
// the requests that take it.
unsafe impl IoctlArg for V4l2RequestBuffers {}
unsafe impl IoctlArg for V4l2Buffer {}
unsafe impl IoctlArg for V4l2StreamParm {}
unsafe impl IoctlArg for V4l2Input {}
unsafe impl IoctlArg for V4l2Queryctrl {}
unsafe impl IoctlArg for V4l2Control {}
unsafe impl IoctlArg for V4l2ExtControls {}
unsafe impl IoctlArg for libc::c_int {}
unsafe impl IoctlArg for u64 {}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINTR | libc::EAGAIN | libc::ETIMEDOUT)
    )
}

/// Issue a request once.
pub fn ioctl<T: IoctlArg>(fd: RawFd, request: c_ulong, arg: &mut T) -> io::Result<()> {
    // SAFETY: `arg` is an exclusively borrowed payload whose layout matches
    // `request` (guaranteed by `IoctlArg`); the kernel only accesses it for
    // the duration of the call.
    let ret = unsafe { libc::ioctl(fd, request as _, (arg as *mut T).cast::<c_void>()) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Issue a request, retrying transient failures up to [`IOCTL_RETRY`] times.
pub fn xioctl<T: IoctlArg>(fd: RawFd, request: c_ulong, arg: &mut T) -> io::Result<()> {
    retry(|| ioctl(fd, request, &mut *arg)).inspect_err(|err| {
        if is_transient(err) {
            log::debug!("ioctl {request:#x} retried {IOCTL_RETRY} times - giving up: {err}");
        }
    })
}

/// Run `op` until it succeeds, fails hard, or has failed transiently
/// [`IOCTL_RETRY`] times.
fn retry<F>(mut op: F) -> io::Result<()>
where
    F: FnMut() -> io::Result<()>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match op() {
            Err(err) if is_transient(&err) && attempts < IOCTL_RETRY => {}
            result => return result,
        }
    }
}

/// Map `len` bytes of the driver buffer at `offset` shared and writable.
pub fn map_buffer(fd: RawFd, offset: u32, len: u32) -> io::Result<MmapMut> {
    // SAFETY: the range was reported by VIDIOC_QUERYBUF for this descriptor.
    // The kernel keeps the pages alive until the mapping is dropped; the
    // driver writes into them only while the buffer is queued.
    unsafe {
        MmapOptions::new()
            .offset(u64::from(offset))
            .len(len as usize)
            .map_mut(fd)
    }
}

/// Convert a NUL-padded name field.
pub fn c_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(raw.get(..end).unwrap_or(raw)).into_owned()
}

/// Block until at least one descriptor is readable, errored or hung up.
///
/// No timeout. `EINTR` restarts the wait.
pub fn poll_readable(fds: &[RawFd]) -> io::Result<Vec<bool>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let count = libc::nfds_t::try_from(pollfds.len())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

    loop {
        // SAFETY: `pollfds` is a live, correctly sized array of `pollfd`.
        let ret = unsafe { libc::poll(pollfds.as_mut_ptr(), count, -1) };
        if ret >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    let ready = libc::POLLIN | libc::POLLERR | libc::POLLHUP;
    Ok(pollfds.iter().map(|p| p.revents & ready != 0).collect())
}
