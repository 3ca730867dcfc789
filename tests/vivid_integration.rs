//! Integration tests using vivid virtual camera.
//!
//! These tests require:
//! - The `integration` feature flag: `cargo test --features integration`
//! - The vivid kernel module loaded (`sudo modprobe vivid`)
//! - Access to /dev/video* devices (may require sudo or video group membership)
//!
//! vivid emits raw formats only, so it exercises controls and the buffer
//! cycle but is rejected by MJPEG negotiation.
//!
//! Tests will fail if vivid is not available.

#![cfg(feature = "integration")]

use std::fs;
use std::path::Path;

use mjpeg_capture::control::{cid, ControlCatalog, RangeScan};
use mjpeg_capture::device::{V4L2Device, V4l2Opener};
use mjpeg_capture::multiplex::PollReadiness;
use mjpeg_capture::traits::{CaptureError, Format, FourCC, Readiness, VideoDevice};
use mjpeg_capture::{CaptureContext, DeviceRegistry};
use serial_test::serial;

/// Find all vivid capture nodes.
///
/// Uses sysfs to check the device name before opening, avoiding
/// unnecessary opens of real cameras.
fn find_vivid_devices() -> Vec<String> {
    let video4linux = Path::new("/sys/class/video4linux");
    if !video4linux.exists() {
        return Vec::new();
    }

    let mut devices = Vec::new();
    for index in 0..16 {
        let name_path = video4linux.join(format!("video{index}")).join("name");
        let Ok(name) = fs::read_to_string(&name_path) else {
            continue;
        };
        if !name.to_lowercase().contains("vivid") {
            continue;
        }

        let path = format!("/dev/video{index}");
        let Ok(device) = V4L2Device::open(&path) else {
            continue;
        };
        if device.capabilities().is_ok_and(|caps| caps.can_capture) {
            devices.push(path);
        }
    }
    devices
}

/// Path of the first vivid capture node.
///
/// Integration tests MUST have vivid loaded - they should fail, not silently skip.
fn require_vivid() -> String {
    let path = find_vivid_devices().into_iter().next();
    assert!(
        path.is_some(),
        "vivid virtual camera not available.\n\
         Load vivid with: sudo modprobe vivid\n\
         Or run unit tests only: cargo test --lib"
    );
    path.unwrap_or_default()
}

#[test]
#[serial]
fn test_vivid_device_open() {
    let path = require_vivid();
    let device = V4L2Device::open(&path).expect("Failed to open vivid device");
    let caps = device.capabilities().expect("Failed to query capabilities");

    assert!(caps.driver.contains("vivid"), "Expected vivid driver");
    assert!(caps.can_stream, "vivid should support streaming");
    assert!(V4L2Device::open("/dev/video-missing").is_err());
}

#[test]
#[serial]
fn test_vivid_controls_enumerate() {
    let path = require_vivid();
    let device = V4L2Device::open(&path).expect("Failed to open vivid device");

    let catalog = ControlCatalog::enumerate(&device);
    assert_eq!(catalog.protocol(), "next-control");
    let brightness = catalog
        .find(cid::BRIGHTNESS)
        .expect("vivid exposes brightness");
    assert!(brightness.value.is_some(), "user control value is read");

    let scanned = ControlCatalog::enumerate_with(&device, &RangeScan);
    assert!(scanned.find(cid::BRIGHTNESS).is_some());
    assert!(scanned.len() <= catalog.len());
}

#[test]
#[serial]
fn test_vivid_control_set_and_reset() {
    let path = require_vivid();
    let device = V4L2Device::open(&path).expect("Failed to open vivid device");
    let mut catalog = ControlCatalog::enumerate(&device);
    let brightness = catalog
        .find(cid::BRIGHTNESS)
        .expect("vivid exposes brightness")
        .clone();

    let target = (brightness.minimum + brightness.maximum) / 3;
    catalog
        .set(&device, cid::BRIGHTNESS, target)
        .expect("Failed to set brightness");
    assert_eq!(catalog.get(&device, cid::BRIGHTNESS).expect("get"), target);

    assert!(matches!(
        catalog.set(&device, cid::BRIGHTNESS, brightness.maximum + 1),
        Err(CaptureError::ControlOutOfRange { .. })
    ));

    catalog.reset(&device, cid::BRIGHTNESS).expect("Failed to reset");
    assert_eq!(
        catalog.get(&device, cid::BRIGHTNESS).expect("get"),
        brightness.default_value
    );
}

#[test]
#[serial]
fn test_vivid_buffer_cycle() {
    let path = require_vivid();
    let device = V4L2Device::open(&path).expect("Failed to open vivid device");
    let format = device
        .set_format(&Format::new(640, 480, FourCC::YUYV))
        .expect("Failed to set format");
    assert_eq!((format.width, format.height), (640, 480));

    assert!(device.request_buffers(1).expect("Failed to request buffers") >= 1);
    let info = device.query_buffer(0).expect("Failed to query buffer");
    let buffer = device.map_buffer(&info).expect("Failed to map buffer");
    assert_eq!(buffer.len(), info.length as usize);

    device.queue_buffer(0).expect("Failed to queue");
    device.stream_on().expect("Failed to start stream");

    let mut readiness = PollReadiness;
    for _ in 0..3 {
        let ready = readiness.wait(&[device.raw_fd()]).expect("Failed to wait");
        assert_eq!(ready, vec![true]);
        let done = device.dequeue_buffer().expect("Failed to dequeue");
        assert_eq!(done.index, 0);
        assert!(done.bytes_used > 0, "Bytes used should be positive");
        device.queue_buffer(done.index).expect("Failed to re-queue");
    }

    device.stream_off().expect("Failed to stop stream");
}

#[test]
#[serial]
fn test_vivid_rejected_by_mjpeg_negotiation() {
    let path = require_vivid();
    let registry = DeviceRegistry::new(V4l2Opener);

    let err = registry
        .register(CaptureContext::new(&path))
        .expect_err("vivid does not deliver JPEG");
    assert!(matches!(err, CaptureError::NotJpeg { .. }), "got {err}");
    assert!(registry.is_empty());
}
