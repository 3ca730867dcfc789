//! Per-device capture session: negotiation, buffer lifecycle and controls.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, trace, warn};

use crate::config::{ControlSettings, ControlWrite, DeviceConfig, Resolution};
use crate::control::{cid, ControlCatalog, ControlDescriptor, Controllability};
use crate::region::{FrameMeta, OutputRegion};
use crate::traits::{CaptureError, DeviceOpener, Format, FourCC, Result, VideoDevice};

/// Configuration and negotiated state of one device.
#[derive(Debug)]
pub struct CaptureContext {
    /// Device node.
    pub path: String,
    /// Requested resolution; replaced by the driver's choice on start.
    pub resolution: Resolution,
    /// Requested frame rate. 0 keeps the driver rate.
    pub fps: u8,
    /// JPEG quality hint.
    pub quality: u8,
    /// Horizontal flip.
    pub hflip: bool,
    /// Display name; replaced by the driver's input name when available.
    pub name: String,
    /// Hardware knobs applied after the stream starts.
    pub settings: ControlSettings,
    catalog: Mutex<ControlCatalog>,
    region: Option<Arc<OutputRegion>>,
}

impl Default for CaptureContext {
    fn default() -> Self {
        Self::from_config(&DeviceConfig::default())
    }
}

impl CaptureContext {
    /// Defaults for the device at `path`.
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_owned(),
            ..Self::default()
        }
    }

    /// Build from a configuration entry.
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            path: config.path.clone(),
            resolution: config.resolution,
            fps: config.fps,
            quality: config.quality,
            hflip: config.hflip,
            name: config.name.clone(),
            settings: config.controls.clone(),
            catalog: Mutex::new(ControlCatalog::default()),
            region: None,
        }
    }

    /// Set the requested resolution.
    #[must_use]
    pub const fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    /// Set the requested frame rate.
    #[must_use]
    pub const fn with_fps(mut self, fps: u8) -> Self {
        self.fps = fps;
        self
    }

    /// Set the quality hint.
    #[must_use]
    pub const fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    /// Set horizontal flip.
    #[must_use]
    pub const fn with_hflip(mut self, hflip: bool) -> Self {
        self.hflip = hflip;
        self
    }

    /// Set the default display name.
    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        name.clone_into(&mut self.name);
        self
    }

    /// Set the hardware knobs.
    #[must_use]
    pub fn with_settings(mut self, settings: ControlSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Output region, bound while the device is streaming.
    pub fn region(&self) -> Option<Arc<OutputRegion>> {
        self.region.clone()
    }

    /// Whether the stream was started and not yet shut down.
    pub const fn is_started(&self) -> bool {
        self.region.is_some()
    }

    /// Copy of the cached control catalog.
    pub fn catalog(&self) -> Result<ControlCatalog> {
        Ok(self.lock_catalog()?.clone())
    }

    fn lock_catalog(&self) -> Result<MutexGuard<'_, ControlCatalog>> {
        self.catalog
            .lock()
            .map_err(|_| CaptureError::LockPoisoned("control catalog"))
    }
}

/// A streaming device together with its context.
#[derive(Debug)]
pub struct CaptureSession<D> {
    context: CaptureContext,
    device: D,
    faulted: AtomicBool,
}

impl<D: VideoDevice> CaptureSession<D> {
    /// Open `context.path` with `opener` and start streaming.
    pub fn open<O>(mut context: CaptureContext, opener: &O) -> Result<Self>
    where
        O: DeviceOpener<Device = D>,
    {
        context.quality = context.quality.min(100);
        let device = opener.open(&context.path)?;
        Self::start(context, device)
    }

    /// Negotiate, map the capture buffer and start the stream.
    ///
    /// The driver may substitute another resolution; the context records
    /// what it chose. Frame rate and input name are best-effort.
    pub fn start(mut context: CaptureContext, device: D) -> Result<Self> {
        context.quality = context.quality.min(100);
        let path = context.path.clone();

        let caps = device.capabilities()?;
        if !caps.can_capture {
            warn!("{path} ({}) does not report video capture", caps.card);
        }
        if !caps.can_stream {
            warn!("{path} ({}) does not report streaming i/o", caps.card);
        }

        let requested = context.resolution;
        let format = device.set_format(&Format::new(
            u32::from(requested.width),
            u32::from(requested.height),
            FourCC::MJPG,
        ))?;
        if !format.fourcc.is_jpeg() {
            return Err(CaptureError::NotJpeg {
                path,
                fourcc: format.fourcc,
            });
        }
        context.resolution = negotiated_resolution(&format)?;
        if context.resolution != requested {
            info!(
                "{path}: driver chose {} instead of {requested}",
                context.resolution
            );
        }

        if context.fps > 0 {
            match device.supports_frame_interval() {
                Ok(true) => {
                    if let Err(err) = device.set_frame_rate(u32::from(context.fps)) {
                        debug!("{path}: could not set frame rate: {err}");
                    }
                }
                Ok(false) => debug!("{path}: frame rate is driver-determined"),
                Err(err) => debug!("{path}: frame interval query failed: {err}"),
            }
        }

        if device.request_buffers(1)? == 0 {
            return Err(CaptureError::NoBuffers(path));
        }
        let info = device.query_buffer(0)?;
        let buffer = device.map_buffer(&info)?;
        let region = Arc::new(OutputRegion::new(buffer, true));
        device.queue_buffer(info.index)?;

        match device.input_name(0) {
            Ok(name) if !name.is_empty() => context.name = name,
            Ok(_) => {}
            Err(err) => debug!("{path}: no input name: {err}"),
        }

        device.stream_on()?;
        context.region = Some(region);
        info!(
            "{path} ({}): streaming {} MJPEG, {} byte buffer",
            context.name, context.resolution, info.length
        );

        let catalog = ControlCatalog::enumerate(&device);
        *context
            .catalog
            .get_mut()
            .map_err(|_| CaptureError::LockPoisoned("control catalog"))? = catalog;

        let session = Self {
            context,
            device,
            faulted: AtomicBool::new(false),
        };
        session.apply_settings()?;
        Ok(session)
    }

    /// Context of this session.
    pub const fn context(&self) -> &CaptureContext {
        &self.context
    }

    /// Underlying device.
    pub const fn device(&self) -> &D {
        &self.device
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.context.name
    }

    /// Descriptor used for readiness waits.
    pub fn raw_fd(&self) -> RawFd {
        self.device.raw_fd()
    }

    /// Output region, bound while streaming.
    pub fn region(&self) -> Option<Arc<OutputRegion>> {
        self.context.region()
    }

    /// Run one dequeue, publish, re-queue cycle.
    ///
    /// The region's exclusive lock covers the dequeue and metadata update
    /// only; the buffer is re-queued after it is released.
    pub fn capture_frame(&self) -> Result<FrameMeta> {
        let region = self
            .context
            .region
            .as_ref()
            .ok_or_else(|| CaptureError::NotStreaming(self.context.path.clone()))?;
        let (meta, buffer) = region.publish(|| self.device.dequeue_buffer())?;
        self.device.queue_buffer(buffer.index)?;
        trace!(
            "{}: frame {} ({} bytes, sequence {})",
            self.context.path,
            meta.updates,
            meta.used,
            buffer.sequence
        );
        Ok(meta)
    }

    /// Stop the stream and unbind the region.
    ///
    /// A session that is not streaming shuts down as a no-op. If stopping
    /// fails the session is left as it was. The device closes when the
    /// session is dropped.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.context.region.is_none() {
            return Ok(());
        }
        self.device.stream_off()?;
        self.context.region = None;
        info!("{}: stream stopped", self.context.path);
        Ok(())
    }

    /// Close the device and keep the context.
    pub fn into_context(self) -> CaptureContext {
        self.context
    }

    /// Exclude this session from further multiplex cycles.
    pub fn mark_faulted(&self) {
        self.faulted.store(true, Ordering::Release);
    }

    /// Whether the session was excluded after a steady-state failure.
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Snapshot of the cached controls.
    pub fn controls(&self) -> Result<Vec<ControlDescriptor>> {
        Ok(self.context.lock_catalog()?.descriptors().to_vec())
    }

    /// Rebuild the control catalog from the driver.
    pub fn enumerate_controls(&self) -> Result<usize> {
        let mut catalog = self.context.lock_catalog()?;
        catalog.refresh(&self.device);
        Ok(catalog.len())
    }

    /// Whether `id` is usable through the simple get/set path.
    pub fn is_controllable(&self, id: u32) -> Result<Controllability> {
        ControlCatalog::is_controllable(&self.device, id)
    }

    /// Read control `id`.
    pub fn get_control(&self, id: u32) -> Result<i32> {
        self.context.lock_catalog()?.get(&self.device, id)
    }

    /// Write control `id`.
    pub fn set_control(&self, id: u32, value: i32) -> Result<()> {
        self.context.lock_catalog()?.set(&self.device, id, value)
    }

    /// Restore the default of control `id`.
    pub fn reset_control(&self, id: u32) -> Result<()> {
        self.context.lock_catalog()?.reset(&self.device, id)
    }

    /// Select entry `index` of menu control `id`.
    pub fn set_menu(&self, id: u32, index: i32) -> Result<()> {
        self.context.lock_catalog()?.set_menu(&self.device, id, index)
    }

    /// Apply quality, flip and the configured knobs. Returns the number of
    /// writes the driver accepted; rejected writes are logged and skipped.
    pub fn apply_settings(&self) -> Result<usize> {
        let mut catalog = self.context.lock_catalog()?;
        let path = &self.context.path;

        let mut writes = Vec::new();
        if catalog.find(cid::JPEG_COMPRESSION_QUALITY).is_some() {
            writes.push((
                "quality",
                ControlWrite::Value {
                    id: cid::JPEG_COMPRESSION_QUALITY,
                    value: i32::from(self.context.quality),
                },
            ));
        } else {
            debug!("{path}: no compression quality control");
        }
        if self.context.hflip {
            writes.push((
                "hflip",
                ControlWrite::Value {
                    id: cid::HFLIP,
                    value: 1,
                },
            ));
        }
        writes.extend(self.context.settings.writes());

        let mut applied = 0;
        for (key, write) in writes {
            let result = match write {
                ControlWrite::Value { id, value } => catalog.set(&self.device, id, value),
                ControlWrite::Menu { id, index } => catalog.set_menu(&self.device, id, index),
                ControlWrite::Standard(standard) => self.device.set_standard(standard),
            };
            match result {
                Ok(()) => {
                    info!("{path}: set {key} ({write:?})");
                    applied += 1;
                }
                Err(err) => warn!("{path}: could not set {key}: {err}"),
            }
        }
        Ok(applied)
    }
}

fn negotiated_resolution(format: &Format) -> Result<Resolution> {
    let invalid = || CaptureError::InvalidValue {
        what: "negotiated resolution",
        value: format!("{}x{}", format.width, format.height),
    };
    Ok(Resolution::new(
        u16::try_from(format.width).map_err(|_| invalid())?,
        u16::try_from(format.height).map_err(|_| invalid())?,
    ))
}
