//! Device registry.
//!
//! Sessions are kept densely ordered: removing the entry at position `i`
//! shifts every later entry down by one. Callers address devices by
//! [`DeviceHandle`], which survives those shifts and goes stale once its
//! device is removed.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{info, warn};

use crate::control::{ControlDescriptor, Controllability};
use crate::region::OutputRegion;
use crate::session::{CaptureContext, CaptureSession};
use crate::traits::{CaptureError, DeviceOpener, Result, VideoDevice};

/// Maximum number of simultaneously registered devices.
pub const MAX_DEVICES: usize = 256;

/// Generation-checked reference to a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    slot: u32,
    generation: u32,
}

impl DeviceHandle {
    /// Slot number, reused after removal.
    pub const fn slot(self) -> u32 {
        self.slot
    }

    /// Generation of the slot when the handle was issued.
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}.{}", self.slot, self.generation)
    }
}

struct Entry<D> {
    handle: DeviceHandle,
    session: CaptureSession<D>,
}

struct Inner<D> {
    entries: Vec<Entry<D>>,
    generations: Vec<u32>,
    free_slots: Vec<u32>,
}

impl<D> Inner<D> {
    const fn new() -> Self {
        Self {
            entries: Vec::new(),
            generations: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    fn position(&self, handle: DeviceHandle) -> Result<usize> {
        self.entries
            .iter()
            .position(|e| e.handle == handle)
            .ok_or(CaptureError::InvalidHandle(handle))
    }

    fn session(&self, handle: DeviceHandle) -> Result<&CaptureSession<D>> {
        self.entries
            .iter()
            .find(|e| e.handle == handle)
            .map(|e| &e.session)
            .ok_or(CaptureError::InvalidHandle(handle))
    }

    /// Make room for one more entry, doubling capacity when full.
    fn admit(&mut self) -> Result<DeviceHandle> {
        let len = self.entries.len();
        if len >= MAX_DEVICES {
            return Err(CaptureError::RegistryFull(MAX_DEVICES));
        }
        if len == self.entries.capacity() {
            let target = (len * 2).clamp(1, MAX_DEVICES);
            self.entries.try_reserve_exact(target - len)?;
        }

        if let Some(slot) = self.free_slots.pop() {
            let generation = self
                .generations
                .get(slot as usize)
                .copied()
                .unwrap_or_default();
            return Ok(DeviceHandle { slot, generation });
        }
        let slot = u32::try_from(self.generations.len())
            .map_err(|_| CaptureError::RegistryFull(MAX_DEVICES))?;
        self.generations.try_reserve(1)?;
        self.generations.push(0);
        Ok(DeviceHandle {
            slot,
            generation: 0,
        })
    }

    fn retire(&mut self, handle: DeviceHandle) {
        if let Some(generation) = self.generations.get_mut(handle.slot as usize) {
            *generation = generation.wrapping_add(1);
            self.free_slots.push(handle.slot);
        }
    }
}

/// Registered capture sessions, shared between the multiplexer and callers
/// that add or remove devices.
pub struct DeviceRegistry<O: DeviceOpener> {
    opener: O,
    inner: RwLock<Inner<O::Device>>,
}

impl<O: DeviceOpener> fmt::Debug for DeviceRegistry<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<O: DeviceOpener> DeviceRegistry<O> {
    /// Empty registry opening devices through `opener`.
    pub const fn new(opener: O) -> Self {
        Self {
            opener,
            inner: RwLock::new(Inner::new()),
        }
    }

    /// Empty registry behind an `Arc`, ready to share with a multiplexer.
    pub fn shared(opener: O) -> Arc<Self> {
        Arc::new(Self::new(opener))
    }

    /// Device opener.
    pub const fn opener(&self) -> &O {
        &self.opener
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner<O::Device>>> {
        self.inner
            .read()
            .map_err(|_| CaptureError::LockPoisoned("registry"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner<O::Device>>> {
        self.inner
            .write()
            .map_err(|_| CaptureError::LockPoisoned("registry"))
    }

    // Counts stay readable after a panic elsewhere.
    fn peek(&self) -> RwLockReadGuard<'_, Inner<O::Device>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open, negotiate and start a device, then append it.
    ///
    /// The device is started before the registry lock is taken. If it cannot
    /// be added, its stream is stopped again and the registry is unchanged.
    pub fn register(&self, context: CaptureContext) -> Result<DeviceHandle> {
        let session = CaptureSession::open(context, &self.opener)?;

        let mut inner = match self.write() {
            Ok(inner) => inner,
            Err(err) => return Err(abandon(session, err)),
        };
        let handle = match inner.admit() {
            Ok(handle) => handle,
            Err(err) => {
                drop(inner);
                return Err(abandon(session, err));
            }
        };

        info!(
            "registered {} ({}) as {handle} at index {}",
            session.context().path,
            session.name(),
            inner.entries.len()
        );
        inner.entries.push(Entry { handle, session });
        Ok(handle)
    }

    /// Stop and remove the device behind `handle`. Returns its context.
    ///
    /// If the stream cannot be stopped the entry stays registered and
    /// streaming.
    pub fn unregister(&self, handle: DeviceHandle) -> Result<CaptureContext> {
        let mut inner = self.write()?;
        let index = inner.position(handle)?;
        Self::remove(&mut inner, index)
    }

    /// Stop and remove the device at position `index`.
    pub fn unregister_at(&self, index: usize) -> Result<CaptureContext> {
        let mut inner = self.write()?;
        let len = inner.entries.len();
        if index >= len {
            return Err(CaptureError::IndexOutOfRange { index, len });
        }
        Self::remove(&mut inner, index)
    }

    fn remove(inner: &mut Inner<O::Device>, index: usize) -> Result<CaptureContext> {
        let len = inner.entries.len();
        let entry = inner
            .entries
            .get_mut(index)
            .ok_or(CaptureError::IndexOutOfRange { index, len })?;
        entry.session.shutdown()?;

        let Entry { handle, session } = inner.entries.remove(index);
        inner.retire(handle);
        info!("unregistered {} ({handle})", session.context().path);
        Ok(session.into_context())
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.peek().entries.len()
    }

    /// Whether no device is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocated entry capacity.
    pub fn capacity(&self) -> usize {
        self.peek().entries.capacity()
    }

    /// Handles in positional order.
    pub fn handles(&self) -> Vec<DeviceHandle> {
        self.peek().entries.iter().map(|e| e.handle).collect()
    }

    /// Handle of the device currently at `index`.
    pub fn handle_at(&self, index: usize) -> Option<DeviceHandle> {
        self.peek().entries.get(index).map(|e| e.handle)
    }

    /// Current position of `handle`. Shifts when earlier devices are
    /// removed.
    pub fn index_of(&self, handle: DeviceHandle) -> Result<usize> {
        self.read()?.position(handle)
    }

    /// Output region of a streaming device.
    pub fn region(&self, handle: DeviceHandle) -> Result<Arc<OutputRegion>> {
        self.with_session(handle, |session| {
            session
                .region()
                .ok_or_else(|| CaptureError::NotStreaming(session.context().path.clone()))
        })
    }

    /// Display name of a device.
    pub fn name(&self, handle: DeviceHandle) -> Result<String> {
        self.with_session(handle, |session| Ok(session.name().to_owned()))
    }

    /// Cached controls of a device.
    pub fn controls(&self, handle: DeviceHandle) -> Result<Vec<ControlDescriptor>> {
        self.with_session(handle, CaptureSession::controls)
    }

    /// Rebuild a device's control catalog.
    pub fn enumerate_controls(&self, handle: DeviceHandle) -> Result<usize> {
        self.with_session(handle, CaptureSession::enumerate_controls)
    }

    /// Whether control `id` is usable through the simple path.
    pub fn is_controllable(&self, handle: DeviceHandle, id: u32) -> Result<Controllability> {
        self.with_session(handle, |session| session.is_controllable(id))
    }

    /// Read control `id`.
    pub fn get_control(&self, handle: DeviceHandle, id: u32) -> Result<i32> {
        self.with_session(handle, |session| session.get_control(id))
    }

    /// Write control `id`.
    pub fn set_control(&self, handle: DeviceHandle, id: u32, value: i32) -> Result<()> {
        self.with_session(handle, |session| session.set_control(id, value))
    }

    /// Restore the default of control `id`.
    pub fn reset_control(&self, handle: DeviceHandle, id: u32) -> Result<()> {
        self.with_session(handle, |session| session.reset_control(id))
    }

    /// Select entry `index` of menu control `id`.
    pub fn set_menu(&self, handle: DeviceHandle, id: u32, index: i32) -> Result<()> {
        self.with_session(handle, |session| session.set_menu(id, index))
    }

    fn with_session<F, R>(&self, handle: DeviceHandle, f: F) -> Result<R>
    where
        F: FnOnce(&CaptureSession<O::Device>) -> Result<R>,
    {
        let inner = self.read()?;
        f(inner.session(handle)?)
    }

    /// Shared view held for one multiplex cycle.
    ///
    /// Registration and removal block until the snapshot is dropped.
    pub fn snapshot_for_wait(&self) -> Result<RegistrySnapshot<'_, O::Device>> {
        Ok(RegistrySnapshot { inner: self.read()? })
    }
}

fn abandon<D: VideoDevice>(mut session: CaptureSession<D>, err: CaptureError) -> CaptureError {
    warn!("could not register {}: {err}", session.context().path);
    if let Err(stop) = session.shutdown() {
        warn!(
            "{}: stream stop after failed registration: {stop}",
            session.context().path
        );
    }
    err
}

/// Registry contents under a shared lock.
pub struct RegistrySnapshot<'a, D> {
    inner: RwLockReadGuard<'a, Inner<D>>,
}

impl<D> RegistrySnapshot<'_, D> {
    /// Registered sessions in positional order.
    pub fn iter(&self) -> impl Iterator<Item = (DeviceHandle, &CaptureSession<D>)> {
        self.inner.entries.iter().map(|e| (e.handle, &e.session))
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }
}
