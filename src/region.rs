//! Output region: the mapped capture buffer plus published frame metadata.
//!
//! The region is shared with readers through an `Arc`. The engine only
//! publishes metadata (byte length of the latest frame, update counter); it
//! never resizes or relocates the buffer.

use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use memmap2::MmapMut;

use crate::traits::{CaptureError, DequeuedBuffer, Result};

/// Backing memory of a capture buffer.
pub struct FrameBuffer {
    storage: Storage,
}

enum Storage {
    Mapped(MmapMut),
    Heap(Box<[u8]>),
}

impl FrameBuffer {
    /// Wrap a kernel buffer mapping.
    pub const fn mapped(map: MmapMut) -> Self {
        Self {
            storage: Storage::Mapped(map),
        }
    }

    /// Zero-filled buffer in process memory.
    pub fn heap(len: usize) -> Self {
        Self {
            storage: Storage::Heap(vec![0; len].into_boxed_slice()),
        }
    }

    /// Raw buffer bytes.
    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            Storage::Mapped(map) => map,
            Storage::Heap(bytes) => bytes,
        }
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the buffer has zero length.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.storage {
            Storage::Mapped(_) => "mapped",
            Storage::Heap(_) => "heap",
        };
        f.debug_struct("FrameBuffer")
            .field("kind", &kind)
            .field("len", &self.len())
            .finish()
    }
}

/// Metadata published after each completed frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameMeta {
    /// Strictly increasing count of published frames.
    pub updates: u64,
    /// Byte length of the most recent frame.
    pub used: u64,
}

/// Frame buffer and metadata shared between the engine and its readers.
///
/// Readers poll [`OutputRegion::meta`] and compare `updates` to detect new
/// frames.
#[derive(Debug)]
pub struct OutputRegion {
    buffer: FrameBuffer,
    honour_used: bool,
    meta: RwLock<FrameMeta>,
}

impl OutputRegion {
    /// Bind a buffer. With `honour_used`, readers see only the bytes of the
    /// last frame rather than the whole buffer.
    pub fn new(buffer: FrameBuffer, honour_used: bool) -> Self {
        Self {
            buffer,
            honour_used,
            meta: RwLock::new(FrameMeta::default()),
        }
    }

    /// Whether the published length bounds the readable bytes.
    pub const fn honours_used(&self) -> bool {
        self.honour_used
    }

    /// Length of the underlying buffer.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Current metadata.
    pub fn meta(&self) -> Result<FrameMeta> {
        Ok(*self.read_lock()?)
    }

    /// Current metadata, or `None` if the engine is mid-update.
    pub fn try_meta(&self) -> Option<FrameMeta> {
        self.meta.try_read().ok().map(|meta| *meta)
    }

    /// Run `f` over the latest frame under the shared lock.
    pub fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&[u8], FrameMeta) -> R,
    {
        let meta = self.read_lock()?;
        let bytes = self.buffer.as_slice();
        let visible = if self.honour_used {
            let used = usize::try_from(meta.used).unwrap_or(usize::MAX);
            bytes.get(..used).unwrap_or(bytes)
        } else {
            bytes
        };
        Ok(f(visible, *meta))
    }

    /// Dequeue under the exclusive lock and publish the completed frame.
    ///
    /// The lock is released before returning, so the caller re-queues the
    /// buffer without holding it.
    pub(crate) fn publish<F>(&self, dequeue: F) -> Result<(FrameMeta, DequeuedBuffer)>
    where
        F: FnOnce() -> Result<DequeuedBuffer>,
    {
        let mut meta = self.write_lock()?;
        let buffer = dequeue()?;
        meta.updates += 1;
        meta.used = u64::from(buffer.bytes_used);
        Ok((*meta, buffer))
    }

    fn read_lock(&self) -> Result<RwLockReadGuard<'_, FrameMeta>> {
        self.meta
            .read()
            .map_err(|_| CaptureError::LockPoisoned("output region"))
    }

    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, FrameMeta>> {
        self.meta
            .write()
            .map_err(|_| CaptureError::LockPoisoned("output region"))
    }
}
