// SPDX-License-Identifier: GPL-3.0-only

//! Display backend interfaces.
//!
//! A guest-facing display protocol only talks to these traits. Concrete
//! backends pick how buffers are allocated and how frames reach the screen.

use crate::utils::env::{bool_var, dev_var};
use pv_display_config::DisplayConfig;
use smithay::backend::allocator::Fourcc;
use std::{
    fmt,
    ops::{Deref, DerefMut},
    path::PathBuf,
    sync::Arc,
};
use tracing::{info, warn};

pub mod detector;
mod error;
pub mod format;
pub mod geometry;
pub mod grant;
pub mod headless;

pub use self::error::{Error, FlipError, Result};
use self::grant::{DomId, GrantRefs};

pub type DisplayBufferPtr = Arc<dyn DisplayBuffer>;
pub type FrameBufferPtr = Arc<dyn FrameBuffer>;
pub type ConnectorPtr = Arc<dyn Connector>;

/// Locally addressable contents of a [`DisplayBuffer`].
pub struct BufferData<'a>(Box<dyn DerefMut<Target = [u8]> + 'a>);

impl<'a> BufferData<'a> {
    pub fn new(data: impl DerefMut<Target = [u8]> + 'a) -> BufferData<'a> {
        BufferData(Box::new(data))
    }
}

impl Deref for BufferData<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for BufferData<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Raw pixel memory.
pub trait DisplayBuffer: Send + Sync {
    /// Size in bytes
    fn size(&self) -> usize;

    /// Bytes per row
    fn stride(&self) -> u32;

    /// Backend specific handle, stable for the lifetime of the buffer.
    fn handle(&self) -> usize;

    /// Backing memory. The allocation does not move while the buffer lives.
    ///
    /// The returned guard may hold a lock on the contents. Drop it before
    /// calling [`DisplayBuffer::copy`] on the same buffer.
    fn data(&self) -> BufferData<'_>;

    /// Name under which other components can import this buffer.
    ///
    /// Repeated calls return the same name.
    fn read_name(&self) -> Result<u32>;

    /// Pull the latest contents of the associated grant pages.
    ///
    /// A no-op for buffers that are not shared or that are the grant mapping
    /// themselves. May block on the foreign domain. Fails with
    /// [`Error::BufferInUse`] while the contents are borrowed through
    /// [`DisplayBuffer::data`].
    fn copy(&self) -> Result<()>;
}

impl fmt::Debug for dyn DisplayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayBuffer")
            .field("handle", &self.handle())
            .field("size", &self.size())
            .field("stride", &self.stride())
            .finish()
    }
}

/// A presentable buffer. Owns exactly one [`DisplayBuffer`].
pub trait FrameBuffer: Send + Sync {
    fn handle(&self) -> usize;
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn format(&self) -> Fourcc;
    fn display_buffer(&self) -> DisplayBufferPtr;
}

/// Presentation info of a completed flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipInfo {
    /// vblank counter of the connector at presentation
    pub sequence: u64,
}

/// Single-shot completion of a page flip.
///
/// Consumed when the flip completes, so it can never run twice. Dropping it
/// without calling [`FlipCallback::complete`] abandons the flip.
pub struct FlipCallback(Box<dyn FnOnce(Result<FlipInfo, FlipError>) + Send>);

impl FlipCallback {
    pub fn new(f: impl FnOnce(Result<FlipInfo, FlipError>) + Send + 'static) -> FlipCallback {
        FlipCallback(Box::new(f))
    }

    pub fn complete(self, result: Result<FlipInfo, FlipError>) {
        (self.0)(result)
    }
}

impl fmt::Debug for FlipCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FlipCallback")
    }
}

/// One display output.
///
/// A connector keeps only a weak reference to the frame buffer it shows;
/// callers keep frame buffers alive for as long as they are on screen.
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;
    fn is_connected(&self) -> bool;
    fn is_initialized(&self) -> bool;

    /// Set a `width`x`height` mode showing `frame_buffer`.
    fn init(&self, width: u32, height: u32, frame_buffer: &FrameBufferPtr) -> Result<()>;

    /// Tear the mode down. Does nothing on an uninitialized connector.
    fn release(&self);

    /// Queue `frame_buffer` for the next vblank.
    ///
    /// Returns immediately. `callback` runs later on the display's event
    /// loop, exactly once, unless the display is stopped first.
    fn page_flip(&self, frame_buffer: &FrameBufferPtr, callback: FlipCallback) -> Result<()>;
}

/// Factory and connector registry of a display backend.
pub trait Display: Send + Sync {
    /// Start delivering flip completions.
    fn start(&self) -> Result<()>;

    /// Stop the event loop. No callback fires after this returns.
    fn stop(&self);

    /// Whether shared buffers are the grant mapping itself.
    fn is_zero_copy_supported(&self) -> bool;

    fn connector_by_name(&self, name: &str) -> Result<ConnectorPtr>;

    fn create_display_buffer(&self, width: u32, height: u32, bpp: u32) -> Result<DisplayBufferPtr>;

    /// Create a buffer backed by pages shared with `dom_id`.
    ///
    /// With `alloc_refs` the pages are allocated here and their references
    /// are written to `refs`. Otherwise `refs` names pages `dom_id` already
    /// granted, one per page of the buffer, in page order.
    fn create_shared_display_buffer(
        &self,
        width: u32,
        height: u32,
        bpp: u32,
        dom_id: DomId,
        refs: &mut GrantRefs,
        alloc_refs: bool,
    ) -> Result<DisplayBufferPtr>;

    fn create_frame_buffer(
        &self,
        display_buffer: DisplayBufferPtr,
        width: u32,
        height: u32,
        pixel_format: u32,
    ) -> Result<FrameBufferPtr>;
}

/// Pick the DRM device a hardware backend should open.
///
/// An explicitly configured device wins, then `PV_DISPLAY_DEVICE`, then
/// auto-detection unless disabled.
pub fn resolve_drm_device(config: &DisplayConfig) -> Option<PathBuf> {
    let configured = dev_var("PV_DISPLAY_DEVICE")
        .map(PathBuf::from)
        .or_else(|| config.drm_device.clone());

    if let Some(path) = configured {
        if path.exists() {
            info!("Using configured DRM device {}", path.display());
            return Some(path);
        }
        warn!(
            "Configured DRM device {} does not exist, ignoring",
            path.display()
        );
    }

    if config.disable_detection || bool_var("PV_DISPLAY_NO_DETECT").unwrap_or(false) {
        info!("DRM device auto detection disabled");
        return None;
    }

    detector::detect_drm_device()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn flip_callback_runs_once_with_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let callback = FlipCallback::new(move |result| {
            assert_eq!(result, Ok(FlipInfo { sequence: 3 }));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        callback.complete(Ok(FlipInfo { sequence: 3 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_flip_callback_never_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        drop(FlipCallback::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn existing_configured_device_wins() {
        let config = DisplayConfig {
            drm_device: Some(std::env::temp_dir()),
            disable_detection: true,
            ..Default::default()
        };
        if std::env::var_os("PV_DISPLAY_DEVICE").is_none() {
            assert_eq!(resolve_drm_device(&config), Some(std::env::temp_dir()));
        }
    }

    #[test]
    fn missing_device_without_detection_is_none() {
        let config = DisplayConfig {
            drm_device: Some(PathBuf::from("/nonexistent/dri/card9")),
            disable_detection: true,
            ..Default::default()
        };
        if std::env::var_os("PV_DISPLAY_DEVICE").is_none() {
            assert_eq!(resolve_drm_device(&config), None);
        }
    }
}
