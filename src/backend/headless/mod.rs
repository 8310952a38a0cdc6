// SPDX-License-Identifier: GPL-3.0-only

//! Software display backend.
//!
//! Buffers live in system memory and connectors are virtual outputs taken
//! from the configuration. A vblank timer on the event-loop thread completes
//! pending page flips at the configured refresh rate.

use calloop::{
    timer::{TimeoutAction, Timer},
    EventLoop, LoopSignal,
};
use indexmap::IndexMap;
use parking_lot::{Mutex, ReentrantMutex};
use pv_display_config::{HeadlessConfig, OutputConfig};
use std::{
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
        mpsc::sync_channel,
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info, warn};

use super::{
    format::{self, SOFTWARE_FORMATS},
    geometry::BufferLayout,
    grant::{DomId, GrantBuffer, GrantRefs, GrantTable},
    Connector, ConnectorPtr, Display, DisplayBufferPtr, Error, FrameBufferPtr, Result,
};

mod buffer;
mod connector;

pub use self::buffer::{HeadlessBuffer, HeadlessFrameBuffer};
pub use self::connector::HeadlessConnector;

const DEFAULT_REFRESH_RATE: u32 = 60_000;

struct EventThread {
    signal: LoopSignal,
    handle: JoinHandle<()>,
}

struct Inner {
    outputs: IndexMap<String, OutputConfig>,
    connectors: Mutex<IndexMap<String, Arc<HeadlessConnector>>>,
    grant_table: Arc<dyn GrantTable>,
    refresh_interval: Duration,
    next_handle: AtomicUsize,
    names: Arc<AtomicU32>,
    // bumped by every stop, completions of an older epoch are dropped
    epoch: AtomicU64,
    // held while completions run, callbacks never run on two threads at once
    dispatch: ReentrantMutex<()>,
}

impl Inner {
    fn dispatch_vblank(&self) {
        let _dispatch = self.dispatch.lock();
        let epoch = self.epoch.load(Ordering::SeqCst);
        let connectors = self.connectors.lock().values().cloned().collect::<Vec<_>>();

        for connector in connectors {
            for (callback, result) in connector.vblank() {
                if self.epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
                if let Err(err) = &result {
                    warn!(connector = connector.name(), ?err, "Page flip failed");
                }
                callback.complete(result);
            }
        }
    }

    fn abandon_pending(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        for connector in self.connectors.lock().values() {
            connector.abandon();
        }
    }

    fn next_handle(&self) -> usize {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

/// Display backend without any hardware behind it.
///
/// Never zero-copy: shared buffers keep their own copy of the grant pages,
/// refreshed by [`DisplayBuffer::copy`](super::DisplayBuffer::copy).
pub struct HeadlessDisplay {
    inner: Arc<Inner>,
    event_thread: Mutex<Option<EventThread>>,
}

impl HeadlessDisplay {
    pub fn new(config: &HeadlessConfig, grant_table: Arc<dyn GrantTable>) -> HeadlessDisplay {
        let refresh_rate = if config.refresh_rate == 0 {
            warn!("Invalid refresh rate 0, using {}mHz", DEFAULT_REFRESH_RATE);
            DEFAULT_REFRESH_RATE
        } else {
            config.refresh_rate
        };

        let mut outputs = IndexMap::new();
        for output in &config.outputs {
            if outputs
                .insert(output.name.clone(), output.clone())
                .is_some()
            {
                warn!("Duplicate output {:?}, using the last one", output.name);
            }
        }

        HeadlessDisplay {
            inner: Arc::new(Inner {
                outputs,
                connectors: Mutex::new(IndexMap::new()),
                grant_table,
                refresh_interval: Duration::from_nanos(1_000_000_000_000 / refresh_rate as u64),
                next_handle: AtomicUsize::new(1),
                names: Arc::new(AtomicU32::new(1)),
                epoch: AtomicU64::new(0),
                dispatch: ReentrantMutex::new(()),
            }),
            event_thread: Mutex::new(None),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        self.inner.refresh_interval
    }

    /// Names of all outputs this display can drive.
    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.inner.outputs.keys().map(String::as_str)
    }

    pub fn headless_connector(&self, name: &str) -> Result<Arc<HeadlessConnector>> {
        let mut connectors = self.inner.connectors.lock();
        if let Some(connector) = connectors.get(name) {
            return Ok(connector.clone());
        }

        let output = self
            .inner
            .outputs
            .get(name)
            .ok_or_else(|| Error::UnknownConnector(name.to_string()))?;
        let connector = Arc::new(HeadlessConnector::new(
            output.name.clone(),
            output.connected,
        ));
        connectors.insert(output.name.clone(), connector.clone());
        Ok(connector)
    }

    /// Run one vblank on the calling thread.
    ///
    /// For callers driving the display without [`Display::start`]. Does
    /// nothing while the event-loop thread is running. A dispatch racing a
    /// concurrent `start` is serialized with the loop thread's own vblanks.
    pub fn dispatch_vblank(&self) {
        if self.event_thread.lock().is_some() {
            warn!("Ignoring manual vblank while the event loop is running");
            return;
        }
        self.inner.dispatch_vblank();
    }

    fn spawn_event_thread(&self) -> Result<EventThread> {
        let inner = self.inner.clone();
        let (tx, rx) = sync_channel(1);

        let handle = thread::Builder::new()
            .name("pv-display-events".into())
            .spawn(move || {
                let mut event_loop = match EventLoop::<Arc<Inner>>::try_new() {
                    Ok(event_loop) => event_loop,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                };

                let interval = inner.refresh_interval;
                if let Err(err) = event_loop.handle().insert_source(
                    Timer::from_duration(interval),
                    move |deadline, _, inner| {
                        inner.dispatch_vblank();
                        TimeoutAction::ToInstant(deadline + interval)
                    },
                ) {
                    let _ = tx.send(Err(err.error));
                    return;
                }

                let _ = tx.send(Ok(event_loop.get_signal()));

                let mut inner = inner;
                if let Err(err) = event_loop.run(None, &mut inner, |_| {}) {
                    error!(?err, "Display event loop failed");
                }
            })?;

        match rx.recv() {
            Ok(Ok(signal)) => Ok(EventThread { signal, handle }),
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(err.into())
            }
            Err(_) => {
                let _ = handle.join();
                Err(std::io::Error::other("display event thread exited during startup").into())
            }
        }
    }
}

impl Drop for HeadlessDisplay {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Display for HeadlessDisplay {
    fn start(&self) -> Result<()> {
        let mut event_thread = self.event_thread.lock();
        if event_thread.is_some() {
            return Err(Error::AlreadyStarted);
        }

        *event_thread = Some(self.spawn_event_thread()?);
        info!(
            interval = ?self.inner.refresh_interval,
            "Headless display started"
        );
        Ok(())
    }

    fn stop(&self) {
        let Some(event_thread) = self.event_thread.lock().take() else {
            return;
        };

        event_thread.signal.stop();
        event_thread.signal.wakeup();
        // stop called from a flip callback runs on the loop thread itself
        if event_thread.handle.thread().id() != thread::current().id()
            && event_thread.handle.join().is_err()
        {
            error!("Display event loop panicked");
        }

        self.inner.abandon_pending();
        info!("Headless display stopped");
    }

    fn is_zero_copy_supported(&self) -> bool {
        false
    }

    fn connector_by_name(&self, name: &str) -> Result<ConnectorPtr> {
        self.headless_connector(name).map(|c| c as ConnectorPtr)
    }

    fn create_display_buffer(&self, width: u32, height: u32, bpp: u32) -> Result<DisplayBufferPtr> {
        let layout = BufferLayout::new(width, height, bpp)?;
        let buffer = HeadlessBuffer::new(
            self.inner.next_handle(),
            layout,
            None,
            self.inner.names.clone(),
        );
        debug!(?buffer, "Created display buffer");
        Ok(Arc::new(buffer))
    }

    fn create_shared_display_buffer(
        &self,
        width: u32,
        height: u32,
        bpp: u32,
        dom_id: DomId,
        refs: &mut GrantRefs,
        alloc_refs: bool,
    ) -> Result<DisplayBufferPtr> {
        let layout = BufferLayout::new(width, height, bpp)?;
        let grant = GrantBuffer::new(
            self.inner.grant_table.as_ref(),
            dom_id,
            refs,
            alloc_refs,
            layout.size,
        )?;
        let buffer = HeadlessBuffer::new(
            self.inner.next_handle(),
            layout,
            Some(grant),
            self.inner.names.clone(),
        );
        debug!(?buffer, "Created shared display buffer");
        Ok(Arc::new(buffer))
    }

    fn create_frame_buffer(
        &self,
        display_buffer: DisplayBufferPtr,
        width: u32,
        height: u32,
        pixel_format: u32,
    ) -> Result<FrameBufferPtr> {
        let format = format::validate(pixel_format, SOFTWARE_FORMATS)?;
        let bpp = format::bits_per_pixel(format).ok_or(Error::UnsupportedFormat(pixel_format))?;
        let layout = BufferLayout::new(width, height, bpp)?;
        if layout.stride > display_buffer.stride()
            || display_buffer.stride() as usize * height as usize > display_buffer.size()
        {
            return Err(Error::FrameBufferTooLarge { width, height });
        }

        Ok(Arc::new(HeadlessFrameBuffer::new(
            self.inner.next_handle(),
            width,
            height,
            format,
            display_buffer,
        )))
    }
}
