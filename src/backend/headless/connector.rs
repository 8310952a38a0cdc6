// SPDX-License-Identifier: GPL-3.0-only

use parking_lot::Mutex;
use std::{
    fmt,
    sync::{Arc, Weak},
};
use tracing::{debug, info};

use crate::backend::{
    Connector, Error, FlipCallback, FlipError, FlipInfo, FrameBuffer, FrameBufferPtr, Result,
};

pub(super) type Completion = (FlipCallback, Result<FlipInfo, FlipError>);

struct PendingFlip {
    frame_buffer: Weak<dyn FrameBuffer>,
    callback: FlipCallback,
}

#[derive(Default)]
struct ConnectorState {
    connected: bool,
    mode: Option<(u32, u32)>,
    current: Option<Weak<dyn FrameBuffer>>,
    pending: Option<PendingFlip>,
    // accepted flips that can no longer be presented, reported on the next vblank
    aborted: Vec<(FlipCallback, FlipError)>,
    sequence: u64,
}

impl ConnectorState {
    fn abort_pending(&mut self, reason: FlipError) {
        if let Some(flip) = self.pending.take() {
            self.aborted.push((flip.callback, reason));
        }
    }
}

/// Virtual output of the headless backend.
///
/// Rejects a page flip while another one is pending on the same connector.
pub struct HeadlessConnector {
    name: String,
    state: Mutex<ConnectorState>,
}

impl fmt::Debug for HeadlessConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("HeadlessConnector")
            .field("name", &self.name)
            .field("connected", &state.connected)
            .field("mode", &state.mode)
            .field("pending", &state.pending.is_some())
            .field("sequence", &state.sequence)
            .finish()
    }
}

impl HeadlessConnector {
    pub(super) fn new(name: String, connected: bool) -> HeadlessConnector {
        HeadlessConnector {
            name,
            state: Mutex::new(ConnectorState {
                connected,
                ..Default::default()
            }),
        }
    }

    /// Simulate a hotplug event.
    ///
    /// Unplugging fails a pending flip with [`FlipError::Disconnected`] on the
    /// next vblank. The mode stays set until the connector is released.
    pub fn set_connected(&self, connected: bool) {
        let mut state = self.state.lock();
        if state.connected == connected {
            return;
        }
        info!(connector = %self.name, connected, "Connector hotplug");
        state.connected = connected;
        if !connected {
            state.abort_pending(FlipError::Disconnected);
        }
    }

    /// Frame buffer currently on screen, if it is still alive.
    pub fn current_frame_buffer(&self) -> Option<FrameBufferPtr> {
        self.state.lock().current.as_ref().and_then(Weak::upgrade)
    }

    pub fn has_pending_flip(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// Advance one vblank and collect the flips it completes.
    ///
    /// The callbacks must be run without holding any connector lock, they are
    /// free to queue the next flip.
    pub(super) fn vblank(&self) -> Vec<Completion> {
        let mut state = self.state.lock();
        if state.mode.is_some() && state.connected {
            state.sequence += 1;
        }

        let mut completions = state
            .aborted
            .drain(..)
            .map(|(callback, reason)| (callback, Err(reason)))
            .collect::<Vec<_>>();

        if let Some(flip) = state.pending.take() {
            let result = match flip.frame_buffer.upgrade() {
                Some(_) => {
                    state.current = Some(flip.frame_buffer);
                    Ok(FlipInfo {
                        sequence: state.sequence,
                    })
                }
                None => Err(FlipError::FrameBufferDestroyed),
            };
            completions.push((flip.callback, result));
        }

        completions
    }

    /// Forget every outstanding flip without running its callback.
    pub(super) fn abandon(&self) {
        let mut state = self.state.lock();
        let dropped = state.aborted.len() + state.pending.is_some() as usize;
        state.pending = None;
        state.aborted.clear();
        if dropped > 0 {
            debug!(connector = %self.name, dropped, "Abandoned pending flips");
        }
    }

    fn check_mode(&self, mode: (u32, u32), frame_buffer: &FrameBufferPtr) -> Result<()> {
        let got = (frame_buffer.width(), frame_buffer.height());
        if got != mode {
            return Err(Error::ModeMismatch {
                name: self.name.clone(),
                mode,
                got,
            });
        }
        Ok(())
    }
}

impl Connector for HeadlessConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn is_initialized(&self) -> bool {
        self.state.lock().mode.is_some()
    }

    fn init(&self, width: u32, height: u32, frame_buffer: &FrameBufferPtr) -> Result<()> {
        let mut state = self.state.lock();
        if state.mode.is_some() {
            return Err(Error::AlreadyInitialized(self.name.clone()));
        }
        if !state.connected {
            return Err(Error::NotConnected(self.name.clone()));
        }
        self.check_mode((width, height), frame_buffer)?;

        info!(connector = %self.name, width, height, "Initializing connector");
        state.mode = Some((width, height));
        state.current = Some(Arc::downgrade(frame_buffer));
        Ok(())
    }

    fn release(&self) {
        let mut state = self.state.lock();
        if state.mode.take().is_none() {
            return;
        }
        info!(connector = %self.name, "Releasing connector");
        state.current = None;
        state.abort_pending(FlipError::Released);
    }

    fn page_flip(&self, frame_buffer: &FrameBufferPtr, callback: FlipCallback) -> Result<()> {
        let mut state = self.state.lock();
        let Some(mode) = state.mode else {
            return Err(Error::NotInitialized(self.name.clone()));
        };
        if !state.connected {
            return Err(Error::NotConnected(self.name.clone()));
        }
        self.check_mode(mode, frame_buffer)?;
        if state.pending.is_some() {
            return Err(Error::FlipPending(self.name.clone()));
        }

        debug!(
            connector = %self.name,
            frame_buffer = frame_buffer.handle(),
            "Queueing page flip"
        );
        state.pending = Some(PendingFlip {
            frame_buffer: Arc::downgrade(frame_buffer),
            callback,
        });
        Ok(())
    }
}
