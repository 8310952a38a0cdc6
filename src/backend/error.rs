// SPDX-License-Identifier: GPL-3.0-only

use super::grant::{DomId, GrantRef};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure of a factory or state-transition operation.
///
/// Nothing is left half-constructed when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid buffer geometry {width}x{height} at {bpp} bpp")]
    InvalidGeometry { width: u32, height: u32, bpp: u32 },
    #[error("invalid grant reference count: got {got}, buffer needs {expected} pages")]
    InvalidGrantRefCount { got: usize, expected: usize },
    #[error("grant reference {gref} of domain {dom_id} cannot be mapped")]
    GrantMap { dom_id: DomId, gref: GrantRef },
    #[error("grant reference {0} has been revoked")]
    GrantRevoked(GrantRef),
    #[error("unsupported pixel format {0:#010x}")]
    UnsupportedFormat(u32),
    #[error("buffer contents are borrowed")]
    BufferInUse,
    #[error("frame buffer {width}x{height} does not fit its display buffer")]
    FrameBufferTooLarge { width: u32, height: u32 },
    #[error("no connector named {0:?}")]
    UnknownConnector(String),
    #[error("connector {0:?} is not connected")]
    NotConnected(String),
    #[error("connector {0:?} is already initialized")]
    AlreadyInitialized(String),
    #[error("connector {0:?} is not initialized")]
    NotInitialized(String),
    #[error("frame buffer {got:?} does not match mode {mode:?} of connector {name:?}")]
    ModeMismatch {
        name: String,
        mode: (u32, u32),
        got: (u32, u32),
    },
    #[error("page flip already pending on connector {0:?}")]
    FlipPending(String),
    #[error("display event loop is already running")]
    AlreadyStarted,
    #[error("display event loop failed: {0}")]
    EventLoop(#[from] calloop::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why an accepted page flip was not presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FlipError {
    #[error("connector was disconnected before the flip completed")]
    Disconnected,
    #[error("connector was released before the flip completed")]
    Released,
    #[error("frame buffer was destroyed before the flip completed")]
    FrameBufferDestroyed,
}
