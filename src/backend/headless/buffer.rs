// SPDX-License-Identifier: GPL-3.0-only

use parking_lot::{Mutex, MutexGuard};
use smithay::backend::allocator::Fourcc;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, OnceLock,
    },
};

use crate::backend::{
    geometry::BufferLayout, grant::GrantBuffer, BufferData, DisplayBuffer, DisplayBufferPtr,
    Error, FrameBuffer, Result,
};

/// System memory buffer, optionally mirroring grant pages.
pub struct HeadlessBuffer {
    handle: usize,
    layout: BufferLayout,
    data: Mutex<Box<[u8]>>,
    grant: Option<GrantBuffer>,
    name: OnceLock<u32>,
    names: Arc<AtomicU32>,
}

impl fmt::Debug for HeadlessBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeadlessBuffer")
            .field("handle", &self.handle)
            .field("layout", &self.layout)
            .field("grant", &self.grant)
            .field("name", &self.name.get())
            .finish()
    }
}

impl HeadlessBuffer {
    pub(super) fn new(
        handle: usize,
        layout: BufferLayout,
        grant: Option<GrantBuffer>,
        names: Arc<AtomicU32>,
    ) -> HeadlessBuffer {
        HeadlessBuffer {
            handle,
            layout,
            data: Mutex::new(vec![0; layout.size].into_boxed_slice()),
            grant,
            name: OnceLock::new(),
            names,
        }
    }

}

impl DisplayBuffer for HeadlessBuffer {
    fn size(&self) -> usize {
        self.layout.size
    }

    fn stride(&self) -> u32 {
        self.layout.stride
    }

    fn handle(&self) -> usize {
        self.handle
    }

    fn data(&self) -> BufferData<'_> {
        BufferData::new(MutexGuard::map(self.data.lock(), |data| &mut **data))
    }

    fn read_name(&self) -> Result<u32> {
        Ok(*self
            .name
            .get_or_init(|| self.names.fetch_add(1, Ordering::Relaxed)))
    }

    fn copy(&self) -> Result<()> {
        match &self.grant {
            Some(grant) => {
                let mut data = self.data.try_lock().ok_or(Error::BufferInUse)?;
                grant.read_into(&mut data)
            }
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
pub struct HeadlessFrameBuffer {
    handle: usize,
    width: u32,
    height: u32,
    format: Fourcc,
    buffer: DisplayBufferPtr,
}

impl HeadlessFrameBuffer {
    pub(super) fn new(
        handle: usize,
        width: u32,
        height: u32,
        format: Fourcc,
        buffer: DisplayBufferPtr,
    ) -> HeadlessFrameBuffer {
        HeadlessFrameBuffer {
            handle,
            width,
            height,
            format,
            buffer,
        }
    }
}

impl FrameBuffer for HeadlessFrameBuffer {
    fn handle(&self) -> usize {
        self.handle
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> Fourcc {
        self.format
    }

    fn display_buffer(&self) -> DisplayBufferPtr {
        self.buffer.clone()
    }
}
