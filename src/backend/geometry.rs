// SPDX-License-Identifier: GPL-3.0-only

use super::error::{Error, Result};

/// Row pitch and total size of a packed pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub stride: u32,
    pub size: usize,
}

impl BufferLayout {
    pub fn new(width: u32, height: u32, bpp: u32) -> Result<BufferLayout> {
        let invalid = || Error::InvalidGeometry { width, height, bpp };

        if width == 0 || height == 0 || bpp == 0 || bpp % 8 != 0 || bpp > 32 {
            return Err(invalid());
        }

        let stride = width.checked_mul(bpp / 8).ok_or_else(invalid)?;
        let size = (stride as usize)
            .checked_mul(height as usize)
            .ok_or_else(invalid)?;

        Ok(BufferLayout { stride, size })
    }
}

/// Number of pages needed to back `size` bytes.
pub fn page_count(size: usize, page_size: usize) -> usize {
    size.div_ceil(page_size)
}

pub fn host_page_size() -> usize {
    rustix::param::page_size()
}
