// SPDX-License-Identifier: GPL-3.0-only

//! Host side of a paravirtualized display.
//!
//! [`backend`] defines the buffer, frame buffer, connector and display
//! interfaces a guest display protocol drives, the grant-table contract for
//! sharing guest memory, a software implementation of all of it, and the DRM
//! device auto detection used before a hardware backend is opened.

pub mod backend;
pub mod config;
pub mod logger;
pub mod utils;
