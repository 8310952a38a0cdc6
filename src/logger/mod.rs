// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init_logger() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            EnvFilter::new(if cfg!(debug_assertions) {
                "info"
            } else {
                "warn"
            })
        })
        .add_directive(
            "pv_display=debug"
                .parse()
                .context("Invalid log directive")?,
        );
    let fmt_layer = fmt::layer().compact().with_writer(std::io::stderr);

    let journald = tracing_journald::layer();
    let journald_err = journald.as_ref().err().map(ToString::to_string);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(journald.ok())
        .with(filter)
        .try_init()
        .context("Failed to install global logger")?;
    log_panics::init();

    if let Some(err) = journald_err {
        warn!(%err, "Journald unavailable, logging to stderr only");
    }
    info!("Version: {}", std::env!("CARGO_PKG_VERSION"));
    if cfg!(debug_assertions) {
        debug!(
            "Debug build ({})",
            std::option_env!("GIT_HASH").unwrap_or("Unknown")
        );
    }

    Ok(())
}
