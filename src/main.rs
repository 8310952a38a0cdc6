// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use clap_lex::RawArgs;
use pv_display::{
    backend::{
        self,
        grant::LocalGrantTable,
        headless::HeadlessDisplay,
        Connector, Display, FlipCallback, FrameBufferPtr,
    },
    config::{self, DisplayConfig},
    logger,
};
use smithay::backend::allocator::Fourcc;
use std::{
    error::Error,
    process,
    sync::{mpsc::channel, Arc},
};
use tracing::{error, info, warn};

fn main() {
    match main_inner() {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(err) => {
            error!("Error occured in main(): {}", err);
            process::exit(1);
        }
    }
}

fn main_inner() -> Result<bool, Box<dyn Error>> {
    let raw_args = RawArgs::from_args();
    let mut cursor = raw_args.cursor();
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let mut headless = false;

    // Parse the arguments
    while let Some(arg) = raw_args.next_os(&mut cursor) {
        match arg.to_str() {
            Some("--help") | Some("-h") => {
                print_help(env!("CARGO_PKG_VERSION"), git_hash);
                return Ok(true);
            }
            Some("--version") | Some("-V") => {
                println!(
                    "pv-display {} (git commit {})",
                    env!("CARGO_PKG_VERSION"),
                    git_hash
                );
                return Ok(true);
            }
            Some("--headless") => headless = true,
            _ => {
                eprintln!("Unknown argument {:?}, see --help", arg);
                return Ok(false);
            }
        }
    }

    // setup logger
    logger::init_logger()?;
    let config = config::load();

    if headless {
        run_headless(&config)?;
        return Ok(true);
    }

    match backend::resolve_drm_device(&config) {
        Some(path) => {
            println!("{}", path.display());
            Ok(true)
        }
        None => {
            warn!("No usable DRM device");
            Ok(false)
        }
    }
}

/// Bring up every connected headless output and flip one frame on each.
fn run_headless(config: &DisplayConfig) -> Result<()> {
    let display = HeadlessDisplay::new(&config.headless, Arc::new(LocalGrantTable::default()));
    display.start().context("Failed to start headless display")?;

    let (tx, rx) = channel();
    let mut shown: Vec<FrameBufferPtr> = Vec::new();
    for output in config.headless.outputs.iter().filter(|o| o.connected) {
        let connector = display.connector_by_name(&output.name)?;
        let buffer = display
            .create_display_buffer(output.width, output.height, 32)
            .with_context(|| format!("Failed to allocate buffer for {}", output.name))?;
        let frame_buffer = display.create_frame_buffer(
            buffer,
            output.width,
            output.height,
            Fourcc::Xrgb8888 as u32,
        )?;

        connector.init(output.width, output.height, &frame_buffer)?;
        let tx = tx.clone();
        let name = output.name.clone();
        connector.page_flip(
            &frame_buffer,
            FlipCallback::new(move |result| {
                let _ = tx.send((name, result));
            }),
        )?;
        shown.push(frame_buffer);
    }
    drop(tx);

    let timeout = display.refresh_interval() * 10;
    for _ in 0..shown.len() {
        match rx.recv_timeout(timeout) {
            Ok((name, Ok(flip))) => {
                info!(connector = %name, sequence = flip.sequence, "Frame presented")
            }
            Ok((name, Err(err))) => warn!(connector = %name, ?err, "Frame not presented"),
            Err(_) => {
                warn!("Timed out waiting for page flips");
                break;
            }
        }
    }

    for output in config.headless.outputs.iter().filter(|o| o.connected) {
        display.connector_by_name(&output.name)?.release();
    }
    display.stop();

    Ok(())
}

fn print_help(version: &str, git_rev: &str) {
    println!(
        r#"pv-display {version} (git commit {git_rev})

Host side display backend for paravirtualized guests.
Without options, prints the DRM device a hardware backend would open.

Options:
  -h, --help      Show this message
  -V, --version   Show the version of pv-display
      --headless  Present one frame on every configured virtual output"#
    );
}
