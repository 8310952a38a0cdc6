// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
pub use pv_display_config::{DisplayConfig, HeadlessConfig, OutputConfig};
use std::{fs::OpenOptions, path::PathBuf};
use tracing::{debug, info, warn};

use crate::utils::env::dev_var;

/// Load the configuration from the first readable location.
///
/// `PV_DISPLAY_CONFIG` names an explicit file that is tried first.
pub fn load() -> DisplayConfig {
    let xdg = xdg::BaseDirectories::new().ok();
    load_from(locations(xdg.as_ref()))
}

fn locations(xdg: Option<&xdg::BaseDirectories>) -> Vec<PathBuf> {
    let mut locations = Vec::with_capacity(5);
    if let Some(path) = dev_var("PV_DISPLAY_CONFIG") {
        locations.push(PathBuf::from(path));
    }
    if let Some(base) = xdg {
        locations.push(base.get_config_file("pv-display.ron"));
        locations.push(base.get_config_file("pv-display/config.ron"));
    }
    locations.push(PathBuf::from("/etc/pv-display/config.ron"));
    locations.push(PathBuf::from("/etc/pv-display.ron"));
    locations
}

pub fn load_from(locations: impl IntoIterator<Item = PathBuf>) -> DisplayConfig {
    for path in locations {
        debug!("Trying config location: {}", path.display());
        if !path.exists() {
            continue;
        }
        match read_config(&path) {
            Ok(config) => {
                info!("Using config at {}", path.display());
                return config;
            }
            Err(err) => warn!(?err, "Skipping malformed config {}", path.display()),
        }
    }

    info!("No config found, using defaults");
    DisplayConfig::default()
}

fn read_config(path: &std::path::Path) -> Result<DisplayConfig> {
    let file = OpenOptions::new()
        .read(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    ron::de::from_reader(file).with_context(|| format!("Failed to parse {}", path.display()))
}
