// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration of the display backend.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// DRM card node to drive. Auto-detected when unset.
    pub drm_device: Option<PathBuf>,
    /// Skip auto-detection entirely, even if `drm_device` is unset.
    pub disable_detection: bool,
    pub headless: HeadlessConfig,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HeadlessConfig {
    pub outputs: Vec<OutputConfig>,
    /// Refresh rate in millihertz
    pub refresh_rate: u32,
}

impl Default for HeadlessConfig {
    fn default() -> HeadlessConfig {
        HeadlessConfig {
            outputs: vec![OutputConfig::default()],
            refresh_rate: 60_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct OutputConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_connected")]
    pub connected: bool,
}

fn default_connected() -> bool {
    true
}

impl Default for OutputConfig {
    fn default() -> OutputConfig {
        OutputConfig {
            name: String::from("Virtual-1"),
            width: 1920,
            height: 1080,
            connected: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let config: DisplayConfig = ron::from_str(
            r#"(
                drm_device: Some("/dev/dri/card1"),
                headless: (outputs: [(name: "HDMI-A-1", width: 800, height: 600)]),
            )"#,
        )
        .unwrap();

        assert_eq!(config.drm_device, Some(PathBuf::from("/dev/dri/card1")));
        assert!(!config.disable_detection);
        assert_eq!(config.headless.refresh_rate, 60_000);
        assert_eq!(config.headless.outputs.len(), 1);
        assert!(config.headless.outputs[0].connected);
        assert_eq!(config.headless.outputs[0].name, "HDMI-A-1");
    }

    #[test]
    fn empty_config_is_default() {
        let config: DisplayConfig = ron::from_str("()").unwrap();
        assert_eq!(config, DisplayConfig::default());
    }
}
