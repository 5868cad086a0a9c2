//! Runtime configuration
//!
//! Defaults suit a stock initramfs. Every field can be overridden through a
//! `BOOTUI_*` environment variable.

use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

use crate::input::DEFAULT_INPUT_DIR;
use crate::ui::{BackendKind, Rotation};

#[derive(Debug, Error)]
#[error("invalid value {value:?} for {key}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsConfig {
    /// Backends to try, in order. Empty means the built-in order.
    pub backends: Vec<BackendKind>,
    pub drm_device: PathBuf,
    pub fb_device: PathBuf,
    pub headless_size: (usize, usize),
    /// Applied right after a backend is selected
    pub rotation: Rotation,
    /// Pixel multiplier for the built-in 8x8 font
    pub font_scale: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            drm_device: PathBuf::from("/dev/dri/card0"),
            fb_device: PathBuf::from("/dev/fb0"),
            headless_size: (640, 480),
            rotation: Rotation::None,
            font_scale: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputConfig {
    pub input_dir: PathBuf,
    pub allow_touch: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from(DEFAULT_INPUT_DIR),
            allow_touch: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub graphics: GraphicsConfig,
    pub input: InputConfig,
    /// Mirror log output into the kernel ring buffer
    pub log_to_kmsg: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from defaults plus whatever `lookup` returns
    /// for each `BOOTUI_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(value) = lookup("BOOTUI_BACKENDS") {
            config.graphics.backends = value
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .map(|part| parse("BOOTUI_BACKENDS", part))
                .collect::<Result<_, _>>()?;
        }
        if let Some(value) = lookup("BOOTUI_DRM_DEVICE") {
            config.graphics.drm_device = PathBuf::from(value);
        }
        if let Some(value) = lookup("BOOTUI_FB_DEVICE") {
            config.graphics.fb_device = PathBuf::from(value);
        }
        if let Some(value) = lookup("BOOTUI_ROTATION") {
            config.graphics.rotation = parse("BOOTUI_ROTATION", &value)?;
        }
        if let Some(value) = lookup("BOOTUI_FONT_SCALE") {
            let scale: usize = parse("BOOTUI_FONT_SCALE", &value)?;
            if scale == 0 {
                return Err(ConfigError {
                    key: "BOOTUI_FONT_SCALE",
                    value,
                    reason: "must be at least 1".to_string(),
                });
            }
            config.graphics.font_scale = scale;
        }
        if let Some(value) = lookup("BOOTUI_INPUT_DIR") {
            config.input.input_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("BOOTUI_ALLOW_TOUCH") {
            config.input.allow_touch = parse_bool("BOOTUI_ALLOW_TOUCH", &value)?;
        }
        if let Some(value) = lookup("BOOTUI_KMSG") {
            config.log_to_kmsg = parse_bool("BOOTUI_KMSG", &value)?;
        }

        Ok(config)
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError {
            key,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_overrides() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config, Config::default());
        assert!(config.graphics.backends.is_empty());
        assert_eq!(config.input.input_dir, PathBuf::from("/dev/input"));
    }

    #[test]
    fn overrides_are_applied() {
        let config = Config::from_lookup(lookup(&[
            ("BOOTUI_BACKENDS", "fbdev, headless"),
            ("BOOTUI_FB_DEVICE", "/dev/fb1"),
            ("BOOTUI_ROTATION", "90"),
            ("BOOTUI_FONT_SCALE", "3"),
            ("BOOTUI_ALLOW_TOUCH", "yes"),
            ("BOOTUI_KMSG", "1"),
        ]))
        .unwrap();

        assert_eq!(
            config.graphics.backends,
            vec![BackendKind::Fbdev, BackendKind::Headless]
        );
        assert_eq!(config.graphics.fb_device, PathBuf::from("/dev/fb1"));
        assert_eq!(config.graphics.rotation, Rotation::Right);
        assert_eq!(config.graphics.font_scale, 3);
        assert!(config.input.allow_touch);
        assert!(config.log_to_kmsg);
    }

    #[test]
    fn bad_values_are_rejected() {
        let err = Config::from_lookup(lookup(&[("BOOTUI_BACKENDS", "drm,vulkan")])).unwrap_err();
        assert_eq!(err.key, "BOOTUI_BACKENDS");

        let err = Config::from_lookup(lookup(&[("BOOTUI_FONT_SCALE", "0")])).unwrap_err();
        assert_eq!(err.key, "BOOTUI_FONT_SCALE");

        let err = Config::from_lookup(lookup(&[("BOOTUI_KMSG", "maybe")])).unwrap_err();
        assert_eq!(err.key, "BOOTUI_KMSG");
    }
}
