//! Evdev-based input devices

use bitflags::bitflags;
use evdev::{AbsoluteAxisType, Device};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::fs;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::InputError;

bitflags! {
    /// What a device can report
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceClass: u8 {
        const KEYS = 1 << 0;
        const RELATIVE = 1 << 1;
        const SWITCHES = 1 << 2;
        const TOUCH = 1 << 3;
    }
}

impl DeviceClass {
    /// Whether the multiplexer should listen to a device of this class
    pub fn is_wanted(self, allow_touch: bool) -> bool {
        self.intersects(DeviceClass::KEYS | DeviceClass::RELATIVE | DeviceClass::SWITCHES)
            || (allow_touch && self.contains(DeviceClass::TOUCH))
    }
}

/// A kernel input device as seen by the multiplexer
pub trait InputSource {
    fn raw_fd(&self) -> RawFd;

    fn device_name(&self) -> String;

    fn class(&self) -> DeviceClass;

    /// Every key code the device can report
    fn key_codes(&self) -> Vec<u16>;

    /// Key codes currently held down
    fn held_keys(&self) -> io::Result<Vec<u16>>;

    /// Switch codes currently active
    fn active_switches(&self) -> io::Result<Vec<u16>>;
}

impl InputSource for Device {
    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn device_name(&self) -> String {
        Device::name(self).unwrap_or("unnamed").to_string()
    }

    fn class(&self) -> DeviceClass {
        let mut class = DeviceClass::empty();
        if self.supported_keys().is_some_and(|keys| keys.iter().next().is_some()) {
            class |= DeviceClass::KEYS;
        }
        if self
            .supported_relative_axes()
            .is_some_and(|axes| axes.iter().next().is_some())
        {
            class |= DeviceClass::RELATIVE;
        }
        if self
            .supported_switches()
            .is_some_and(|switches| switches.iter().next().is_some())
        {
            class |= DeviceClass::SWITCHES;
        }
        if self
            .supported_absolute_axes()
            .is_some_and(|axes| axes.contains(AbsoluteAxisType::ABS_MT_POSITION_X))
        {
            class |= DeviceClass::TOUCH;
        }
        class
    }

    fn key_codes(&self) -> Vec<u16> {
        self.supported_keys()
            .map(|keys| keys.iter().map(|key| key.code()).collect())
            .unwrap_or_default()
    }

    fn held_keys(&self) -> io::Result<Vec<u16>> {
        Ok(self.get_key_state()?.iter().map(|key| key.code()).collect())
    }

    fn active_switches(&self) -> io::Result<Vec<u16>> {
        Ok(self.get_switch_state()?.iter().map(|sw| sw.0).collect())
    }
}

/// Open every `event*` node under `input_dir` that is worth listening to.
///
/// Nodes that fail to open or report nothing useful are logged and skipped.
pub fn scan_devices(
    input_dir: &Path,
    allow_touch: bool,
    limit: usize,
) -> Result<Vec<Device>, InputError> {
    let entries = fs::read_dir(input_dir).map_err(|source| InputError::InputDir {
        path: input_dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with("event"))
        })
        .collect();
    paths.sort();

    let mut devices = Vec::new();
    for path in paths {
        if devices.len() >= limit {
            warn!("Input device limit ({}) reached, ignoring {:?}", limit, path);
            break;
        }

        let device = match Device::open(&path) {
            Ok(device) => device,
            Err(e) => {
                warn!("Failed to open input device {:?}: {}", path, e);
                continue;
            }
        };

        let class = device.class();
        if !class.is_wanted(allow_touch) {
            debug!("Ignoring input device {:?} ({:?})", path, class);
            continue;
        }

        if let Err(e) = set_nonblocking(device.as_raw_fd()) {
            warn!("Failed to make {:?} non-blocking: {}", path, e);
            continue;
        }

        info!(
            "Found input device {:?}: {} ({:?})",
            path,
            device.device_name(),
            class
        );
        devices.push(device);
    }

    Ok(devices)
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_is_only_wanted_when_allowed() {
        assert!(!DeviceClass::TOUCH.is_wanted(false));
        assert!(DeviceClass::TOUCH.is_wanted(true));
        assert!(DeviceClass::KEYS.is_wanted(false));
        assert!((DeviceClass::SWITCHES | DeviceClass::TOUCH).is_wanted(false));
        assert!(!DeviceClass::empty().is_wanted(true));
    }

    #[test]
    fn missing_input_dir_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let result = scan_devices(&temp.path().join("input"), false, 16);
        assert!(matches!(result, Err(InputError::InputDir { .. })));
    }

    #[test]
    fn bogus_nodes_are_skipped() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("event0"), b"not a device").unwrap();
        fs::write(temp.path().join("mice"), b"").unwrap();

        let devices = scan_devices(temp.path(), true, 16).unwrap();
        assert!(devices.is_empty());
    }
}
