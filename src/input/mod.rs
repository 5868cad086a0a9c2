//! Input handling module
//!
//! Merges the kernel input devices (and any extra descriptors the caller
//! hands over) into one callback stream driven by epoll.
//!
//! The lifecycle is `init` → any number of `wait`/`dispatch` cycles →
//! `exit`. Callbacks run on the thread that calls `dispatch`; registry
//! changes they request are applied once the pass is finished.

pub mod evdev_handler;
pub mod registry;

use evdev::{EventType, InputEvent};
use nix::sys::epoll::{EpollEvent, EpollFlags, EpollTimeout};
use std::io;
use std::mem;
use std::ops::ControlFlow;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use evdev_handler::{DeviceClass, InputSource};
pub use registry::{Callback, Disposition, Registrar};

use registry::{Handler, InputRegistry, Owner, Pending};

/// Most kernel input devices picked up by a scan
pub const MAX_DEVICES: usize = 16;
/// Most extra descriptors registered through `add_fd`
pub const MAX_MISC_FDS: usize = 16;

pub const DEFAULT_INPUT_DIR: &str = "/dev/input";

#[derive(Debug, Error)]
pub enum InputError {
    #[error("failed to read input directory {}: {source}", .path.display())]
    InputDir { path: PathBuf, source: io::Error },

    #[error("too many descriptors registered (limit {0})")]
    TooManyDescriptors(usize),

    #[error("input multiplexer has exited")]
    Exited,

    #[error("descriptor is not ready for reading")]
    NotReadable,

    #[error("short read from input device: {0} bytes")]
    ShortRead(usize),

    #[error("invalid wait timeout: {0}")]
    InvalidTimeout(i32),

    #[error(transparent)]
    Sys(#[from] nix::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Single-threaded input event loop over epoll
pub struct EventMultiplexer {
    registry: InputRegistry,
    primary: Option<Callback>,
    events: Vec<EpollEvent>,
    ready: Vec<(RawFd, EpollFlags)>,
    exited: bool,
}

impl EventMultiplexer {
    /// Empty multiplexer with no primary callback and no devices
    pub fn new() -> Result<Self, InputError> {
        Ok(Self {
            registry: InputRegistry::new()?,
            primary: None,
            events: vec![EpollEvent::empty(); MAX_DEVICES + MAX_MISC_FDS],
            ready: Vec::new(),
            exited: false,
        })
    }

    /// Scan the default input directory and bind every relevant device to
    /// `callback`.
    pub fn init<F>(callback: F, allow_touch: bool) -> Result<Self, InputError>
    where
        F: FnMut(&mut Registrar, BorrowedFd<'_>, EpollFlags) -> Disposition + 'static,
    {
        Self::init_from(Path::new(DEFAULT_INPUT_DIR), callback, allow_touch)
    }

    pub fn init_from<F>(
        input_dir: &Path,
        callback: F,
        allow_touch: bool,
    ) -> Result<Self, InputError>
    where
        F: FnMut(&mut Registrar, BorrowedFd<'_>, EpollFlags) -> Disposition + 'static,
    {
        let mut multiplexer = Self::new()?;
        multiplexer.set_primary(callback);

        for device in evdev_handler::scan_devices(input_dir, allow_touch, MAX_DEVICES)? {
            let name = device.device_name();
            if let Err(e) = multiplexer.attach_device(Box::new(device)) {
                warn!("Failed to register input device {}: {}", name, e);
            }
        }

        info!(
            "Input initialized with {} device(s) from {:?}",
            multiplexer.device_count(),
            input_dir
        );
        Ok(multiplexer)
    }

    /// Callback used by every device registered through `attach_device`
    pub fn set_primary<F>(&mut self, callback: F)
    where
        F: FnMut(&mut Registrar, BorrowedFd<'_>, EpollFlags) -> Disposition + 'static,
    {
        self.primary = Some(Box::new(callback));
    }

    /// Register an input device under the primary callback
    pub fn attach_device(&mut self, device: Box<dyn InputSource>) -> Result<(), InputError> {
        self.ensure_running()?;
        if self.device_count() >= MAX_DEVICES {
            return Err(InputError::TooManyDescriptors(MAX_DEVICES));
        }
        debug!("Registering input device {} (fd {})", device.device_name(), device.raw_fd());
        self.registry.insert(Owner::Device(device), Handler::Primary)
    }

    /// Register an extra descriptor with its own callback. The registry
    /// takes ownership and closes it on removal or `exit`. Registering a
    /// descriptor that is already present replaces its callback.
    pub fn add_fd<F>(&mut self, fd: OwnedFd, callback: F) -> Result<(), InputError>
    where
        F: FnMut(&mut Registrar, BorrowedFd<'_>, EpollFlags) -> Disposition + 'static,
    {
        self.add_boxed(fd, Box::new(callback))
    }

    fn add_boxed(&mut self, fd: OwnedFd, callback: Callback) -> Result<(), InputError> {
        self.ensure_running()?;
        let raw = fd.as_raw_fd();
        if !self.registry.contains(raw) && self.registry.count_fds() >= MAX_MISC_FDS {
            return Err(InputError::TooManyDescriptors(MAX_MISC_FDS));
        }
        self.registry.insert(Owner::Fd(fd), Handler::Custom(callback))
    }

    /// Unregister and close `fd`
    pub fn remove_fd(&mut self, fd: RawFd) -> bool {
        self.registry.remove(fd)
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registry.contains(fd)
    }

    pub fn device_count(&self) -> usize {
        self.registry.devices().len()
    }

    /// Block until a descriptor is ready: `0` polls, a negative value waits
    /// forever, a positive value waits up to that many milliseconds.
    /// Returns the number of ready descriptors, 0 on timeout.
    pub fn wait(&mut self, timeout: i32) -> Result<usize, InputError> {
        self.ensure_running()?;
        let timeout = if timeout < 0 {
            EpollTimeout::NONE
        } else {
            EpollTimeout::try_from(timeout).map_err(|_| InputError::InvalidTimeout(timeout))?
        };

        let count = self.registry.wait(&mut self.events, timeout)?;
        self.ready.clear();
        self.ready.extend(
            self.events[..count]
                .iter()
                .map(|event| (event.data() as RawFd, event.events())),
        );
        Ok(count)
    }

    /// Run the callback of every descriptor reported by the last `wait`.
    pub fn dispatch(&mut self) {
        if self.exited {
            return;
        }

        let ready = mem::take(&mut self.ready);
        let mut registrar = Registrar::default();
        for (fd, events) in ready {
            let disposition =
                self.registry
                    .invoke(fd, events, self.primary.as_mut(), &mut registrar);
            if disposition == Some(Disposition::Remove) {
                debug!("Callback for fd {} asked for removal", fd);
                registrar.remove_fd(fd);
            }
        }

        for change in registrar.drain() {
            match change {
                Pending::Add(fd, callback) => {
                    let raw = fd.as_raw_fd();
                    if let Err(e) = self.add_boxed(fd, callback) {
                        warn!("Failed to register fd {}: {}", raw, e);
                    }
                }
                Pending::Remove(fd) => {
                    self.registry.remove(fd);
                }
            }
        }
    }

    /// Report every key currently held on a key device, with value 1.
    pub fn sync_key_state<F>(&self, mut callback: F) -> Result<(), InputError>
    where
        F: FnMut(u16, i32) -> ControlFlow<()>,
    {
        self.ensure_running()?;
        for device in self.registry.devices() {
            if !device.class().contains(DeviceClass::KEYS) {
                continue;
            }
            let held = match device.held_keys() {
                Ok(held) => held,
                Err(e) => {
                    warn!("Failed to read key state of {}: {}", device.device_name(), e);
                    continue;
                }
            };
            for code in held {
                if callback(code, 1).is_break() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Report every switch currently active on a switch device, with value 1.
    pub fn sync_sw_state<F>(&self, mut callback: F) -> Result<(), InputError>
    where
        F: FnMut(u16, i32) -> ControlFlow<()>,
    {
        self.ensure_running()?;
        for device in self.registry.devices() {
            if !device.class().contains(DeviceClass::SWITCHES) {
                continue;
            }
            let active = match device.active_switches() {
                Ok(active) => active,
                Err(e) => {
                    warn!("Failed to read switch state of {}: {}", device.device_name(), e);
                    continue;
                }
            };
            for code in active {
                if callback(code, 1).is_break() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Every key code any registered key device can report
    pub fn iterate_available_keys<F: FnMut(u16)>(&self, mut callback: F) {
        for device in self.registry.devices() {
            if device.class().contains(DeviceClass::KEYS) {
                device.key_codes().into_iter().for_each(&mut callback);
            }
        }
    }

    /// Each touch device, followed by the keys it can report
    pub fn iterate_touch_inputs<T, K>(&self, mut touch: T, mut key: K)
    where
        T: FnMut(&dyn InputSource),
        K: FnMut(u16),
    {
        for device in self.registry.devices() {
            if device.class().contains(DeviceClass::TOUCH) {
                touch(device);
                device.key_codes().into_iter().for_each(&mut key);
            }
        }
    }

    /// Close every registered descriptor. Later calls are no-ops.
    pub fn exit(&mut self) {
        if self.exited {
            return;
        }
        info!("Closing {} input descriptor(s)", self.registry.len());
        self.registry.clear();
        self.primary = None;
        self.ready.clear();
        self.exited = true;
    }

    pub fn is_exited(&self) -> bool {
        self.exited
    }

    fn ensure_running(&self) -> Result<(), InputError> {
        if self.exited {
            Err(InputError::Exited)
        } else {
            Ok(())
        }
    }
}

impl AsFd for EventMultiplexer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.registry.epoll_fd()
    }
}

impl Drop for EventMultiplexer {
    fn drop(&mut self) {
        self.exit();
    }
}

/// Read one input record from a ready descriptor
pub fn get_input(fd: BorrowedFd<'_>, events: EpollFlags) -> Result<InputEvent, InputError> {
    if !events.contains(EpollFlags::EPOLLIN) {
        return Err(InputError::NotReadable);
    }

    // SAFETY: input_event is plain old data
    let mut raw: libc::input_event = unsafe { mem::zeroed() };
    let size = mem::size_of::<libc::input_event>();
    // SAFETY: the slice covers exactly `raw`, which outlives it
    let bytes = unsafe {
        std::slice::from_raw_parts_mut(&mut raw as *mut libc::input_event as *mut u8, size)
    };
    let read = nix::unistd::read(fd.as_raw_fd(), bytes)?;
    if read != size {
        return Err(InputError::ShortRead(read));
    }

    Ok(InputEvent::new(EventType(raw.type_), raw.code, raw.value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use evdev::{InputEventKind, Key};
    use nix::unistd::pipe;
    use std::cell::RefCell;
    use std::fs::File;
    use std::io::Write;
    use std::os::unix::io::FromRawFd;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    struct FakeDevice {
        fd: OwnedFd,
        class: DeviceClass,
        keys: Vec<u16>,
        held: Vec<u16>,
        switches: Vec<u16>,
    }

    impl FakeDevice {
        fn new(class: DeviceClass) -> (Self, OwnedFd) {
            let (read, write) = pipe().unwrap();
            let device = Self {
                fd: read,
                class,
                keys: Vec::new(),
                held: Vec::new(),
                switches: Vec::new(),
            };
            (device, write)
        }
    }

    impl InputSource for FakeDevice {
        fn raw_fd(&self) -> RawFd {
            self.fd.as_raw_fd()
        }

        fn device_name(&self) -> String {
            "fake".to_string()
        }

        fn class(&self) -> DeviceClass {
            self.class
        }

        fn key_codes(&self) -> Vec<u16> {
            self.keys.clone()
        }

        fn held_keys(&self) -> io::Result<Vec<u16>> {
            Ok(self.held.clone())
        }

        fn active_switches(&self) -> io::Result<Vec<u16>> {
            Ok(self.switches.clone())
        }
    }

    fn keep(_: &mut Registrar, _: BorrowedFd<'_>, _: EpollFlags) -> Disposition {
        Disposition::Keep
    }

    fn raw_event(type_: u16, code: u16, value: i32) -> Vec<u8> {
        // SAFETY: input_event is plain old data
        let mut raw: libc::input_event = unsafe { mem::zeroed() };
        raw.type_ = type_;
        raw.code = code;
        raw.value = value;
        let size = mem::size_of::<libc::input_event>();
        // SAFETY: reads exactly the bytes of `raw`
        unsafe { std::slice::from_raw_parts(&raw as *const _ as *const u8, size) }.to_vec()
    }

    #[test]
    fn zero_timeout_returns_immediately() {
        let mut mux = EventMultiplexer::new().unwrap();
        let (read, _write) = pipe().unwrap();
        mux.add_fd(read, keep).unwrap();

        let start = Instant::now();
        assert_eq!(mux.wait(0).unwrap(), 0);
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn positive_timeout_expires() {
        let mut mux = EventMultiplexer::new().unwrap();
        let start = Instant::now();
        assert_eq!(mux.wait(20).unwrap(), 0);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn dispatch_runs_ready_callbacks() {
        let mut mux = EventMultiplexer::new().unwrap();
        let (read, write) = pipe().unwrap();
        let hits = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&hits);
        mux.add_fd(read, move |_, fd, events| {
            assert!(events.contains(EpollFlags::EPOLLIN));
            let mut buf = [0u8; 8];
            nix::unistd::read(fd.as_raw_fd(), &mut buf).unwrap();
            *counter.borrow_mut() += 1;
            Disposition::Keep
        })
        .unwrap();

        let mut writer = File::from(write);
        writer.write_all(b"x").unwrap();
        assert_eq!(mux.wait(-1).unwrap(), 1);
        mux.dispatch();
        assert_eq!(*hits.borrow(), 1);

        // Data consumed: nothing left to report.
        assert_eq!(mux.wait(0).unwrap(), 0);
    }

    #[test]
    fn reregistering_replaces_callback() {
        let mut mux = EventMultiplexer::new().unwrap();
        let (read, write) = pipe().unwrap();
        let fd = read.as_raw_fd();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let first = Rc::clone(&seen);
        mux.add_fd(read, move |_, _, _| {
            first.borrow_mut().push("first");
            Disposition::Keep
        })
        .unwrap();

        // SAFETY: the registry releases the duplicate without closing it
        let duplicate = unsafe { OwnedFd::from_raw_fd(fd) };
        let second = Rc::clone(&seen);
        mux.add_fd(duplicate, move |_, _, _| {
            second.borrow_mut().push("second");
            Disposition::Keep
        })
        .unwrap();

        File::from(write).write_all(b"x").unwrap();
        assert_eq!(mux.wait(100).unwrap(), 1);
        mux.dispatch();
        assert_eq!(*seen.borrow(), vec!["second"]);
    }

    #[test]
    fn remove_disposition_drops_descriptor() {
        let mut mux = EventMultiplexer::new().unwrap();
        let (read, write) = pipe().unwrap();
        let fd = read.as_raw_fd();
        mux.add_fd(read, |_, _, _| Disposition::Remove).unwrap();

        File::from(write).write_all(b"x").unwrap();
        mux.wait(100).unwrap();
        mux.dispatch();
        assert!(!mux.is_registered(fd));
    }

    #[test]
    fn additions_during_dispatch_wait_for_next_cycle() {
        let mut mux = EventMultiplexer::new().unwrap();
        let (trigger, trigger_write) = pipe().unwrap();
        let (late, late_write) = pipe().unwrap();
        let late_fd = late.as_raw_fd();
        let late_hits = Rc::new(RefCell::new(0));

        let mut pending = Some(late);
        let counter = Rc::clone(&late_hits);
        mux.add_fd(trigger, move |registrar, _, _| {
            if let Some(fd) = pending.take() {
                let counter = Rc::clone(&counter);
                registrar.add_fd(fd, move |_, _, _| {
                    *counter.borrow_mut() += 1;
                    Disposition::Keep
                });
            }
            Disposition::Keep
        })
        .unwrap();

        let mut late_write = File::from(late_write);
        late_write.write_all(b"y").unwrap();
        File::from(trigger_write).write_all(b"x").unwrap();

        mux.wait(100).unwrap();
        mux.dispatch();
        assert!(mux.is_registered(late_fd));
        assert_eq!(*late_hits.borrow(), 0);

        assert!(mux.wait(100).unwrap() >= 1);
        mux.dispatch();
        assert_eq!(*late_hits.borrow(), 1);
    }

    #[test]
    fn removals_during_dispatch_apply_after_the_pass() {
        let mut mux = EventMultiplexer::new().unwrap();
        let (first, first_write) = pipe().unwrap();
        let (second, second_write) = pipe().unwrap();
        let second_fd = second.as_raw_fd();
        let second_hits = Rc::new(RefCell::new(0));

        mux.add_fd(first, move |registrar, _, _| {
            registrar.remove_fd(second_fd);
            Disposition::Keep
        })
        .unwrap();
        let counter = Rc::clone(&second_hits);
        mux.add_fd(second, move |_, _, _| {
            *counter.borrow_mut() += 1;
            Disposition::Keep
        })
        .unwrap();

        let mut first_write = File::from(first_write);
        let mut second_write = File::from(second_write);
        first_write.write_all(b"x").unwrap();
        second_write.write_all(b"y").unwrap();

        assert_eq!(mux.wait(100).unwrap(), 2);
        mux.dispatch();
        // Both were ready, so the removed descriptor still ran this pass.
        assert_eq!(*second_hits.borrow(), 1);
        assert!(!mux.is_registered(second_fd));

        // The registry released its end of the pipe.
        assert!(second_write.write_all(b"z").is_err());
    }

    #[test]
    fn misc_descriptor_limit() {
        let mut mux = EventMultiplexer::new().unwrap();
        let mut writers = Vec::new();
        for _ in 0..MAX_MISC_FDS {
            let (read, write) = pipe().unwrap();
            mux.add_fd(read, keep).unwrap();
            writers.push(write);
        }
        let (read, _write) = pipe().unwrap();
        assert!(matches!(
            mux.add_fd(read, keep),
            Err(InputError::TooManyDescriptors(MAX_MISC_FDS))
        ));
    }

    #[test]
    fn sync_reports_held_keys_and_active_switches() {
        let mut mux = EventMultiplexer::new().unwrap();
        let (mut keyboard, _kw) = FakeDevice::new(DeviceClass::KEYS);
        keyboard.keys = vec![Key::KEY_UP.code(), Key::KEY_POWER.code()];
        keyboard.held = vec![Key::KEY_POWER.code()];
        let (mut lid, _lw) = FakeDevice::new(DeviceClass::SWITCHES);
        lid.switches = vec![0];
        mux.attach_device(Box::new(keyboard)).unwrap();
        mux.attach_device(Box::new(lid)).unwrap();

        let start = Instant::now();
        let mut keys = Vec::new();
        mux.sync_key_state(|code, value| {
            keys.push((code, value));
            ControlFlow::Continue(())
        })
        .unwrap();
        let mut switches = Vec::new();
        mux.sync_sw_state(|code, value| {
            switches.push((code, value));
            ControlFlow::Continue(())
        })
        .unwrap();

        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(keys, vec![(Key::KEY_POWER.code(), 1)]);
        assert_eq!(switches, vec![(0, 1)]);

        let mut available = Vec::new();
        mux.iterate_available_keys(|code| available.push(code));
        assert_eq!(available, vec![Key::KEY_UP.code(), Key::KEY_POWER.code()]);
    }

    #[test]
    fn sync_stops_on_break() {
        let mut mux = EventMultiplexer::new().unwrap();
        let (mut keyboard, _kw) = FakeDevice::new(DeviceClass::KEYS);
        keyboard.held = vec![1, 2, 3];
        mux.attach_device(Box::new(keyboard)).unwrap();

        let mut seen = 0;
        mux.sync_key_state(|_, _| {
            seen += 1;
            ControlFlow::Break(())
        })
        .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn touch_devices_are_reported_with_their_keys() {
        let mut mux = EventMultiplexer::new().unwrap();
        let (mut panel, _pw) = FakeDevice::new(DeviceClass::TOUCH | DeviceClass::KEYS);
        panel.keys = vec![Key::BTN_TOUCH.code()];
        let (keyboard, _kw) = FakeDevice::new(DeviceClass::KEYS);
        mux.attach_device(Box::new(panel)).unwrap();
        mux.attach_device(Box::new(keyboard)).unwrap();

        let mut touches = 0;
        let mut keys = Vec::new();
        mux.iterate_touch_inputs(|_| touches += 1, |code| keys.push(code));
        assert_eq!(touches, 1);
        assert_eq!(keys, vec![Key::BTN_TOUCH.code()]);
    }

    #[test]
    fn primary_callback_reads_events() {
        let mut mux = EventMultiplexer::new().unwrap();
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&received);
        mux.set_primary(move |_, fd, events| {
            if let Ok(event) = get_input(fd, events) {
                sink.borrow_mut().push(event.kind());
            }
            Disposition::Keep
        });

        let (keyboard, write) = FakeDevice::new(DeviceClass::KEYS);
        mux.attach_device(Box::new(keyboard)).unwrap();
        File::from(write)
            .write_all(&raw_event(EventType::KEY.0, Key::KEY_ENTER.code(), 1))
            .unwrap();

        assert_eq!(mux.wait(100).unwrap(), 1);
        mux.dispatch();
        assert_eq!(
            *received.borrow(),
            vec![InputEventKind::Key(Key::KEY_ENTER)]
        );
    }

    #[test]
    fn get_input_rejects_short_records() {
        let (read, write) = pipe().unwrap();
        File::from(write).write_all(b"abc").unwrap();
        assert!(matches!(
            get_input(read.as_fd(), EpollFlags::EPOLLIN),
            Err(InputError::ShortRead(3))
        ));
        assert!(matches!(
            get_input(read.as_fd(), EpollFlags::EPOLLHUP),
            Err(InputError::NotReadable)
        ));
    }

    #[test]
    fn exit_is_idempotent_and_final() {
        let mut mux = EventMultiplexer::new().unwrap();
        let (read, _write) = pipe().unwrap();
        let fd = read.as_raw_fd();
        mux.add_fd(read, keep).unwrap();

        mux.exit();
        mux.exit();
        assert!(mux.is_exited());
        assert!(!mux.is_registered(fd));
        assert!(matches!(mux.wait(0), Err(InputError::Exited)));
    }

    #[test]
    fn init_on_empty_directory_has_no_devices() {
        let temp = tempfile::tempdir().unwrap();
        let mux = EventMultiplexer::init_from(temp.path(), keep, false).unwrap();
        assert_eq!(mux.device_count(), 0);
    }

    #[test]
    fn init_on_missing_directory_fails() {
        let temp = tempfile::tempdir().unwrap();
        let result = EventMultiplexer::init_from(&temp.path().join("nope"), keep, false);
        assert!(matches!(result, Err(InputError::InputDir { .. })));
    }
}
