//! Descriptor to callback table backing the epoll instance

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use std::collections::HashMap;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use tracing::{debug, warn};

use super::evdev_handler::InputSource;
use super::InputError;

/// What a callback wants done with its descriptor after running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    Remove,
}

/// Readiness callback. Registry changes go through the [`Registrar`] and
/// are applied once the current dispatch pass is over.
pub type Callback = Box<dyn FnMut(&mut Registrar, BorrowedFd<'_>, EpollFlags) -> Disposition>;

pub(crate) enum Handler {
    /// Route to the multiplexer-wide callback
    Primary,
    Custom(Callback),
}

pub(crate) enum Owner {
    Device(Box<dyn InputSource>),
    Fd(OwnedFd),
}

impl Owner {
    fn raw_fd(&self) -> RawFd {
        match self {
            Owner::Device(device) => device.raw_fd(),
            Owner::Fd(fd) => fd.as_raw_fd(),
        }
    }

    fn borrow(&self) -> BorrowedFd<'_> {
        match self {
            // SAFETY: the device owns the descriptor for as long as `self` lives
            Owner::Device(device) => unsafe { BorrowedFd::borrow_raw(device.raw_fd()) },
            Owner::Fd(fd) => fd.as_fd(),
        }
    }

    /// Drop a duplicate handle to an already registered descriptor
    /// without closing the descriptor underneath the live entry.
    fn release_duplicate(self) {
        match self {
            Owner::Fd(fd) => {
                let _ = fd.into_raw_fd();
            }
            Owner::Device(device) => std::mem::forget(device),
        }
    }
}

struct Entry {
    owner: Owner,
    handler: Handler,
}

/// Registry changes requested from inside a callback
#[derive(Default)]
pub struct Registrar {
    changes: Vec<Pending>,
}

impl Registrar {
    pub fn add_fd<F>(&mut self, fd: OwnedFd, callback: F)
    where
        F: FnMut(&mut Registrar, BorrowedFd<'_>, EpollFlags) -> Disposition + 'static,
    {
        self.changes.push(Pending::Add(fd, Box::new(callback)));
    }

    pub fn remove_fd(&mut self, fd: RawFd) {
        self.changes.push(Pending::Remove(fd));
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Pending> + '_ {
        self.changes.drain(..)
    }
}

pub(crate) enum Pending {
    Add(OwnedFd, Callback),
    Remove(RawFd),
}

pub(crate) struct InputRegistry {
    epoll: Epoll,
    entries: HashMap<RawFd, Entry>,
}

impl InputRegistry {
    pub fn new() -> Result<Self, InputError> {
        Ok(Self {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?,
            entries: HashMap::new(),
        })
    }

    pub fn epoll_fd(&self) -> BorrowedFd<'_> {
        self.epoll.0.as_fd()
    }

    /// Register `owner`, or replace the callback if its descriptor is
    /// already present.
    pub fn insert(&mut self, owner: Owner, handler: Handler) -> Result<(), InputError> {
        let fd = owner.raw_fd();
        if let Some(entry) = self.entries.get_mut(&fd) {
            debug!("Replacing callback for fd {}", fd);
            entry.handler = handler;
            owner.release_duplicate();
            return Ok(());
        }

        let flags = EpollFlags::EPOLLIN | EpollFlags::EPOLLWAKEUP;
        self.epoll
            .add(owner.borrow(), EpollEvent::new(flags, fd as u64))?;
        self.entries.insert(fd, Entry { owner, handler });
        Ok(())
    }

    /// Unregister and close `fd`. Returns false if it was not registered.
    pub fn remove(&mut self, fd: RawFd) -> bool {
        let Some(entry) = self.entries.remove(&fd) else {
            return false;
        };
        if let Err(e) = self.epoll.delete(entry.owner.borrow()) {
            warn!("Failed to remove fd {} from epoll: {}", fd, e);
        }
        true
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.entries.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn count_fds(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| matches!(entry.owner, Owner::Fd(_)))
            .count()
    }

    pub fn wait(
        &self,
        events: &mut [EpollEvent],
        timeout: EpollTimeout,
    ) -> Result<usize, InputError> {
        Ok(self.epoll.wait(events, timeout)?)
    }

    /// Run the callback for `fd`. None if `fd` is not registered.
    pub fn invoke(
        &mut self,
        fd: RawFd,
        events: EpollFlags,
        primary: Option<&mut Callback>,
        registrar: &mut Registrar,
    ) -> Option<Disposition> {
        let Entry { owner, handler } = self.entries.get_mut(&fd)?;
        let borrowed = owner.borrow();
        let disposition = match handler {
            Handler::Custom(callback) => callback(registrar, borrowed, events),
            Handler::Primary => match primary {
                Some(callback) => callback(registrar, borrowed, events),
                None => Disposition::Keep,
            },
        };
        Some(disposition)
    }

    /// Registered devices ordered by descriptor
    pub fn devices(&self) -> Vec<&dyn InputSource> {
        let mut devices: Vec<(RawFd, &dyn InputSource)> = self
            .entries
            .iter()
            .filter_map(|(fd, entry)| match &entry.owner {
                Owner::Device(device) => Some((*fd, device.as_ref())),
                Owner::Fd(_) => None,
            })
            .collect();
        devices.sort_by_key(|(fd, _)| *fd);
        devices.into_iter().map(|(_, device)| device).collect()
    }

    pub fn clear(&mut self) {
        let fds: Vec<RawFd> = self.entries.keys().copied().collect();
        for fd in fds {
            self.remove(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;
    use std::os::unix::io::FromRawFd;

    fn keep(_: &mut Registrar, _: BorrowedFd<'_>, _: EpollFlags) -> Disposition {
        Disposition::Keep
    }

    fn drop_me(_: &mut Registrar, _: BorrowedFd<'_>, _: EpollFlags) -> Disposition {
        Disposition::Remove
    }

    #[test]
    fn insert_and_remove() {
        let mut registry = InputRegistry::new().unwrap();
        let (read, _write) = pipe().unwrap();
        let fd = read.as_raw_fd();

        registry
            .insert(Owner::Fd(read), Handler::Custom(Box::new(keep)))
            .unwrap();
        assert!(registry.contains(fd));
        assert_eq!(registry.count_fds(), 1);

        assert!(registry.remove(fd));
        assert!(!registry.contains(fd));
        assert!(!registry.remove(fd));
    }

    #[test]
    fn second_registration_replaces_callback() {
        let mut registry = InputRegistry::new().unwrap();
        let (read, _write) = pipe().unwrap();
        let fd = read.as_raw_fd();

        registry
            .insert(Owner::Fd(read), Handler::Custom(Box::new(keep)))
            .unwrap();
        // SAFETY: released again by the registry without closing
        let duplicate = unsafe { OwnedFd::from_raw_fd(fd) };
        registry
            .insert(Owner::Fd(duplicate), Handler::Custom(Box::new(drop_me)))
            .unwrap();
        assert_eq!(registry.len(), 1);

        let mut registrar = Registrar::default();
        let result = registry.invoke(fd, EpollFlags::EPOLLIN, None, &mut registrar);
        assert_eq!(result, Some(Disposition::Remove));
    }

    #[test]
    fn primary_handler_without_callback_keeps() {
        let mut registry = InputRegistry::new().unwrap();
        let (read, _write) = pipe().unwrap();
        let fd = read.as_raw_fd();
        registry.insert(Owner::Fd(read), Handler::Primary).unwrap();

        let mut registrar = Registrar::default();
        assert_eq!(
            registry.invoke(fd, EpollFlags::EPOLLIN, None, &mut registrar),
            Some(Disposition::Keep)
        );
        assert_eq!(
            registry.invoke(fd + 100, EpollFlags::EPOLLIN, None, &mut registrar),
            None
        );
    }

    #[test]
    fn registrar_collects_changes_in_order() {
        let (read, _write) = pipe().unwrap();
        let fd = read.as_raw_fd();
        let mut registrar = Registrar::default();
        registrar.add_fd(read, keep);
        registrar.remove_fd(fd);

        let pending: Vec<Pending> = registrar.drain().collect();
        assert!(matches!(pending[0], Pending::Add(..)));
        assert!(matches!(pending[1], Pending::Remove(f) if f == fd));
        assert!(registrar.is_empty());
    }
}
