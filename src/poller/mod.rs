//! Readiness poller driving the reactor emulation of the completion port.

#[cfg_attr(any(target_os = "linux", target_os = "android"), path = "epoll.rs")]
#[cfg_attr(
    any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd"
    ),
    path = "kqueue.rs"
)]
mod impls;

pub use impls::*;

use std::io::{Error, Result};

use errno::{errno, set_errno};

/// Registration key reserved for the wake-up pipe.
pub const NOTIFY_KEY: u64 = usize::MAX as u64;

/// Readiness reported for one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub key: u64,
    pub readable: bool,
    pub writable: bool,
}

/// Buffers reused by every [`SysPoller::wait`] of one caller.
pub struct Events {
    raw: Vec<RawEvent>,
    ready: Vec<Event>,
}

impl Events {
    /// Room for `capacity` native events per wait.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);

        Self {
            raw: vec![unsafe { std::mem::zeroed() }; capacity],
            ready: Vec::with_capacity(capacity),
        }
    }

    /// Readiness raised by the last wait.
    pub fn ready(&self) -> &[Event] {
        &self.ready
    }
}

/// Self-pipe used to interrupt a blocking wait.
#[derive(Debug)]
pub(crate) struct Notifier {
    read: i32,
    write: i32,
}

impl Notifier {
    pub fn new() -> Result<Self> {
        let mut fds = [0i32; 2];

        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(Error::last_os_error());
        }

        let notifier = Self {
            read: fds[0],
            write: fds[1],
        };

        for fd in fds {
            unsafe {
                noblock(fd)?;
                cloexec(fd)?;
            }
        }

        Ok(notifier)
    }

    pub fn read_fd(&self) -> i32 {
        self.read
    }

    pub fn notify(&self) -> Result<()> {
        let ret = unsafe { libc::write(self.write, [1u8].as_ptr() as *const libc::c_void, 1) };

        if ret < 0 {
            let e = errno();

            set_errno(e);

            // A full pipe already guarantees a wake-up.
            if e.0 == libc::EAGAIN || e.0 == libc::EWOULDBLOCK {
                return Ok(());
            }

            return Err(Error::from_raw_os_error(e.0));
        }

        Ok(())
    }

    pub fn drain(&self) {
        let mut buf = [0u8; 64];

        while unsafe { libc::read(self.read, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) }
            > 0
        {}
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read);
            libc::close(self.write);
        }
    }
}

pub(crate) unsafe fn noblock(fd: i32) -> Result<()> {
    use libc::*;

    let flags = fcntl(fd, F_GETFL);

    if flags < 0 {
        return Err(Error::last_os_error());
    }

    if fcntl(fd, F_SETFL, flags | O_NONBLOCK) < 0 {
        return Err(Error::last_os_error());
    }

    Ok(())
}

pub(crate) unsafe fn cloexec(fd: i32) -> Result<()> {
    use libc::*;

    let flags = fcntl(fd, F_GETFD);

    if flags < 0 {
        return Err(Error::last_os_error());
    }

    if fcntl(fd, F_SETFD, flags | FD_CLOEXEC) < 0 {
        return Err(Error::last_os_error());
    }

    Ok(())
}
