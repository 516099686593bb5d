use std::{
    io::{Error, Result},
    ptr::null_mut,
    time::Duration,
};

use errno::{errno, set_errno};
use libc::*;

use super::{Event, Events, Notifier, NOTIFY_KEY};

pub type RawEvent = epoll_event;

/// Edge-triggered epoll instance plus its wake-up pipe.
#[derive(Debug)]
pub struct SysPoller {
    handle: i32,
    notifier: Notifier,
}

impl Drop for SysPoller {
    fn drop(&mut self) {
        log::debug!(target:"reactor", "Close epoll handle({})", self.handle);
        unsafe { close(self.handle) };
    }
}

impl SysPoller {
    pub fn new() -> Result<Self> {
        let handle = unsafe { epoll_create1(EPOLL_CLOEXEC) };

        if -1 == handle {
            return Err(Error::last_os_error());
        }

        let notifier = match Notifier::new() {
            Ok(notifier) => notifier,
            Err(err) => {
                unsafe { close(handle) };
                return Err(err);
            }
        };

        let poller = Self { handle, notifier };

        // Level triggered, drained on every wake-up.
        poller.ctl(
            EPOLL_CTL_ADD,
            poller.notifier.read_fd(),
            EPOLLIN as u32,
            NOTIFY_KEY,
        )?;

        Ok(poller)
    }

    /// Watch `fd` for both directions, reporting readiness under `key`.
    pub fn add(&self, fd: i32, key: u64) -> Result<()> {
        let events = (EPOLLIN | EPOLLOUT | EPOLLRDHUP | EPOLLET) as u32;

        match self.ctl(EPOLL_CTL_ADD, fd, events, key) {
            Err(err) if err.raw_os_error() == Some(EEXIST) => {
                self.ctl(EPOLL_CTL_MOD, fd, events, key)
            }
            ret => ret,
        }
    }

    pub fn delete(&self, fd: i32) -> Result<()> {
        let ret = unsafe { epoll_ctl(self.handle, EPOLL_CTL_DEL, fd, null_mut()) };

        if ret == -1 {
            return Err(Error::last_os_error());
        }

        Ok(())
    }

    /// Wake a thread blocked in [`SysPoller::wait`].
    pub fn notify(&self) -> Result<()> {
        self.notifier.notify()
    }

    /// Wait for readiness, replacing the contents of `events`.
    ///
    /// An interrupted wait returns with no events.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> Result<()> {
        let Events { raw, ready } = events;

        ready.clear();

        let timeout = match timeout {
            Some(timeout) => timeout.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };

        let fired = unsafe {
            epoll_wait(
                self.handle,
                raw.as_mut_ptr(),
                raw.len() as i32,
                timeout,
            )
        };

        if fired < 0 {
            let e = errno();

            set_errno(e);

            if e.0 == EINTR {
                return Ok(());
            }

            log::error!(target:"reactor", "epoll_wait error({})", e);

            return Err(Error::from_raw_os_error(e.0));
        }

        for event in &raw[..fired as usize] {
            let key = event.u64;

            if key == NOTIFY_KEY {
                self.notifier.drain();
            }

            let flags = event.events;

            let failed = flags & (EPOLLHUP | EPOLLERR) as u32 != 0;

            ready.push(Event {
                key,
                readable: failed || flags & (EPOLLIN | EPOLLRDHUP) as u32 != 0,
                writable: failed || flags & EPOLLOUT as u32 != 0,
            });
        }

        log::trace!(target:"reactor", "raised {:?}", ready);

        Ok(())
    }

    fn ctl(&self, op: i32, fd: i32, events: u32, key: u64) -> Result<()> {
        let mut event = epoll_event { events, u64: key };

        let ret = unsafe { epoll_ctl(self.handle, op, fd, &mut event) };

        if ret == -1 {
            return Err(Error::last_os_error());
        }

        Ok(())
    }
}
