use std::{
    io::{Error, Result},
    ptr::{null, null_mut},
    time::Duration,
};

use errno::{errno, set_errno};
use libc::*;

use super::{Event, Events, Notifier, NOTIFY_KEY};

pub type RawEvent = kevent;

/// kqueue instance plus its wake-up pipe, filters are registered with `EV_CLEAR`.
#[derive(Debug)]
pub struct SysPoller {
    handle: i32,
    notifier: Notifier,
}

impl Drop for SysPoller {
    fn drop(&mut self) {
        log::debug!(target:"reactor", "Close kqueue handle({})", self.handle);
        unsafe { close(self.handle) };
    }
}

fn change(fd: i32, filter: i16, flags: u16, key: u64) -> kevent {
    let mut event: kevent = unsafe { std::mem::zeroed() };

    event.ident = fd as uintptr_t;
    event.filter = filter as _;
    event.flags = flags as _;
    event.udata = key as usize as _;

    event
}

impl SysPoller {
    pub fn new() -> Result<Self> {
        let handle = unsafe { kqueue() };

        if handle < 0 {
            return Err(Error::last_os_error());
        }

        unsafe {
            if let Err(err) = super::cloexec(handle) {
                close(handle);
                return Err(err);
            }
        }

        let notifier = match Notifier::new() {
            Ok(notifier) => notifier,
            Err(err) => {
                unsafe { close(handle) };
                return Err(err);
            }
        };

        let poller = Self { handle, notifier };

        poller.apply(&mut [change(
            poller.notifier.read_fd(),
            EVFILT_READ as i16,
            EV_ADD as u16,
            NOTIFY_KEY,
        )])?;

        Ok(poller)
    }

    /// Watch `fd` for both directions, reporting readiness under `key`.
    pub fn add(&self, fd: i32, key: u64) -> Result<()> {
        log::trace!(target:"reactor", "add to kevent fd({}) key({})", fd, key);

        let flags = (EV_ADD | EV_CLEAR) as u16;

        self.apply(&mut [
            change(fd, EVFILT_READ as i16, flags, key),
            change(fd, EVFILT_WRITE as i16, flags, key),
        ])
    }

    pub fn delete(&self, fd: i32) -> Result<()> {
        log::trace!(target:"reactor", "remove from kevent fd({})", fd);

        let flags = EV_DELETE as u16;

        self.apply(&mut [
            change(fd, EVFILT_READ as i16, flags, 0),
            change(fd, EVFILT_WRITE as i16, flags, 0),
        ])
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

        let timeout = timeout.map(|timeout| timespec {
            tv_sec: timeout.as_secs() as _,
            tv_nsec: timeout.subsec_nanos() as _,
        });

        let fired = unsafe {
            kevent(
                self.handle,
                null(),
                0,
                raw.as_mut_ptr(),
                raw.len() as _,
                timeout
                    .as_ref()
                    .map(|timeout| timeout as *const timespec)
                    .unwrap_or(null()),
            )
        };

        if fired < 0 {
            let e = errno();

            set_errno(e);

            if e.0 == EINTR {
                return Ok(());
            }

            log::error!(target:"reactor", "kevent wait error({})", e);

            return Err(Error::from_raw_os_error(e.0));
        }

        for event in &raw[..fired as usize] {
            let key = event.udata as usize as u64;

            if key == NOTIFY_KEY {
                self.notifier.drain();
            }

            let failed = event.flags & EV_ERROR as u16 != 0;

            if failed {
                log::error!(
                    target:"reactor",
                    "fd({}) fired error,{}",
                    event.ident as i32,
                    Error::from_raw_os_error(event.data as i32)
                );
            }

            ready.push(Event {
                key,
                readable: failed || event.filter == EVFILT_READ as _,
                writable: failed || event.filter == EVFILT_WRITE as _,
            });
        }

        log::trace!(target:"reactor", "raised {:?}", ready);

        Ok(())
    }

    fn apply(&self, changes: &mut [kevent]) -> Result<()> {
        let ret = unsafe {
            kevent(
                self.handle,
                changes.as_ptr(),
                changes.len() as _,
                null_mut(),
                0,
                null(),
            )
        };

        if ret < 0 {
            return Err(Error::last_os_error());
        }

        Ok(())
    }
}
