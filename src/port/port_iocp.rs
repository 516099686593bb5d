use std::{
    io::{Error, Result},
    ptr::null_mut,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use winapi::{
    shared::{
        minwindef::DWORD,
        ntdef::HANDLE,
        winerror::{ERROR_ABANDONED_WAIT_0, ERROR_INVALID_HANDLE, WAIT_TIMEOUT},
    },
    um::{
        errhandlingapi::GetLastError,
        handleapi::{CloseHandle, INVALID_HANDLE_VALUE},
        ioapiset::*,
        minwinbase::{OVERLAPPED, OVERLAPPED_ENTRY},
        winbase::INFINITE,
    },
};

use crate::{
    overlapped::NativeOverlapped, socket::Socket, AsyncSocket, CompletionStatus, SocketError,
};

use super::{PortBackend, PortConfig, Token};

/// Kernel completion port handle shared with associated sockets.
#[derive(Debug)]
pub(crate) struct PortShared {
    handle: HANDLE,
    disposed: AtomicBool,
}

unsafe impl Send for PortShared {}
unsafe impl Sync for PortShared {}

impl PortShared {
    pub(crate) fn handle(&self) -> HANDLE {
        self.handle
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Queue a completion packet by hand.
    pub(crate) fn post(&self, key: usize, overlapped: *mut OVERLAPPED) -> Result<()> {
        if self.is_disposed() {
            return Err(SocketError::Disposed.into());
        }

        if unsafe { PostQueuedCompletionStatus(self.handle, 0, key, overlapped) } == 0 {
            return Err(Error::last_os_error());
        }

        Ok(())
    }
}

/// I/O completion port.
#[derive(Debug)]
pub(crate) struct Port {
    shared: Arc<PortShared>,
}

impl PortBackend for Port {
    fn create(config: &PortConfig) -> Result<Self> {
        let handle = unsafe {
            CreateIoCompletionPort(INVALID_HANDLE_VALUE, null_mut(), 0, config.concurrency)
        };

        if handle.is_null() {
            return Err(Error::last_os_error());
        }

        log::debug!(target:"iocp", "create port({:?})", handle);

        Ok(Self {
            shared: Arc::new(PortShared {
                handle,
                disposed: AtomicBool::new(false),
            }),
        })
    }

    fn associate(&self, socket: &AsyncSocket, token: Token) -> Result<()> {
        socket.inner().attach(&self.shared, token)
    }

    fn dequeue(&self, timeout: Option<Duration>, max: usize) -> Result<Vec<CompletionStatus>> {
        let mut entries: Vec<OVERLAPPED_ENTRY> = vec![unsafe { std::mem::zeroed() }; max];

        let mut removed = 0u32;

        let timeout = match timeout {
            Some(timeout) => timeout.as_millis().min((INFINITE - 1) as u128) as DWORD,
            None => INFINITE,
        };

        let ret = unsafe {
            GetQueuedCompletionStatusEx(
                self.shared.handle,
                entries.as_mut_ptr(),
                entries.len() as u32,
                &mut removed,
                timeout,
                0,
            )
        };

        if ret == 0 {
            let e = unsafe { GetLastError() };

            return match e {
                WAIT_TIMEOUT => Ok(vec![]),
                ERROR_ABANDONED_WAIT_0 | ERROR_INVALID_HANDLE => {
                    log::debug!(target:"iocp", "port({:?}) closed", self.shared.handle);
                    Err(SocketError::Disposed.into())
                }
                _ => Err(Error::from_raw_os_error(e as i32)),
            };
        }

        log::trace!(target:"iocp", "port({:?}) removed({})", self.shared.handle, removed);

        let statuses = entries[..removed as usize]
            .iter()
            .map(|entry| {
                if entry.lpOverlapped.is_null() {
                    return CompletionStatus::signal(Token(entry.lpCompletionKey));
                }

                let native = entry.lpOverlapped as *mut NativeOverlapped;

                // Reclaim the reference leaked when the operation was issued.
                unsafe {
                    let socket = Arc::from_raw((*native).owner as *const Socket);

                    socket.finish(native)
                }
            })
            .collect();

        Ok(statuses)
    }

    fn signal(&self, token: Token) -> Result<()> {
        self.shared.post(token.0, null_mut())
    }

    fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        log::debug!(target:"iocp", "dispose port({:?})", self.shared.handle);

        unsafe { CloseHandle(self.shared.handle) };
    }

    fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }
}
