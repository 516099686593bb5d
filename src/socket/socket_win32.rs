use std::{
    ffi::c_void,
    fmt::Debug,
    io::{Error, ErrorKind, Result},
    mem::size_of,
    net::SocketAddr,
    ptr::null_mut,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};

use once_cell::sync::OnceCell;
use winapi::{
    shared::{
        guiddef::GUID,
        minwindef::{DWORD, FALSE, TRUE},
        mstcpip::SIO_KEEPALIVE_VALS,
        ntdef::HANDLE,
        winerror::ERROR_IO_PENDING,
        ws2def::*,
    },
    um::{
        ioapiset::{CancelIoEx, CreateIoCompletionPort},
        minwinbase::OVERLAPPED,
        mswsock::*,
        winbase::{SetFileCompletionNotificationModes, FILE_SKIP_COMPLETION_PORT_ON_SUCCESS},
        winsock2::*,
    },
};

use crate::{
    buffer::PinnedBuffer,
    overlapped::{NativeOverlapped, Overlapped},
    port::PortShared,
    AddressFamily, Buffer, CompletionStatus, OperationType, ProtocolType, SocketAddress,
    SocketError, SocketType, Token,
};

use super::{AsyncSocket, IoControlCode, KeepAliveValues, MessageFlags, SocketBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Bound,
    Listening,
    Connecting,
    Connected,
}

/// Socket receiving the connection of an in-flight `AcceptEx`.
struct PendingAccept {
    target: AsyncSocket,
    /// Created by the listener, disposed again if the accept fails.
    owned: bool,
}

struct State {
    phase: Phase,
    bound: Option<SocketAddress>,
    /// Read by `ConnectEx` from this slot.
    remote: Option<SocketAddress>,
    send_buffer: PinnedBuffer,
    receive_buffer: PinnedBuffer,
    /// Local and remote address records written by `AcceptEx`.
    accept_buffer: Option<Box<[u8]>>,
    pending_accept: Option<PendingAccept>,
    accepted: Option<AsyncSocket>,
}

#[derive(Debug)]
struct Association {
    port: Weak<PortShared>,
    token: Token,
    /// Immediate successes are not queued by the kernel and must be posted by hand.
    skip_on_success: bool,
}

/// Overlapped socket bound to an I/O completion port.
///
/// While an operation is pending the kernel holds a leaked strong reference to the
/// socket through [`NativeOverlapped::owner`], reclaimed by [`Socket::finish`].
pub struct Socket {
    handle: SOCKET,
    family: AddressFamily,
    socket_type: SocketType,
    protocol: ProtocolType,
    inbound: Overlapped,
    outbound: Overlapped,
    state: Mutex<State>,
    association: OnceCell<Association>,
    disposed: AtomicBool,
}

impl Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "socket({})", self.handle)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::Acquire) {
            log::debug!(target:"win32_net", "socket({}) dropped without dispose", self.handle);

            unsafe { closesocket(self.handle) };
        }
    }
}

/// Load a winsock extension function once per process.
unsafe fn extension<T: Copy>(
    handle: SOCKET,
    guid: &GUID,
    cache: &'static OnceCell<Option<T>>,
) -> Result<Option<T>> {
    cache
        .get_or_try_init(|| {
            let mut function: Option<T> = None;

            let mut bytes_returned = 0u32;

            if WSAIoctl(
                handle,
                SIO_GET_EXTENSION_FUNCTION_POINTER,
                guid as *const GUID as *mut c_void,
                size_of::<GUID>() as u32,
                &mut function as *mut Option<T> as *mut c_void,
                size_of::<Option<T>>() as u32,
                &mut bytes_returned,
                null_mut(),
                None,
            ) == SOCKET_ERROR
            {
                return Err(Error::last_os_error());
            }

            Ok(function)
        })
        .copied()
}

fn connect_ex(handle: SOCKET) -> Result<LPFN_CONNECTEX> {
    static CONNECT_EX: OnceCell<LPFN_CONNECTEX> = OnceCell::new();

    unsafe { extension(handle, &WSAID_CONNECTEX, &CONNECT_EX) }
}

fn accept_ex(handle: SOCKET) -> Result<LPFN_ACCEPTEX> {
    static ACCEPT_EX: OnceCell<LPFN_ACCEPTEX> = OnceCell::new();

    unsafe { extension(handle, &WSAID_ACCEPTEX, &ACCEPT_EX) }
}

impl Socket {
    pub(crate) fn attach(self: &Arc<Self>, port: &Arc<PortShared>, token: Token) -> Result<()> {
        if self.is_disposed() {
            return Err(SocketError::Disposed.into());
        }

        let mut fresh = false;

        let association = self.association.get_or_try_init(|| {
            fresh = true;

            let ret = unsafe {
                CreateIoCompletionPort(self.handle as HANDLE, port.handle(), token.0, 0)
            };

            if ret.is_null() {
                return Err(Error::last_os_error());
            }

            let skip_on_success = unsafe {
                SetFileCompletionNotificationModes(
                    self.handle as HANDLE,
                    FILE_SKIP_COMPLETION_PORT_ON_SUCCESS,
                )
            } != 0;

            if !skip_on_success {
                log::debug!(
                    target:"win32_net",
                    "socket({}) keeps kernel completions on success, {}",
                    self.handle,
                    Error::last_os_error()
                );
            }

            Ok::<_, Error>(Association {
                port: Arc::downgrade(port),
                token,
                skip_on_success,
            })
        })?;

        if fresh || (association.port.ptr_eq(&Arc::downgrade(port)) && association.token == token)
        {
            return Ok(());
        }

        Err(SocketError::InvalidState.into())
    }

    /// Turn a dequeued packet into the completion of the operation it belongs to.
    ///
    /// # Safety
    ///
    /// `native` must be one of this socket's descriptors, dequeued from its port, and
    /// `self` the reference leaked when the operation was issued.
    pub(crate) unsafe fn finish(self: Arc<Self>, native: *mut NativeOverlapped) -> CompletionStatus {
        let overlapped = if self.inbound.owns(native) {
            &self.inbound
        } else {
            &self.outbound
        };

        let operation = overlapped.operation();

        let mut transferred: DWORD = 0;
        let mut flags: DWORD = 0;

        let mut result: Result<usize> = if self.is_disposed() {
            Err(SocketError::OperationAborted.into())
        } else if WSAGetOverlappedResult(
            self.handle,
            native as *mut OVERLAPPED,
            &mut transferred,
            FALSE,
            &mut flags,
        ) == FALSE
        {
            Err(Error::from_raw_os_error(WSAGetLastError()))
        } else {
            Ok(transferred as usize)
        };

        let mut state = self.state.lock().unwrap();

        match operation {
            OperationType::Accept => {
                if let Some(PendingAccept { target, owned }) = state.pending_accept.take() {
                    if result.is_ok() {
                        if let Err(err) = target.inner().accepted_from(self.handle) {
                            result = Err(err);
                        }
                    }

                    match &result {
                        Ok(_) => state.accepted = Some(target),
                        Err(_) if owned => target.dispose(),
                        Err(_) => {}
                    }
                }
            }
            OperationType::Connect => {
                if result.is_ok() {
                    if let Err(err) = self.set_option_raw(SOL_SOCKET, SO_UPDATE_CONNECT_CONTEXT, &[])
                    {
                        result = Err(err);
                    }
                }

                state.phase = match result {
                    Ok(_) => Phase::Connected,
                    Err(_) => Phase::Bound,
                };
            }
            _ => {}
        }

        overlapped.complete();

        drop(state);

        let (error, bytes) = match result {
            Ok(bytes) => (SocketError::Success, bytes),
            Err(err) => (SocketError::from(&err), 0),
        };

        log::trace!(
            target:"win32_net",
            "socket({}) {:?} completed {:?} bytes({})",
            self.handle,
            operation,
            error,
            bytes
        );

        let token = self
            .association
            .get()
            .map(|association| association.token)
            .unwrap_or_default();

        CompletionStatus::new(
            Some(AsyncSocket::from_inner(self)),
            operation,
            error,
            bytes,
            token,
        )
    }

    /// Finish the accept context of a socket that just received a connection.
    fn accepted_from(&self, listener: SOCKET) -> Result<()> {
        self.set_option_raw(SOL_SOCKET, SO_UPDATE_ACCEPT_CONTEXT, &listener.to_ne_bytes())?;

        self.state.lock().unwrap().phase = Phase::Connected;

        Ok(())
    }

    fn is_fresh(&self) -> bool {
        self.state.lock().unwrap().phase == Phase::Created
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.state.lock().unwrap();

        if self.is_disposed() {
            return Err(SocketError::Disposed.into());
        }

        Ok(state)
    }

    fn association(&self) -> Result<&Association> {
        self.association
            .get()
            .ok_or_else(|| SocketError::InvalidState.into())
    }

    /// Hand a started operation to the kernel.
    ///
    /// `issue` returns `Ok` when the call finished synchronously, otherwise the
    /// `WSAGetLastError` code.
    fn submit<F>(self: &Arc<Self>, overlapped: &Overlapped, issue: F) -> Result<()>
    where
        F: FnOnce(*mut OVERLAPPED) -> std::result::Result<(), i32>,
    {
        let association = match self.association.get() {
            Some(association) => association,
            None => {
                overlapped.complete();
                return Err(SocketError::InvalidState.into());
            }
        };

        let owner = Arc::into_raw(self.clone());

        let native = unsafe { overlapped.prepare(owner as *const ()) };

        let reclaim = |err: Error| -> Result<()> {
            drop(unsafe { Arc::from_raw(owner) });
            overlapped.complete();
            Err(err)
        };

        match issue(native as *mut OVERLAPPED) {
            Ok(_) if association.skip_on_success => {
                let posted = match association.port.upgrade() {
                    Some(port) => port.post(association.token.0, native as *mut OVERLAPPED),
                    None => Err(SocketError::Disposed.into()),
                };

                match posted {
                    Ok(_) => Ok(()),
                    Err(err) => reclaim(err),
                }
            }
            Ok(_) => Ok(()),
            Err(code) if code == ERROR_IO_PENDING as i32 => {
                log::trace!(
                    target:"win32_net",
                    "socket({}) {:?} pending",
                    self.handle,
                    overlapped.operation()
                );
                Ok(())
            }
            Err(code) => reclaim(Error::from_raw_os_error(code)),
        }
    }

    fn bind_locked(&self, state: &mut State, addr: SocketAddress) -> Result<()> {
        if unsafe { bind(self.handle, addr.as_ptr(), addr.len()) } == SOCKET_ERROR {
            return Err(Error::last_os_error());
        }

        state.bound = Some(addr);

        if state.phase == Phase::Created {
            state.phase = Phase::Bound;
        }

        Ok(())
    }
}

fn last_wsa_error() -> i32 {
    unsafe { WSAGetLastError() }
}

impl SocketBackend for Socket {
    fn open(
        family: AddressFamily,
        socket_type: SocketType,
        protocol: ProtocolType,
    ) -> Result<Self> {
        let handle = unsafe {
            WSASocketW(
                family.native(),
                socket_type.native(),
                protocol.native(),
                null_mut(),
                0,
                WSA_FLAG_OVERLAPPED,
            )
        };

        if handle == INVALID_SOCKET {
            return Err(Error::last_os_error());
        }

        log::trace!(target:"win32_net", "socket({}) created {:?} {:?}", handle, family, socket_type);

        Ok(Self {
            handle,
            family,
            socket_type,
            protocol,
            inbound: Overlapped::new(),
            outbound: Overlapped::new(),
            state: Mutex::new(State {
                phase: Phase::Created,
                bound: None,
                remote: None,
                send_buffer: PinnedBuffer::default(),
                receive_buffer: PinnedBuffer::default(),
                accept_buffer: None,
                pending_accept: None,
                accepted: None,
            }),
            association: OnceCell::new(),
            disposed: AtomicBool::new(false),
        })
    }

    fn family(&self) -> AddressFamily {
        self.family
    }

    fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    fn protocol_type(&self) -> ProtocolType {
        self.protocol
    }

    fn bind(&self, addr: SocketAddress) -> Result<()> {
        let mut state = self.lock()?;

        self.bind_locked(&mut state, addr)
    }

    fn listen(&self, backlog: i32) -> Result<()> {
        let mut state = self.lock()?;

        if state.bound.is_none() {
            return Err(SocketError::InvalidState.into());
        }

        if unsafe { listen(self.handle, backlog) } == SOCKET_ERROR {
            return Err(Error::last_os_error());
        }

        state.phase = Phase::Listening;

        Ok(())
    }

    fn accept(self: &Arc<Self>, target: Option<AsyncSocket>) -> Result<()> {
        self.association()?;

        let mut state = self.lock()?;

        if state.phase != Phase::Listening {
            return Err(SocketError::InvalidState.into());
        }

        let accept_ex = accept_ex(self.handle)?.ok_or_else(|| {
            Error::new(ErrorKind::Unsupported, "AcceptEx extension unavailable")
        })?;

        let (target, owned) = match target {
            Some(target) => {
                if !target.inner().is_fresh() {
                    return Err(SocketError::InvalidState.into());
                }

                (target, false)
            }
            None => (
                AsyncSocket::from_inner(Arc::new(Socket::open(
                    self.family,
                    self.socket_type,
                    self.protocol,
                )?)),
                true,
            ),
        };

        if let Err(err) = self.inbound.start(OperationType::Accept) {
            if owned {
                target.dispose();
            }

            return Err(err);
        }

        let record_len = self.family.address_size() + 16;

        let output = state
            .accept_buffer
            .get_or_insert_with(|| vec![0u8; record_len * 2].into_boxed_slice())
            .as_mut_ptr();

        state.pending_accept = Some(PendingAccept {
            target: target.clone(),
            owned,
        });

        let listener = self.handle;
        let accept_socket = target.inner().handle;

        log::trace!(target:"win32_net", "socket({}) accept into {:?}", listener, target);

        let result = self.submit(&self.inbound, |native| unsafe {
            let mut received = 0u32;

            if accept_ex(
                listener,
                accept_socket,
                output as *mut c_void,
                0,
                record_len as u32,
                record_len as u32,
                &mut received,
                native,
            ) == TRUE
            {
                Ok(())
            } else {
                Err(last_wsa_error())
            }
        });

        if result.is_err() {
            state.pending_accept = None;

            if owned {
                target.dispose();
            }
        }

        result
    }

    fn connect(self: &Arc<Self>, addr: SocketAddress) -> Result<()> {
        self.association()?;

        let mut state = self.lock()?;

        if state.phase == Phase::Listening
            || state.phase == Phase::Connecting
            || state.phase == Phase::Connected
        {
            return Err(SocketError::InvalidState.into());
        }

        let connect_ex = connect_ex(self.handle)?.ok_or_else(|| {
            Error::new(ErrorKind::Unsupported, "ConnectEx extension unavailable")
        })?;

        // ConnectEx requires a bound socket.
        if state.bound.is_none() {
            self.bind_locked(&mut state, SocketAddress::any(self.family))?;
        }

        self.outbound.start(OperationType::Connect)?;

        state.phase = Phase::Connecting;

        let remote = state.remote.insert(addr);

        let (name, name_len) = (remote.as_ptr(), remote.len());

        let handle = self.handle;

        log::trace!(target:"win32_net", "socket({}) connect {:?}", handle, addr);

        let result = self.submit(&self.outbound, |native| unsafe {
            if connect_ex(handle, name, name_len, null_mut(), 0, null_mut(), native) == TRUE {
                Ok(())
            } else {
                Err(last_wsa_error())
            }
        });

        if result.is_err() {
            state.phase = Phase::Bound;
            state.remote = None;
        }

        result
    }

    fn send(
        self: &Arc<Self>,
        buffer: &Buffer,
        offset: usize,
        count: usize,
        flags: MessageFlags,
    ) -> Result<()> {
        self.association()?;

        let mut state = self.lock()?;

        self.outbound.start(OperationType::Send)?;

        state.send_buffer.switch(buffer);

        let mut wsabuf = WSABUF {
            len: count as u32,
            buf: unsafe { buffer.as_mut_ptr().add(offset) } as *mut i8,
        };

        let handle = self.handle;

        log::trace!(target:"win32_net", "socket({}) send({})", handle, count);

        self.submit(&self.outbound, |native| unsafe {
            let mut sent = 0u32;

            if WSASend(
                handle,
                &mut wsabuf,
                1,
                &mut sent,
                flags.native() as DWORD,
                native,
                None,
            ) == 0
            {
                Ok(())
            } else {
                Err(last_wsa_error())
            }
        })
    }

    fn receive(
        self: &Arc<Self>,
        buffer: &Buffer,
        offset: usize,
        count: usize,
        flags: MessageFlags,
    ) -> Result<()> {
        self.association()?;

        let mut state = self.lock()?;

        self.inbound.start(OperationType::Receive)?;

        state.receive_buffer.switch(buffer);

        let mut wsabuf = WSABUF {
            len: count as u32,
            buf: unsafe { buffer.as_mut_ptr().add(offset) } as *mut i8,
        };

        let handle = self.handle;

        log::trace!(target:"win32_net", "socket({}) recv({})", handle, count);

        self.submit(&self.inbound, |native| unsafe {
            let mut received = 0u32;
            let mut flags = flags.native() as DWORD;

            if WSARecv(
                handle,
                &mut wsabuf,
                1,
                &mut received,
                &mut flags,
                native,
                None,
            ) == 0
            {
                Ok(())
            } else {
                Err(last_wsa_error())
            }
        })
    }

    fn take_accepted(&self) -> Option<AsyncSocket> {
        self.state.lock().unwrap().accepted.take()
    }

    fn local_endpoint(&self) -> Result<SocketAddr> {
        SocketAddress::query(|addr, len| unsafe { getsockname(self.handle, addr, len) })
    }

    fn remote_endpoint(&self) -> Result<SocketAddr> {
        SocketAddress::query(|addr, len| unsafe { getpeername(self.handle, addr, len) })
    }

    fn set_option_raw(&self, level: i32, name: i32, value: &[u8]) -> Result<()> {
        if unsafe {
            setsockopt(
                self.handle,
                level,
                name,
                value.as_ptr() as *const i8,
                value.len() as i32,
            )
        } == SOCKET_ERROR
        {
            return Err(Error::last_os_error());
        }

        Ok(())
    }

    fn get_option_raw(&self, level: i32, name: i32, value: &mut [u8]) -> Result<usize> {
        let mut len = value.len() as i32;

        if unsafe {
            getsockopt(
                self.handle,
                level,
                name,
                value.as_mut_ptr() as *mut i8,
                &mut len,
            )
        } == SOCKET_ERROR
        {
            return Err(Error::last_os_error());
        }

        Ok((len as usize).min(value.len()))
    }

    fn io_control(&self, code: IoControlCode, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let native_code = match code {
            IoControlCode::BytesAvailable => {
                if output.len() < size_of::<u32>() {
                    return Err(Error::new(
                        ErrorKind::InvalidInput,
                        "output too small for byte count",
                    ));
                }

                FIONREAD as DWORD
            }
            IoControlCode::KeepAliveValues => {
                KeepAliveValues::from_bytes(input)?;

                SIO_KEEPALIVE_VALS
            }
            IoControlCode::Raw(code) => code,
        };

        let mut returned: DWORD = 0;

        if unsafe {
            WSAIoctl(
                self.handle,
                native_code,
                input.as_ptr() as *mut c_void,
                input.len() as DWORD,
                output.as_mut_ptr() as *mut c_void,
                output.len() as DWORD,
                &mut returned,
                null_mut(),
                None,
            )
        } == SOCKET_ERROR
        {
            return Err(Error::last_os_error());
        }

        Ok(returned as usize)
    }

    fn dispose(self: &Arc<Self>) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        log::debug!(target:"win32_net", "dispose socket({})", self.handle);

        let mut state = self.state.lock().unwrap();

        let inbound_pending = self.inbound.is_pending();
        let outbound_pending = self.outbound.is_pending();

        unsafe {
            CancelIoEx(self.handle as HANDLE, null_mut());
            closesocket(self.handle);
        }

        self.inbound.complete();
        self.outbound.complete();

        // Regions a cancelled operation may still reference live until the socket drops.
        if !inbound_pending {
            state.receive_buffer.release();
            state.accept_buffer = None;
        }

        if !outbound_pending {
            state.send_buffer.release();
            state.remote = None;
        }

        state.bound = None;

        let accepted = state.accepted.take();

        drop(state);

        if let Some(accepted) = accepted {
            accepted.dispose();
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}
