use std::{
    fmt::Debug,
    io::{Error, ErrorKind, Result},
    mem::size_of,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};

use errno::{errno, set_errno};
use libc::*;
use once_cell::sync::OnceCell;

use crate::{
    buffer::PinnedBuffer,
    overlapped::Overlapped,
    poller::cloexec,
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

/// Operation waiting for read readiness.
enum Inbound {
    Accept { target: Option<AsyncSocket> },
    Receive { offset: usize, count: usize, flags: MessageFlags },
}

/// Operation waiting for write readiness.
enum Outbound {
    Connect,
    /// Stream sends stay parked until all `count` bytes went out.
    Send {
        offset: usize,
        count: usize,
        flags: MessageFlags,
        sent: usize,
    },
}

struct State {
    phase: Phase,
    bound: Option<SocketAddress>,
    remote: Option<SocketAddress>,
    send_buffer: PinnedBuffer,
    receive_buffer: PinnedBuffer,
    /// Two address records back to back, allocated by the first accept.
    accept_buffer: Option<Box<[u8]>>,
    accepted: Option<AsyncSocket>,
    inbound_op: Option<Inbound>,
    outbound_op: Option<Outbound>,
    /// Keeps the socket alive while an operation is parked, released once none is.
    parked: Option<Arc<Socket>>,
}

/// Relation to the port the socket reports to.
#[derive(Debug)]
struct Association {
    port: Weak<PortShared>,
    token: Token,
    /// Poller registration key.
    key: u64,
}

enum Attempt {
    WouldBlock,
    Finished(Result<usize>),
}

fn would_block(code: i32) -> bool {
    code == EAGAIN || code == EWOULDBLOCK
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: c_int = MSG_NOSIGNAL;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: c_int = 0;

/// Non-blocking socket driven by the port's reactor thread.
///
/// Every operation is attempted at once; when the OS would block it is parked in the
/// direction's slot and retried by [`Socket::on_ready`]. The state lock is held across
/// each attempt so a readiness edge can never slip between a failed attempt and parking.
pub struct Socket {
    fd: i32,
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
        write!(f, "fd({})", self.fd)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::Acquire) {
            log::debug!(target:"unix_net", "fd({}) dropped without dispose", self.fd);

            if let Some(association) = self.association.get() {
                if let Some(port) = association.port.upgrade() {
                    port.forget(association.key);
                }
            }

            unsafe { close(self.fd) };
        }
    }
}

impl Socket {
    fn from_fd(
        fd: i32,
        family: AddressFamily,
        socket_type: SocketType,
        protocol: ProtocolType,
        phase: Phase,
    ) -> Self {
        Self {
            fd,
            family,
            socket_type,
            protocol,
            inbound: Overlapped::new(),
            outbound: Overlapped::new(),
            state: Mutex::new(State {
                phase,
                bound: None,
                remote: None,
                send_buffer: PinnedBuffer::default(),
                receive_buffer: PinnedBuffer::default(),
                accept_buffer: None,
                accepted: None,
                inbound_op: None,
                outbound_op: None,
                parked: None,
            }),
            association: OnceCell::new(),
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn raw_fd(&self) -> i32 {
        self.fd
    }

    /// Register with `port`, reporting completions under `token`.
    pub(crate) fn attach(self: &Arc<Self>, port: &Arc<PortShared>, token: Token) -> Result<()> {
        if self.is_disposed() {
            return Err(SocketError::Disposed.into());
        }

        let mut fresh = false;

        let association = self.association.get_or_try_init(|| {
            fresh = true;

            let key = port.register(self)?;

            log::trace!(target:"unix_net", "fd({}) associated key({}) {:?}", self.fd, key, token);

            Ok::<_, Error>(Association {
                port: Arc::downgrade(port),
                token,
                key,
            })
        })?;

        if fresh || (association.port.ptr_eq(&Arc::downgrade(port)) && association.token == token)
        {
            return Ok(());
        }

        Err(SocketError::InvalidState.into())
    }

    /// Retry parked operations after the reactor reported readiness.
    pub(crate) fn on_ready(self: &Arc<Self>, readable: bool, writable: bool) {
        let mut state = match self.lock() {
            Ok(state) => state,
            Err(_) => return,
        };

        if readable {
            if let Some(op) = state.inbound_op.take() {
                let attempt = match &op {
                    Inbound::Accept { target } => self.attempt_accept(&mut state, target.as_ref()),
                    Inbound::Receive {
                        offset,
                        count,
                        flags,
                    } => match state.receive_buffer.get().cloned() {
                        Some(buffer) => self.attempt_receive(&buffer, *offset, *count, *flags),
                        None => Attempt::Finished(Err(SocketError::InvalidState.into())),
                    },
                };

                match attempt {
                    Attempt::WouldBlock => state.inbound_op = Some(op),
                    Attempt::Finished(result) => {
                        if self.inbound.complete() {
                            self.post(self.inbound.operation(), result);
                        }
                    }
                }
            }
        }

        if writable {
            if let Some(mut op) = state.outbound_op.take() {
                let attempt = match &mut op {
                    Outbound::Connect => {
                        let attempt = self.attempt_connect_finish(&state);

                        match &attempt {
                            Attempt::Finished(Ok(_)) => state.phase = Phase::Connected,
                            Attempt::Finished(Err(_)) => state.phase = Phase::Bound,
                            Attempt::WouldBlock => {}
                        }

                        attempt
                    }
                    Outbound::Send {
                        offset,
                        count,
                        flags,
                        sent,
                    } => match state.send_buffer.get().cloned() {
                        Some(buffer) => self.drive_send(&buffer, *offset, *count, *flags, sent),
                        None => Attempt::Finished(Err(SocketError::InvalidState.into())),
                    },
                };

                match attempt {
                    Attempt::WouldBlock => state.outbound_op = Some(op),
                    Attempt::Finished(result) => {
                        if self.outbound.complete() {
                            self.post(self.outbound.operation(), result);
                        }
                    }
                }
            }
        }

        let released = Self::unpark(&mut state);

        drop(state);
        drop(released);
    }

    /// Hold a strong reference until every parked operation finished.
    fn park(self: &Arc<Self>, state: &mut State) {
        state.parked.get_or_insert_with(|| self.clone());
    }

    /// Returns the parked reference once no operation waits any more, to be dropped
    /// after the state lock is released.
    fn unpark(state: &mut State) -> Option<Arc<Socket>> {
        if state.inbound_op.is_none() && state.outbound_op.is_none() {
            state.parked.take()
        } else {
            None
        }
    }

    /// Install an accepted connection into this socket's descriptor.
    fn adopt(&self, fd: i32, remote: SocketAddress) -> Result<()> {
        let mut state = match self.lock() {
            Ok(state) => state,
            Err(err) => {
                unsafe { close(fd) };
                return Err(err);
            }
        };

        unsafe {
            if dup2(fd, self.fd) < 0 {
                let err = Error::last_os_error();
                close(fd);
                return Err(err);
            }

            close(fd);

            cloexec(self.fd)?;
        }

        if let Some(association) = self.association.get() {
            if let Some(port) = association.port.upgrade() {
                port.reregister(self.fd, association.key)?;
            }
        }

        state.phase = Phase::Connected;
        state.remote = Some(remote);

        log::trace!(target:"unix_net", "fd({}) adopted connection from {:?}", self.fd, remote);

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

    fn post(self: &Arc<Self>, operation: OperationType, result: Result<usize>) {
        let (error, bytes) = match result {
            Ok(bytes) => (SocketError::Success, bytes),
            Err(err) => (SocketError::from(&err), 0),
        };

        log::trace!(
            target:"unix_net",
            "fd({}) {:?} completed {:?} bytes({})",
            self.fd,
            operation,
            error,
            bytes
        );

        let association = match self.association.get() {
            Some(association) => association,
            None => return,
        };

        match association.port.upgrade() {
            Some(port) => port.post(CompletionStatus::new(
                Some(AsyncSocket::from_inner(self.clone())),
                operation,
                error,
                bytes,
                association.token,
            )),
            None => {
                log::debug!(target:"unix_net", "fd({}) port gone, drop {:?} completion", self.fd, operation)
            }
        }
    }

    fn bind_locked(&self, state: &mut State, addr: SocketAddress) -> Result<()> {
        if unsafe { bind(self.fd, addr.as_ptr(), addr.len()) } < 0 {
            return Err(Error::last_os_error());
        }

        state.bound = Some(addr);

        if state.phase == Phase::Created {
            state.phase = Phase::Bound;
        }

        Ok(())
    }

    fn attempt_accept(&self, state: &mut State, target: Option<&AsyncSocket>) -> Attempt {
        let record_len = self.family.address_size() + 16;

        let storage = state
            .accept_buffer
            .get_or_insert_with(|| vec![0u8; record_len * 2].into_boxed_slice());

        let (fd, remote) = loop {
            let mut len = record_len as socklen_t;

            let ptr = storage.as_mut_ptr() as *mut sockaddr;

            #[cfg(any(target_os = "linux", target_os = "android"))]
            let fd = unsafe { accept4(self.fd, ptr, &mut len, SOCK_NONBLOCK | SOCK_CLOEXEC) };

            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            let fd = unsafe { accept(self.fd, ptr, &mut len) };

            if fd >= 0 {
                break (fd, unsafe { SocketAddress::copy_from_raw(ptr, len) });
            }

            let e = errno();

            set_errno(e);

            if e.0 == EINTR {
                continue;
            }

            if would_block(e.0) {
                return Attempt::WouldBlock;
            }

            return Attempt::Finished(Err(Error::from_raw_os_error(e.0)));
        };

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        if let Err(err) = unsafe { prepare_fd(fd) } {
            unsafe { close(fd) };
            return Attempt::Finished(Err(err));
        }

        log::trace!(target:"unix_net", "fd({}) accepted fd({}) from {:?}", self.fd, fd, remote);

        let accepted = match target {
            Some(target) => match target.inner().adopt(fd, remote) {
                Ok(_) => target.clone(),
                Err(err) => return Attempt::Finished(Err(err)),
            },
            None => {
                let socket = Socket::from_fd(
                    fd,
                    self.family,
                    self.socket_type,
                    self.protocol,
                    Phase::Connected,
                );

                socket.state.lock().unwrap().remote = Some(remote);

                AsyncSocket::from_inner(Arc::new(socket))
            }
        };

        state.accepted = Some(accepted);

        Attempt::Finished(Ok(0))
    }

    fn attempt_connect_finish(&self, state: &State) -> Attempt {
        let mut error: c_int = 0;
        let mut len = size_of::<c_int>() as socklen_t;

        if unsafe {
            getsockopt(
                self.fd,
                SOL_SOCKET,
                SO_ERROR,
                &mut error as *mut c_int as *mut c_void,
                &mut len,
            )
        } < 0
        {
            return Attempt::Finished(Err(Error::last_os_error()));
        }

        if error != 0 {
            return Attempt::Finished(Err(Error::from_raw_os_error(error)));
        }

        let remote = match &state.remote {
            Some(remote) => remote,
            None => return Attempt::Finished(Err(SocketError::InvalidState.into())),
        };

        // A second connect reports whether the handshake finished.
        if unsafe { connect(self.fd, remote.as_ptr(), remote.len()) } == 0 {
            return Attempt::Finished(Ok(0));
        }

        let e = errno();

        set_errno(e);

        match e.0 {
            EISCONN => Attempt::Finished(Ok(0)),
            EINPROGRESS | EALREADY | EINTR => Attempt::WouldBlock,
            code if would_block(code) => Attempt::WouldBlock,
            code => Attempt::Finished(Err(Error::from_raw_os_error(code))),
        }
    }

    fn attempt_send(
        &self,
        buffer: &Buffer,
        offset: usize,
        count: usize,
        flags: MessageFlags,
    ) -> Attempt {
        loop {
            let sent = {
                let guard = buffer.lock();

                unsafe {
                    send(
                        self.fd,
                        guard[offset..].as_ptr() as *const c_void,
                        count,
                        flags.native() | SEND_FLAGS,
                    )
                }
            };

            if sent >= 0 {
                return Attempt::Finished(Ok(sent as usize));
            }

            let e = errno();

            set_errno(e);

            if e.0 == EINTR {
                continue;
            }

            if would_block(e.0) {
                return Attempt::WouldBlock;
            }

            return Attempt::Finished(Err(Error::from_raw_os_error(e.0)));
        }
    }

    /// Push the rest of a send range, advancing `sent` on every partial write.
    fn drive_send(
        &self,
        buffer: &Buffer,
        offset: usize,
        count: usize,
        flags: MessageFlags,
        sent: &mut usize,
    ) -> Attempt {
        loop {
            match self.attempt_send(buffer, offset + *sent, count - *sent, flags) {
                Attempt::Finished(Ok(bytes)) => {
                    *sent += bytes;

                    // Datagrams leave in one piece.
                    if *sent >= count || bytes == 0 || self.socket_type != SocketType::Stream {
                        return Attempt::Finished(Ok(*sent));
                    }
                }
                attempt => return attempt,
            }
        }
    }

    fn attempt_receive(
        &self,
        buffer: &Buffer,
        offset: usize,
        count: usize,
        flags: MessageFlags,
    ) -> Attempt {
        loop {
            let received = {
                let mut guard = buffer.lock();

                unsafe {
                    recv(
                        self.fd,
                        guard[offset..].as_mut_ptr() as *mut c_void,
                        count,
                        flags.native(),
                    )
                }
            };

            if received >= 0 {
                return Attempt::Finished(Ok(received as usize));
            }

            let e = errno();

            set_errno(e);

            if e.0 == EINTR {
                continue;
            }

            if would_block(e.0) {
                return Attempt::WouldBlock;
            }

            return Attempt::Finished(Err(Error::from_raw_os_error(e.0)));
        }
    }

    /// Settle an operation that was just started on `overlapped`.
    fn settle(
        self: &Arc<Self>,
        overlapped: &Overlapped,
        operation: OperationType,
        attempt: Attempt,
    ) -> Result<bool> {
        match attempt {
            Attempt::WouldBlock => {
                log::trace!(target:"unix_net", "fd({}) {:?} pending", self.fd, operation);
                Ok(true)
            }
            Attempt::Finished(Ok(bytes)) => {
                overlapped.complete();
                self.post(operation, Ok(bytes));
                Ok(false)
            }
            Attempt::Finished(Err(err)) => {
                overlapped.complete();
                Err(err)
            }
        }
    }

    /// Callers hold the state lock so `fd` cannot be closed underneath.
    fn setsockopt_locked(&self, level: c_int, name: c_int, value: &[u8]) -> Result<()> {
        if unsafe {
            setsockopt(
                self.fd,
                level,
                name,
                value.as_ptr() as *const c_void,
                value.len() as socklen_t,
            )
        } < 0
        {
            return Err(Error::last_os_error());
        }

        Ok(())
    }

    fn set_int(&self, level: c_int, name: c_int, value: c_int) -> Result<()> {
        self.setsockopt_locked(level, name, &value.to_ne_bytes())
    }

    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "dragonfly"
    ))]
    fn set_keep_alive_timers(&self, values: &KeepAliveValues) -> Result<()> {
        self.set_int(IPPROTO_TCP, TCP_KEEPIDLE, seconds(values.time_ms))?;
        self.set_int(IPPROTO_TCP, TCP_KEEPINTVL, seconds(values.interval_ms))
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn set_keep_alive_timers(&self, values: &KeepAliveValues) -> Result<()> {
        self.set_int(IPPROTO_TCP, TCP_KEEPALIVE, seconds(values.time_ms))?;
        self.set_int(IPPROTO_TCP, TCP_KEEPINTVL, seconds(values.interval_ms))
    }

    /// Timers are system wide here, only the switch is per socket.
    #[cfg(target_os = "openbsd")]
    fn set_keep_alive_timers(&self, _values: &KeepAliveValues) -> Result<()> {
        Ok(())
    }
}

fn seconds(ms: u32) -> c_int {
    (ms / 1000).max(1) as c_int
}

/// Non-blocking, close-on-exec and no SIGPIPE, for platforms without `SOCK_*` type flags.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn prepare_fd(fd: i32) -> Result<()> {
    crate::poller::noblock(fd)?;
    cloexec(fd)?;

    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    {
        let on: c_int = 1;

        if setsockopt(
            fd,
            SOL_SOCKET,
            SO_NOSIGPIPE,
            &on as *const c_int as *const c_void,
            size_of::<c_int>() as socklen_t,
        ) < 0
        {
            return Err(Error::last_os_error());
        }
    }

    Ok(())
}

impl SocketBackend for Socket {
    fn open(
        family: AddressFamily,
        socket_type: SocketType,
        protocol: ProtocolType,
    ) -> Result<Self> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let fd = unsafe {
            socket(
                family.native(),
                socket_type.native() | SOCK_NONBLOCK | SOCK_CLOEXEC,
                protocol.native(),
            )
        };

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let fd = unsafe { socket(family.native(), socket_type.native(), protocol.native()) };

        if fd < 0 {
            return Err(Error::last_os_error());
        }

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        if let Err(err) = unsafe { prepare_fd(fd) } {
            unsafe { close(fd) };
            return Err(err);
        }

        log::trace!(target:"unix_net", "fd({}) created {:?} {:?}", fd, family, socket_type);

        Ok(Self::from_fd(
            fd,
            family,
            socket_type,
            protocol,
            Phase::Created,
        ))
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

        if unsafe { listen(self.fd, backlog) } < 0 {
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

        if let Some(target) = &target {
            if !target.inner().is_fresh() {
                return Err(SocketError::InvalidState.into());
            }
        }

        self.inbound.start(OperationType::Accept)?;

        let attempt = self.attempt_accept(&mut state, target.as_ref());

        if self.settle(&self.inbound, OperationType::Accept, attempt)? {
            state.inbound_op = Some(Inbound::Accept { target });
            self.park(&mut state);
        }

        Ok(())
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

        if state.bound.is_none() {
            self.bind_locked(&mut state, SocketAddress::any(self.family))?;
        }

        self.outbound.start(OperationType::Connect)?;

        state.remote = Some(addr);

        log::trace!(target:"unix_net", "fd({}) connect {:?}", self.fd, addr);

        let attempt = if unsafe { connect(self.fd, addr.as_ptr(), addr.len()) } == 0 {
            Attempt::Finished(Ok(0))
        } else {
            let e = errno();

            set_errno(e);

            match e.0 {
                EINPROGRESS | EINTR => Attempt::WouldBlock,
                code if would_block(code) => Attempt::WouldBlock,
                code => Attempt::Finished(Err(Error::from_raw_os_error(code))),
            }
        };

        match &attempt {
            Attempt::WouldBlock => state.phase = Phase::Connecting,
            Attempt::Finished(Ok(_)) => state.phase = Phase::Connected,
            Attempt::Finished(Err(_)) => state.remote = None,
        }

        if self.settle(&self.outbound, OperationType::Connect, attempt)? {
            state.outbound_op = Some(Outbound::Connect);
            self.park(&mut state);
        }

        Ok(())
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

        log::trace!(target:"unix_net", "fd({}) send({})", self.fd, count);

        let mut sent = 0;

        let attempt = self.drive_send(buffer, offset, count, flags, &mut sent);

        if self.settle(&self.outbound, OperationType::Send, attempt)? {
            state.outbound_op = Some(Outbound::Send {
                offset,
                count,
                flags,
                sent,
            });
            self.park(&mut state);
        }

        Ok(())
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

        log::trace!(target:"unix_net", "fd({}) recv({})", self.fd, count);

        let attempt = self.attempt_receive(buffer, offset, count, flags);

        if self.settle(&self.inbound, OperationType::Receive, attempt)? {
            state.inbound_op = Some(Inbound::Receive {
                offset,
                count,
                flags,
            });
            self.park(&mut state);
        }

        Ok(())
    }

    fn take_accepted(&self) -> Option<AsyncSocket> {
        self.state.lock().unwrap().accepted.take()
    }

    fn local_endpoint(&self) -> Result<SocketAddr> {
        let _state = self.lock()?;

        SocketAddress::query(|addr, len| unsafe { getsockname(self.fd, addr, len) })
    }

    fn remote_endpoint(&self) -> Result<SocketAddr> {
        let _state = self.lock()?;

        SocketAddress::query(|addr, len| unsafe { getpeername(self.fd, addr, len) })
    }

    fn set_option_raw(&self, level: i32, name: i32, value: &[u8]) -> Result<()> {
        let _state = self.lock()?;

        self.setsockopt_locked(level, name, value)
    }

    fn get_option_raw(&self, level: i32, name: i32, value: &mut [u8]) -> Result<usize> {
        let _state = self.lock()?;

        let mut len = value.len() as socklen_t;

        if unsafe {
            getsockopt(
                self.fd,
                level,
                name,
                value.as_mut_ptr() as *mut c_void,
                &mut len,
            )
        } < 0
        {
            return Err(Error::last_os_error());
        }

        Ok((len as usize).min(value.len()))
    }

    fn io_control(&self, code: IoControlCode, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let _state = self.lock()?;

        match code {
            IoControlCode::BytesAvailable => {
                if output.len() < size_of::<c_int>() {
                    return Err(Error::new(
                        ErrorKind::InvalidInput,
                        "output too small for byte count",
                    ));
                }

                let mut available: c_int = 0;

                if unsafe { ioctl(self.fd, FIONREAD, &mut available as *mut c_int) } < 0 {
                    return Err(Error::last_os_error());
                }

                output[..size_of::<c_int>()].copy_from_slice(&available.to_ne_bytes());

                Ok(size_of::<c_int>())
            }
            IoControlCode::KeepAliveValues => {
                let values = KeepAliveValues::from_bytes(input)?;

                self.set_int(SOL_SOCKET, SO_KEEPALIVE, values.enabled as c_int)?;

                if values.enabled {
                    self.set_keep_alive_timers(&values)?;
                }

                Ok(0)
            }
            IoControlCode::Raw(code) => {
                let mut scratch = vec![0u8; input.len().max(output.len())];

                scratch[..input.len()].copy_from_slice(input);

                if unsafe { ioctl(self.fd, code as _, scratch.as_mut_ptr()) } < 0 {
                    return Err(Error::last_os_error());
                }

                let len = output.len();

                output.copy_from_slice(&scratch[..len]);

                Ok(len)
            }
        }
    }

    fn dispose(self: &Arc<Self>) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        log::debug!(target:"unix_net", "dispose fd({})", self.fd);

        let mut state = self.state.lock().unwrap();

        let inbound_op = state.inbound_op.take();
        let outbound_op = state.outbound_op.take();

        let abort_inbound = inbound_op.is_some() && self.inbound.complete();
        let abort_outbound = outbound_op.is_some() && self.outbound.complete();

        self.inbound.complete();
        self.outbound.complete();

        if let Some(association) = self.association.get() {
            if let Some(port) = association.port.upgrade() {
                port.deregister(association.key, self.fd);
            }
        }

        unsafe { close(self.fd) };

        state.send_buffer.release();
        state.receive_buffer.release();
        state.accept_buffer = None;
        state.bound = None;
        state.remote = None;

        let accepted = state.accepted.take();

        let released = state.parked.take();

        drop(state);

        if let Some(accepted) = accepted {
            accepted.dispose();
        }

        if abort_inbound {
            self.post(
                self.inbound.operation(),
                Err(SocketError::OperationAborted.into()),
            );
        }

        if abort_outbound {
            self.post(
                self.outbound.operation(),
                Err(SocketError::OperationAborted.into()),
            );
        }

        drop(released);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}
