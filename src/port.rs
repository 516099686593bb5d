//! Completion port: the queue every socket operation reports into.

#[cfg_attr(target_family = "windows", path = "port/port_iocp.rs")]
#[cfg_attr(target_family = "unix", path = "port/port_reactor.rs")]
mod impls;

#[cfg(target_family = "unix")]
mod queue;

pub(crate) use impls::PortShared;

use std::{
    fmt::Debug,
    io::{Error, ErrorKind, Result},
    time::Duration,
};

use crate::{AsyncSocket, SocketError};

/// Opaque correlation token supplied at association or to [`CompletionPort::signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Token(pub usize);

/// Kind of operation a completion reports.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Accept = 0,
    Connect = 1,
    Send = 2,
    Receive = 3,
    /// Reserved for graceful close completions, never produced by this crate.
    Disconnect = 4,
    /// Posted by [`CompletionPort::signal`], carries no socket.
    Signal = 5,
}

impl OperationType {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Accept,
            1 => Self::Connect,
            2 => Self::Send,
            3 => Self::Receive,
            4 => Self::Disconnect,
            _ => Self::Signal,
        }
    }
}

/// Outcome of one operation, as delivered to a consumer.
#[derive(Debug, Clone)]
pub struct CompletionStatus {
    socket: Option<AsyncSocket>,
    operation_type: OperationType,
    socket_error: SocketError,
    bytes_transferred: usize,
    token: Token,
}

impl CompletionStatus {
    pub(crate) fn new(
        socket: Option<AsyncSocket>,
        operation_type: OperationType,
        socket_error: SocketError,
        bytes_transferred: usize,
        token: Token,
    ) -> Self {
        Self {
            socket,
            operation_type,
            socket_error,
            bytes_transferred,
            token,
        }
    }

    pub(crate) fn signal(token: Token) -> Self {
        Self::new(None, OperationType::Signal, SocketError::Success, 0, token)
    }

    /// Socket the operation ran on, `None` for signals.
    pub fn socket(&self) -> Option<&AsyncSocket> {
        self.socket.as_ref()
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    pub fn socket_error(&self) -> SocketError {
        self.socket_error
    }

    /// Bytes moved by a send, receive or accept. Zero for a successful receive means the
    /// peer closed its sending side.
    pub fn bytes_transferred(&self) -> usize {
        self.bytes_transferred
    }

    pub fn token(&self) -> Token {
        self.token
    }
}

/// Port configuration.
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Threads the OS lets run concurrently on an IOCP, 0 means one per CPU. The reactor
    /// backend ignores it.
    pub concurrency: u32,
    /// Readiness events the reactor thread pulls per poll.
    pub events_capacity: usize,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            concurrency: 0,
            events_capacity: 1024,
        }
    }
}

/// Platform queue behind a [`CompletionPort`].
pub(crate) trait PortBackend: Sized {
    fn create(config: &PortConfig) -> Result<Self>;

    fn associate(&self, socket: &AsyncSocket, token: Token) -> Result<()>;

    /// Up to `max` completions, an empty result means the timeout elapsed.
    fn dequeue(&self, timeout: Option<Duration>, max: usize) -> Result<Vec<CompletionStatus>>;

    fn signal(&self, token: Token) -> Result<()>;

    fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

/// Queue of [`CompletionStatus`] shared by any number of consumer threads.
///
/// Every completion is handed to exactly one consumer. Share the port between threads
/// with an [`std::sync::Arc`], dropping the last handle disposes it.
pub struct CompletionPort {
    backend: impls::Port,
}

impl CompletionPort {
    /// Create a port with the default [`PortConfig`].
    pub fn create() -> Result<Self> {
        Self::with_config(PortConfig::default())
    }

    pub fn with_config(config: PortConfig) -> Result<Self> {
        crate::init()?;

        let backend = impls::Port::create(&config)?;

        Ok(Self { backend })
    }

    /// Route all completions of `socket` to this port, tagged with `token`.
    ///
    /// Associating again with the same port and token is a no-op; any other second
    /// association fails with [`SocketError::InvalidState`].
    pub fn associate(&self, socket: &AsyncSocket, token: Token) -> Result<()> {
        self.check_disposed()?;

        self.backend.associate(socket, token)
    }

    /// Wait for one completion.
    ///
    /// `None` waits forever, [`Duration::ZERO`] polls. Fails with
    /// [`ErrorKind::TimedOut`] when the timeout elapses first.
    pub fn dequeue_one(&self, timeout: Option<Duration>) -> Result<CompletionStatus> {
        self.check_disposed()?;

        self.backend
            .dequeue(timeout, 1)?
            .pop()
            .ok_or_else(|| Error::new(ErrorKind::TimedOut, "dequeue timeout"))
    }

    /// Take up to `max` completions, blocking only while none is available.
    ///
    /// Returns an empty batch when the timeout elapses.
    pub fn dequeue_many(
        &self,
        timeout: Option<Duration>,
        max: usize,
    ) -> Result<Vec<CompletionStatus>> {
        self.check_disposed()?;

        if max == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "max must be positive"));
        }

        self.backend.dequeue(timeout, max)
    }

    /// Post a [`OperationType::Signal`] completion carrying `token`.
    pub fn signal(&self, token: Token) -> Result<()> {
        self.check_disposed()?;

        self.backend.signal(token)
    }

    /// Release the queue and wake every blocked consumer with [`SocketError::Disposed`].
    ///
    /// Outstanding socket operations are not cancelled.
    pub fn dispose(&self) {
        self.backend.dispose()
    }

    pub fn is_disposed(&self) -> bool {
        self.backend.is_disposed()
    }

    fn check_disposed(&self) -> Result<()> {
        if self.backend.is_disposed() {
            return Err(SocketError::Disposed.into());
        }

        Ok(())
    }
}

impl Drop for CompletionPort {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Debug for CompletionPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CompletionPort(disposed: {})", self.is_disposed())
    }
}
