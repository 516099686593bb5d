//! Asynchronous socket: fire-and-forget operations reporting to a [`CompletionPort`](crate::CompletionPort).

#[cfg_attr(target_family = "windows", path = "socket/socket_win32.rs")]
#[cfg_attr(target_family = "unix", path = "socket/socket_unix.rs")]
mod impls;

pub(crate) use impls::Socket;

use std::{
    fmt::Debug,
    hash::Hash,
    io::{Error, ErrorKind, Result},
    net::{SocketAddr, ToSocketAddrs},
    ops::BitOr,
    sync::Arc,
};

use crate::{
    options, AddressFamily, Buffer, ProtocolType, SocketAddress, SocketError, SocketOptionLevel,
    SocketOptionName, SocketOptionValue, SocketType,
};

/// Flags for send and receive operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageFlags(u32);

impl MessageFlags {
    pub const NONE: MessageFlags = MessageFlags(0);
    pub const OUT_OF_BAND: MessageFlags = MessageFlags(0x1);
    pub const PEEK: MessageFlags = MessageFlags(0x2);
    pub const DONT_ROUTE: MessageFlags = MessageFlags(0x4);

    pub fn contains(&self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[cfg(target_family = "unix")]
    pub(crate) fn native(&self) -> i32 {
        let mut flags = 0;

        if self.contains(Self::OUT_OF_BAND) {
            flags |= libc::MSG_OOB;
        }

        if self.contains(Self::PEEK) {
            flags |= libc::MSG_PEEK;
        }

        if self.contains(Self::DONT_ROUTE) {
            flags |= libc::MSG_DONTROUTE;
        }

        flags
    }

    #[cfg(target_family = "windows")]
    pub(crate) fn native(&self) -> i32 {
        use winapi::um::winsock2::{MSG_DONTROUTE, MSG_OOB, MSG_PEEK};

        let mut flags = 0;

        if self.contains(Self::OUT_OF_BAND) {
            flags |= MSG_OOB;
        }

        if self.contains(Self::PEEK) {
            flags |= MSG_PEEK;
        }

        if self.contains(Self::DONT_ROUTE) {
            flags |= MSG_DONTROUTE;
        }

        flags
    }
}

impl BitOr for MessageFlags {
    type Output = MessageFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        MessageFlags(self.0 | rhs.0)
    }
}

/// Synchronous control requests for [`AsyncSocket::io_control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoControlCode {
    /// Bytes waiting to be received, written to the output as a native-endian `i32`.
    BytesAvailable,
    /// Keep-alive settings, the input is a [`KeepAliveValues`] record.
    KeepAliveValues,
    /// Platform control code passed through untouched.
    Raw(u32),
}

/// Keep-alive record used with [`IoControlCode::KeepAliveValues`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveValues {
    pub enabled: bool,
    /// Idle time before the first probe, in milliseconds.
    pub time_ms: u32,
    /// Interval between probes, in milliseconds.
    pub interval_ms: u32,
}

impl KeepAliveValues {
    /// Native 12 byte record: three native-endian `u32`.
    pub fn to_bytes(&self) -> [u8; 12] {
        let mut record = [0u8; 12];

        record[..4].copy_from_slice(&(self.enabled as u32).to_ne_bytes());
        record[4..8].copy_from_slice(&self.time_ms.to_ne_bytes());
        record[8..].copy_from_slice(&self.interval_ms.to_ne_bytes());

        record
    }

    pub fn from_bytes(record: &[u8]) -> Result<Self> {
        if record.len() < 12 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("keep-alive record needs 12 bytes, got {}", record.len()),
            ));
        }

        let field = |index: usize| {
            let mut value = [0u8; 4];
            value.copy_from_slice(&record[index * 4..index * 4 + 4]);
            u32::from_ne_bytes(value)
        };

        Ok(Self {
            enabled: field(0) != 0,
            time_ms: field(1),
            interval_ms: field(2),
        })
    }
}

/// Capability set every platform socket implements.
pub(crate) trait SocketBackend: Sized + Send + Sync + 'static {
    fn open(family: AddressFamily, socket_type: SocketType, protocol: ProtocolType)
        -> Result<Self>;

    fn family(&self) -> AddressFamily;

    fn socket_type(&self) -> SocketType;

    fn protocol_type(&self) -> ProtocolType;

    fn bind(&self, addr: SocketAddress) -> Result<()>;

    fn listen(&self, backlog: i32) -> Result<()>;

    fn accept(self: &Arc<Self>, target: Option<AsyncSocket>) -> Result<()>;

    fn connect(self: &Arc<Self>, addr: SocketAddress) -> Result<()>;

    fn send(
        self: &Arc<Self>,
        buffer: &Buffer,
        offset: usize,
        count: usize,
        flags: MessageFlags,
    ) -> Result<()>;

    fn receive(
        self: &Arc<Self>,
        buffer: &Buffer,
        offset: usize,
        count: usize,
        flags: MessageFlags,
    ) -> Result<()>;

    fn take_accepted(&self) -> Option<AsyncSocket>;

    fn local_endpoint(&self) -> Result<SocketAddr>;

    fn remote_endpoint(&self) -> Result<SocketAddr>;

    fn set_option_raw(&self, level: i32, name: i32, value: &[u8]) -> Result<()>;

    /// Returns the length the OS wrote into `value`.
    fn get_option_raw(&self, level: i32, name: i32, value: &mut [u8]) -> Result<usize>;

    fn io_control(&self, code: IoControlCode, input: &[u8], output: &mut [u8]) -> Result<usize>;

    fn dispose(self: &Arc<Self>);

    fn is_disposed(&self) -> bool;
}

/// Socket whose accept, connect, send and receive report through a completion port.
///
/// Clones are cheap handles to the same socket, equality is identity. The socket must
/// be associated with a port before issuing asynchronous operations; at most one
/// operation per direction (accept/receive, connect/send) may be outstanding.
#[derive(Clone)]
pub struct AsyncSocket {
    inner: Arc<Socket>,
}

impl AsyncSocket {
    pub fn create(
        family: AddressFamily,
        socket_type: SocketType,
        protocol: ProtocolType,
    ) -> Result<Self> {
        crate::init()?;

        Ok(Self {
            inner: Arc::new(Socket::open(family, socket_type, protocol)?),
        })
    }

    /// IPv4 stream socket.
    pub fn create_ipv4_tcp() -> Result<Self> {
        Self::create(
            AddressFamily::InterNetwork,
            SocketType::Stream,
            ProtocolType::Tcp,
        )
    }

    /// IPv6 stream socket.
    pub fn create_ipv6_tcp() -> Result<Self> {
        Self::create(
            AddressFamily::InterNetworkV6,
            SocketType::Stream,
            ProtocolType::Tcp,
        )
    }

    pub fn family(&self) -> AddressFamily {
        self.inner.family()
    }

    pub fn socket_type(&self) -> SocketType {
        self.inner.socket_type()
    }

    pub fn protocol_type(&self) -> ProtocolType {
        self.inner.protocol_type()
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        self.check_disposed()?;

        self.inner.bind(addr.into())
    }

    /// Start listening, the socket must be bound first.
    pub fn listen(&self, backlog: i32) -> Result<()> {
        self.check_disposed()?;

        self.inner.listen(backlog)
    }

    /// Accept one connection into a new socket, collected with
    /// [`AsyncSocket::get_accepted_socket`] once the Accept completion arrives.
    pub fn accept(&self) -> Result<()> {
        self.check_disposed()?;

        self.inner.accept(None)
    }

    /// Accept one connection into a caller-created, unbound socket.
    pub fn accept_into(&self, target: &AsyncSocket) -> Result<()> {
        self.check_disposed()?;

        if target == self {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "socket can't accept into itself",
            ));
        }

        target.check_disposed()?;

        self.inner.accept(Some(target.clone()))
    }

    /// Connect to `addr`, binding to the wildcard address first if unbound.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.check_disposed()?;

        self.inner.connect(addr.into())
    }

    /// Resolve `host` and connect to the first address of this socket's family.
    pub fn connect_host(&self, host: &str, port: u16) -> Result<()> {
        self.check_disposed()?;

        let family = self.family();

        let addr = (host, port)
            .to_socket_addrs()?
            .find(|addr| AddressFamily::of(addr) == family)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::AddrNotAvailable,
                    format!("{} has no {:?} address", host, family),
                )
            })?;

        log::trace!("resolved {}:{} to {}", host, port, addr);

        self.connect(addr)
    }

    /// Send the whole buffer.
    pub fn send(&self, buffer: &Buffer) -> Result<()> {
        self.send_with(buffer, 0, buffer.len(), MessageFlags::NONE)
    }

    pub fn send_with(
        &self,
        buffer: &Buffer,
        offset: usize,
        count: usize,
        flags: MessageFlags,
    ) -> Result<()> {
        self.check_disposed()?;

        check_range(buffer, offset, count)?;

        self.inner.send(buffer, offset, count, flags)
    }

    /// Receive into the whole buffer.
    pub fn receive(&self, buffer: &Buffer) -> Result<()> {
        self.receive_with(buffer, 0, buffer.len(), MessageFlags::NONE)
    }

    pub fn receive_with(
        &self,
        buffer: &Buffer,
        offset: usize,
        count: usize,
        flags: MessageFlags,
    ) -> Result<()> {
        self.check_disposed()?;

        check_range(buffer, offset, count)?;

        self.inner.receive(buffer, offset, count, flags)
    }

    /// Socket produced by the last Accept completion, handed out once.
    pub fn get_accepted_socket(&self) -> Option<AsyncSocket> {
        self.inner.take_accepted()
    }

    pub fn local_endpoint(&self) -> Result<SocketAddr> {
        self.check_disposed()?;

        self.inner.local_endpoint()
    }

    pub fn remote_endpoint(&self) -> Result<SocketAddr> {
        self.check_disposed()?;

        self.inner.remote_endpoint()
    }

    pub fn set_socket_option<V: Into<SocketOptionValue>>(
        &self,
        level: SocketOptionLevel,
        name: SocketOptionName,
        value: V,
    ) -> Result<()> {
        self.check_disposed()?;

        let (native_level, native_name) = options::native_option(level, name)?;

        let record = options::encode(name, &value.into())?;

        self.inner
            .set_option_raw(native_level, native_name, &record)
    }

    /// Read an integer or linger option.
    pub fn get_socket_option(
        &self,
        level: SocketOptionLevel,
        name: SocketOptionName,
    ) -> Result<SocketOptionValue> {
        self.check_disposed()?;

        let (native_level, native_name) = options::native_option(level, name)?;

        let mut record = [0u8; options::MAX_RECORD_LEN];

        let len = self
            .inner
            .get_option_raw(native_level, native_name, &mut record)?;

        options::decode(name, &record[..len])
    }

    /// Read an option as raw bytes, truncated to the length the OS reports.
    pub fn get_socket_option_bytes(
        &self,
        level: SocketOptionLevel,
        name: SocketOptionName,
        len: usize,
    ) -> Result<Vec<u8>> {
        self.check_disposed()?;

        let (native_level, native_name) = options::native_option(level, name)?;

        let mut record = vec![0u8; len];

        let len = self
            .inner
            .get_option_raw(native_level, native_name, &mut record)?;

        record.truncate(len);

        Ok(record)
    }

    /// Issue a synchronous control request, returns the bytes written to `output`.
    pub fn io_control(
        &self,
        code: IoControlCode,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize> {
        self.check_disposed()?;

        self.inner.io_control(code, input, output)
    }

    /// Cancel outstanding operations and close the socket. Idempotent.
    ///
    /// Completions for operations cancelled here may still be dequeued afterwards.
    pub fn dispose(&self) {
        self.inner.dispose()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    pub(crate) fn inner(&self) -> &Arc<Socket> {
        &self.inner
    }

    pub(crate) fn from_inner(inner: Arc<Socket>) -> Self {
        Self { inner }
    }

    fn check_disposed(&self) -> Result<()> {
        if self.inner.is_disposed() {
            return Err(SocketError::Disposed.into());
        }

        Ok(())
    }
}

fn check_range(buffer: &Buffer, offset: usize, count: usize) -> Result<()> {
    let len = buffer.len();

    match offset.checked_add(count) {
        Some(end) if end <= len => Ok(()),
        _ => Err(Error::new(
            ErrorKind::InvalidInput,
            format!("range {}+{} out of buffer len({})", offset, count, len),
        )),
    }
}

impl PartialEq for AsyncSocket {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for AsyncSocket {}

impl Hash for AsyncSocket {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state)
    }
}

impl Debug for AsyncSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AsyncSocket({:?})", self.inner)
    }
}
