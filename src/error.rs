use std::{
    fmt::Display,
    io::{Error, ErrorKind},
};

/// Categorized outcome of a socket operation.
///
/// Completions carry one of these in-band, synchronous failures carry it as the payload
/// of the returned [`std::io::Error`] when the failure did not come from the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketError {
    Success,
    /// The OS accepted the request and will complete it later.
    IoPending,
    /// The operation was cancelled, usually because the socket was disposed.
    OperationAborted,
    ConnectionRefused,
    ConnectionReset,
    ConnectionAborted,
    NotConnected,
    IsConnected,
    AddressInUse,
    AddressNotAvailable,
    TimedOut,
    HostUnreachable,
    NetworkUnreachable,
    Shutdown,
    MessageSize,
    NoBufferSpace,
    InvalidArgument,
    WouldBlock,
    /// The call is illegal in the current socket/port/operation state.
    InvalidState,
    /// The socket or port has been disposed.
    Disposed,
    /// The OS could not allocate the requested object.
    ResourceExhausted,
    /// An OS error without a dedicated category, carrying the raw code.
    Other(i32),
    /// An error that carries neither an OS code nor a known category.
    Unknown,
}

impl SocketError {
    /// Returns true for [`SocketError::Success`].
    pub fn is_success(&self) -> bool {
        *self == SocketError::Success
    }

    /// Map a raw OS error code (errno on unix, WSA/win32 code on windows).
    #[cfg(target_family = "unix")]
    pub fn from_raw_os_error(code: i32) -> Self {
        use libc::*;

        match code {
            0 => Self::Success,
            EINPROGRESS | EALREADY => Self::IoPending,
            ECANCELED => Self::OperationAborted,
            ECONNREFUSED => Self::ConnectionRefused,
            ECONNRESET | EPIPE => Self::ConnectionReset,
            ECONNABORTED => Self::ConnectionAborted,
            ENOTCONN => Self::NotConnected,
            EISCONN => Self::IsConnected,
            EADDRINUSE => Self::AddressInUse,
            EADDRNOTAVAIL => Self::AddressNotAvailable,
            ETIMEDOUT => Self::TimedOut,
            EHOSTUNREACH => Self::HostUnreachable,
            ENETUNREACH => Self::NetworkUnreachable,
            ESHUTDOWN => Self::Shutdown,
            EMSGSIZE => Self::MessageSize,
            ENOBUFS => Self::NoBufferSpace,
            EINVAL => Self::InvalidArgument,
            ENOMEM | EMFILE | ENFILE => Self::ResourceExhausted,
            code if code == EAGAIN || code == EWOULDBLOCK => Self::WouldBlock,
            code => Self::Other(code),
        }
    }

    /// Map a raw OS error code (errno on unix, WSA/win32 code on windows).
    #[cfg(target_family = "windows")]
    pub fn from_raw_os_error(code: i32) -> Self {
        use winapi::shared::winerror::*;
        use winapi::um::winsock2::*;

        const NETNAME_DELETED: i32 = ERROR_NETNAME_DELETED as i32;
        const CONNECTION_REFUSED: i32 = ERROR_CONNECTION_REFUSED as i32;
        const CONNECTION_ABORTED: i32 = ERROR_CONNECTION_ABORTED as i32;
        const NOT_ENOUGH_MEMORY: i32 = ERROR_NOT_ENOUGH_MEMORY as i32;

        match code {
            0 => Self::Success,
            WSA_IO_PENDING | WSAEINPROGRESS | WSAEALREADY => Self::IoPending,
            WSA_OPERATION_ABORTED | WSAECANCELLED => Self::OperationAborted,
            WSAECONNREFUSED | CONNECTION_REFUSED => Self::ConnectionRefused,
            WSAECONNRESET | NETNAME_DELETED => Self::ConnectionReset,
            WSAECONNABORTED | CONNECTION_ABORTED => Self::ConnectionAborted,
            WSAENOTCONN => Self::NotConnected,
            WSAEISCONN => Self::IsConnected,
            WSAEADDRINUSE => Self::AddressInUse,
            WSAEADDRNOTAVAIL => Self::AddressNotAvailable,
            WSAETIMEDOUT => Self::TimedOut,
            WSAEHOSTUNREACH => Self::HostUnreachable,
            WSAENETUNREACH => Self::NetworkUnreachable,
            WSAESHUTDOWN => Self::Shutdown,
            WSAEMSGSIZE => Self::MessageSize,
            WSAENOBUFS => Self::NoBufferSpace,
            WSAEINVAL => Self::InvalidArgument,
            WSAEMFILE | NOT_ENOUGH_MEMORY => Self::ResourceExhausted,
            WSAEWOULDBLOCK => Self::WouldBlock,
            code => Self::Other(code),
        }
    }

    /// The [`ErrorKind`] an [`std::io::Error`] built from this category reports.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionRefused => ErrorKind::ConnectionRefused,
            Self::ConnectionReset => ErrorKind::ConnectionReset,
            Self::ConnectionAborted | Self::OperationAborted => ErrorKind::ConnectionAborted,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::AddressInUse => ErrorKind::AddrInUse,
            Self::AddressNotAvailable => ErrorKind::AddrNotAvailable,
            Self::TimedOut => ErrorKind::TimedOut,
            Self::WouldBlock | Self::IoPending => ErrorKind::WouldBlock,
            Self::InvalidArgument => ErrorKind::InvalidInput,
            Self::Shutdown => ErrorKind::BrokenPipe,
            Self::ResourceExhausted | Self::NoBufferSpace => ErrorKind::OutOfMemory,
            _ => ErrorKind::Other,
        }
    }
}

impl Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidState => write!(f, "operation is not valid in the current state"),
            Self::Disposed => write!(f, "object has been disposed"),
            Self::ResourceExhausted => write!(f, "system resources exhausted"),
            Self::Other(code) => write!(f, "os error({})", code),
            other => write!(f, "{:?}", other),
        }
    }
}

impl std::error::Error for SocketError {}

impl From<SocketError> for Error {
    fn from(value: SocketError) -> Self {
        match value {
            SocketError::Other(code) => Error::from_raw_os_error(code),
            value => Error::new(value.kind(), value),
        }
    }
}

impl From<&Error> for SocketError {
    fn from(error: &Error) -> Self {
        if let Some(inner) = error
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<SocketError>())
        {
            return *inner;
        }

        if let Some(code) = error.raw_os_error() {
            return Self::from_raw_os_error(code);
        }

        match error.kind() {
            ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            ErrorKind::ConnectionReset => Self::ConnectionReset,
            ErrorKind::ConnectionAborted => Self::ConnectionAborted,
            ErrorKind::NotConnected => Self::NotConnected,
            ErrorKind::AddrInUse => Self::AddressInUse,
            ErrorKind::AddrNotAvailable => Self::AddressNotAvailable,
            ErrorKind::TimedOut => Self::TimedOut,
            ErrorKind::WouldBlock => Self::WouldBlock,
            ErrorKind::InvalidInput => Self::InvalidArgument,
            ErrorKind::OutOfMemory => Self::ResourceExhausted,
            _ => Self::Unknown,
        }
    }
}

impl From<Error> for SocketError {
    fn from(error: Error) -> Self {
        Self::from(&error)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Error, ErrorKind};

    use super::SocketError;

    #[test]
    fn test_crate_errors_survive_io_error() {
        let error: Error = SocketError::InvalidState.into();

        assert_eq!(error.kind(), ErrorKind::Other);
        assert_eq!(SocketError::from(&error), SocketError::InvalidState);

        let error: Error = SocketError::Disposed.into();

        assert_eq!(SocketError::from(error), SocketError::Disposed);

        let error: Error = SocketError::ResourceExhausted.into();

        assert_eq!(error.kind(), ErrorKind::OutOfMemory);
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn test_os_codes() {
        let error = Error::from_raw_os_error(libc::ECONNREFUSED);

        assert_eq!(SocketError::from(&error), SocketError::ConnectionRefused);

        assert_eq!(
            SocketError::from_raw_os_error(libc::EAGAIN),
            SocketError::WouldBlock
        );

        assert_eq!(SocketError::from_raw_os_error(0), SocketError::Success);

        let error: Error = SocketError::Other(libc::EPERM).into();

        assert_eq!(error.raw_os_error(), Some(libc::EPERM));
    }

    #[test]
    fn test_kind_fallback() {
        let error = Error::new(ErrorKind::TimedOut, "dequeue timeout");

        assert_eq!(SocketError::from(&error), SocketError::TimedOut);

        let error = Error::new(ErrorKind::Unsupported, "nope");

        assert_eq!(SocketError::from(&error), SocketError::Unknown);
    }
}
