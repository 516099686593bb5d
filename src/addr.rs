use std::{
    fmt::Debug,
    io::{Error, ErrorKind, Result},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
};

use os_socketaddr::{socklen_t, OsSocketAddr};

#[cfg(target_family = "unix")]
pub(crate) type RawSockAddr = libc::sockaddr;

#[cfg(target_family = "windows")]
pub(crate) type RawSockAddr = winapi::shared::ws2def::SOCKADDR;

/// Address family of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4
    InterNetwork,
    /// IPv6
    InterNetworkV6,
}

impl AddressFamily {
    /// Family of the provided endpoint.
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Self::InterNetwork,
            SocketAddr::V6(_) => Self::InterNetworkV6,
        }
    }

    /// Size in bytes of the native address record of this family.
    pub fn address_size(&self) -> usize {
        match self {
            Self::InterNetwork => 16,
            Self::InterNetworkV6 => 28,
        }
    }

    #[cfg(target_family = "unix")]
    pub(crate) fn native(&self) -> i32 {
        match self {
            Self::InterNetwork => libc::AF_INET,
            Self::InterNetworkV6 => libc::AF_INET6,
        }
    }

    #[cfg(target_family = "windows")]
    pub(crate) fn native(&self) -> i32 {
        use winapi::shared::ws2def::{AF_INET, AF_INET6};

        match self {
            Self::InterNetwork => AF_INET,
            Self::InterNetworkV6 => AF_INET6,
        }
    }
}

/// Socket type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    Stream,
    Dgram,
}

impl SocketType {
    #[cfg(target_family = "unix")]
    pub(crate) fn native(&self) -> i32 {
        match self {
            Self::Stream => libc::SOCK_STREAM,
            Self::Dgram => libc::SOCK_DGRAM,
        }
    }

    #[cfg(target_family = "windows")]
    pub(crate) fn native(&self) -> i32 {
        use winapi::shared::ws2def::{SOCK_DGRAM, SOCK_STREAM};

        match self {
            Self::Stream => SOCK_STREAM,
            Self::Dgram => SOCK_DGRAM,
        }
    }
}

/// Transport protocol of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolType {
    Tcp,
    Udp,
    /// Let the OS choose the default protocol of the socket type.
    Unspecified,
}

impl ProtocolType {
    #[cfg(target_family = "unix")]
    pub(crate) fn native(&self) -> i32 {
        match self {
            Self::Tcp => libc::IPPROTO_TCP,
            Self::Udp => libc::IPPROTO_UDP,
            Self::Unspecified => 0,
        }
    }

    #[cfg(target_family = "windows")]
    pub(crate) fn native(&self) -> i32 {
        use winapi::shared::ws2def::{IPPROTO_TCP, IPPROTO_UDP};

        match self {
            Self::Tcp => IPPROTO_TCP as i32,
            Self::Udp => IPPROTO_UDP as i32,
            Self::Unspecified => 0,
        }
    }
}

/// Owned, fixed-size native socket address.
///
/// The record lives inline, so a `SocketAddress` held by a socket keeps a stable address
/// for as long as the socket owns it.
#[derive(Clone, Copy)]
pub struct SocketAddress {
    raw: OsSocketAddr,
}

impl SocketAddress {
    /// Wildcard address (`0.0.0.0:0` or `[::]:0`) of the family.
    pub fn any(family: AddressFamily) -> Self {
        match family {
            AddressFamily::InterNetwork => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into(),
            AddressFamily::InterNetworkV6 => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)).into(),
        }
    }

    /// Family of the stored address, `None` while the record is empty.
    pub fn family(&self) -> Option<AddressFamily> {
        self.endpoint().map(|addr| AddressFamily::of(&addr))
    }

    /// Native record size in bytes: 16 for IPv4, 28 for IPv6.
    pub fn size(&self) -> usize {
        self.raw.len() as usize
    }

    /// Convert back to a std endpoint.
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.raw.into_addr()
    }

    #[cfg(test)]
    pub(crate) fn empty() -> Self {
        Self {
            raw: OsSocketAddr::new(),
        }
    }

    /// Copy a native record written by the OS.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `len` bytes.
    pub(crate) unsafe fn copy_from_raw(ptr: *const RawSockAddr, len: socklen_t) -> Self {
        Self {
            raw: OsSocketAddr::copy_from_raw(ptr, len),
        }
    }

    pub(crate) fn as_ptr(&self) -> *const RawSockAddr {
        self.raw.as_ptr()
    }

    pub(crate) fn len(&self) -> socklen_t {
        self.raw.len()
    }

    /// Fill an address through a `getsockname`-like call.
    pub(crate) fn query<F>(f: F) -> Result<SocketAddr>
    where
        F: FnOnce(*mut RawSockAddr, *mut socklen_t) -> i32,
    {
        let mut raw = OsSocketAddr::new();

        let mut len = raw.capacity();

        if f(raw.as_mut_ptr(), &mut len) != 0 {
            return Err(Error::last_os_error());
        }

        raw.into_addr().ok_or_else(|| {
            Error::new(
                ErrorKind::AddrNotAvailable,
                format!("unknown address family, len({})", len),
            )
        })
    }
}

impl From<SocketAddr> for SocketAddress {
    fn from(value: SocketAddr) -> Self {
        Self {
            raw: OsSocketAddr::from(value),
        }
    }
}

impl Debug for SocketAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.endpoint() {
            Some(addr) => write!(f, "SocketAddress({})", addr),
            None => write!(f, "SocketAddress(empty)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    #[test]
    fn test_native_sizes() {
        let v4: SocketAddr = "127.0.0.1:1812".parse().unwrap();
        let v6: SocketAddr = "[::1]:1812".parse().unwrap();

        assert_eq!(SocketAddress::from(v4).size(), 16);
        assert_eq!(SocketAddress::from(v6).size(), 28);

        assert_eq!(AddressFamily::InterNetwork.address_size(), 16);
        assert_eq!(AddressFamily::InterNetworkV6.address_size(), 28);

        assert_eq!(SocketAddress::from(v6).endpoint(), Some(v6));
    }

    #[test]
    fn test_any() {
        let any = SocketAddress::any(AddressFamily::InterNetworkV6);

        assert_eq!(any.family(), Some(AddressFamily::InterNetworkV6));
        assert_eq!(any.endpoint(), Some("[::]:0".parse().unwrap()));

        assert_eq!(SocketAddress::empty().family(), None);
        assert_eq!(SocketAddress::empty().size(), 0);
    }
}
