//! Socket option names, values and their native record layouts.

use std::{
    io::{Error, ErrorKind, Result},
    net::{Ipv4Addr, Ipv6Addr},
};

/// Protocol level an option applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOptionLevel {
    Socket,
    Ip,
    IpV6,
    Tcp,
    Udp,
}

/// Supported option names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOptionName {
    ReuseAddress,
    KeepAlive,
    Broadcast,
    Linger,
    SendBuffer,
    ReceiveBuffer,
    Error,
    Type,
    NoDelay,
    IpTimeToLive,
    MulticastTimeToLive,
    MulticastLoopback,
    AddMembership,
    DropMembership,
    IpV6Only,
}

/// Linger on close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LingerOption {
    pub enabled: bool,
    /// Seconds, must fit in 16 bits.
    pub linger_time: u32,
}

/// IPv4 multicast group membership.
///
/// The interface is chosen by `local_address` when present, otherwise by
/// `interface_index` (0 lets the OS pick).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastOption {
    pub group: Ipv4Addr,
    pub local_address: Option<Ipv4Addr>,
    pub interface_index: u32,
}

/// IPv6 multicast group membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpV6MulticastOption {
    pub group: Ipv6Addr,
    pub interface_index: u32,
}

/// Value of a socket option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketOptionValue {
    Bool(bool),
    Int(i32),
    Bytes(Vec<u8>),
    Linger(LingerOption),
    Multicast(MulticastOption),
    IpV6Multicast(IpV6MulticastOption),
}

impl From<bool> for SocketOptionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for SocketOptionValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<Vec<u8>> for SocketOptionValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<LingerOption> for SocketOptionValue {
    fn from(value: LingerOption) -> Self {
        Self::Linger(value)
    }
}

impl From<MulticastOption> for SocketOptionValue {
    fn from(value: MulticastOption) -> Self {
        Self::Multicast(value)
    }
}

impl From<IpV6MulticastOption> for SocketOptionValue {
    fn from(value: IpV6MulticastOption) -> Self {
        Self::IpV6Multicast(value)
    }
}

#[cfg(target_family = "unix")]
mod sys {
    pub use libc::{
        IPPROTO_IP, IPPROTO_IPV6, IPPROTO_TCP, IPV6_MULTICAST_HOPS, IPV6_MULTICAST_LOOP,
        IPV6_V6ONLY, IP_ADD_MEMBERSHIP, IP_DROP_MEMBERSHIP, IP_MULTICAST_LOOP, IP_MULTICAST_TTL,
        IP_TTL, SOL_SOCKET, SO_BROADCAST, SO_ERROR, SO_KEEPALIVE, SO_LINGER, SO_RCVBUF,
        SO_REUSEADDR, SO_SNDBUF, SO_TYPE, TCP_NODELAY,
    };

    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub use libc::{IPV6_ADD_MEMBERSHIP, IPV6_DROP_MEMBERSHIP};

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub use libc::{IPV6_JOIN_GROUP as IPV6_ADD_MEMBERSHIP, IPV6_LEAVE_GROUP as IPV6_DROP_MEMBERSHIP};
}

#[cfg(target_family = "windows")]
mod sys {
    pub use winapi::shared::ws2def::{
        IPPROTO_IP, SOL_SOCKET, SO_BROADCAST, SO_ERROR, SO_KEEPALIVE, SO_LINGER, SO_RCVBUF,
        SO_REUSEADDR, SO_SNDBUF, SO_TYPE, TCP_NODELAY,
    };
    pub use winapi::shared::ws2ipdef::{
        IPV6_ADD_MEMBERSHIP, IPV6_DROP_MEMBERSHIP, IPV6_MULTICAST_HOPS, IPV6_MULTICAST_LOOP,
        IPV6_V6ONLY, IP_ADD_MEMBERSHIP, IP_DROP_MEMBERSHIP, IP_MULTICAST_LOOP, IP_MULTICAST_TTL,
        IP_TTL,
    };

    pub const IPPROTO_TCP: i32 = winapi::shared::ws2def::IPPROTO_TCP as i32;
    pub const IPPROTO_IPV6: i32 = winapi::shared::ws2def::IPPROTO_IPV6 as i32;
}

/// Resolve a level/name pair to the native `(level, optname)` pair.
pub(crate) fn native_option(
    level: SocketOptionLevel,
    name: SocketOptionName,
) -> Result<(i32, i32)> {
    use sys::*;
    use SocketOptionLevel as L;
    use SocketOptionName as N;

    let native = match (level, name) {
        (L::Socket, N::ReuseAddress) => (SOL_SOCKET, SO_REUSEADDR),
        (L::Socket, N::KeepAlive) => (SOL_SOCKET, SO_KEEPALIVE),
        (L::Socket, N::Broadcast) => (SOL_SOCKET, SO_BROADCAST),
        (L::Socket, N::Linger) => (SOL_SOCKET, SO_LINGER),
        (L::Socket, N::SendBuffer) => (SOL_SOCKET, SO_SNDBUF),
        (L::Socket, N::ReceiveBuffer) => (SOL_SOCKET, SO_RCVBUF),
        (L::Socket, N::Error) => (SOL_SOCKET, SO_ERROR),
        (L::Socket, N::Type) => (SOL_SOCKET, SO_TYPE),
        (L::Tcp, N::NoDelay) => (IPPROTO_TCP, TCP_NODELAY),
        (L::Ip, N::IpTimeToLive) => (IPPROTO_IP, IP_TTL),
        (L::Ip, N::MulticastTimeToLive) => (IPPROTO_IP, IP_MULTICAST_TTL),
        (L::Ip, N::MulticastLoopback) => (IPPROTO_IP, IP_MULTICAST_LOOP),
        (L::Ip, N::AddMembership) => (IPPROTO_IP, IP_ADD_MEMBERSHIP),
        (L::Ip, N::DropMembership) => (IPPROTO_IP, IP_DROP_MEMBERSHIP),
        (L::IpV6, N::IpV6Only) => (IPPROTO_IPV6, IPV6_V6ONLY),
        (L::IpV6, N::MulticastTimeToLive) => (IPPROTO_IPV6, IPV6_MULTICAST_HOPS),
        (L::IpV6, N::MulticastLoopback) => (IPPROTO_IPV6, IPV6_MULTICAST_LOOP),
        (L::IpV6, N::AddMembership) => (IPPROTO_IPV6, IPV6_ADD_MEMBERSHIP),
        (L::IpV6, N::DropMembership) => (IPPROTO_IPV6, IPV6_DROP_MEMBERSHIP),
        (level, name) => {
            return Err(Error::new(
                ErrorKind::Unsupported,
                format!("option {:?} at level {:?}", name, level),
            ))
        }
    };

    Ok(native)
}

/// Encode `value` into the native record `setsockopt` expects for `name`.
pub(crate) fn encode(name: SocketOptionName, value: &SocketOptionValue) -> Result<Vec<u8>> {
    match (name, value) {
        (SocketOptionName::Linger, SocketOptionValue::Linger(linger)) => encode_linger(linger),
        (_, SocketOptionValue::Linger(_)) => Err(mismatch(name, value)),
        (
            SocketOptionName::AddMembership | SocketOptionName::DropMembership,
            SocketOptionValue::Multicast(multicast),
        ) => Ok(encode_multicast(multicast)),
        (
            SocketOptionName::AddMembership | SocketOptionName::DropMembership,
            SocketOptionValue::IpV6Multicast(multicast),
        ) => {
            let mut record = multicast.group.octets().to_vec();

            record.extend_from_slice(&multicast.interface_index.to_ne_bytes());

            Ok(record)
        }
        (_, SocketOptionValue::Multicast(_) | SocketOptionValue::IpV6Multicast(_)) => {
            Err(mismatch(name, value))
        }
        (_, SocketOptionValue::Bool(flag)) => Ok((*flag as i32).to_ne_bytes().to_vec()),
        (_, SocketOptionValue::Int(value)) => Ok(value.to_ne_bytes().to_vec()),
        (_, SocketOptionValue::Bytes(bytes)) => Ok(bytes.clone()),
    }
}

/// Decode the record `getsockopt` returned for `name`.
pub(crate) fn decode(name: SocketOptionName, record: &[u8]) -> Result<SocketOptionValue> {
    match name {
        SocketOptionName::Linger => decode_linger(record),
        SocketOptionName::AddMembership | SocketOptionName::DropMembership => Err(Error::new(
            ErrorKind::Unsupported,
            "multicast membership can't be read back",
        )),
        _ => match record.len() {
            // Some BSD ip level options are single bytes.
            1 => Ok(SocketOptionValue::Int(record[0] as i32)),
            len if len >= 4 => {
                let mut int = [0u8; 4];

                int.copy_from_slice(&record[..4]);

                Ok(SocketOptionValue::Int(i32::from_ne_bytes(int)))
            }
            len => Err(Error::new(
                ErrorKind::InvalidData,
                format!("option {:?} returned {} bytes", name, len),
            )),
        },
    }
}

/// Buffer size big enough for any record [`decode`] understands.
pub(crate) const MAX_RECORD_LEN: usize = 8;

fn mismatch(name: SocketOptionName, value: &SocketOptionValue) -> Error {
    Error::new(
        ErrorKind::InvalidInput,
        format!("option {:?} can't be set to {:?}", name, value),
    )
}

fn encode_linger(linger: &LingerOption) -> Result<Vec<u8>> {
    if linger.linger_time > u16::MAX as u32 {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("linger time({}) out of range 0..=65535", linger.linger_time),
        ));
    }

    let mut record = vec![];

    #[cfg(target_family = "unix")]
    {
        record.extend_from_slice(&(linger.enabled as libc::c_int).to_ne_bytes());
        record.extend_from_slice(&(linger.linger_time as libc::c_int).to_ne_bytes());
    }

    #[cfg(target_family = "windows")]
    {
        record.extend_from_slice(&(linger.enabled as u16).to_ne_bytes());
        record.extend_from_slice(&(linger.linger_time as u16).to_ne_bytes());
    }

    Ok(record)
}

fn decode_linger(record: &[u8]) -> Result<SocketOptionValue> {
    #[cfg(target_family = "unix")]
    let (enabled, linger_time) = {
        if record.len() < 8 {
            return Err(Error::new(ErrorKind::InvalidData, "short linger record"));
        }

        let mut onoff = [0u8; 4];
        let mut time = [0u8; 4];

        onoff.copy_from_slice(&record[..4]);
        time.copy_from_slice(&record[4..8]);

        (i32::from_ne_bytes(onoff) != 0, i32::from_ne_bytes(time) as u32)
    };

    #[cfg(target_family = "windows")]
    let (enabled, linger_time) = {
        if record.len() < 4 {
            return Err(Error::new(ErrorKind::InvalidData, "short linger record"));
        }

        (
            u16::from_ne_bytes([record[0], record[1]]) != 0,
            u16::from_ne_bytes([record[2], record[3]]) as u32,
        )
    };

    Ok(SocketOptionValue::Linger(LingerOption {
        enabled,
        linger_time,
    }))
}

/// Linux takes an `ip_mreqn`, so the interface index can be passed directly.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn encode_multicast(multicast: &MulticastOption) -> Vec<u8> {
    let mut record = multicast.group.octets().to_vec();

    record.extend_from_slice(
        &multicast
            .local_address
            .unwrap_or(Ipv4Addr::UNSPECIFIED)
            .octets(),
    );

    record.extend_from_slice(&(multicast.interface_index as i32).to_ne_bytes());

    record
}

/// Windows reads an interface index from `imr_interface` when it is in `0.0.0.0/8`.
#[cfg(target_family = "windows")]
fn encode_multicast(multicast: &MulticastOption) -> Vec<u8> {
    let mut record = multicast.group.octets().to_vec();

    let interface = multicast
        .local_address
        .unwrap_or_else(|| Ipv4Addr::from(multicast.interface_index));

    record.extend_from_slice(&interface.octets());

    record
}

/// Plain `ip_mreq`, the index can't be expressed so only the local address is used.
#[cfg(all(
    target_family = "unix",
    not(any(target_os = "linux", target_os = "android"))
))]
fn encode_multicast(multicast: &MulticastOption) -> Vec<u8> {
    let mut record = multicast.group.octets().to_vec();

    record.extend_from_slice(
        &multicast
            .local_address
            .unwrap_or(Ipv4Addr::UNSPECIFIED)
            .octets(),
    );

    record
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use super::*;

    #[test]
    fn test_linger_range() {
        let linger = LingerOption {
            enabled: true,
            linger_time: 65536,
        };

        let error = encode(SocketOptionName::Linger, &linger.into()).unwrap_err();

        assert_eq!(error.kind(), ErrorKind::InvalidInput);

        let linger = LingerOption {
            enabled: true,
            linger_time: 65535,
        };

        let record = encode(SocketOptionName::Linger, &linger.into()).unwrap();

        assert_eq!(
            decode(SocketOptionName::Linger, &record).unwrap(),
            SocketOptionValue::Linger(linger)
        );
    }

    #[test]
    fn test_value_mismatch() {
        let linger = LingerOption {
            enabled: false,
            linger_time: 0,
        };

        assert!(encode(SocketOptionName::NoDelay, &linger.into()).is_err());

        let multicast = MulticastOption {
            group: Ipv4Addr::new(239, 0, 0, 1),
            local_address: None,
            interface_index: 0,
        };

        assert!(encode(SocketOptionName::Broadcast, &multicast.into()).is_err());

        let record = encode(SocketOptionName::AddMembership, &multicast.into()).unwrap();

        assert_eq!(&record[..4], &[239, 0, 0, 1]);
    }

    #[test]
    fn test_native_pairs() {
        assert!(native_option(SocketOptionLevel::Tcp, SocketOptionName::NoDelay).is_ok());

        let error =
            native_option(SocketOptionLevel::Udp, SocketOptionName::NoDelay).unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_decode_int() {
        assert_eq!(
            decode(SocketOptionName::ReceiveBuffer, &4096i32.to_ne_bytes()).unwrap(),
            SocketOptionValue::Int(4096)
        );

        assert_eq!(
            decode(SocketOptionName::MulticastTimeToLive, &[7]).unwrap(),
            SocketOptionValue::Int(7)
        );

        assert!(decode(SocketOptionName::AddMembership, &[0; 8]).is_err());
    }
}
