use std::{io::ErrorKind, net::Ipv4Addr};

use asyncio::*;

#[test]
fn test_linger() {
    _ = pretty_env_logger::try_init();

    let socket = AsyncSocket::create_ipv4_tcp().unwrap();

    socket
        .set_socket_option(
            SocketOptionLevel::Socket,
            SocketOptionName::Linger,
            LingerOption {
                enabled: true,
                linger_time: 5,
            },
        )
        .unwrap();

    assert_eq!(
        socket
            .get_socket_option(SocketOptionLevel::Socket, SocketOptionName::Linger)
            .unwrap(),
        SocketOptionValue::Linger(LingerOption {
            enabled: true,
            linger_time: 5,
        })
    );

    let error = socket
        .set_socket_option(
            SocketOptionLevel::Socket,
            SocketOptionName::Linger,
            LingerOption {
                enabled: true,
                linger_time: 70_000,
            },
        )
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::InvalidInput);

    socket.dispose();
}

#[test]
fn test_int_options() {
    _ = pretty_env_logger::try_init();

    let socket = AsyncSocket::create_ipv4_tcp().unwrap();

    socket
        .set_socket_option(SocketOptionLevel::Tcp, SocketOptionName::NoDelay, true)
        .unwrap();

    assert_ne!(
        socket
            .get_socket_option(SocketOptionLevel::Tcp, SocketOptionName::NoDelay)
            .unwrap(),
        SocketOptionValue::Int(0)
    );

    socket
        .set_socket_option(SocketOptionLevel::Ip, SocketOptionName::IpTimeToLive, 32)
        .unwrap();

    assert_eq!(
        socket
            .get_socket_option(SocketOptionLevel::Ip, SocketOptionName::IpTimeToLive)
            .unwrap(),
        SocketOptionValue::Int(32)
    );

    socket
        .set_socket_option(
            SocketOptionLevel::Socket,
            SocketOptionName::ReuseAddress,
            true,
        )
        .unwrap();

    let record = socket
        .get_socket_option_bytes(SocketOptionLevel::Socket, SocketOptionName::ReuseAddress, 4)
        .unwrap();

    assert_eq!(record.len(), 4);
    assert_ne!(record, vec![0u8; 4]);

    socket.dispose();
}

#[test]
fn test_unsupported_pairs() {
    _ = pretty_env_logger::try_init();

    let socket = AsyncSocket::create_ipv4_tcp().unwrap();

    let error = socket
        .set_socket_option(SocketOptionLevel::Udp, SocketOptionName::NoDelay, true)
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Unsupported);

    let error = socket
        .set_socket_option(
            SocketOptionLevel::Socket,
            SocketOptionName::KeepAlive,
            MulticastOption {
                group: Ipv4Addr::new(239, 0, 0, 1),
                local_address: None,
                interface_index: 0,
            },
        )
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::InvalidInput);

    let error = socket
        .get_socket_option(SocketOptionLevel::Ip, SocketOptionName::AddMembership)
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Unsupported);

    socket.dispose();

    let error = socket
        .get_socket_option(SocketOptionLevel::Socket, SocketOptionName::KeepAlive)
        .unwrap_err();

    assert_eq!(SocketError::from(&error), SocketError::Disposed);
}

#[test]
fn test_multicast_membership() {
    _ = pretty_env_logger::try_init();

    let socket = AsyncSocket::create(
        AddressFamily::InterNetwork,
        SocketType::Dgram,
        ProtocolType::Udp,
    )
    .unwrap();

    socket.bind("0.0.0.0:0".parse().unwrap()).unwrap();

    let membership = MulticastOption {
        group: Ipv4Addr::new(239, 255, 0, 1),
        local_address: Some(Ipv4Addr::LOCALHOST),
        interface_index: 0,
    };

    // Hosts without a multicast capable loopback refuse the join.
    if socket
        .set_socket_option(
            SocketOptionLevel::Ip,
            SocketOptionName::AddMembership,
            membership,
        )
        .is_ok()
    {
        socket
            .set_socket_option(
                SocketOptionLevel::Ip,
                SocketOptionName::DropMembership,
                membership,
            )
            .unwrap();
    }

    socket.dispose();
}
