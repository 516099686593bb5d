use std::{
    io::ErrorKind,
    net::SocketAddr,
    thread::{sleep, spawn},
    time::Duration,
};

use asyncio::*;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

fn wait_for(port: &CompletionPort, count: usize) -> Vec<CompletionStatus> {
    let mut statuses = vec![];

    while statuses.len() < count {
        let mut batch = port.dequeue_many(TIMEOUT, count - statuses.len()).unwrap();

        assert!(!batch.is_empty(), "dequeue timeout");

        statuses.append(&mut batch);
    }

    statuses
}

fn listen(port: &CompletionPort) -> (AsyncSocket, SocketAddr) {
    let listener = AsyncSocket::create_ipv4_tcp().unwrap();

    port.associate(&listener, Token(1)).unwrap();

    listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.listen(16).unwrap();

    let addr = listener.local_endpoint().unwrap();

    (listener, addr)
}

/// Returns (listener, server side, client side).
fn connect_pair(port: &CompletionPort) -> (AsyncSocket, AsyncSocket, AsyncSocket) {
    let (listener, addr) = listen(port);

    listener.accept().unwrap();

    let client = AsyncSocket::create_ipv4_tcp().unwrap();

    port.associate(&client, Token(2)).unwrap();

    client.connect(addr).unwrap();

    for status in wait_for(port, 2) {
        assert_eq!(status.socket_error(), SocketError::Success);

        match status.operation_type() {
            OperationType::Accept => {
                assert_eq!(status.socket(), Some(&listener));
                assert_eq!(status.token(), Token(1));
            }
            OperationType::Connect => {
                assert_eq!(status.socket(), Some(&client));
                assert_eq!(status.token(), Token(2));
            }
            operation => panic!("unexpected {:?}", operation),
        }
    }

    let server = listener.get_accepted_socket().unwrap();

    assert!(listener.get_accepted_socket().is_none());

    port.associate(&server, Token(3)).unwrap();

    (listener, server, client)
}

#[test]
fn test_endpoints() {
    _ = pretty_env_logger::try_init();

    let port = CompletionPort::create().unwrap();

    let (listener, server, client) = connect_pair(&port);

    assert_eq!(server.local_endpoint().unwrap(), client.remote_endpoint().unwrap());
    assert_eq!(server.remote_endpoint().unwrap(), client.local_endpoint().unwrap());
    assert_eq!(
        listener.local_endpoint().unwrap(),
        client.remote_endpoint().unwrap()
    );

    assert_eq!(server.family(), AddressFamily::InterNetwork);
    assert_eq!(server.socket_type(), SocketType::Stream);

    for socket in [listener, server, client] {
        socket.dispose();
    }
}

#[test]
fn test_echo() {
    _ = pretty_env_logger::try_init();

    let port = CompletionPort::create().unwrap();

    let (listener, server, client) = connect_pair(&port);

    let inbound = Buffer::new(32);

    server.receive(&inbound).unwrap();

    client.send(&Buffer::from(&b"hello world"[..])).unwrap();

    let mut received = 0;

    while received < 11 {
        for status in wait_for(&port, 1) {
            assert_eq!(status.socket_error(), SocketError::Success);

            match status.operation_type() {
                OperationType::Send => assert_eq!(status.bytes_transferred(), 11),
                OperationType::Receive => {
                    received += status.bytes_transferred();

                    if received < 11 {
                        server
                            .receive_with(&inbound, received, 32 - received, MessageFlags::NONE)
                            .unwrap();
                    }
                }
                operation => panic!("unexpected {:?}", operation),
            }
        }
    }

    assert_eq!(&inbound.to_vec()[..11], b"hello world");

    for socket in [listener, server, client] {
        socket.dispose();
    }
}

#[test]
fn test_bulk_transfer() {
    _ = pretty_env_logger::try_init();

    const LEN: usize = 1024 * 1024;

    let port = std::sync::Arc::new(CompletionPort::create().unwrap());

    let (listener, server, client) = connect_pair(&port);

    let outbound: Buffer = (0..LEN).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();

    let inbound = Buffer::new(LEN);

    let worker = {
        let port = port.clone();
        let server = server.clone();
        let client = client.clone();
        let outbound = outbound.clone();
        let inbound = inbound.clone();

        spawn(move || {
            let mut sent = 0;
            let mut received = 0;

            loop {
                for status in port.dequeue_many(None, 16).unwrap() {
                    assert_eq!(status.socket_error(), SocketError::Success);

                    match status.operation_type() {
                        OperationType::Signal => return (sent, received),
                        OperationType::Send => {
                            sent += status.bytes_transferred();

                            if sent < LEN {
                                client
                                    .send_with(&outbound, sent, LEN - sent, MessageFlags::NONE)
                                    .unwrap();
                            }

                            if sent == LEN && received == LEN {
                                port.signal(Token(99)).unwrap();
                            }
                        }
                        OperationType::Receive => {
                            assert_ne!(status.bytes_transferred(), 0);

                            received += status.bytes_transferred();

                            if received < LEN {
                                server
                                    .receive_with(
                                        &inbound,
                                        received,
                                        LEN - received,
                                        MessageFlags::NONE,
                                    )
                                    .unwrap();
                            }

                            if sent == LEN && received == LEN {
                                port.signal(Token(99)).unwrap();
                            }
                        }
                        operation => panic!("unexpected {:?}", operation),
                    }
                }
            }
        })
    };

    server.receive(&inbound).unwrap();
    client.send(&outbound).unwrap();

    let (sent, received) = worker.join().unwrap();

    assert_eq!(sent, LEN);
    assert_eq!(received, LEN);
    assert_eq!(inbound.to_vec(), outbound.to_vec());

    for socket in [listener, server, client] {
        socket.dispose();
    }
}

#[test]
fn test_send_completes_whole_range() {
    _ = pretty_env_logger::try_init();

    const LEN: usize = 32 * 1024 * 1024;

    let port = CompletionPort::create().unwrap();

    let (listener, server, client) = connect_pair(&port);

    let outbound: Buffer = (0..LEN).map(|i| (i % 241) as u8).collect::<Vec<_>>().into();

    client.send(&outbound).unwrap();

    // Nobody reads yet, the socket buffers cannot take the whole range.
    #[cfg(target_family = "unix")]
    assert!(port.dequeue_one(Some(Duration::from_millis(200))).is_err());

    let inbound = Buffer::new(LEN);

    server.receive(&inbound).unwrap();

    let mut sent = None;
    let mut received = 0;

    while sent.is_none() || received < LEN {
        let status = port.dequeue_one(TIMEOUT).unwrap();

        assert_eq!(status.socket_error(), SocketError::Success);

        match status.operation_type() {
            OperationType::Send => {
                assert!(sent.is_none());

                sent = Some(status.bytes_transferred());
            }
            OperationType::Receive => {
                assert_ne!(status.bytes_transferred(), 0);

                received += status.bytes_transferred();

                if received < LEN {
                    server
                        .receive_with(&inbound, received, LEN - received, MessageFlags::NONE)
                        .unwrap();
                }
            }
            operation => panic!("unexpected {:?}", operation),
        }
    }

    assert_eq!(sent, Some(LEN));
    assert_eq!(inbound.to_vec(), outbound.to_vec());

    for socket in [listener, server, client] {
        socket.dispose();
    }
}

#[test]
fn test_dropped_socket_still_completes() {
    _ = pretty_env_logger::try_init();

    let port = CompletionPort::create().unwrap();

    let (listener, server, client) = connect_pair(&port);

    let inbound = Buffer::new(16);

    server.receive(&inbound).unwrap();

    drop(server);

    client.send(&Buffer::from(&b"hello"[..])).unwrap();

    let mut receive = None;

    for status in wait_for(&port, 2) {
        assert_eq!(status.socket_error(), SocketError::Success);

        match status.operation_type() {
            OperationType::Send => assert_eq!(status.socket(), Some(&client)),
            OperationType::Receive => receive = Some(status),
            operation => panic!("unexpected {:?}", operation),
        }
    }

    let receive = receive.unwrap();

    assert_eq!(receive.token(), Token(3));
    assert_eq!(receive.bytes_transferred(), 5);
    assert_eq!(&inbound.to_vec()[..5], b"hello");

    receive.socket().unwrap().dispose();

    listener.dispose();
    client.dispose();
}

#[test]
fn test_peer_close() {
    _ = pretty_env_logger::try_init();

    let port = CompletionPort::create().unwrap();

    let (listener, server, client) = connect_pair(&port);

    client.dispose();

    server.receive(&Buffer::new(16)).unwrap();

    let status = port.dequeue_one(TIMEOUT).unwrap();

    assert_eq!(status.operation_type(), OperationType::Receive);
    assert_eq!(status.socket_error(), SocketError::Success);
    assert_eq!(status.bytes_transferred(), 0);

    listener.dispose();
    server.dispose();
}

#[test]
fn test_dispose_pending_receive() {
    _ = pretty_env_logger::try_init();

    let port = CompletionPort::create().unwrap();

    let (listener, server, client) = connect_pair(&port);

    server.receive(&Buffer::new(16)).unwrap();

    assert!(port.dequeue_one(Some(Duration::from_millis(100))).is_err());

    server.dispose();

    let status = port.dequeue_one(TIMEOUT).unwrap();

    assert_eq!(status.operation_type(), OperationType::Receive);
    assert_eq!(status.socket_error(), SocketError::OperationAborted);
    assert_eq!(status.socket(), Some(&server));

    let error = server.receive(&Buffer::new(16)).unwrap_err();

    assert_eq!(SocketError::from(&error), SocketError::Disposed);

    let error = server.local_endpoint().unwrap_err();

    assert_eq!(SocketError::from(&error), SocketError::Disposed);

    let mut output = [0u8; 4];

    let error = server
        .io_control(IoControlCode::BytesAvailable, &[], &mut output)
        .unwrap_err();

    assert_eq!(SocketError::from(&error), SocketError::Disposed);

    listener.dispose();
    client.dispose();
}

#[test]
fn test_one_operation_per_direction() {
    _ = pretty_env_logger::try_init();

    let port = CompletionPort::create().unwrap();

    let (listener, server, client) = connect_pair(&port);

    server.receive(&Buffer::new(16)).unwrap();

    let error = server.receive(&Buffer::new(16)).unwrap_err();

    assert_eq!(SocketError::from(&error), SocketError::InvalidState);

    // The outbound direction is independent.
    server.send(&Buffer::from(&b"ping"[..])).unwrap();

    let status = port.dequeue_one(TIMEOUT).unwrap();

    assert_eq!(status.operation_type(), OperationType::Send);
    assert_eq!(status.socket(), Some(&server));

    let error = server
        .send_with(&Buffer::new(4), 2, 4, MessageFlags::NONE)
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::InvalidInput);

    for socket in [listener, server, client] {
        socket.dispose();
    }
}

#[test]
fn test_not_associated() {
    _ = pretty_env_logger::try_init();

    let socket = AsyncSocket::create_ipv4_tcp().unwrap();

    let error = socket
        .connect("127.0.0.1:1812".parse().unwrap())
        .unwrap_err();

    assert_eq!(SocketError::from(&error), SocketError::InvalidState);

    let error = socket.receive(&Buffer::new(4)).unwrap_err();

    assert_eq!(SocketError::from(&error), SocketError::InvalidState);

    let port = CompletionPort::create().unwrap();

    port.associate(&socket, Token(1)).unwrap();

    // Listen requires a bound socket.
    let error = socket.listen(16).unwrap_err();

    assert_eq!(SocketError::from(&error), SocketError::InvalidState);

    let error = socket.accept().unwrap_err();

    assert_eq!(SocketError::from(&error), SocketError::InvalidState);

    socket.dispose();
}

#[test]
fn test_accept_into() {
    _ = pretty_env_logger::try_init();

    let port = CompletionPort::create().unwrap();

    let (listener, addr) = listen(&port);

    let error = listener.accept_into(&listener).unwrap_err();

    assert_eq!(error.kind(), ErrorKind::InvalidInput);

    let target = AsyncSocket::create_ipv4_tcp().unwrap();

    listener.accept_into(&target).unwrap();

    let client = AsyncSocket::create_ipv4_tcp().unwrap();

    port.associate(&client, Token(2)).unwrap();

    client.connect(addr).unwrap();

    for status in wait_for(&port, 2) {
        assert_eq!(status.socket_error(), SocketError::Success);
    }

    assert_eq!(listener.get_accepted_socket(), Some(target.clone()));

    assert_eq!(
        target.remote_endpoint().unwrap(),
        client.local_endpoint().unwrap()
    );

    port.associate(&target, Token(3)).unwrap();

    target.send(&Buffer::from(&b"hello"[..])).unwrap();

    let inbound = Buffer::new(5);

    client.receive(&inbound).unwrap();

    for status in wait_for(&port, 2) {
        assert_eq!(status.socket_error(), SocketError::Success);
        assert!(status.bytes_transferred() > 0);
    }

    for socket in [listener, target, client] {
        socket.dispose();
    }
}

#[test]
fn test_connect_host() {
    _ = pretty_env_logger::try_init();

    let port = CompletionPort::create().unwrap();

    let (listener, addr) = listen(&port);

    listener.accept().unwrap();

    let client = AsyncSocket::create_ipv4_tcp().unwrap();

    port.associate(&client, Token(2)).unwrap();

    client.connect_host("localhost", addr.port()).unwrap();

    for status in wait_for(&port, 2) {
        assert_eq!(status.socket_error(), SocketError::Success);
    }

    assert_eq!(client.remote_endpoint().unwrap(), addr);

    let accepted = listener.get_accepted_socket().unwrap();

    for socket in [listener, accepted, client] {
        socket.dispose();
    }
}

#[test]
fn test_connection_refused() {
    _ = pretty_env_logger::try_init();

    let port = CompletionPort::create().unwrap();

    // Reserve a port, then close it so nothing listens there.
    let addr = {
        let (listener, addr) = listen(&port);

        listener.dispose();

        addr
    };

    let client = AsyncSocket::create_ipv4_tcp().unwrap();

    port.associate(&client, Token(2)).unwrap();

    match client.connect(addr) {
        Ok(_) => {
            let status = port.dequeue_one(TIMEOUT).unwrap();

            assert_eq!(status.operation_type(), OperationType::Connect);
            assert_eq!(status.socket_error(), SocketError::ConnectionRefused);
        }
        Err(err) => assert_eq!(SocketError::from(&err), SocketError::ConnectionRefused),
    }

    client.dispose();
}

#[test]
fn test_io_control() {
    _ = pretty_env_logger::try_init();

    let port = CompletionPort::create().unwrap();

    let (listener, server, client) = connect_pair(&port);

    client.send(&Buffer::from(&b"hello world"[..])).unwrap();

    let status = port.dequeue_one(TIMEOUT).unwrap();

    assert_eq!(status.operation_type(), OperationType::Send);

    sleep(Duration::from_millis(100));

    let mut output = [0u8; 4];

    server
        .io_control(IoControlCode::BytesAvailable, &[], &mut output)
        .unwrap();

    assert_eq!(u32::from_ne_bytes(output), 11);

    let keep_alive = KeepAliveValues {
        enabled: true,
        time_ms: 30_000,
        interval_ms: 5_000,
    };

    server
        .io_control(IoControlCode::KeepAliveValues, &keep_alive.to_bytes(), &mut [])
        .unwrap();

    assert_ne!(
        server
            .get_socket_option(SocketOptionLevel::Socket, SocketOptionName::KeepAlive)
            .unwrap(),
        SocketOptionValue::Int(0)
    );

    let error = server
        .io_control(IoControlCode::KeepAliveValues, &[1, 0, 0, 0], &mut [])
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::InvalidInput);

    for socket in [listener, server, client] {
        socket.dispose();
    }
}
