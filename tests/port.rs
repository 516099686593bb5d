use std::{
    io::ErrorKind,
    sync::{mpsc, Arc},
    thread::spawn,
    time::Duration,
};

use asyncio::*;

#[test]
fn test_signal() {
    _ = pretty_env_logger::try_init();

    let port = CompletionPort::create().unwrap();

    port.signal(Token(42)).unwrap();

    let status = port.dequeue_one(Some(Duration::from_secs(1))).unwrap();

    assert_eq!(status.operation_type(), OperationType::Signal);
    assert_eq!(status.token(), Token(42));
    assert_eq!(status.socket_error(), SocketError::Success);
    assert_eq!(status.bytes_transferred(), 0);
    assert!(status.socket().is_none());

    let error = port
        .dequeue_one(Some(Duration::from_millis(50)))
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::TimedOut);
}

#[test]
fn test_signal_wakes_one_consumer() {
    _ = pretty_env_logger::try_init();

    let port = Arc::new(CompletionPort::create().unwrap());

    let (sender, receiver) = mpsc::channel();

    let consumers = (0..4)
        .map(|_| {
            let port = port.clone();
            let sender = sender.clone();

            spawn(move || {
                if let Ok(status) = port.dequeue_one(Some(Duration::from_millis(500))) {
                    sender.send(status.token()).unwrap();
                }
            })
        })
        .collect::<Vec<_>>();

    port.signal(Token(7)).unwrap();

    for consumer in consumers {
        consumer.join().unwrap();
    }

    drop(sender);

    assert_eq!(receiver.iter().collect::<Vec<_>>(), vec![Token(7)]);
}

#[test]
fn test_signal_wakes_one_batch_consumer() {
    _ = pretty_env_logger::try_init();

    let port = Arc::new(CompletionPort::create().unwrap());

    let consumers = (0..4)
        .map(|_| {
            let port = port.clone();

            spawn(move || port.dequeue_many(None, 8))
        })
        .collect::<Vec<_>>();

    std::thread::sleep(Duration::from_millis(100));

    port.signal(Token(11)).unwrap();

    std::thread::sleep(Duration::from_millis(200));

    // Releases the consumers that got nothing.
    port.dispose();

    let mut batches = vec![];

    for consumer in consumers {
        match consumer.join().unwrap() {
            Ok(batch) => batches.push(batch),
            Err(err) => assert_eq!(SocketError::from(&err), SocketError::Disposed),
        }
    }

    assert_eq!(batches.len(), 1);

    assert_eq!(
        batches[0]
            .iter()
            .map(|status| (status.operation_type(), status.token()))
            .collect::<Vec<_>>(),
        vec![(OperationType::Signal, Token(11))]
    );
}

#[test]
fn test_dequeue_many() {
    _ = pretty_env_logger::try_init();

    let port = CompletionPort::create().unwrap();

    assert!(port
        .dequeue_many(Some(Duration::ZERO), 8)
        .unwrap()
        .is_empty());

    assert_eq!(
        port.dequeue_many(None, 0).unwrap_err().kind(),
        ErrorKind::InvalidInput
    );

    for i in 0..5 {
        port.signal(Token(i)).unwrap();
    }

    let batch = port.dequeue_many(None, 3).unwrap();

    assert_eq!(
        batch.iter().map(|status| status.token()).collect::<Vec<_>>(),
        vec![Token(0), Token(1), Token(2)]
    );

    let batch = port.dequeue_many(None, 8).unwrap();

    assert_eq!(batch.len(), 2);
}

#[test]
fn test_dispose_wakes_consumers() {
    _ = pretty_env_logger::try_init();

    let port = Arc::new(CompletionPort::create().unwrap());

    let consumer = {
        let port = port.clone();

        spawn(move || port.dequeue_one(None))
    };

    std::thread::sleep(Duration::from_millis(100));

    port.dispose();
    port.dispose();

    assert!(port.is_disposed());

    let error = consumer.join().unwrap().unwrap_err();

    assert_eq!(SocketError::from(&error), SocketError::Disposed);

    let error = port.signal(Token(1)).unwrap_err();

    assert_eq!(SocketError::from(&error), SocketError::Disposed);
}

#[test]
fn test_associate_twice() {
    _ = pretty_env_logger::try_init();

    let port = CompletionPort::create().unwrap();

    let other = CompletionPort::create().unwrap();

    let socket = AsyncSocket::create_ipv4_tcp().unwrap();

    port.associate(&socket, Token(1)).unwrap();
    port.associate(&socket, Token(1)).unwrap();

    let error = port.associate(&socket, Token(2)).unwrap_err();

    assert_eq!(SocketError::from(&error), SocketError::InvalidState);

    let error = other.associate(&socket, Token(1)).unwrap_err();

    assert_eq!(SocketError::from(&error), SocketError::InvalidState);

    socket.dispose();

    let disposed = AsyncSocket::create_ipv4_tcp().unwrap();

    disposed.dispose();

    let error = port.associate(&disposed, Token(3)).unwrap_err();

    assert_eq!(SocketError::from(&error), SocketError::Disposed);
}
