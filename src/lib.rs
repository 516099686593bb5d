//! Completion port programming model for asynchronous sockets.
//!
//! Every socket operation is fire-and-forget: it either fails at the call site or
//! produces exactly one [`CompletionStatus`] that any number of worker threads can pull
//! from a shared [`CompletionPort`]. Windows maps this directly onto I/O completion
//! ports, unix platforms emulate it with an epoll/kqueue reactor thread.
//!
//! ```no_run
//! use asyncio::*;
//!
//! let port = CompletionPort::create().unwrap();
//!
//! let listener = AsyncSocket::create_ipv4_tcp().unwrap();
//!
//! port.associate(&listener, Token(1)).unwrap();
//!
//! listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
//! listener.listen(128).unwrap();
//! listener.accept().unwrap();
//!
//! let status = port.dequeue_one(None).unwrap();
//!
//! assert_eq!(status.operation_type(), OperationType::Accept);
//! ```

mod addr;
mod buffer;
mod error;
mod options;
mod overlapped;
#[cfg(target_family = "unix")]
mod poller;
mod port;
mod socket;

pub use addr::*;
pub use buffer::*;
pub use error::*;
pub use options::*;
pub use port::*;
pub use socket::*;

/// One-time initialization of the socket subsystem.
///
/// Runs `WSAStartup` on windows and is a no-op everywhere else. Ports and sockets call it
/// implicitly, calling it again is harmless.
#[cfg(target_family = "windows")]
pub fn init() -> std::io::Result<()> {
    use once_cell::sync::OnceCell;
    use winapi::um::winsock2::{WSAStartup, WSADATA};

    static WSA_STARTUP: OnceCell<()> = OnceCell::new();

    WSA_STARTUP
        .get_or_try_init(|| unsafe {
            let mut wsa_data: WSADATA = std::mem::zeroed();

            let error = WSAStartup(2 << 8 | 2, &mut wsa_data);

            if error != 0 {
                return Err(std::io::Error::from_raw_os_error(error));
            }

            log::trace!("WSAStartup success");

            Ok(())
        })
        .map(|_| ())
}

/// One-time initialization of the socket subsystem.
///
/// Runs `WSAStartup` on windows and is a no-op everywhere else. Ports and sockets call it
/// implicitly, calling it again is harmless.
#[cfg(target_family = "unix")]
pub fn init() -> std::io::Result<()> {
    Ok(())
}
