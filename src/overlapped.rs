//! Per-direction operation context shared by both socket backends.

use std::{
    io::Result,
    sync::atomic::{AtomicU8, Ordering},
};

use crate::{OperationType, SocketError};

const IDLE: u8 = 0;
const PENDING: u8 = 1;
const COMPLETED: u8 = 2;

/// Links one in-flight socket operation to the completion queue.
///
/// Each socket owns two of these, one for accept/receive and one for connect/send, and
/// reuses them for every operation in that direction.
pub(crate) struct Overlapped {
    state: AtomicU8,
    operation: AtomicU8,
    #[cfg(target_family = "windows")]
    native: Box<std::cell::UnsafeCell<NativeOverlapped>>,
}

/// Native descriptor handed to the kernel, the `OVERLAPPED` must stay the first field.
#[cfg(target_family = "windows")]
#[repr(C)]
pub(crate) struct NativeOverlapped {
    pub raw: winapi::um::minwinbase::OVERLAPPED,
    /// Leaked `Arc` of the owning socket while the operation is pending.
    pub owner: *const (),
}

// The native descriptor is only written by the issuing thread before the kernel sees it
// and read back by the single consumer that dequeues its completion.
#[cfg(target_family = "windows")]
unsafe impl Send for Overlapped {}
#[cfg(target_family = "windows")]
unsafe impl Sync for Overlapped {}

impl Overlapped {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            operation: AtomicU8::new(OperationType::Signal as u8),
            #[cfg(target_family = "windows")]
            native: Box::new(std::cell::UnsafeCell::new(NativeOverlapped {
                raw: unsafe { std::mem::zeroed() },
                owner: std::ptr::null(),
            })),
        }
    }

    /// Mark a new operation as in flight.
    ///
    /// Legal from idle or completed, fails with [`SocketError::InvalidState`] while a
    /// previous operation is still pending.
    pub fn start(&self, operation: OperationType) -> Result<()> {
        for from in [IDLE, COMPLETED] {
            if self
                .state
                .compare_exchange(from, PENDING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.operation.store(operation as u8, Ordering::Release);

                return Ok(());
            }
        }

        Err(SocketError::InvalidState.into())
    }

    /// Move pending to completed, returns false if the operation was not pending.
    ///
    /// Only the caller that gets `true` may report the completion.
    pub fn complete(&self) -> bool {
        self.state
            .compare_exchange(PENDING, COMPLETED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[cfg_attr(target_family = "unix", allow(dead_code))]
    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    /// Operation type of the last started operation.
    pub fn operation(&self) -> OperationType {
        OperationType::from_u8(self.operation.load(Ordering::Acquire))
    }

    /// Reset the native descriptor and hand it to the kernel, owned by `owner`.
    ///
    /// # Safety
    ///
    /// The context must have just been started, so no other thread touches the native
    /// descriptor until its completion is dequeued.
    #[cfg(target_family = "windows")]
    pub unsafe fn prepare(&self, owner: *const ()) -> *mut NativeOverlapped {
        let native = self.native.get();

        (*native).raw = std::mem::zeroed();
        (*native).owner = owner;

        native
    }

    /// Returns true if `native` is this context's descriptor.
    #[cfg(target_family = "windows")]
    pub fn owns(&self, native: *const NativeOverlapped) -> bool {
        std::ptr::eq(self.native.get() as *const NativeOverlapped, native)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
    };

    use crate::{OperationType, SocketError};

    use super::Overlapped;

    #[test]
    fn test_state_machine() {
        let overlapped = Overlapped::new();

        assert!(!overlapped.complete());

        overlapped.start(OperationType::Receive).unwrap();

        assert!(overlapped.is_pending());
        assert_eq!(overlapped.operation(), OperationType::Receive);

        let error = overlapped.start(OperationType::Receive).unwrap_err();

        assert_eq!(SocketError::from(&error), SocketError::InvalidState);

        assert!(overlapped.complete());
        assert!(!overlapped.complete());

        overlapped.start(OperationType::Accept).unwrap();

        assert_eq!(overlapped.operation(), OperationType::Accept);
    }

    #[test]
    fn test_complete_once() {
        let overlapped = Arc::new(Overlapped::new());

        overlapped.start(OperationType::Send).unwrap();

        let winners = Arc::new(AtomicUsize::new(0));

        let handles = (0..8)
            .map(|_| {
                let overlapped = overlapped.clone();
                let winners = winners.clone();

                thread::spawn(move || {
                    if overlapped.complete() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
