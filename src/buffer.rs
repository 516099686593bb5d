use std::{
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard},
};

/// Shared, fixed-address byte region handed to send/receive operations.
///
/// Clones share the same memory. The region never moves or resizes, so the socket can
/// keep pointing at it while an operation is in flight. Callers must not touch the
/// contents until the matching completion has been dequeued.
#[derive(Clone, Default)]
pub struct Buffer(Arc<Mutex<Box<[u8]>>>);

impl Buffer {
    /// Create a zero-filled buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        vec![0u8; len].into()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock the region for reading or writing.
    pub fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.0.lock().unwrap()
    }

    /// Copy the contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().to_vec()
    }

    /// Returns true if both handles refer to the same region.
    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Start address of the region, stable for the buffer's lifetime.
    #[cfg_attr(target_family = "unix", allow(dead_code))]
    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.lock().as_mut_ptr()
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(value: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(value.into_boxed_slice())))
    }
}

impl From<&[u8]> for Buffer {
    fn from(value: &[u8]) -> Self {
        value.to_vec().into()
    }
}

impl Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Buffer({:p}, len({}))", Arc::as_ptr(&self.0), self.len())
    }
}

/// Keeps the buffer of the last operation in one direction alive.
///
/// Repinning only happens when a different buffer object is supplied, so a caller that
/// reuses one buffer for every receive pins it once.
#[derive(Debug, Default)]
pub(crate) struct PinnedBuffer {
    buffer: Option<Buffer>,
}

impl PinnedBuffer {
    /// Pin `buffer`, returns false if it was already the pinned one.
    ///
    /// Must not be called while an operation on the pinned buffer is in flight.
    pub fn switch(&mut self, buffer: &Buffer) -> bool {
        if let Some(pinned) = &self.buffer {
            if pinned.ptr_eq(buffer) {
                return false;
            }
        }

        self.buffer = Some(buffer.clone());

        true
    }

    pub fn get(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    pub fn release(&mut self) {
        self.buffer.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_region() {
        let buffer: Buffer = b"hello".as_slice().into();

        let clone = buffer.clone();

        clone.lock()[0] = b'j';

        assert_eq!(buffer.to_vec(), b"jello");
        assert!(buffer.ptr_eq(&clone));
        assert!(!buffer.ptr_eq(&Buffer::new(5)));
        assert_eq!(buffer.as_mut_ptr(), clone.as_mut_ptr());
    }

    #[test]
    fn test_pin_switch() {
        let mut pinned = PinnedBuffer::default();

        let first = Buffer::new(16);

        assert!(pinned.switch(&first));
        assert!(!pinned.switch(&first.clone()));

        let second = Buffer::new(16);

        assert!(pinned.switch(&second));
        assert!(pinned.get().unwrap().ptr_eq(&second));

        pinned.release();

        assert!(pinned.get().is_none());
    }
}
