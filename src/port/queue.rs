use std::{
    collections::VecDeque,
    io::{Error, ErrorKind, Result},
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

use crate::SocketError;

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Multi-consumer blocking queue emulating the kernel completion queue.
#[derive(Debug)]
pub(crate) struct CompletionQueue<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
}

impl<T> CompletionQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Append an item and wake one consumer, returns false once closed.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if inner.closed {
            return false;
        }

        inner.items.push_back(item);

        drop(inner);

        self.ready.notify_one();

        true
    }

    /// Take up to `max` items, waiting while the queue is empty.
    ///
    /// `None` waits forever. Returns an empty batch on timeout and fails with
    /// [`SocketError::Disposed`] once closed.
    pub fn pop(&self, timeout: Option<Duration>, max: usize) -> Result<Vec<T>> {
        if max == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "max must be positive"));
        }

        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));

        let mut inner = self.inner.lock().unwrap();

        loop {
            if inner.closed {
                return Err(SocketError::Disposed.into());
            }

            if !inner.items.is_empty() {
                let count = max.min(inner.items.len());

                let batch = inner.items.drain(..count).collect::<Vec<_>>();

                let more = !inner.items.is_empty();

                drop(inner);

                // Hand the rest to another waiter.
                if more {
                    self.ready.notify_one();
                }

                return Ok(batch);
            }

            inner = match (timeout, deadline) {
                (None, _) => self.ready.wait(inner).unwrap(),
                // Timeout too large to represent, wait forever.
                (Some(_), None) => self.ready.wait(inner).unwrap(),
                (Some(_), Some(deadline)) => {
                    let now = Instant::now();

                    if now >= deadline {
                        return Ok(vec![]);
                    }

                    self.ready.wait_timeout(inner, deadline - now).unwrap().0
                }
            };
        }
    }

    /// Reject further pushes, wake every waiter and drop queued items.
    pub fn close(&self) -> Vec<T> {
        let mut inner = self.inner.lock().unwrap();

        inner.closed = true;

        let items = inner.items.drain(..).collect();

        drop(inner);

        self.ready.notify_all();

        items
    }
}
