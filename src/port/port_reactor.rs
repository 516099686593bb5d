use std::{
    collections::HashMap,
    io::Result,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    poller::{Event, Events, SysPoller, NOTIFY_KEY},
    socket::Socket,
    AsyncSocket, CompletionStatus, SocketError,
};

use super::{queue::CompletionQueue, PortBackend, PortConfig, Token};

/// State shared by the port handle, its reactor thread and associated sockets.
#[derive(Debug)]
pub(crate) struct PortShared {
    queue: CompletionQueue<CompletionStatus>,
    poller: SysPoller,
    sockets: Mutex<HashMap<u64, Weak<Socket>>>,
    next_key: AtomicU64,
    disposed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PortShared {
    /// Queue a completion, dropped with a log once the port is disposed.
    pub(crate) fn post(&self, status: CompletionStatus) {
        let operation = status.operation_type();

        if !self.queue.push(status) {
            log::debug!(target:"reactor", "port disposed, drop {:?} completion", operation);
        }
    }

    /// Watch `socket` for readiness, returning its registration key.
    pub(crate) fn register(&self, socket: &Arc<Socket>) -> Result<u64> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);

        self.sockets
            .lock()
            .unwrap()
            .insert(key, Arc::downgrade(socket));

        if let Err(err) = self.poller.add(socket.raw_fd(), key) {
            self.sockets.lock().unwrap().remove(&key);
            return Err(err);
        }

        Ok(key)
    }

    /// Register a replacement descriptor under an existing key.
    pub(crate) fn reregister(&self, fd: i32, key: u64) -> Result<()> {
        self.poller.add(fd, key)
    }

    pub(crate) fn deregister(&self, key: u64, fd: i32) {
        self.forget(key);

        if let Err(err) = self.poller.delete(fd) {
            log::trace!(target:"reactor", "fd({}) deregister, {}", fd, err);
        }
    }

    /// Drop the key of a socket whose descriptor is already gone.
    pub(crate) fn forget(&self, key: u64) {
        self.sockets.lock().unwrap().remove(&key);
    }

    fn dispatch(&self, events: &[Event]) {
        for event in events {
            if event.key == NOTIFY_KEY {
                continue;
            }

            let socket = self
                .sockets
                .lock()
                .unwrap()
                .get(&event.key)
                .and_then(Weak::upgrade);

            match socket {
                Some(socket) => socket.on_ready(event.readable, event.writable),
                None => {
                    log::trace!(target:"reactor", "key({}) raised without socket", event.key)
                }
            }
        }
    }

    fn run(self: Arc<Self>, capacity: usize) {
        log::debug!(target:"reactor", "reactor thread started");

        let mut events = Events::with_capacity(capacity);

        while !self.disposed.load(Ordering::Acquire) {
            if let Err(err) = self.poller.wait(&mut events, None) {
                log::error!(target:"reactor", "poll error, {}", err);

                thread::sleep(Duration::from_millis(10));

                continue;
            }

            if self.disposed.load(Ordering::Acquire) {
                break;
            }

            self.dispatch(events.ready());
        }

        log::debug!(target:"reactor", "reactor thread stopped");
    }
}

/// Completion port emulated on a readiness poller.
///
/// A dedicated thread waits on the poller and finishes parked socket operations, pushing
/// their results into an in-process queue consumers block on.
#[derive(Debug)]
pub(crate) struct Port {
    shared: Arc<PortShared>,
}

impl PortBackend for Port {
    fn create(config: &PortConfig) -> Result<Self> {
        let shared = Arc::new(PortShared {
            queue: CompletionQueue::new(),
            poller: SysPoller::new()?,
            sockets: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            worker: Mutex::new(None),
        });

        let capacity = config.events_capacity.max(1);

        let worker = {
            let shared = shared.clone();

            thread::Builder::new()
                .name("asyncio-reactor".into())
                .spawn(move || shared.run(capacity))?
        };

        *shared.worker.lock().unwrap() = Some(worker);

        Ok(Self { shared })
    }

    fn associate(&self, socket: &AsyncSocket, token: Token) -> Result<()> {
        socket.inner().attach(&self.shared, token)
    }

    fn dequeue(&self, timeout: Option<Duration>, max: usize) -> Result<Vec<CompletionStatus>> {
        self.shared.queue.pop(timeout, max)
    }

    fn signal(&self, token: Token) -> Result<()> {
        if self.shared.queue.push(CompletionStatus::signal(token)) {
            Ok(())
        } else {
            Err(SocketError::Disposed.into())
        }
    }

    fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        log::debug!(target:"reactor", "dispose port");

        if let Err(err) = self.shared.poller.notify() {
            log::error!(target:"reactor", "wake reactor thread, {}", err);
        }

        if let Some(worker) = self.shared.worker.lock().unwrap().take() {
            if worker.thread().id() != thread::current().id() {
                if worker.join().is_err() {
                    log::error!(target:"reactor", "reactor thread panicked");
                }
            }
        }

        let dropped = self.shared.queue.close();

        log::debug!(target:"reactor", "dropped {} undelivered completions", dropped.len());
    }

    fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }
}
