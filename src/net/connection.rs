//! Per-peer state shared by the receive thread, the send thread and the
//! owning server or client.

use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_queue::SegQueue;
use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::core::message::{ConnectionId, UNSET_ID};
use crate::core::pool::SharedBuf;

/// Which end of the protocol this connection plays. Clients mask what they
/// send; servers require masked input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn expects_masked_input(self) -> bool {
        self == Role::Server
    }

    pub fn masks_output(self) -> bool {
        self == Role::Client
    }
}

/// Auto-resetting binary signal: `wait` returns once per `signal` burst.
pub(crate) struct WakeSignal {
    set: Mutex<bool>,
    cond: Condvar,
}

impl WakeSignal {
    fn new() -> Self {
        Self {
            set: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn signal(&self) {
        *self.set.lock() = true;
        self.cond.notify_one();
    }

    pub(crate) fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
        *set = false;
    }
}

type DisposeHook = Box<dyn FnOnce(ConnectionId) + Send>;

pub struct Connection {
    id: AtomicI64,
    role: Role,
    socket: TcpStream,
    peer: SocketAddr,
    outbound: SegQueue<SharedBuf>,
    wake: WakeSignal,
    threads: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
    on_dispose: Mutex<Option<DisposeHook>>,
}

impl Connection {
    /// `socket` is a handle on the peer's socket used only for teardown.
    pub fn new(role: Role, socket: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id: AtomicI64::new(UNSET_ID),
            role,
            socket,
            peer,
            outbound: SegQueue::new(),
            wake: WakeSignal::new(),
            threads: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
            on_dispose: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id.load(Ordering::Acquire)
    }

    pub(crate) fn set_id(&self, id: ConnectionId) {
        self.id.store(id, Ordering::Release);
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Registers the owner's bookkeeping, run exactly once on disposal.
    pub(crate) fn set_dispose_hook(&self, hook: DisposeHook) {
        *self.on_dispose.lock() = Some(hook);
        if self.is_disposed() {
            self.run_dispose_hook();
        }
    }

    pub(crate) fn attach_thread(&self, handle: JoinHandle<()>) {
        self.threads.lock().push(handle);
    }

    /// Queues a message for the send thread. Returns false once disposed.
    pub fn enqueue(&self, buf: SharedBuf) -> bool {
        if self.is_disposed() {
            return false;
        }
        self.outbound.push(buf);
        // A dispose that lands between the check and the push has already
        // drained the queue; drain again so the buffer is not stranded.
        if self.is_disposed() {
            self.drain_outbound();
            return false;
        }
        self.wake.signal();
        true
    }

    pub(crate) fn next_outbound(&self) -> Option<SharedBuf> {
        self.outbound.pop()
    }

    fn drain_outbound(&self) {
        while let Some(buf) = self.outbound.pop() {
            buf.release();
        }
    }

    pub(crate) fn wait_for_work(&self) {
        self.wake.wait();
    }

    /// Tears the connection down. Only the first caller does any work.
    ///
    /// Shutting the socket down makes the pipelines' blocking calls return;
    /// they see the disposed flag and exit without reporting an error.
    pub fn dispose(&self) {
        if self
            .disposed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        debug!("disposing connection {} ({})", self.id(), self.peer);

        let _ = self.socket.shutdown(Shutdown::Both);
        self.wake.signal();
        self.drain_outbound();
        self.run_dispose_hook();
    }

    fn run_dispose_hook(&self) {
        let hook = self.on_dispose.lock().take();
        if let Some(hook) = hook {
            hook(self.id());
        }
    }

    /// Waits for the pipeline threads, skipping the calling thread.
    pub(crate) fn join_threads(&self) {
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::socket_pair;
    use super::*;
    use crate::core::pool::BufferPool;
    use std::io::Read;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn connection() -> (Arc<Connection>, TcpStream) {
        let (server, client) = socket_pair();
        let peer = server.peer_addr().unwrap();
        (Arc::new(Connection::new(Role::Server, server, peer)), client)
    }

    #[test]
    fn starts_unassigned() {
        let (conn, _peer) = connection();
        assert_eq!(conn.id(), UNSET_ID);
        conn.set_id(7);
        assert_eq!(conn.id(), 7);
    }

    #[test]
    fn concurrent_dispose_runs_teardown_once() {
        let (conn, _peer) = connection();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        conn.set_dispose_hook(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let racers: Vec<_> = (0..8)
            .map(|_| {
                let conn = Arc::clone(&conn);
                thread::spawn(move || conn.dispose())
            })
            .collect();
        for racer in racers {
            racer.join().unwrap();
        }
        conn.dispose();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispose_releases_queued_buffers_and_closes_socket() {
        let pool = BufferPool::new(2, 16, 64).unwrap();
        let (conn, mut peer) = connection();
        assert!(conn.enqueue(pool.copy_from(b"pending").unwrap().share()));
        assert_eq!(pool.free_buffers(7), 0);

        conn.dispose();
        assert_eq!(pool.free_buffers(7), 1);
        assert!(!conn.enqueue(pool.copy_from(b"late").unwrap().share()));
        assert_eq!(pool.free_buffers(4), 1);

        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn hook_set_after_dispose_still_runs() {
        let (conn, _peer) = connection();
        conn.dispose();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        conn.set_dispose_hook(Box::new(move |_| flag.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn wake_signal_releases_waiter() {
        let pool = BufferPool::new(2, 16, 64).unwrap();
        let (conn, _peer) = connection();
        let waiter = {
            let conn = Arc::clone(&conn);
            thread::spawn(move || conn.wait_for_work())
        };
        assert!(conn.enqueue(pool.copy_from(b"wake").unwrap().share()));
        waiter.join().unwrap();
        assert!(matches!(conn.next_outbound(), Some(buf) if &buf[..] == b"wake"));
    }

    #[test]
    fn enqueue_racing_dispose_never_strands_a_buffer() {
        let pool = Arc::new(BufferPool::new(2, 16, 64).unwrap());
        for _ in 0..200 {
            let (conn, _peer) = connection();
            let producers: Vec<_> = (0..4)
                .map(|_| {
                    let conn = Arc::clone(&conn);
                    let pool = Arc::clone(&pool);
                    thread::spawn(move || {
                        while conn.enqueue(pool.copy_from(b"racing").unwrap().share()) {}
                    })
                })
                .collect();
            conn.dispose();
            for producer in producers {
                producer.join().unwrap();
            }
            assert!(conn.next_outbound().is_none());
        }
    }
}
