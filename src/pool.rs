//! Fixed worker pool over one bounded task queue.
//!
//! A task is a connection plus a dispatch intent. Under the reactor
//! discipline the worker performs the socket I/O itself and reports the
//! outcome back on a one-shot completion channel *before* it starts
//! processing, so the event loop is never left waiting on a lost flag.
//! Under the proactor discipline the loop already did the I/O and the
//! worker only runs the parse-route-encode pipeline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::http::conn::{Connection, ProcessAction, WriteStatus};
use crate::net::NetCtx;
use crate::store::StorePool;
use crate::store::UserDb;

/// How long the event loop waits for a reactor worker's completion report.
pub const COMPLETION_BOUND: Duration = Duration::from_secs(5);

/// How long a caller may wait for queue room when a plain dispatch was
/// rejected and re-arming cannot redeliver the work.
pub const RETRY_BOUND: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Reactor: worker reads, then processes.
    Read,
    /// Reactor: worker drains the write buffer.
    Write,
    /// Proactor: data already read, worker only processes.
    Process,
}

pub struct Task {
    conn: Arc<Mutex<Connection>>,
    intent: Intent,
    done: Option<Sender<bool>>,
}

impl Task {
    pub fn read(conn: Arc<Mutex<Connection>>) -> (Task, Receiver<bool>) {
        let (tx, rx) = bounded(1);
        (Task { conn, intent: Intent::Read, done: Some(tx) }, rx)
    }

    pub fn write(conn: Arc<Mutex<Connection>>) -> (Task, Receiver<bool>) {
        let (tx, rx) = bounded(1);
        (Task { conn, intent: Intent::Write, done: Some(tx) }, rx)
    }

    pub fn process(conn: Arc<Mutex<Connection>>) -> Task {
        Task { conn, intent: Intent::Process, done: None }
    }
}

pub struct WorkerPool {
    tx: Option<Sender<Task>>,
    // Keeps the queue connected even when no worker holds a clone, so a
    // full-queue dispatch is rejected as Full rather than Disconnected.
    _rx: Receiver<Task>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        workers: usize,
        queue_cap: usize,
        ctx: Arc<NetCtx>,
        store: Arc<StorePool>,
        live: Arc<AtomicUsize>,
    ) -> WorkerPool {
        let (tx, rx) = bounded::<Task>(queue_cap);
        let workers = (0..workers)
            .map(|_| {
                let rx = rx.clone();
                let ctx = ctx.clone();
                let store = store.clone();
                let live = live.clone();
                std::thread::spawn(move || Self::run(rx, ctx, store, live))
            })
            .collect();
        WorkerPool { tx: Some(tx), _rx: rx, workers }
    }

    /// Non-blocking enqueue. A full queue hands the task back to the caller
    /// instead of dropping it.
    pub fn dispatch(&self, task: Task) -> Result<(), Task> {
        match &self.tx {
            Some(tx) => tx.try_send(task).map_err(|e| e.into_inner()),
            None => Err(task),
        }
    }

    /// Enqueue, waiting up to `timeout` for queue room. Still hands the task
    /// back if no worker drains the queue in time.
    pub fn dispatch_within(&self, task: Task, timeout: Duration) -> Result<(), Task> {
        match &self.tx {
            Some(tx) => tx.send_timeout(task, timeout).map_err(|e| e.into_inner()),
            None => Err(task),
        }
    }

    fn run(rx: Receiver<Task>, ctx: Arc<NetCtx>, store: Arc<StorePool>, live: Arc<AtomicUsize>) {
        while let Ok(task) = rx.recv() {
            match task.intent {
                Intent::Read => {
                    let ok = task.conn.lock().read_once();
                    // Report before processing: the loop resumes as soon as
                    // the I/O outcome is known.
                    if let Some(done) = &task.done {
                        let _ = done.send(ok);
                    }
                    if ok {
                        let db = store.acquire();
                        process_request(&task.conn, &ctx, &live, &db);
                    }
                }
                Intent::Write => {
                    let ok = finish_write(&task.conn, &ctx);
                    if let Some(done) = &task.done {
                        let _ = done.send(ok);
                    }
                }
                Intent::Process => {
                    let db = store.acquire();
                    process_request(&task.conn, &ctx, &live, &db);
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Run the request pipeline on buffered data, holding a store handle for the
/// duration, then re-arm the socket's interest per the outcome.
pub(crate) fn process_request(
    conn: &Arc<Mutex<Connection>>,
    ctx: &NetCtx,
    live: &AtomicUsize,
    db: &UserDb,
) {
    let mut c = conn.lock();
    let Some(fd) = c.fd() else {
        return;
    };
    match c.process(db) {
        ProcessAction::AwaitMore => ctx.rearm_read(fd),
        ProcessAction::Respond => ctx.rearm_write(fd),
        ProcessAction::Fatal => {
            log::warn!("dropping {} after encoding failure", c.peer());
            ctx.deregister(fd);
            if c.close().is_some() {
                live.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

/// Drain the write buffer once and resolve the follow-up. Returns false when
/// the connection is done (orderly or not) and the caller should close it.
pub(crate) fn finish_write(conn: &Arc<Mutex<Connection>>, ctx: &NetCtx) -> bool {
    let mut c = conn.lock();
    let Some(fd) = c.fd() else {
        return false;
    };
    match c.write_once() {
        WriteStatus::Blocked => {
            ctx.rearm_write(fd);
            true
        }
        WriteStatus::KeepAlive => {
            c.reset();
            ctx.rearm_read(fd);
            true
        }
        WriteStatus::Finished | WriteStatus::Error => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
    use std::path::PathBuf;
    use std::time::Instant;

    fn task() -> Task {
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1);
        let conn = Connection::new(None, peer, Arc::new(PathBuf::from(".")), false);
        Task::process(Arc::new(Mutex::new(conn)))
    }

    fn pool_with(workers: usize, cap: usize) -> WorkerPool {
        let ctx = Arc::new(NetCtx::new(false).unwrap());
        let store = StorePool::new(Arc::new(UserDb::new()), 1);
        let live = Arc::new(AtomicUsize::new(0));
        WorkerPool::new(workers, cap, ctx, store, live)
    }

    #[test]
    fn dispatch_rejects_once_the_queue_is_full() {
        // No workers: nothing drains the queue.
        let pool = pool_with(0, 2);

        assert!(pool.dispatch(task()).is_ok());
        assert!(pool.dispatch(task()).is_ok());
        let rejected = pool.dispatch(task());
        // The task comes back to the caller rather than being dropped.
        assert!(matches!(rejected, Err(t) if t.intent == Intent::Process));
    }

    #[test]
    fn bounded_dispatch_hands_the_task_back_after_the_wait() {
        let pool = pool_with(0, 1);
        assert!(pool.dispatch(task()).is_ok());

        // Nothing ever drains the queue, so the bounded wait must return
        // the task instead of blocking forever.
        let started = Instant::now();
        assert!(pool.dispatch_within(task(), Duration::from_millis(50)).is_err());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn read_intent_reports_its_outcome_on_the_completion_channel() {
        let pool = pool_with(1, 4);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let root = Arc::new(PathBuf::from("."));

        // Data waiting on the socket: the worker reads it and reports true.
        let mut client = TcpStream::connect(addr).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n").unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let conn =
            Arc::new(Mutex::new(Connection::new(Some(accepted), peer, root.clone(), false)));
        let (task, done) = Task::read(conn);
        assert!(pool.dispatch(task).is_ok());
        assert_eq!(done.recv_timeout(Duration::from_secs(1)), Ok(true));

        // Peer hangs up before sending anything: the worker reports false.
        let client = TcpStream::connect(addr).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        drop(client);
        std::thread::sleep(Duration::from_millis(100));
        let conn = Arc::new(Mutex::new(Connection::new(Some(accepted), peer, root, false)));
        let (task, done) = Task::read(conn);
        assert!(pool.dispatch(task).is_ok());
        assert_eq!(done.recv_timeout(Duration::from_secs(1)), Ok(false));
    }
}
