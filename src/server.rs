//! The epoll event loop: accept, dispatch readiness, reap idle connections.
//!
//! The loop is the only thread that touches the connection table, the timer
//! wheel and the signal pipe. Connection sockets are one-shot registered, so
//! handing a socket to a worker and processing its next event can never
//! overlap. Workers may close a connection on their own; every close path
//! funnels through `Connection::close`, which is idempotent, and the loop's
//! table cleanup tolerates a slot whose socket is already gone.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{EpollEvent, EpollFlags};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::{Config, DispatchMode, IDLE_TICKS, MAX_EVENTS, MAX_FD_SLOTS};
use crate::http::conn::Connection;
use crate::net::{io_err, NetCtx};
use crate::pool::{self, Task, WorkerPool, COMPLETION_BOUND, RETRY_BOUND};
use crate::signal::{SignalBatch, SignalPipe};
use crate::store::{StorePool, UserDb};
use crate::timer::{TimerHandle, Wheel};

const BUSY_REPLY: &[u8] = b"Internal server busy";

pub struct Server {
    cfg: Config,
    ctx: Arc<NetCtx>,
    listener: TcpListener,
    listen_fd: RawFd,
    signals: SignalPipe,
    conns: Vec<Option<Arc<Mutex<Connection>>>>,
    timers: Vec<Option<TimerHandle>>,
    wheel: Wheel<RawFd>,
    pool: WorkerPool,
    live: Arc<AtomicUsize>,
    doc_root: Arc<PathBuf>,
}

impl Server {
    pub fn new(cfg: Config, db: Arc<UserDb>) -> io::Result<Server> {
        cfg.validate()?;

        let ctx = Arc::new(NetCtx::new(cfg.trigger.conn_et)?);
        let listener = bind_listener(cfg.port, cfg.graceful_linger)?;
        let listen_fd = listener.as_raw_fd();
        ctx.register_listener(listen_fd, cfg.trigger.listener_et)?;

        let signals = SignalPipe::install(cfg.tick_secs)?;
        ctx.register_pipe(signals.fd())?;

        let store = StorePool::new(db, cfg.store_size);
        let live = Arc::new(AtomicUsize::new(0));
        let pool =
            WorkerPool::new(cfg.workers, cfg.queue_cap, ctx.clone(), store, live.clone());
        let doc_root = Arc::new(cfg.doc_root.clone());

        Ok(Server {
            cfg,
            ctx,
            listener,
            listen_fd,
            signals,
            conns: vec![None; MAX_FD_SLOTS],
            timers: vec![None; MAX_FD_SLOTS],
            wheel: Wheel::new(),
            pool,
            live,
            doc_root,
        })
    }

    /// The bound address, useful when the configured port was 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Block on the event loop until SIGTERM.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = vec![EpollEvent::empty(); MAX_EVENTS];
        loop {
            let n = match self.ctx.wait(&mut events, -1) {
                Ok(n) => n,
                Err(Errno::EINTR) => 0,
                Err(e) => return Err(io_err(e)),
            };

            let mut batch = SignalBatch::default();
            for ev in &events[..n] {
                let fd = ev.data() as RawFd;
                let flags = ev.events();
                if fd == self.listen_fd {
                    self.accept_clients();
                } else if fd == self.signals.fd() {
                    let drained = self.signals.drain();
                    batch.timed_out |= drained.timed_out;
                    batch.shutdown |= drained.shutdown;
                } else if flags
                    .intersects(EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR)
                {
                    self.close_conn(fd);
                } else if flags.contains(EpollFlags::EPOLLIN) {
                    self.on_readable(fd);
                } else if flags.contains(EpollFlags::EPOLLOUT) {
                    self.on_writable(fd);
                }
            }

            if batch.shutdown {
                log::info!("SIGTERM received, shutting down");
                return Ok(());
            }
            // Expiry runs after the event batch so a connection active in
            // this very batch has already pushed its deadline out.
            if batch.timed_out {
                self.expire_idle();
                self.signals.rearm_alarm(self.cfg.tick_secs);
            }
        }
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    self.admit(stream, peer);
                    // Level-triggered listener: one accept per event, epoll
                    // re-reports the backlog.
                    if !self.cfg.trigger.listener_et {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    return;
                }
            }
        }
    }

    fn admit(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let fd = stream.as_raw_fd();
        let slot = fd as usize;
        if let Err(e) = stream.set_nonblocking(true) {
            log::warn!("could not make {peer} nonblocking: {e}");
            return;
        }
        if self.live.load(Ordering::SeqCst) >= self.cfg.max_clients || slot >= MAX_FD_SLOTS {
            log::warn!("refusing {peer}: at capacity");
            // Single best-effort write on the nonblocking socket.
            let _ = stream.write(BUSY_REPLY);
            return;
        }

        // The kernel reuses descriptor numbers; a stale slot here belongs to
        // a connection that was closed without table cleanup.
        if let Some(stale) = self.timers[slot].take() {
            self.wheel.cancel(stale);
        }
        self.conns[slot] = None;

        if let Err(e) = self.ctx.register_conn(fd) {
            log::warn!("could not register {peer}: {e}");
            return;
        }

        let conn =
            Connection::new(Some(stream), peer, self.doc_root.clone(), self.cfg.trigger.conn_et);
        self.conns[slot] = Some(Arc::new(Mutex::new(conn)));
        self.timers[slot] = Some(self.wheel.schedule(IDLE_TICKS, fd));
        self.live.fetch_add(1, Ordering::SeqCst);
        log::debug!("accepted {peer} on fd {fd}");
    }

    fn on_readable(&mut self, fd: RawFd) {
        let Some(conn) = self.conn_at(fd) else {
            return;
        };
        self.bump_timer(fd);
        match self.cfg.dispatch {
            DispatchMode::Reactor => {
                let (task, done) = Task::read(conn);
                if self.pool.dispatch(task).is_err() {
                    log::warn!("task queue full, deferring read on fd {fd}");
                    self.ctx.rearm_read(fd);
                    return;
                }
                if !matches!(done.recv_timeout(COMPLETION_BOUND), Ok(true)) {
                    self.close_conn(fd);
                }
            }
            DispatchMode::Proactor => {
                let ok = conn.lock().read_once();
                if !ok {
                    self.close_conn(fd);
                    return;
                }
                if let Err(task) = self.pool.dispatch(Task::process(conn)) {
                    // The socket is already drained here, so re-arming read
                    // interest would never redeliver the buffered request.
                    // Wait briefly for queue room; shed the connection if
                    // none opens up.
                    log::warn!("task queue full, waiting to enqueue parse for fd {fd}");
                    if self.pool.dispatch_within(task, RETRY_BOUND).is_err() {
                        log::warn!("task queue still full, dropping fd {fd}");
                        self.close_conn(fd);
                    }
                }
            }
        }
    }

    fn on_writable(&mut self, fd: RawFd) {
        let Some(conn) = self.conn_at(fd) else {
            return;
        };
        self.bump_timer(fd);
        match self.cfg.dispatch {
            DispatchMode::Reactor => {
                let (task, done) = Task::write(conn);
                if self.pool.dispatch(task).is_err() {
                    log::warn!("task queue full, deferring write on fd {fd}");
                    self.ctx.rearm_write(fd);
                    return;
                }
                if !matches!(done.recv_timeout(COMPLETION_BOUND), Ok(true)) {
                    self.close_conn(fd);
                }
            }
            DispatchMode::Proactor => {
                if !pool::finish_write(&conn, &self.ctx) {
                    self.close_conn(fd);
                }
            }
        }
    }

    fn conn_at(&self, fd: RawFd) -> Option<Arc<Mutex<Connection>>> {
        self.conns.get(fd as usize).and_then(|slot| slot.clone())
    }

    /// Push a connection's idle deadline out to a full budget from now.
    fn bump_timer(&mut self, fd: RawFd) {
        if let Some(handle) = self.timers[fd as usize] {
            self.wheel.reschedule(handle, IDLE_TICKS);
        }
    }

    fn close_conn(&mut self, fd: RawFd) {
        let slot = fd as usize;
        if slot >= MAX_FD_SLOTS {
            return;
        }
        if let Some(handle) = self.timers[slot].take() {
            self.wheel.cancel(handle);
        }
        if let Some(conn) = self.conns[slot].take() {
            self.ctx.deregister(fd);
            let mut c = conn.lock();
            // A worker may have closed the socket already; only the party
            // that actually closed it decrements the live count.
            if c.close().is_some() {
                self.live.fetch_sub(1, Ordering::SeqCst);
                log::info!("closed connection from {}", c.peer());
            }
        }
    }

    fn expire_idle(&mut self) {
        for fd in self.wheel.tick() {
            let slot = fd as usize;
            self.timers[slot] = None;
            if let Some(conn) = self.conns[slot].take() {
                self.ctx.deregister(fd);
                let mut c = conn.lock();
                if c.close().is_some() {
                    self.live.fetch_sub(1, Ordering::SeqCst);
                    log::info!("reaped idle connection from {}", c.peer());
                }
            }
        }
    }
}

fn bind_listener(port: u16, graceful_linger: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    // Zero linger discards unsent data with an RST on close; one second
    // gives the peer a grace window to drain.
    let linger = if graceful_linger { Duration::from_secs(1) } else { Duration::from_secs(0) };
    socket.set_linger(Some(linger))?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_an_ephemeral_port() {
        let cfg = Config { port: 0, workers: 1, store_size: 1, ..Config::default() };
        let server = Server::new(cfg, Arc::new(UserDb::new())).unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }
}
