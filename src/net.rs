//! Epoll registration context shared by the event loop and the workers.
//!
//! Connection sockets are registered one-shot: a readiness event is delivered
//! at most once until whoever finished handling it re-arms the interest, so a
//! connection can never be handed to two workers for the same event.

use std::io;
use std::os::fd::{BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};

pub(crate) fn io_err(errno: Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

pub struct NetCtx {
    epoll: Epoll,
    conn_et: bool,
}

impl NetCtx {
    pub fn new(conn_et: bool) -> io::Result<NetCtx> {
        let epoll = Epoll::new(EpollCreateFlags::empty()).map_err(io_err)?;
        Ok(NetCtx { epoll, conn_et })
    }

    fn conn_flags(&self, interest: EpollFlags) -> EpollFlags {
        let mut flags = interest | EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLONESHOT;
        if self.conn_et {
            flags |= EpollFlags::EPOLLET;
        }
        flags
    }

    /// Register the listening socket: no one-shot, ET per its own mode.
    pub fn register_listener(&self, fd: RawFd, et: bool) -> io::Result<()> {
        let mut flags = EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP;
        if et {
            flags |= EpollFlags::EPOLLET;
        }
        self.add(fd, flags)
    }

    /// Register the self-pipe read end: plain level-triggered read interest.
    pub fn register_pipe(&self, fd: RawFd) -> io::Result<()> {
        self.add(fd, EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP)
    }

    /// Register a freshly accepted connection with read interest.
    pub fn register_conn(&self, fd: RawFd) -> io::Result<()> {
        self.add(fd, self.conn_flags(EpollFlags::EPOLLIN))
    }

    /// Re-arm a one-shot registration with read interest.
    pub fn rearm_read(&self, fd: RawFd) {
        self.modify(fd, self.conn_flags(EpollFlags::EPOLLIN));
    }

    /// Re-arm a one-shot registration with write interest.
    pub fn rearm_write(&self, fd: RawFd) {
        self.modify(fd, self.conn_flags(EpollFlags::EPOLLOUT));
    }

    /// Drop a descriptor from the interest set. Descriptors already closed
    /// or never registered are fine to pass.
    pub fn deregister(&self, fd: RawFd) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match self.epoll.delete(borrowed) {
            Ok(()) | Err(Errno::ENOENT) | Err(Errno::EBADF) => {}
            Err(e) => log::warn!("epoll delete failed for fd {fd}: {e}"),
        }
    }

    pub fn wait(&self, events: &mut [EpollEvent], timeout_ms: isize) -> nix::Result<usize> {
        self.epoll.wait(events, timeout_ms)
    }

    fn add(&self, fd: RawFd, flags: EpollFlags) -> io::Result<()> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.add(borrowed, EpollEvent::new(flags, fd as u64)).map_err(io_err)
    }

    fn modify(&self, fd: RawFd, flags: EpollFlags) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut event = EpollEvent::new(flags, fd as u64);
        if let Err(e) = self.epoll.modify(borrowed, &mut event) {
            log::warn!("epoll re-arm failed for fd {fd}: {e}");
        }
    }
}
