//! Self-pipe signal delivery.
//!
//! The handler itself only forwards the signal number into a socketpair; the
//! event loop drains the read end and reacts outside signal context. The
//! write-end fd lives in a process-wide atomic because a C signal handler
//! cannot capture state.

use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::alarm;

use crate::net::io_err;

static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(sig: libc::c_int) {
    let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    // Nothing but a write of the signal byte; errno is preserved for the
    // interrupted code.
    unsafe {
        let saved = *libc::__errno_location();
        let byte = sig as u8;
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        *libc::__errno_location() = saved;
    }
}

/// Flags decoded from one drain of the pipe.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalBatch {
    pub timed_out: bool,
    pub shutdown: bool,
}

pub struct SignalPipe {
    read: UnixStream,
    _write: UnixStream,
}

impl SignalPipe {
    /// Install handlers for SIGALRM/SIGTERM, ignore SIGPIPE, and arm the
    /// first tick alarm.
    pub fn install(tick_secs: u32) -> io::Result<SignalPipe> {
        let (read, write) = UnixStream::pair()?;
        read.set_nonblocking(true)?;
        write.set_nonblocking(true)?;
        PIPE_WRITE_FD.store(write.as_raw_fd(), Ordering::Relaxed);

        // No SA_RESTART: an interrupted epoll_wait must return so the loop
        // picks the pipe up in the next batch.
        let forward =
            SigAction::new(SigHandler::Handler(forward_signal), SaFlags::empty(), SigSet::all());
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        unsafe {
            sigaction(Signal::SIGALRM, &forward).map_err(io_err)?;
            sigaction(Signal::SIGTERM, &forward).map_err(io_err)?;
            sigaction(Signal::SIGPIPE, &ignore).map_err(io_err)?;
        }
        alarm::set(tick_secs);

        Ok(SignalPipe { read, _write: write })
    }

    pub fn fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Drain every pending signal byte and fold them into flags.
    pub fn drain(&mut self) -> SignalBatch {
        let mut batch = SignalBatch::default();
        let mut buf = [0u8; 1024];
        loop {
            match self.read.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &sig in &buf[..n] {
                        if sig as i32 == Signal::SIGALRM as i32 {
                            batch.timed_out = true;
                        } else if sig as i32 == Signal::SIGTERM as i32 {
                            batch.shutdown = true;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("signal pipe read failed: {e}");
                    break;
                }
            }
        }
        batch
    }

    /// Re-arm the periodic tick alarm.
    pub fn rearm_alarm(&self, tick_secs: u32) {
        alarm::set(tick_secs);
    }
}
