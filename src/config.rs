use std::io;
use std::path::PathBuf;

use clap::ValueEnum;

/// Capacity of a connection's read buffer.
pub const READ_BUF_SIZE: usize = 2048;
/// Capacity of a connection's write buffer (headers and error bodies).
pub const WRITE_BUF_SIZE: usize = 1024;
/// Longest resolved filesystem path a request may map to.
pub const MAX_PATH_LEN: usize = 200;
/// Size of the fd-indexed connection/timer tables.
pub const MAX_FD_SLOTS: usize = 10240;
/// Upper bound on readiness events handled per wakeup.
pub const MAX_EVENTS: usize = 10000;
/// A connection's idle budget, in timer ticks.
pub const IDLE_TICKS: usize = 3;

/// Who performs the socket I/O once readiness is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DispatchMode {
    /// Workers perform the read/write themselves after being handed raw
    /// readiness.
    Reactor,
    /// The event loop performs the I/O and hands workers parsed-ready data.
    Proactor,
}

/// Edge/level trigger selection, independently for the listening socket and
/// the per-connection sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerModes {
    pub listener_et: bool,
    pub conn_et: bool,
}

impl TriggerModes {
    /// Decode the four-way combo flag: 0 LT+LT, 1 LT+ET, 2 ET+LT, 3 ET+ET.
    pub fn from_combo(combo: u8) -> TriggerModes {
        TriggerModes {
            listener_et: combo == 2 || combo == 3,
            conn_et: combo == 1 || combo == 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub doc_root: PathBuf,
    pub trigger: TriggerModes,
    pub workers: usize,
    pub store_size: usize,
    pub graceful_linger: bool,
    pub dispatch: DispatchMode,
    pub tick_secs: u32,
    pub max_clients: usize,
    pub queue_cap: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: 9006,
            doc_root: PathBuf::from("./root"),
            trigger: TriggerModes::from_combo(0),
            workers: 8,
            store_size: 8,
            graceful_linger: false,
            dispatch: DispatchMode::Proactor,
            tick_secs: 5,
            max_clients: 10000,
            queue_cap: 10000,
        }
    }
}

impl Config {
    pub fn validate(&self) -> io::Result<()> {
        if self.workers == 0 {
            return Err(invalid("worker count must be nonzero"));
        }
        if self.store_size == 0 {
            return Err(invalid("store pool size must be nonzero"));
        }
        if self.tick_secs == 0 {
            return Err(invalid("tick period must be nonzero"));
        }
        if self.max_clients == 0 || self.max_clients > MAX_FD_SLOTS {
            return Err(invalid("max client count out of range"));
        }
        if self.queue_cap == 0 {
            return Err(invalid("task queue capacity must be nonzero"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combo_decodes_both_axes() {
        assert_eq!(
            TriggerModes::from_combo(0),
            TriggerModes { listener_et: false, conn_et: false }
        );
        assert_eq!(
            TriggerModes::from_combo(1),
            TriggerModes { listener_et: false, conn_et: true }
        );
        assert_eq!(
            TriggerModes::from_combo(2),
            TriggerModes { listener_et: true, conn_et: false }
        );
        assert_eq!(
            TriggerModes::from_combo(3),
            TriggerModes { listener_et: true, conn_et: true }
        );
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let cfg = Config { workers: 0, ..Config::default() };
        assert!(cfg.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }
}
