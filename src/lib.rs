//! A multiplexed HTTP/1.1 file server built on epoll readiness, a fixed
//! worker pool and a timing-wheel idle reaper.

pub mod config;
pub mod http;
pub mod net;
pub mod pool;
pub mod server;
pub mod signal;
pub mod store;
pub mod timer;
