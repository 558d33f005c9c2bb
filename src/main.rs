use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use crossbeam::channel::{bounded, Sender};
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use mux_web_server::config::{Config, DispatchMode, TriggerModes};
use mux_web_server::server::Server;
use mux_web_server::store::UserDb;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogMode {
    /// Log lines go straight to stdout.
    Sync,
    /// Log lines go through a bounded channel to a writer thread.
    Async,
}

/// Static file server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen port
    #[arg(env, long, default_value_t = 9006)]
    port: u16,

    /// Directory served to clients
    #[arg(env, long, default_value = "./root")]
    doc_root: PathBuf,

    /// Trigger combo: 0 LT+LT, 1 LT+ET, 2 ET+LT, 3 ET+ET
    #[arg(env, long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
    trig_mode: u8,

    /// Number of workers
    #[arg(env, long, default_value_t = 8)]
    workers: usize,

    /// Number of pooled store handles
    #[arg(env, long, default_value_t = 8)]
    store_size: usize,

    /// Give closing sockets a one-second drain window instead of an RST
    #[arg(env, long, default_value_t = false)]
    graceful_linger: bool,

    /// Who performs socket I/O after readiness
    #[arg(env, long, value_enum, default_value_t = DispatchMode::Proactor)]
    dispatch: DispatchMode,

    /// Logging style
    #[arg(env, long, value_enum, default_value_t = LogMode::Sync)]
    log_mode: LogMode,

    /// Disable logging entirely
    #[arg(env, long, default_value_t = false)]
    quiet: bool,

    /// Seconds between idle-reaper ticks
    #[arg(env, long, default_value_t = 5)]
    tick_secs: u32,

    /// Maximum concurrent connections
    #[arg(env, long, default_value_t = 10000)]
    max_clients: usize,

    /// Task queue capacity
    #[arg(env, long, default_value_t = 10000)]
    queue_cap: usize,
}

/// Hands formatted log lines to a writer thread so the caller never blocks
/// on stdout.
#[derive(Clone)]
struct AsyncLogWriter {
    tx: Sender<Vec<u8>>,
}

impl AsyncLogWriter {
    fn spawn() -> AsyncLogWriter {
        let (tx, rx) = bounded::<Vec<u8>>(2000);
        std::thread::spawn(move || {
            let mut out = io::stdout();
            while let Ok(line) = rx.recv() {
                let _ = out.write_all(&line);
            }
        });
        AsyncLogWriter { tx }
    }
}

impl io::Write for AsyncLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // A full channel drops the line rather than stalling the logger.
        let _ = self.tx.try_send(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for AsyncLogWriter {
    type Writer = AsyncLogWriter;

    fn make_writer(&'a self) -> AsyncLogWriter {
        self.clone()
    }
}

fn init_logging(args: &Args) {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    let filter =
        if args.quiet { EnvFilter::new("off") } else { EnvFilter::from_default_env() };
    match args.log_mode {
        LogMode::Sync => {
            tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
        }
        LogMode::Async => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(AsyncLogWriter::spawn()))
                .with(filter)
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();
    init_logging(&args);

    // Stand-in for loading the user table from a real backend at startup.
    let db = Arc::new(UserDb::new());
    db.seed([("admin", "admin"), ("guest", "guest")]);

    let cfg = Config {
        port: args.port,
        doc_root: args.doc_root.clone(),
        trigger: TriggerModes::from_combo(args.trig_mode),
        workers: args.workers,
        store_size: args.store_size,
        graceful_linger: args.graceful_linger,
        dispatch: args.dispatch,
        tick_secs: args.tick_secs,
        max_clients: args.max_clients,
        queue_cap: args.queue_cap,
    };
    let mut server = Server::new(cfg, db)?;
    log::info!(
        "serving {} at {} ({:?} dispatch, trigger combo {})",
        args.doc_root.display(),
        server.local_addr()?,
        args.dispatch,
        args.trig_mode
    );
    server.run()?;
    Ok(())
}
