//! Process-wide logger installation, including the optional best-effort
//! duplication of structured events to an external HTTP sink (§6 "optional
//! log-sink URL and token").
//!
//! Wraps the same `env_logger` backend the teacher's `main.rs` installs via
//! `env_logger::init()`, so filtering behavior (`RUST_LOG`, and here also
//! `DEBUG` as a coarser fallback) is unchanged whether or not a sink is
//! configured. The sink itself never blocks the logging call site: records
//! are handed to an unbounded channel and a background task does the actual
//! POSTing, matching the "forward to an external process, best-effort,
//! never block the caller" shape already used for status reporting
//! elsewhere in this lineage of services.

use log::{Log, Metadata, Record};
use tokio::sync::mpsc::{self, UnboundedSender};

struct SinkLogger {
    inner: env_logger::Logger,
    tx: UnboundedSender<String>,
}

impl Log for SinkLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.inner.enabled(record.metadata()) {
            return;
        }
        self.inner.log(record);
        let line = format!("{} [{}] {}", record.level(), record.target(), record.args());
        // Unbounded, non-blocking: a slow or dead sink must never stall the
        // thread that's logging. If the forwarder task has already exited
        // (e.g. during shutdown) the send simply fails and is dropped.
        let _ = self.tx.send(line);
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Installs the process-wide logger. Must be called once, from within a
/// running Tokio runtime (it spawns the forwarder task when a sink URL is
/// configured).
///
/// `debug` (the `DEBUG` environment flag) only supplies the default filter
/// level used when `RUST_LOG` is not set; an explicit `RUST_LOG` always
/// wins, matching `env_logger`'s own precedence.
pub fn init(sink_url: Option<String>, sink_token: Option<String>, debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let inner = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).build();
    let level = inner.filter();

    let logger: Box<dyn Log> = match sink_url {
        Some(url) => {
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            tokio::spawn(async move {
                let client = reqwest::Client::new();
                while let Some(line) = rx.recv().await {
                    let mut req = client.post(&url).body(line);
                    if let Some(token) = &sink_token {
                        req = req.bearer_auth(token);
                    }
                    if let Err(e) = req.send().await {
                        // Not routed through `log!`: that would re-enter this
                        // logger and could loop if the sink itself is the
                        // cause of every failure.
                        eprintln!("log sink: best-effort delivery to {url} failed: {e}");
                    }
                }
            });
            Box::new(SinkLogger { inner, tx })
        }
        None => Box::new(inner),
    };

    log::set_boxed_logger(logger).expect("logger already initialized");
    log::set_max_level(level);
}
