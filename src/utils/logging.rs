//! Asynchronous log sink.
//!
//! `tracing` events are formatted on the calling task and handed to a bounded
//! queue; a dedicated thread drains the queue into the destination. A full
//! queue drops the line instead of stalling request handling.

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

enum Entry {
    Line(Vec<u8>),
    Stop,
}

/// Handle to the log writer thread. Call [`LogSink::stop`] before exiting so
/// queued lines are flushed.
pub struct LogSink {
    tx: SyncSender<Entry>,
    dropped: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl LogSink {
    /// Starts the writer thread with room for `capacity` pending lines.
    pub fn spawn<W>(capacity: usize, out: W) -> Self
    where
        W: Write + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let worker = thread::Builder::new()
            .name("msgbroker-log".into())
            .spawn(move || drain(rx, out))
            .ok();

        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            worker,
        }
    }

    /// A `MakeWriter` feeding this sink, for use with `tracing_subscriber`.
    pub fn writer(&self) -> QueueWriter {
        QueueWriter {
            tx: self.tx.clone(),
            dropped: self.dropped.clone(),
        }
    }

    /// Number of lines discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Flushes everything queued so far and waits for the writer thread to
    /// exit. Lines logged afterwards are discarded. Returns the number of
    /// lines dropped over the sink's lifetime.
    pub fn stop(mut self) -> u64 {
        let _ = self.tx.send(Entry::Stop);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.dropped()
    }
}

fn drain<W: Write>(rx: Receiver<Entry>, mut out: W) {
    for entry in rx {
        match entry {
            Entry::Line(line) => {
                let _ = out.write_all(&line);
            }
            Entry::Stop => break,
        }
    }
    let _ = out.flush();
}

/// Cloneable producer side of a [`LogSink`].
#[derive(Clone)]
pub struct QueueWriter {
    tx: SyncSender<Entry>,
    dropped: Arc<AtomicU64>,
}

impl<'a> MakeWriter<'a> for QueueWriter {
    type Writer = LineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LineWriter {
            buf: Vec::new(),
            queue: self.clone(),
        }
    }
}

/// Buffers one formatted event and enqueues it when dropped.
pub struct LineWriter {
    buf: Vec<u8>,
    queue: QueueWriter,
}

impl Write for LineWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LineWriter {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let line = std::mem::take(&mut self.buf);
        match self.queue.tx.try_send(Entry::Line(line)) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                self.queue.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Maps a configured level name onto a filter. Unknown names fall back to
/// `info`.
pub fn parse_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "off" => LevelFilter::OFF,
        "error" => LevelFilter::ERROR,
        "warn" | "warning" => LevelFilter::WARN,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        _ => LevelFilter::INFO,
    }
}

/// Initialize tracing for the application, writing through a bounded queue
/// to stdout.
///
/// `RUST_LOG` takes precedence over `default_level` when set. Uses `try_init`
/// so tests can call this repeatedly without panicking.
pub fn init(default_level: &str, queue_capacity: usize) -> LogSink {
    let sink = LogSink::spawn(queue_capacity, io::stdout());
    let filter = EnvFilter::builder()
        .with_default_directive(parse_level(default_level).into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(sink.writer())
        .try_init();

    sink
}
