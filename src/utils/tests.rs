use super::error::{BrokerError, ProtocolError, USAGE};
use super::logging::{self, LogSink};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_log_sink_flushes_on_stop() {
    let out = Captured::default();
    let sink = LogSink::spawn(16, out.clone());
    let writer = sink.writer();

    for line in ["first\n", "second\n"] {
        let mut w = writer.make_writer();
        w.write_all(line.as_bytes()).unwrap();
    }

    assert_eq!(sink.stop(), 0);
    assert_eq!(out.contents(), "first\nsecond\n");
}

#[test]
fn test_log_sink_discards_lines_after_stop() {
    let out = Captured::default();
    let sink = LogSink::spawn(4, out.clone());
    let writer = sink.writer();
    sink.stop();

    let mut w = writer.make_writer();
    w.write_all(b"late\n").unwrap();
    drop(w);

    assert_eq!(out.contents(), "");
}

#[test]
fn test_parse_level() {
    assert_eq!(logging::parse_level("error"), LevelFilter::ERROR);
    assert_eq!(logging::parse_level("WARNING"), LevelFilter::WARN);
    assert_eq!(logging::parse_level("debug"), LevelFilter::DEBUG);
    assert_eq!(logging::parse_level("nonsense"), LevelFilter::INFO);
}

#[test]
fn test_logging_init_accepts_levels() {
    // try_init makes repeated initialisation harmless
    logging::init("info", 8).stop();
    logging::init("debug", 8).stop();
    logging::init("warn", 8).stop();
}

#[test]
fn test_usage_message_matches_wire_text() {
    assert_eq!(ProtocolError::Usage.to_string(), USAGE);
    assert_eq!(BrokerError::Stopped.to_string(), "broker stopped");
}
