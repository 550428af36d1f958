//! Captures `cache_log` events emitted on the test thread as JSON.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone, Default)]
struct JsonLines(Arc<Mutex<Vec<u8>>>);

impl Write for JsonLines {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.0.lock().unwrap_or_else(|err| err.into_inner());
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for JsonLines {
    type Writer = JsonLines;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Holds a thread-local JSON subscriber until dropped. Transactions must run
/// on the test thread, which the default `#[tokio::test]` runtime does.
pub struct CacheLogRecorder {
    lines: JsonLines,
    _guard: DefaultGuard,
}

impl CacheLogRecorder {
    pub fn install() -> Self {
        let lines = JsonLines::default();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::INFO)
            .with_writer(lines.clone())
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        Self {
            lines,
            _guard: guard,
        }
    }

    /// Field maps of the `cache_log` events seen so far.
    pub fn events(&self) -> Vec<Value> {
        let buffer = self.lines.0.lock().unwrap_or_else(|err| err.into_inner());
        String::from_utf8_lossy(&buffer)
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|line| line.get("fields").cloned())
            .filter(|fields| fields["target"] == "cache_log")
            .collect()
    }

    pub fn event_for(&self, url: &str) -> Option<Value> {
        self.events().into_iter().find(|fields| fields["url"] == url)
    }
}
