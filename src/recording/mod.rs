//! Terminal session recording.
//!
//! A recording is a gzip-compressed, newline-delimited JSON file in the
//! asciicast v2 layout:
//!
//! ```text
//! {"version":2,"width":80,"height":24,"timestamp":1700000000,"env":{"TERM":"xterm"}}
//! [0.016,"o","$ "]
//! [1.250,"i","ls\r"]
//! ```
//!
//! Line 1 is the header. Every following line is a three element array of
//! seconds since the recording started, the direction (`"o"` output, `"i"`
//! input) and the raw text.
//!
//! [`Recorder`] writes from the interactive hot path: each call only formats
//! the line and hands it to a channel. A blocking writer task owns the gzip
//! stream and finalizes it on [`Recorder::close`].

mod reader;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

pub use reader::RecordingReader;

/// File extension of finished recordings.
pub const RECORDING_EXT: &str = "cast.gz";

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("recorder already closed")]
    AlreadyClosed,

    #[error("recording io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("recording encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("malformed recording: {0}")]
    Format(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingHeader {
    pub version: u32,
    pub width: u16,
    pub height: u16,
    /// Unix seconds at recording start.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl RecordingHeader {
    pub fn new(width: u16, height: u16, timestamp: i64) -> Self {
        Self {
            version: 2,
            width,
            height,
            timestamp,
            env: BTreeMap::from([("TERM".to_string(), "xterm".to_string())]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Output,
    Input,
}

impl EventKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::Output => "o",
            Self::Input => "i",
        }
    }
}

/// One timed chunk of terminal traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingEvent {
    pub elapsed: f64,
    pub kind: EventKind,
    pub data: String,
}

impl Serialize for RecordingEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.elapsed, self.kind.code(), &self.data).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RecordingEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (elapsed, code, data) = <(f64, String, String)>::deserialize(deserializer)?;
        let kind = match code.as_str() {
            "o" => EventKind::Output,
            "i" => EventKind::Input,
            other => return Err(de::Error::custom(format!("unknown event code '{other}'"))),
        };
        Ok(Self {
            elapsed,
            kind,
            data,
        })
    }
}

struct RecorderState {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    writer: Option<JoinHandle<std::io::Result<()>>>,
}

/// Append-only recorder for one terminal stream.
pub struct Recorder {
    path: PathBuf,
    started: Instant,
    state: Mutex<RecorderState>,
}

impl Recorder {
    /// Create `<dir>/<stream_id>.cast.gz`, write the header and start the writer task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn create(
        dir: &Path,
        stream_id: &str,
        width: u16,
        height: u16,
    ) -> Result<Self, RecordingError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{stream_id}.{RECORDING_EXT}"));
        let file = File::create(&path)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());

        let header = RecordingHeader::new(width, height, Utc::now().timestamp());
        serde_json::to_writer(&mut encoder, &header)?;
        encoder.write_all(b"\n")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::task::spawn_blocking(move || write_events(encoder, rx));

        debug!("Recording stream {stream_id} to {}", path.display());
        Ok(Self {
            path,
            started: Instant::now(),
            state: Mutex::new(RecorderState {
                tx: Some(tx),
                writer: Some(writer),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record bytes sent to the user.
    pub fn write_output(&self, data: &[u8]) -> Result<(), RecordingError> {
        self.write_event(EventKind::Output, data)
    }

    /// Record bytes typed by the user.
    pub fn write_input(&self, data: &[u8]) -> Result<(), RecordingError> {
        self.write_event(EventKind::Input, data)
    }

    fn write_event(&self, kind: EventKind, data: &[u8]) -> Result<(), RecordingError> {
        let state = self.state.lock().map_err(|_| RecordingError::AlreadyClosed)?;
        let Some(tx) = &state.tx else {
            return Err(RecordingError::AlreadyClosed);
        };
        // elapsed is taken under the lock so lines are enqueued in time order
        let event = RecordingEvent {
            elapsed: self.started.elapsed().as_secs_f64(),
            kind,
            data: String::from_utf8_lossy(data).into_owned(),
        };
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        tx.send(line).map_err(|_| {
            RecordingError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "recording writer stopped",
            ))
        })
    }

    /// Flush, finalize the gzip stream and return the file path.
    ///
    /// A second call fails with [`RecordingError::AlreadyClosed`].
    pub async fn close(&self) -> Result<PathBuf, RecordingError> {
        let writer = {
            let mut state = self.state.lock().map_err(|_| RecordingError::AlreadyClosed)?;
            if state.tx.take().is_none() {
                return Err(RecordingError::AlreadyClosed);
            }
            state.writer.take()
        };
        if let Some(writer) = writer {
            writer
                .await
                .map_err(|e| std::io::Error::other(format!("recording writer panicked: {e}")))??;
        }
        Ok(self.path.clone())
    }
}

fn write_events(
    mut encoder: GzEncoder<BufWriter<File>>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> std::io::Result<()> {
    while let Some(line) = rx.blocking_recv() {
        if let Err(e) = encoder.write_all(&line) {
            error!("Recording write error: {e}");
            return Err(e);
        }
    }
    let mut inner = encoder.finish()?;
    inner.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_has_header_then_events_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let rec = Recorder::create(dir.path(), "s1", 80, 24).unwrap();
        for i in 0..3 {
            rec.write_output(format!("out{i}").as_bytes()).unwrap();
        }
        rec.write_input(b"ls\r").unwrap();
        rec.write_input(b"exit\r").unwrap();
        let path = rec.close().await.unwrap();
        assert!(path.to_string_lossy().ends_with("s1.cast.gz"));

        let mut reader = RecordingReader::open(&path).unwrap();
        assert_eq!(reader.header().version, 2);
        assert_eq!(reader.header().width, 80);
        assert_eq!(reader.header().height, 24);
        assert_eq!(reader.header().env.get("TERM").map(String::as_str), Some("xterm"));

        let events: Vec<_> = reader.by_ref().collect::<Result<_, _>>().unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events.iter().filter(|e| e.kind == EventKind::Output).count(), 3);
        assert_eq!(events[3].data, "ls\r");
        assert!(events.windows(2).all(|w| w[0].elapsed <= w[1].elapsed));
    }

    #[tokio::test]
    async fn file_is_gzip_ndjson() {
        use std::io::Read;

        let dir = tempfile::tempdir().unwrap();
        let rec = Recorder::create(dir.path(), "s2", 100, 30).unwrap();
        rec.write_output(b"hi").unwrap();
        let path = rec.close().await.unwrap();

        let mut text = String::new();
        flate2::read::GzDecoder::new(File::open(path).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let event: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert!(event[0].is_f64());
        assert_eq!(event[1], "o");
        assert_eq!(event[2], "hi");
    }

    #[tokio::test]
    async fn close_twice_fails_and_writes_after_close_fail() {
        let dir = tempfile::tempdir().unwrap();
        let rec = Recorder::create(dir.path(), "s3", 80, 24).unwrap();
        rec.close().await.unwrap();
        assert!(matches!(rec.close().await, Err(RecordingError::AlreadyClosed)));
        assert!(matches!(rec.write_output(b"late"), Err(RecordingError::AlreadyClosed)));
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let ev = RecordingEvent {
            elapsed: 0.5,
            kind: EventKind::Output,
            data: String::from_utf8_lossy(&[0x66, 0xff, 0x6f]).into_owned(),
        };
        let line = serde_json::to_string(&ev).unwrap();
        assert_eq!(line, "[0.5,\"o\",\"f\u{fffd}o\"]");
    }
}
