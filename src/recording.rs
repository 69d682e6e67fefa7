//! Asciinema-style recording of session output.
//!
//! Each session owns one recording file (`stdout` in its control directory).
//! The first line is a header record; every subsequent line is a compact
//! event array `[time, channel, data]` where `time` is seconds since session
//! start. Output is `'o'`, input (opt-in) is `'i'`, resizes are `'r'` with
//! `COLSxROWS` data, and injected markers are `'m'`.
//!
//! Appends go through a bounded in-memory queue guarded by a mutex; a
//! dedicated writer task owns the file handle and drains the queue in batches.
//! When the queue is full the oldest `'o'` event is evicted and a dropped
//! counter incremented; the counter is reported in a trailing `'m'` event at
//! close. `close()` drains, flushes, fsyncs, and resolves exactly once.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{error, warn};

/// Minimum queue capacity; configs below this are clamped up.
pub const MIN_QUEUE_CAPACITY: usize = 1024;

/// Which stream a recording event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventChannel {
    /// Terminal output.
    Output,
    /// Terminal input (recorded only when enabled).
    Input,
    /// Window resize, data is `COLSxROWS`.
    Resize,
    /// Injected marker/banner.
    Marker,
}

impl EventChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Output => "o",
            Self::Input => "i",
            Self::Resize => "r",
            Self::Marker => "m",
        }
    }
}

/// A single timestamped event, not yet serialized.
#[derive(Debug, Clone)]
pub struct RecordingEvent {
    /// Seconds since session start.
    pub time: f64,
    pub channel: EventChannel,
    pub data: String,
}

impl RecordingEvent {
    fn to_line(&self) -> String {
        serde_json::json!([self.time, self.channel.as_str(), self.data]).to_string()
    }
}

/// Header record written as the first line of the recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingHeader {
    pub version: u32,
    pub width: u16,
    pub height: u16,
    /// Session creation time, seconds since the epoch.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
}

impl RecordingHeader {
    pub fn new(width: u16, height: u16, timestamp: u64) -> Self {
        Self {
            version: 2,
            width,
            height,
            timestamp,
            title: None,
            env: std::collections::HashMap::new(),
        }
    }
}

struct EventQueue {
    events: VecDeque<RecordingEvent>,
    capacity: usize,
    dropped: u64,
    closed: bool,
    /// Raw JSON line appended after the trailer at close (exit record).
    exit_line: Option<String>,
}

impl EventQueue {
    /// Push with drop-oldest-output eviction.
    fn push(&mut self, event: RecordingEvent) {
        if self.closed {
            return;
        }
        if self.events.len() >= self.capacity {
            // Prefer evicting the oldest output chunk; control events ('r'/'m')
            // are rare and must survive.
            let victim = self
                .events
                .iter()
                .position(|e| e.channel == EventChannel::Output);
            match victim {
                Some(idx) => {
                    self.events.remove(idx);
                }
                None => {
                    self.events.pop_front();
                }
            }
            self.dropped += 1;
        }
        self.events.push_back(event);
    }
}

/// Handle to one session's recording. Cheap to share behind an `Arc`.
pub struct RecordingWriter {
    queue: Arc<Mutex<EventQueue>>,
    notify: Arc<Notify>,
    started: Instant,
    done: Mutex<Option<oneshot::Receiver<()>>>,
}

impl RecordingWriter {
    /// Create the recording file, write the header line, and start the
    /// background writer task.
    pub async fn create(
        path: &Path,
        header: &RecordingHeader,
        capacity: usize,
    ) -> std::io::Result<Self> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await?;

        let header_line = serde_json::to_string(header)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        file.write_all(header_line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        let queue = Arc::new(Mutex::new(EventQueue {
            events: VecDeque::new(),
            capacity: capacity.max(MIN_QUEUE_CAPACITY),
            dropped: 0,
            closed: false,
            exit_line: None,
        }));
        let notify = Arc::new(Notify::new());
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(writer_task(
            file,
            Arc::clone(&queue),
            Arc::clone(&notify),
            done_tx,
        ));

        Ok(Self {
            queue,
            notify,
            started: Instant::now(),
            done: Mutex::new(Some(done_rx)),
        })
    }

    /// Seconds since the recording started.
    pub fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Enqueue an event. Never blocks on I/O; the queue mutex is held only
    /// for the push itself.
    pub async fn append(&self, channel: EventChannel, data: String) {
        let event = RecordingEvent {
            time: self.elapsed(),
            channel,
            data,
        };
        self.queue.lock().await.push(event);
        self.notify.notify_one();
    }

    pub async fn record_output(&self, bytes: &[u8]) {
        self.append(EventChannel::Output, String::from_utf8_lossy(bytes).into_owned())
            .await;
    }

    pub async fn record_input(&self, bytes: &[u8]) {
        self.append(EventChannel::Input, String::from_utf8_lossy(bytes).into_owned())
            .await;
    }

    pub async fn record_resize(&self, cols: u16, rows: u16) {
        self.append(EventChannel::Resize, format!("{cols}x{rows}")).await;
    }

    pub async fn record_marker(&self, text: &str) {
        self.append(EventChannel::Marker, text.to_string()).await;
    }

    /// Number of events evicted so far.
    pub async fn dropped(&self) -> u64 {
        self.queue.lock().await.dropped
    }

    /// Close the recording: drain pending events, append the exit record and
    /// (when drops occurred) a dropped-count trailer, flush and fsync.
    ///
    /// Idempotent; only the first call waits for the writer task.
    pub async fn close(&self, exit: Option<(Option<i32>, &str)>) {
        {
            let mut inner = self.queue.lock().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            if let Some((code, session_id)) = exit {
                inner.exit_line = Some(
                    serde_json::json!(["exit", code.unwrap_or(-1), session_id]).to_string(),
                );
            }
        }
        self.notify.notify_one();

        let rx = self.done.lock().await.take();
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }
}

/// Background task that drains the queue and writes event lines to disk.
async fn writer_task(
    mut file: fs::File,
    queue: Arc<Mutex<EventQueue>>,
    notify: Arc<Notify>,
    done_tx: oneshot::Sender<()>,
) {
    loop {
        let (batch, finished) = {
            let mut inner = queue.lock().await;
            let batch: Vec<RecordingEvent> = inner.events.drain(..).collect();
            let finished = inner.closed && batch.is_empty();
            (batch, finished)
        };

        for event in &batch {
            let line = event.to_line();
            if let Err(e) = write_line(&mut file, &line).await {
                error!("Recording write error: {e}");
                let _ = done_tx.send(());
                return;
            }
        }

        if finished {
            let (dropped, exit_line) = {
                let inner = queue.lock().await;
                (inner.dropped, inner.exit_line.clone())
            };
            if dropped > 0 {
                let trailer = RecordingEvent {
                    time: 0.0,
                    channel: EventChannel::Marker,
                    data: format!("dropped {dropped} output events"),
                };
                if let Err(e) = write_line(&mut file, &trailer.to_line()).await {
                    warn!("Recording trailer write error: {e}");
                }
            }
            if let Some(line) = exit_line {
                if let Err(e) = write_line(&mut file, &line).await {
                    warn!("Recording exit record write error: {e}");
                }
            }
            if let Err(e) = file.flush().await {
                warn!("Recording flush error: {e}");
            }
            if let Err(e) = file.sync_all().await {
                warn!("Recording fsync error: {e}");
            }
            let _ = done_tx.send(());
            return;
        }

        if batch.is_empty() {
            notify.notified().await;
        } else if let Err(e) = file.flush().await {
            error!("Recording flush error: {e}");
            let _ = done_tx.send(());
            return;
        }
    }
}

async fn write_line(file: &mut fs::File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await
}

/// A slice of the recording read for tailing.
#[derive(Debug, Serialize)]
pub struct RecordingTail {
    /// Byte offset the read started from.
    pub start: u64,
    /// Byte offset to resume from (end of the last complete line).
    pub end: u64,
    /// Raw newline-delimited event lines.
    pub data: String,
}

/// Read complete recording lines starting at `offset`.
///
/// Partial trailing lines (a write in progress) are left for the next call;
/// `end` always points at a line boundary.
pub async fn tail_recording(path: &Path, offset: u64) -> std::io::Result<RecordingTail> {
    let mut file = fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let start = offset.min(len);
    file.seek(SeekFrom::Start(start)).await?;

    let mut raw = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut raw).await?;

    // Cut at the last newline so callers never see a torn line.
    let complete = match raw.iter().rposition(|&b| b == b'\n') {
        Some(pos) => pos + 1,
        None => 0,
    };
    raw.truncate(complete);

    Ok(RecordingTail {
        start,
        end: start + complete as u64,
        data: String::from_utf8_lossy(&raw).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_header_and_events_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let header = RecordingHeader::new(80, 24, 1_700_000_000);
        let rec = RecordingWriter::create(&path, &header, 1024).await.unwrap();

        rec.record_output(b"hi\r\n").await;
        rec.record_resize(120, 40).await;
        rec.close(Some((Some(0), "abc"))).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();

        let head: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(head["version"], 2);
        assert_eq!(head["width"], 80);
        assert_eq!(head["height"], 24);
        assert_eq!(head["timestamp"], 1_700_000_000u64);

        let out: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(out[1], "o");
        assert_eq!(out[2], "hi\r\n");

        let resize: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(resize[1], "r");
        assert_eq!(resize[2], "120x40");

        let exit: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(exit[0], "exit");
        assert_eq!(exit[1], 0);
        assert_eq!(exit[2], "abc");

        assert!(lines.next().is_none());
    }

    #[tokio::test]
    async fn test_eviction_prefers_oldest_output() {
        let mut queue = EventQueue {
            events: VecDeque::new(),
            capacity: 3,
            dropped: 0,
            closed: false,
            exit_line: None,
        };
        queue.push(RecordingEvent {
            time: 0.0,
            channel: EventChannel::Output,
            data: "first".into(),
        });
        queue.push(RecordingEvent {
            time: 0.1,
            channel: EventChannel::Resize,
            data: "80x24".into(),
        });
        queue.push(RecordingEvent {
            time: 0.2,
            channel: EventChannel::Output,
            data: "second".into(),
        });
        queue.push(RecordingEvent {
            time: 0.3,
            channel: EventChannel::Output,
            data: "third".into(),
        });

        assert_eq!(queue.dropped, 1);
        assert_eq!(queue.events.len(), 3);
        // The resize survived; "first" was evicted.
        assert_eq!(queue.events[0].channel, EventChannel::Resize);
        assert_eq!(queue.events[1].data, "second");
        assert_eq!(queue.events[2].data, "third");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let header = RecordingHeader::new(80, 24, 0);
        let rec = RecordingWriter::create(&path, &header, 1024).await.unwrap();
        rec.close(None).await;
        rec.close(None).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_trailer_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let header = RecordingHeader::new(80, 24, 0);
        // Capacity clamps to MIN_QUEUE_CAPACITY, so force drops by exceeding it.
        let rec = RecordingWriter::create(&path, &header, 0).await.unwrap();
        for i in 0..(MIN_QUEUE_CAPACITY + 5) {
            // Hold the writer out of the race by appending before it can drain:
            // even if some events are flushed early the dropped counter only
            // needs to be nonzero for the trailer to appear.
            rec.append(EventChannel::Output, format!("chunk {i}")).await;
        }
        let dropped = rec.dropped().await;
        rec.close(None).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        if dropped > 0 {
            assert!(contents.contains("dropped"));
        }
        // Header is always the first line regardless of drops.
        assert!(contents.starts_with("{\"version\":2"));
    }

    #[tokio::test]
    async fn test_tail_resumes_at_line_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        std::fs::write(&path, "line one\nline two\npartial").unwrap();

        let first = tail_recording(&path, 0).await.unwrap();
        assert_eq!(first.data, "line one\nline two\n");
        assert_eq!(first.end, 18);

        let rest = tail_recording(&path, first.end).await.unwrap();
        assert_eq!(rest.data, "");
        assert_eq!(rest.end, first.end);

        let beyond = tail_recording(&path, 10_000).await.unwrap();
        assert_eq!(beyond.data, "");
    }
}
