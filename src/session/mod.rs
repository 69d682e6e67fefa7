//! Session lifecycle: one PTY-backed process bundled with its recording,
//! metadata, and subscriber set.
//!
//! ## State machine
//!
//! `starting → running` on successful PTY spawn, `running → exiting` on the
//! first kill request or child-exit observation, `exiting → exited` once the
//! child is reaped and buffered output drained. Terminal. Write operations
//! (input, resize, signal) on an exited session fail with `SESSION_EXITED`;
//! inspection and recording tail remain available.
//!
//! ## Concurrency
//!
//! A pump task is the only consumer of the PTY reader channel; it forks each
//! chunk to the recording writer and the subscriber set, so all subscribers
//! observe output in production order. Input and resizes reach the PTY only
//! through its single writer task. Kill waiters block on a watch channel the
//! pump flips when the session reaches its terminal state.

pub mod fanout;
pub mod registry;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::protocol::{parse_signal_name, ControlCommand, StatusUpdate};
use crate::pty::{allocate_pty, spawn_in_pty, ExitInfo, PtyHost};
use crate::recording::{RecordingHeader, RecordingWriter};
use fanout::{Envelope, SinkKind, SubscriberSet, Subscription};
use store::{ExitRecord, SessionMeta};

/// SIGTERM → SIGKILL escalation delay.
pub const KILL_GRACE: Duration = Duration::from_secs(3);

/// Overall bound on a `kill()` call; past this the reaper keeps going but the
/// caller gets `KILL_TIMEOUT`.
pub const KILL_DEADLINE: Duration = Duration::from_secs(10);

/// Applied to every output chunk before recording and fan-out (OSC title
/// rewriting and similar concerns hook in here).
pub type OutputTransform = Arc<dyn Fn(Bytes) -> Bytes + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Exiting,
    Exited,
}

/// Per-session knobs threaded down from the server config.
#[derive(Debug, Clone)]
pub struct SessionTuning {
    pub subscriber_queue_len: usize,
    pub backpressure_grace: Duration,
    pub max_payload: usize,
    pub recording_queue_len: usize,
    pub record_input: bool,
}

/// Snapshot returned by list/detail endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub command: Vec<String>,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub created_at: u64,
    pub last_activity_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_signal: Option<i32>,
    pub title_mode: store::TitleMode,
    pub shell: bool,
    /// Recovered from a previous server run; input and resize unavailable.
    pub detached: bool,
    pub subscriber_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_app_status: Option<StatusUpdate>,
}

/// A live (or recovered) session.
pub struct Session {
    meta: Mutex<SessionMeta>,
    control_dir: PathBuf,
    status: Mutex<SessionStatus>,
    exit: Mutex<Option<ExitRecord>>,
    exited_tx: watch::Sender<bool>,
    last_activity_ms: AtomicU64,
    last_app_status: Mutex<Option<StatusUpdate>>,
    subscribers: SubscriberSet,
    pty: Option<PtyHost>,
    recording: Option<Arc<RecordingWriter>>,
    original_size: (u16, u16),
    record_input: bool,
    max_payload: usize,
    detached: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("control_dir", &self.control_dir)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawn a new PTY-backed session. The control directory must already
    /// exist; `session.json` is the registry's responsibility.
    pub async fn spawn(
        mut meta: SessionMeta,
        control_dir: PathBuf,
        tuning: &SessionTuning,
        transform: Option<OutputTransform>,
    ) -> CoreResult<Arc<Self>> {
        let pty_pair = allocate_pty(meta.cols, meta.rows)
            .map_err(|e| CoreError::internal("PTY allocation failed", e))?;

        let mut env = meta.env.clone();
        env.entry("TERM".to_string())
            .or_insert_with(|| "xterm-256color".to_string());

        let child = spawn_in_pty(&pty_pair, &meta.command, &meta.cwd, &env, meta.shell)
            .map_err(|e| CoreError::InvalidOperation(format!("failed to spawn command: {e}")))?;

        let header = RecordingHeader {
            version: 2,
            width: meta.cols,
            height: meta.rows,
            timestamp: meta.created_at,
            title: Some(meta.name.clone()),
            env: meta.env.clone(),
        };
        let recording = RecordingWriter::create(
            &store::recording_path(&control_dir),
            &header,
            tuning.recording_queue_len,
        )
        .await
        .map_err(|e| CoreError::internal("failed to create recording", e))?;

        let (pty, out_rx) = PtyHost::start(pty_pair, child)
            .map_err(|e| CoreError::internal("failed to start PTY host", e))?;
        meta.pid = Some(pty.pid());

        let (exited_tx, _) = watch::channel(false);
        let session = Arc::new(Self {
            original_size: (meta.cols, meta.rows),
            meta: Mutex::new(meta),
            control_dir,
            status: Mutex::new(SessionStatus::Starting),
            exit: Mutex::new(None),
            exited_tx,
            last_activity_ms: AtomicU64::new(store::now_ms()),
            last_app_status: Mutex::new(None),
            subscribers: SubscriberSet::new(
                tuning.subscriber_queue_len,
                tuning.backpressure_grace,
            ),
            pty: Some(pty),
            recording: Some(Arc::new(recording)),
            record_input: tuning.record_input,
            max_payload: tuning.max_payload,
            detached: false,
        });

        tokio::spawn(pump(Arc::clone(&session), out_rx, transform));

        // The PTY spawn succeeded and the pump is live.
        {
            let mut status = session.status.lock().await;
            if *status == SessionStatus::Starting {
                *status = SessionStatus::Running;
            }
        }
        Ok(session)
    }

    /// Rebuild a session whose child is still alive but whose PTY belongs to
    /// a previous server process. Read-only: status fan-out works, input and
    /// resize do not.
    pub fn recovered_running(
        meta: SessionMeta,
        control_dir: PathBuf,
        tuning: &SessionTuning,
    ) -> Arc<Self> {
        let (exited_tx, _) = watch::channel(false);
        Arc::new(Self {
            original_size: (meta.cols, meta.rows),
            meta: Mutex::new(meta),
            control_dir,
            status: Mutex::new(SessionStatus::Running),
            exit: Mutex::new(None),
            exited_tx,
            last_activity_ms: AtomicU64::new(store::now_ms()),
            last_app_status: Mutex::new(None),
            subscribers: SubscriberSet::new(
                tuning.subscriber_queue_len,
                tuning.backpressure_grace,
            ),
            pty: None,
            recording: None,
            record_input: false,
            max_payload: tuning.max_payload,
            detached: true,
        })
    }

    /// Rebuild an exited session from disk for inspection and tailing.
    pub fn recovered_exited(
        meta: SessionMeta,
        control_dir: PathBuf,
        tuning: &SessionTuning,
        exit: Option<ExitRecord>,
    ) -> Arc<Self> {
        let (exited_tx, _) = watch::channel(true);
        Arc::new(Self {
            original_size: (meta.cols, meta.rows),
            meta: Mutex::new(meta),
            control_dir,
            status: Mutex::new(SessionStatus::Exited),
            exit: Mutex::new(exit),
            exited_tx,
            last_activity_ms: AtomicU64::new(store::now_ms()),
            last_app_status: Mutex::new(None),
            subscribers: SubscriberSet::new(
                tuning.subscriber_queue_len,
                tuning.backpressure_grace,
            ),
            pty: None,
            recording: None,
            record_input: false,
            max_payload: tuning.max_payload,
            detached: true,
        })
    }

    pub async fn id(&self) -> String {
        self.meta.lock().await.id.clone()
    }

    pub async fn meta_snapshot(&self) -> SessionMeta {
        self.meta.lock().await.clone()
    }

    /// Rename the session, keeping `session.json` in sync.
    pub async fn rename(&self, name: String) {
        let meta = {
            let mut meta = self.meta.lock().await;
            meta.name = name;
            meta.clone()
        };
        if let Err(e) = store::write_session_meta(&self.control_dir, &meta).await {
            warn!("Failed to persist rename for session {}: {e}", meta.id);
        }
    }

    pub fn control_dir(&self) -> &Path {
        &self.control_dir
    }

    pub async fn status(&self) -> SessionStatus {
        *self.status.lock().await
    }

    pub async fn is_exited(&self) -> bool {
        matches!(self.status().await, SessionStatus::Exited)
    }

    pub async fn exit_record(&self) -> Option<ExitRecord> {
        *self.exit.lock().await
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.len().await
    }

    /// Recovered sessions have no PTY and reject writes.
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    fn touch_activity(&self) {
        self.last_activity_ms
            .fetch_max(store::now_ms(), Ordering::Relaxed);
    }

    /// Deliver input bytes to the PTY, in arrival order.
    pub async fn send_stdin(&self, data: Bytes) -> CoreResult<()> {
        if self.is_exited().await {
            return Err(CoreError::SessionExited);
        }
        let Some(pty) = &self.pty else {
            return Err(CoreError::NotReattachable);
        };
        if data.len() > self.max_payload {
            return Err(CoreError::PayloadTooLarge {
                size: data.len(),
                max: self.max_payload,
            });
        }
        if data.is_empty() {
            return Ok(());
        }
        if self.record_input {
            if let Some(rec) = &self.recording {
                rec.record_input(&data).await;
            }
        }
        pty.write(data)?;
        self.touch_activity();
        Ok(())
    }

    /// Apply a control command.
    pub async fn send_control(&self, cmd: ControlCommand) -> CoreResult<()> {
        match cmd {
            ControlCommand::Resize { cols, rows } => self.resize(cols, rows).await,
            ControlCommand::Kill { signal } => {
                let sig = match signal.as_deref() {
                    None => libc::SIGTERM,
                    Some(name) => parse_signal_name(name).ok_or_else(|| {
                        CoreError::ControlMessageFailed(format!("unknown signal {name:?}"))
                    })?,
                };
                self.kill(sig, KILL_GRACE).await.map(|_| ())
            }
            ControlCommand::ResetSize => {
                let (cols, rows) = self.original_size;
                match self.resize(cols, rows).await {
                    Ok(()) => Ok(()),
                    Err(e @ (CoreError::SessionExited | CoreError::NotReattachable)) => Err(e),
                    Err(e) => Err(CoreError::ResetSizeFailed(e.to_string())),
                }
            }
        }
    }

    /// Resize the PTY. Idempotent: repeating the current size is a no-op and
    /// produces no broadcast.
    pub async fn resize(&self, cols: u16, rows: u16) -> CoreResult<()> {
        if self.is_exited().await {
            return Err(CoreError::SessionExited);
        }
        let Some(pty) = &self.pty else {
            return Err(CoreError::NotReattachable);
        };
        if cols == 0 || rows == 0 {
            return Err(CoreError::InvalidOperation("zero-sized terminal".into()));
        }

        {
            let mut meta = self.meta.lock().await;
            if (meta.cols, meta.rows) == (cols, rows) {
                return Ok(());
            }
            meta.cols = cols;
            meta.rows = rows;
        }

        pty.resize(cols, rows)?;
        if let Some(rec) = &self.recording {
            rec.record_resize(cols, rows).await;
        }
        self.subscribers
            .publish(Envelope::Resize { cols, rows })
            .await;

        // Best-effort: keep session.json in sync with the live size.
        let meta = self.meta.lock().await.clone();
        if let Err(e) = store::write_session_meta(&self.control_dir, &meta).await {
            warn!("Failed to persist resize for session {}: {e}", meta.id);
        }
        Ok(())
    }

    /// Kill the session: `signal` first, SIGKILL once `grace` elapses, and
    /// return when the child has been reaped. Killing an already-exited
    /// session succeeds immediately with the recorded exit.
    pub async fn kill(&self, signal: i32, grace: Duration) -> CoreResult<Option<ExitRecord>> {
        if self.is_exited().await {
            return Ok(self.exit_record().await);
        }

        {
            let mut status = self.status.lock().await;
            if *status == SessionStatus::Running || *status == SessionStatus::Starting {
                *status = SessionStatus::Exiting;
            }
        }

        let Some(pty) = &self.pty else {
            return self.kill_detached(signal).await;
        };

        let deadline = tokio::time::Instant::now() + KILL_DEADLINE;
        if let Err(e) = pty.signal(signal) {
            // The group may already be gone; the reaper will confirm.
            warn!("Kill signal delivery failed: {e}");
        }

        let mut exited = self.exited_tx.subscribe();
        let escalate_at = tokio::time::Instant::now() + grace;

        // Phase 1: wait out the grace period for a voluntary exit.
        loop {
            if *exited.borrow() {
                return Ok(self.exit_record().await);
            }
            tokio::select! {
                changed = exited.changed() => {
                    if changed.is_err() {
                        return Ok(self.exit_record().await);
                    }
                }
                () = tokio::time::sleep_until(escalate_at) => break,
            }
        }

        // Phase 2: escalate and wait out the overall deadline.
        let _ = pty.signal(libc::SIGKILL);
        loop {
            if *exited.borrow() {
                return Ok(self.exit_record().await);
            }
            tokio::select! {
                changed = exited.changed() => {
                    if changed.is_err() {
                        return Ok(self.exit_record().await);
                    }
                }
                () = tokio::time::sleep_until(deadline) => return Err(CoreError::KillTimeout),
            }
        }
    }

    /// Kill path for recovered sessions: we never owned the child, so poll
    /// the pid until it disappears instead of waiting on a reaper.
    async fn kill_detached(&self, signal: i32) -> CoreResult<Option<ExitRecord>> {
        let pid = self.meta.lock().await.pid.unwrap_or(0);
        if pid == 0 {
            return Err(CoreError::ControlMessageFailed("no recorded pid".into()));
        }
        #[allow(clippy::cast_possible_wrap)]
        let pgid = pid as i32;
        unsafe {
            libc::kill(-pgid, signal);
        }

        let deadline = tokio::time::Instant::now() + KILL_DEADLINE;
        let escalate_at = tokio::time::Instant::now() + KILL_GRACE;
        let mut escalated = false;
        loop {
            let alive = unsafe { libc::kill(pgid, 0) } == 0;
            if !alive {
                let record = ExitRecord {
                    code: None,
                    signal: Some(signal),
                    ended_at: store::now_secs(),
                };
                self.mark_exited(record).await;
                return Ok(Some(record));
            }
            if !escalated && tokio::time::Instant::now() >= escalate_at {
                unsafe {
                    libc::kill(-pgid, libc::SIGKILL);
                }
                escalated = true;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::KillTimeout);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Best-effort signal without waiting for exit.
    pub async fn signal(&self, signal: i32) -> CoreResult<()> {
        if self.is_exited().await {
            return Err(CoreError::SessionExited);
        }
        match &self.pty {
            Some(pty) => pty.signal(signal),
            None => {
                let pid = self.meta.lock().await.pid.unwrap_or(0);
                if pid == 0 {
                    return Err(CoreError::ControlMessageFailed("no recorded pid".into()));
                }
                #[allow(clippy::cast_possible_wrap)]
                let ret = unsafe { libc::kill(-(pid as i32), signal) };
                if ret == 0 {
                    Ok(())
                } else {
                    Err(CoreError::ControlMessageFailed(format!(
                        "kill failed: {}",
                        std::io::Error::last_os_error()
                    )))
                }
            }
        }
    }

    /// Attach a sink. The current app status (if any) is queued immediately,
    /// before any subsequent output.
    pub async fn subscribe(&self, kind: SinkKind) -> CoreResult<Subscription> {
        if self.is_exited().await {
            return Err(CoreError::SessionExited);
        }
        let sub = self.subscribers.subscribe(kind).await;
        let status = self.last_app_status.lock().await.clone();
        if let Some(status) = status {
            self.subscribers
                .push_to(sub.id(), Envelope::Status(status))
                .await;
        }
        Ok(sub)
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.unsubscribe(id).await;
    }

    /// Store an app status record and broadcast it to every *other* sink.
    pub async fn set_app_status(&self, update: StatusUpdate, origin: Option<u64>) {
        *self.last_app_status.lock().await = Some(update.clone());
        self.subscribers
            .publish_except(origin, Envelope::Status(update))
            .await;
    }

    pub async fn last_app_status(&self) -> Option<StatusUpdate> {
        self.last_app_status.lock().await.clone()
    }

    pub async fn summary(&self) -> SessionSummary {
        let meta = self.meta.lock().await.clone();
        let exit = self.exit_record().await;
        SessionSummary {
            id: meta.id,
            name: meta.name,
            command: meta.command,
            cwd: meta.cwd,
            cols: meta.cols,
            rows: meta.rows,
            status: self.status().await,
            pid: meta.pid,
            created_at: meta.created_at,
            last_activity_at: self.last_activity_ms.load(Ordering::Relaxed),
            exit_code: exit.and_then(|e| e.code),
            exit_signal: exit.and_then(|e| e.signal),
            title_mode: meta.title_mode,
            shell: meta.shell,
            detached: self.detached,
            subscriber_count: self.subscriber_count().await,
            last_app_status: self.last_app_status().await,
        }
    }

    /// Flip to the terminal state, persist `exit.json`, close the recording,
    /// and notify subscribers and kill waiters.
    async fn mark_exited(&self, record: ExitRecord) {
        {
            let mut status = self.status.lock().await;
            if *status == SessionStatus::Exited {
                return;
            }
            *status = SessionStatus::Exited;
        }
        *self.exit.lock().await = Some(record);

        let id = self.id().await;
        if let Err(e) = store::write_exit_record(&self.control_dir, &record).await {
            warn!("Failed to write exit.json for session {id}: {e}");
        }
        if let Some(rec) = &self.recording {
            rec.close(Some((record.code, &id))).await;
        }
        self.subscribers
            .publish(Envelope::Exit(ExitInfo {
                code: record.code,
                signal: record.signal,
            }))
            .await;
        // Close every queue so consumers that missed the Exit envelope (full
        // queue) still observe end-of-stream and disconnect.
        self.subscribers.clear().await;
        let _ = self.exited_tx.send(true);

        info!(
            "Session {id} exited (code={:?}, signal={:?})",
            record.code, record.signal
        );
    }
}

/// The session pump: sole consumer of the PTY output channel. Forks every
/// chunk to the recording and the subscriber set, then finalizes the session
/// once the reader closes and the reaper reports.
async fn pump(
    session: Arc<Session>,
    mut out_rx: tokio::sync::mpsc::Receiver<Bytes>,
    transform: Option<OutputTransform>,
) {
    while let Some(chunk) = out_rx.recv().await {
        let chunk = match &transform {
            Some(t) => t(chunk),
            None => chunk,
        };
        if chunk.is_empty() {
            continue;
        }
        session.touch_activity();
        if let Some(rec) = &session.recording {
            rec.record_output(&chunk).await;
        }
        session.subscribers.publish(Envelope::Output(chunk)).await;
    }

    // Reader hit EOF: every produced byte has been recorded and fanned out.
    // Wait for the reaper's verdict.
    let info = match &session.pty {
        Some(pty) => {
            let mut exit_rx = pty.exit_watch();
            loop {
                if let Some(info) = *exit_rx.borrow() {
                    break info;
                }
                if exit_rx.changed().await.is_err() {
                    break ExitInfo {
                        code: Some(-1),
                        signal: None,
                    };
                }
            }
        }
        None => ExitInfo {
            code: Some(-1),
            signal: None,
        },
    };

    session
        .mark_exited(ExitRecord {
            code: info.code,
            signal: info.signal,
            ended_at: store::now_secs(),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn tuning() -> SessionTuning {
        SessionTuning {
            subscriber_queue_len: 256,
            backpressure_grace: Duration::from_secs(30),
            max_payload: 1024 * 1024,
            recording_queue_len: 1024,
            record_input: false,
        }
    }

    fn meta(id: &str, command: &[&str], dir: &Path) -> SessionMeta {
        SessionMeta {
            id: id.into(),
            name: id.into(),
            command: command.iter().map(ToString::to_string).collect(),
            cwd: dir.to_string_lossy().into_owned(),
            env: HashMap::new(),
            cols: 80,
            rows: 24,
            pid: None,
            created_at: store::now_secs(),
            title_mode: store::TitleMode::default(),
            shell: false,
        }
    }

    async fn wait_exited(session: &Session) {
        let mut rx = session.exited_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            rx.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_echo_session_records_and_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let m = meta("echo", &["/bin/sh", "-c", "echo hi"], dir.path());
        let session = Session::spawn(m, dir.path().to_path_buf(), &tuning(), None)
            .await
            .unwrap();
        let mut sub = session.subscribe(SinkKind::WsClient).await.unwrap();

        let mut output = Vec::new();
        loop {
            match sub.recv().await {
                Some(Envelope::Output(b)) => output.extend_from_slice(&b),
                Some(Envelope::Exit(info)) => {
                    assert_eq!(info.code, Some(0));
                    break;
                }
                Some(_) => {}
                None => break,
            }
        }
        assert!(String::from_utf8_lossy(&output).contains("hi"));

        wait_exited(&session).await;
        assert!(session.is_exited().await);

        let exit = store::read_exit_record(dir.path()).await.unwrap();
        assert_eq!(exit.code, Some(0));

        let recording = std::fs::read_to_string(store::recording_path(dir.path())).unwrap();
        assert!(recording.starts_with("{\"version\":2"));
        assert!(recording.contains("\"o\""));
    }

    #[tokio::test]
    async fn test_writes_after_exit_fail() {
        let dir = tempfile::tempdir().unwrap();
        let m = meta("short", &["/bin/true"], dir.path());
        let session = Session::spawn(m, dir.path().to_path_buf(), &tuning(), None)
            .await
            .unwrap();
        wait_exited(&session).await;

        let err = session.send_stdin(Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err.code(), "SESSION_EXITED");
        let err = session.resize(100, 50).await.unwrap_err();
        assert_eq!(err.code(), "SESSION_EXITED");
        let err = session
            .send_control(ControlCommand::ResetSize)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SESSION_EXITED");
        let err = session
            .subscribe(SinkKind::IpcClient)
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err.code(), "SESSION_EXITED");
    }

    #[tokio::test]
    async fn test_kill_already_exited_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let m = meta("dead", &["/bin/true"], dir.path());
        let session = Session::spawn(m, dir.path().to_path_buf(), &tuning(), None)
            .await
            .unwrap();
        wait_exited(&session).await;

        let exit = session.kill(libc::SIGTERM, KILL_GRACE).await.unwrap();
        assert_eq!(exit.and_then(|e| e.code), Some(0));
    }

    #[tokio::test]
    async fn test_kill_terminates_long_running_child() {
        let dir = tempfile::tempdir().unwrap();
        let m = meta("sleeper", &["/bin/sleep", "60"], dir.path());
        let session = Session::spawn(m, dir.path().to_path_buf(), &tuning(), None)
            .await
            .unwrap();

        let exit = session
            .kill(libc::SIGTERM, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(session.is_exited().await);
        assert!(exit.is_some());
    }

    #[tokio::test]
    async fn test_kill_escalates_when_sigterm_is_trapped() {
        let dir = tempfile::tempdir().unwrap();
        let m = meta(
            "stubborn",
            &["/bin/sh", "-c", "trap '' TERM; sleep 60"],
            dir.path(),
        );
        let session = Session::spawn(m, dir.path().to_path_buf(), &tuning(), None)
            .await
            .unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let exit = session
            .kill(libc::SIGTERM, Duration::from_millis(500))
            .await
            .unwrap();
        assert!(session.is_exited().await);
        assert_eq!(exit.and_then(|e| e.signal), Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_resize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let m = meta("cat", &["/bin/cat"], dir.path());
        let session = Session::spawn(m, dir.path().to_path_buf(), &tuning(), None)
            .await
            .unwrap();
        let mut sub = session.subscribe(SinkKind::WsClient).await.unwrap();

        session.resize(120, 40).await.unwrap();
        session.resize(120, 40).await.unwrap();

        // Exactly one resize broadcast despite two calls.
        let mut resizes = 0;
        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Some(env) = sub.try_recv() {
            if matches!(env, Envelope::Resize { .. }) {
                resizes += 1;
            }
        }
        assert_eq!(resizes, 1);

        session.kill(libc::SIGKILL, KILL_GRACE).await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_size_restores_creation_size() {
        let dir = tempfile::tempdir().unwrap();
        let m = meta("cat4", &["/bin/cat"], dir.path());
        let session = Session::spawn(m, dir.path().to_path_buf(), &tuning(), None)
            .await
            .unwrap();
        let mut sub = session.subscribe(SinkKind::WsClient).await.unwrap();

        session.resize(120, 40).await.unwrap();
        session.send_control(ControlCommand::ResetSize).await.unwrap();
        // Already back at the creation size, so this one is a no-op.
        session.send_control(ControlCommand::ResetSize).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut resizes = Vec::new();
        while let Some(env) = sub.try_recv() {
            if let Envelope::Resize { cols, rows } = env {
                resizes.push((cols, rows));
            }
        }
        assert_eq!(resizes, vec![(120, 40), (80, 24)]);

        let meta = session.meta_snapshot().await;
        assert_eq!((meta.cols, meta.rows), (80, 24));

        session.kill(libc::SIGKILL, KILL_GRACE).await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_size_on_recovered_session_not_reattachable() {
        let dir = tempfile::tempdir().unwrap();
        let m = meta("ghost2", &["/bin/cat"], dir.path());
        let session = Session::recovered_running(m, dir.path().to_path_buf(), &tuning());

        let err = session
            .send_control(ControlCommand::ResetSize)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_REATTACHABLE");
    }

    #[tokio::test]
    async fn test_status_broadcast_skips_origin_and_replays_on_subscribe() {
        let dir = tempfile::tempdir().unwrap();
        let m = meta("cat2", &["/bin/cat"], dir.path());
        let session = Session::spawn(m, dir.path().to_path_buf(), &tuning(), None)
            .await
            .unwrap();
        let mut a = session.subscribe(SinkKind::IpcClient).await.unwrap();
        let mut b = session.subscribe(SinkKind::IpcClient).await.unwrap();

        let status = StatusUpdate {
            app: "claude".into(),
            status: "thinking".into(),
            extras: serde_json::Map::new(),
        };
        session.set_app_status(status, Some(a.id())).await;

        assert!(matches!(b.recv().await, Some(Envelope::Status(_))));
        assert!(a.try_recv().is_none());

        // A later subscriber sees the stored status immediately.
        let mut c = session.subscribe(SinkKind::IpcClient).await.unwrap();
        assert!(matches!(c.recv().await, Some(Envelope::Status(s)) if s.app == "claude"));

        session.kill(libc::SIGKILL, KILL_GRACE).await.unwrap();
    }

    #[tokio::test]
    async fn test_detached_session_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let m = meta("ghost", &["/bin/cat"], dir.path());
        let session = Session::recovered_running(m, dir.path().to_path_buf(), &tuning());

        let err = session.send_stdin(Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err.code(), "NOT_REATTACHABLE");
        let err = session.resize(10, 10).await.unwrap_err();
        assert_eq!(err.code(), "NOT_REATTACHABLE");

        // Status fan-out still works on a detached session.
        assert!(session.subscribe(SinkKind::IpcClient).await.is_ok());
    }

    #[tokio::test]
    async fn test_oversized_stdin_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let m = meta("cat3", &["/bin/cat"], dir.path());
        let mut t = tuning();
        t.max_payload = 8;
        let session = Session::spawn(m, dir.path().to_path_buf(), &t, None)
            .await
            .unwrap();

        let err = session
            .send_stdin(Bytes::from_static(b"way too much data"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PAYLOAD_TOO_LARGE");

        session.kill(libc::SIGKILL, KILL_GRACE).await.unwrap();
    }
}
