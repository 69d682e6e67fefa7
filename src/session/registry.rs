//! Process-wide session registry.
//!
//! The registry is the single authority for creating, looking up, and
//! destroying sessions, and it owns the on-disk control root. It is
//! cloneable; all clones share the same inner state.
//!
//! ## Concurrency
//!
//! The session map is behind an `RwLock`. Lookups take a read lock;
//! create/remove hold the write lock across their check-and-insert so two
//! racing creates cannot collide.
//!
//! ## Startup recovery
//!
//! On start the registry scans the control root. A directory whose recorded
//! pid is still alive (verified against `/proc/<pid>/cmdline`) becomes a
//! *detached-running* session: its IPC socket is rebound, output history can
//! be tailed, but input and resize return `NOT_REATTACHABLE` since the PTY
//! belonged to the dead server process. A directory whose pid is gone becomes
//! an exited session with the code from `exit.json`, or unknown. With
//! `cleanup_on_startup`, exited directories older than the threshold are
//! deleted.

use std::collections::HashMap;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use super::store::{self, SessionMeta, TitleMode};
use super::{OutputTransform, Session, SessionStatus, SessionSummary, SessionTuning};
use crate::error::{CoreError, CoreResult};
use crate::ipc::IpcServer;

/// Platform cap on `sockaddr_un` paths (104 on the BSDs and macOS, 108 on
/// Linux). Validated against the smaller value so control roots stay
/// portable.
pub const SOCKET_PATH_MAX: usize = 104;

/// Request to create a session.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub name: Option<String>,
    pub command: Vec<String>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub title_mode: Option<TitleMode>,
    pub shell: bool,
}

/// Registry-level knobs, resolved from the server config.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub tuning: SessionTuning,
    pub ipc_max_connections: usize,
    pub max_frame: usize,
    pub default_title_mode: TitleMode,
    pub default_cols: u16,
    pub default_rows: u16,
    pub default_cwd: String,
}

struct SessionEntry {
    session: Arc<Session>,
    ipc: Option<IpcServer>,
}

struct RegistryInner {
    root: PathBuf,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    settings: RegistrySettings,
    transform: Option<OutputTransform>,
}

/// Cloneable handle to the registry.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Create a registry over `root`, creating the directory if needed.
    pub fn new(
        root: PathBuf,
        settings: RegistrySettings,
        transform: Option<OutputTransform>,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            inner: Arc::new(RegistryInner {
                root,
                sessions: RwLock::new(HashMap::new()),
                settings,
                transform,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Create a session: control dir, `session.json`, PTY, recording, and
    /// IPC socket.
    pub async fn create(&self, spec: CreateSpec) -> CoreResult<Arc<Session>> {
        let settings = &self.inner.settings;
        let id = Uuid::new_v4().to_string();
        let dir = self.inner.root.join(&id);

        let socket = store::socket_path(&dir);
        let socket_len = socket.as_os_str().as_bytes().len();
        if socket_len >= SOCKET_PATH_MAX {
            return Err(CoreError::PathTooLong {
                len: socket_len,
                max: SOCKET_PATH_MAX,
            });
        }

        if spec.command.is_empty() {
            return Err(CoreError::InvalidOperation("empty command".into()));
        }

        let mut builder = std::fs::DirBuilder::new();
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder
            .create(&dir)
            .map_err(|e| CoreError::internal("failed to create control dir", e))?;

        let meta = SessionMeta {
            id: id.clone(),
            name: spec
                .name
                .unwrap_or_else(|| command_label(&spec.command)),
            command: spec.command,
            cwd: spec.cwd.unwrap_or_else(|| settings.default_cwd.clone()),
            env: spec.env,
            cols: spec.cols.unwrap_or(settings.default_cols),
            rows: spec.rows.unwrap_or(settings.default_rows),
            pid: None,
            created_at: store::now_secs(),
            title_mode: spec.title_mode.unwrap_or(settings.default_title_mode),
            shell: spec.shell,
        };

        let session = match Session::spawn(
            meta,
            dir.clone(),
            &settings.tuning,
            self.inner.transform.clone(),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                // Leave no half-created directory behind.
                let _ = fs::remove_dir_all(&dir).await;
                return Err(e);
            }
        };

        let meta = session.meta_snapshot().await;
        let pid = meta.pid.unwrap_or(0);
        if let Err(e) = store::write_session_meta(&dir, &meta).await {
            warn!("Failed to write session.json for {id}: {e}");
        }

        let ipc = match IpcServer::spawn(
            Arc::clone(&session),
            socket,
            settings.ipc_max_connections,
            settings.max_frame,
        ) {
            Ok(server) => Some(server),
            Err(e) => {
                // A session without its socket violates the one-socket-per-
                // session contract; tear everything down.
                let _ = session.kill(libc::SIGKILL, Duration::from_secs(1)).await;
                let _ = fs::remove_dir_all(&dir).await;
                return Err(CoreError::internal("failed to bind IPC socket", e));
            }
        };

        let mut sessions = self.inner.sessions.write().await;
        sessions.insert(
            id.clone(),
            SessionEntry {
                session: Arc::clone(&session),
                ipc,
            },
        );
        info!("Session {id} created (pid {pid}), total: {}", sessions.len());
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner
            .sessions
            .read()
            .await
            .get(id)
            .map(|entry| Arc::clone(&entry.session))
    }

    /// Like [`get`](Self::get) but with the not-found error already applied.
    pub async fn require(&self, id: &str) -> CoreResult<Arc<Session>> {
        self.get(id)
            .await
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.inner.sessions.read().await;
        let mut summaries = Vec::with_capacity(sessions.len());
        for entry in sessions.values() {
            summaries.push(entry.session.summary().await);
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    /// Remove an exited session and delete its control directory. Fails while
    /// the session is running or has attached subscribers.
    pub async fn remove(&self, id: &str) -> CoreResult<()> {
        let mut sessions = self.inner.sessions.write().await;
        let Some(entry) = sessions.get(id) else {
            return Err(CoreError::SessionNotFound(id.to_string()));
        };
        if !entry.session.is_exited().await {
            return Err(CoreError::InvalidOperation(
                "session is still running".into(),
            ));
        }
        if entry.session.subscriber_count().await > 0 {
            return Err(CoreError::InvalidOperation(
                "session has attached subscribers".into(),
            ));
        }
        let entry = sessions.remove(id).expect("checked above");
        drop(sessions);

        if let Some(ipc) = entry.ipc {
            ipc.shutdown();
        }
        remove_dir_atomic(&self.inner.root, id).await;
        info!("Session {id} removed");
        Ok(())
    }

    /// Startup sweep: rebuild sessions from the control root. Returns
    /// `(recovered_running, recovered_exited)`.
    pub async fn recover(&self) -> (usize, usize) {
        let mut running = 0usize;
        let mut exited = 0usize;

        let Ok(mut entries) = fs::read_dir(&self.inner.root).await else {
            return (0, 0);
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(dir_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            // A crashed removal leaves a `.removing` tombstone; finish the job.
            if dir_name.ends_with(".removing") {
                let _ = fs::remove_dir_all(&path).await;
                continue;
            }

            let mut meta = match store::read_session_meta(&path).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("Skipping unreadable session dir {dir_name}: {e}");
                    continue;
                }
            };
            if meta.id != dir_name {
                warn!("Session dir {dir_name} disagrees with its metadata id; using dir name");
                meta.id = dir_name.to_string();
            }

            let settings = &self.inner.settings;
            let pid = meta.pid.unwrap_or(0);
            if pid != 0 && pid_runs_command(pid, &meta.command) {
                let session =
                    Session::recovered_running(meta, path.clone(), &settings.tuning);
                let ipc = match IpcServer::spawn(
                    Arc::clone(&session),
                    store::socket_path(&path),
                    settings.ipc_max_connections,
                    settings.max_frame,
                ) {
                    Ok(server) => Some(server),
                    Err(e) => {
                        warn!("Failed to rebind IPC socket for {dir_name}: {e}");
                        None
                    }
                };
                self.inner
                    .sessions
                    .write()
                    .await
                    .insert(dir_name.to_string(), SessionEntry { session, ipc });
                info!("Recovered running session {dir_name} (pid {pid}, read-only)");
                running += 1;
            } else {
                let exit = store::read_exit_record(&path).await;
                let session =
                    Session::recovered_exited(meta, path.clone(), &settings.tuning, exit);
                self.inner
                    .sessions
                    .write()
                    .await
                    .insert(dir_name.to_string(), SessionEntry { session, ipc: None });
                info!(
                    "Recovered exited session {dir_name} (code={:?})",
                    exit.and_then(|e| e.code)
                );
                exited += 1;
            }
        }

        (running, exited)
    }

    /// Delete exited sessions whose tombstone is older than `max_age`.
    /// Intended for startup right after [`recover`](Self::recover).
    pub async fn cleanup_stale(&self, max_age: Duration) -> usize {
        let now = store::now_secs();
        let cutoff = now.saturating_sub(max_age.as_secs());

        let stale: Vec<String> = {
            let sessions = self.inner.sessions.read().await;
            let mut stale = Vec::new();
            for (id, entry) in sessions.iter() {
                if !entry.session.is_exited().await {
                    continue;
                }
                let ended_at = entry
                    .session
                    .exit_record()
                    .await
                    .map_or(0, |e| e.ended_at);
                if ended_at <= cutoff {
                    stale.push(id.clone());
                }
            }
            stale
        };

        let mut removed = 0usize;
        for id in stale {
            let entry = self.inner.sessions.write().await.remove(&id);
            if let Some(entry) = entry {
                if let Some(ipc) = entry.ipc {
                    ipc.shutdown();
                }
                remove_dir_atomic(&self.inner.root, &id).await;
                info!("Cleaned up stale session {id}");
                removed += 1;
            }
        }
        removed
    }

    /// Periodic sweep: shut down IPC listeners of exited sessions that no
    /// longer have subscribers. The sessions stay listed for inspection until
    /// removed explicitly. Returns how many listeners were reaped.
    pub async fn reap(&self) -> usize {
        let mut sessions = self.inner.sessions.write().await;
        let mut reaped = 0usize;
        for (id, entry) in sessions.iter_mut() {
            if entry.ipc.is_some()
                && entry.session.is_exited().await
                && entry.session.subscriber_count().await == 0
            {
                if let Some(ipc) = entry.ipc.take() {
                    ipc.shutdown();
                    info!("Reaped IPC listener for exited session {id}");
                    reaped += 1;
                }
            }
        }
        reaped
    }

    /// Kill every session (server shutdown): SIGTERM all at once, wait up to
    /// 3 s, SIGKILL the rest.
    pub async fn kill_all(&self) {
        let snapshot: Vec<Arc<Session>> = {
            let sessions = self.inner.sessions.read().await;
            sessions
                .values()
                .map(|entry| Arc::clone(&entry.session))
                .collect()
        };
        if snapshot.is_empty() {
            return;
        }

        for session in &snapshot {
            let _ = session.signal(libc::SIGTERM).await;
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let mut all_exited = true;
            for session in &snapshot {
                if !session.is_exited().await {
                    all_exited = false;
                    break;
                }
            }
            if all_exited || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for session in &snapshot {
            if !session.is_exited().await {
                let _ = session.signal(libc::SIGKILL).await;
            }
        }

        let mut sessions = self.inner.sessions.write().await;
        for entry in sessions.values_mut() {
            if let Some(ipc) = entry.ipc.take() {
                ipc.shutdown();
            }
        }
        info!("Shut down {} session(s)", snapshot.len());
    }

    /// Count sessions by liveness, for the health endpoint.
    pub async fn running_count(&self) -> usize {
        let sessions = self.inner.sessions.read().await;
        let mut running = 0;
        for entry in sessions.values() {
            if !matches!(entry.session.status().await, SessionStatus::Exited) {
                running += 1;
            }
        }
        running
    }
}

/// Human label when no name was given: basename of the program.
fn command_label(command: &[String]) -> String {
    command
        .first()
        .map(|p| p.rsplit('/').next().unwrap_or(p).to_string())
        .unwrap_or_else(|| "session".to_string())
}

/// Rename-then-delete so a crash mid-removal never leaves a half-deleted
/// directory that recovery would misread.
async fn remove_dir_atomic(root: &Path, id: &str) {
    let dir = root.join(id);
    let tomb = root.join(format!("{id}.removing"));
    match fs::rename(&dir, &tomb).await {
        Ok(()) => {
            if let Err(e) = fs::remove_dir_all(&tomb).await {
                warn!("Failed to delete {}: {e}", tomb.display());
            }
        }
        Err(e) => {
            warn!("Failed to stage {} for removal: {e}", dir.display());
            let _ = fs::remove_dir_all(&dir).await;
        }
    }
}

/// Check whether `pid` is alive and its cmdline still matches the recorded
/// command (guards against pid reuse). Unverifiable pids are treated as dead.
fn pid_runs_command(pid: u32, command: &[String]) -> bool {
    #[allow(clippy::cast_possible_wrap)]
    let alive = unsafe { libc::kill(pid as i32, 0) } == 0;
    if !alive {
        return false;
    }

    let Some(program) = command.first() else {
        return false;
    };
    let wanted = program.rsplit('/').next().unwrap_or(program);

    std::fs::read(format!("/proc/{pid}/cmdline"))
        .ok()
        .and_then(|bytes| {
            let exe = bytes.split(|&b| b == 0).next()?;
            let exe = std::str::from_utf8(exe).ok()?;
            Some(exe.contains(wanted))
        })
        .unwrap_or(false)
}
