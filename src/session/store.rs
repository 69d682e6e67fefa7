//! On-disk control directory layout.
//!
//! Each session owns `<controlRoot>/<id>/` containing:
//!
//! ```text
//! session.json   # spec + immutable metadata
//! ipc.sock       # Unix domain socket
//! stdout         # asciinema-style recording
//! exit.json      # written at exit: {code, signal, endedAt}
//! ```
//!
//! JSON files are written to a temp name in the same directory and renamed
//! into place so readers never observe a torn file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

pub const SESSION_FILE: &str = "session.json";
pub const SOCKET_FILE: &str = "ipc.sock";
pub const RECORDING_FILE: &str = "stdout";
pub const EXIT_FILE: &str = "exit.json";

/// How (if at all) the terminal title is rewritten for this session. The
/// rewrite itself is an injected output transform; the mode is carried as
/// metadata so clients can render accordingly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TitleMode {
    None,
    Filter,
    Static,
    #[default]
    Dynamic,
}

/// Contents of `session.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: String,
    pub name: String,
    pub command: Vec<String>,
    pub cwd: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
    #[serde(default)]
    pub pid: Option<u32>,
    /// Seconds since the epoch.
    pub created_at: u64,
    #[serde(default)]
    pub title_mode: TitleMode,
    /// Run the command line through `/bin/sh -c`.
    #[serde(default)]
    pub shell: bool,
}

/// Contents of `exit.json`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitRecord {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Seconds since the epoch.
    pub ended_at: u64,
}

pub fn session_json_path(dir: &Path) -> PathBuf {
    dir.join(SESSION_FILE)
}

pub fn socket_path(dir: &Path) -> PathBuf {
    dir.join(SOCKET_FILE)
}

pub fn recording_path(dir: &Path) -> PathBuf {
    dir.join(RECORDING_FILE)
}

pub fn exit_json_path(dir: &Path) -> PathBuf {
    dir.join(EXIT_FILE)
}

/// Current time, seconds since the epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Current time, milliseconds since the epoch.
pub fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Write a JSON file atomically: temp file in the same directory, then rename.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &json).await?;
    fs::rename(&tmp, path).await
}

pub async fn write_session_meta(dir: &Path, meta: &SessionMeta) -> std::io::Result<()> {
    write_json_atomic(&session_json_path(dir), meta).await
}

pub async fn read_session_meta(dir: &Path) -> std::io::Result<SessionMeta> {
    let raw = fs::read(session_json_path(dir)).await?;
    serde_json::from_slice(&raw)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

pub async fn write_exit_record(dir: &Path, record: &ExitRecord) -> std::io::Result<()> {
    write_json_atomic(&exit_json_path(dir), record).await
}

/// Read `exit.json`, tolerating its absence (crash before exit) and corruption.
pub async fn read_exit_record(dir: &Path) -> Option<ExitRecord> {
    let raw = fs::read(exit_json_path(dir)).await.ok()?;
    match serde_json::from_slice(&raw) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("Corrupt exit.json in {}: {e}", dir.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> SessionMeta {
        SessionMeta {
            id: "abc-123".into(),
            name: "build".into(),
            command: vec!["cargo".into(), "build".into()],
            cwd: "/tmp".into(),
            env: HashMap::from([("TERM".into(), "xterm-256color".into())]),
            cols: 80,
            rows: 24,
            pid: Some(4242),
            created_at: 1_700_000_000,
            title_mode: TitleMode::Dynamic,
            shell: false,
        }
    }

    #[tokio::test]
    async fn test_session_meta_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let meta = sample_meta();
        write_session_meta(dir.path(), &meta).await.unwrap();
        let back = read_session_meta(dir.path()).await.unwrap();
        assert_eq!(back.id, meta.id);
        assert_eq!(back.command, meta.command);
        assert_eq!(back.pid, Some(4242));
        assert_eq!(back.title_mode, TitleMode::Dynamic);
    }

    #[tokio::test]
    async fn test_session_json_uses_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        write_session_meta(dir.path(), &sample_meta()).await.unwrap();
        let raw = std::fs::read_to_string(session_json_path(dir.path())).unwrap();
        assert!(raw.contains("\"createdAt\""));
        assert!(raw.contains("\"titleMode\""));
        assert!(!raw.contains("\"created_at\""));
    }

    #[tokio::test]
    async fn test_atomic_write_leaves_no_temp_file(){
        let dir = tempfile::tempdir().unwrap();
        write_session_meta(dir.path(), &sample_meta()).await.unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_exit_record_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_exit_record(dir.path()).await.is_none());

        std::fs::write(exit_json_path(dir.path()), b"not json").unwrap();
        assert!(read_exit_record(dir.path()).await.is_none());

        let record = ExitRecord {
            code: Some(0),
            signal: None,
            ended_at: 1_700_000_100,
        };
        write_exit_record(dir.path(), &record).await.unwrap();
        let back = read_exit_record(dir.path()).await.unwrap();
        assert_eq!(back.code, Some(0));
        assert_eq!(back.ended_at, 1_700_000_100);
    }
}
