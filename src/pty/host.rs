//! Async host around one PTY-backed child process.
//!
//! A [`PtyHost`] owns three background tasks:
//!
//! - **reader** — drains the master fd and emits output chunks on a channel;
//!   adjacent reads are coalesced within a short window (≤ 4 ms) so bulk
//!   output doesn't arrive one syscall-read at a time while interactive
//!   echo stays snappy.
//! - **writer** — the single consumer of the command ingress; input bytes and
//!   resizes are applied to the master strictly in arrival order.
//! - **reaper** — waits on the child and publishes its exit status on a
//!   watch channel.
//!
//! The reader treats any read error as EOF: a closed PTY raises EIO on
//! Linux, which simply means the child is gone.

use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::spawn::{resize_pty, PtyPair};
use crate::error::{CoreError, CoreResult};

/// Read buffer size for a single `read()` from the master.
const READ_BUF: usize = 8192;

/// Stop coalescing once a chunk reaches this size.
const COALESCE_LIMIT: usize = 16 * 1024;

/// How long to wait for an adjacent read before emitting the chunk.
const COALESCE_WINDOW: Duration = Duration::from_millis(4);

/// Capacity of the output channel between the reader and the session pump.
const OUTPUT_CHANNEL: usize = 64;

/// Commands serialized onto the PTY writer task.
#[derive(Debug)]
pub enum PtyCommand {
    /// Write raw bytes to the child's stdin.
    Write(Bytes),
    /// Change the terminal window size.
    Resize { cols: u16, rows: u16 },
}

/// Exit status published by the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// A spawned child attached to a PTY, with its I/O tasks running.
pub struct PtyHost {
    pid: u32,
    cmd_tx: mpsc::UnboundedSender<PtyCommand>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl PtyHost {
    /// Take ownership of an allocated PTY and spawned child and start the
    /// reader/writer/reaper tasks. Returns the host plus the channel on which
    /// output chunks arrive; the channel closes once the PTY reaches EOF.
    pub fn start(pty: PtyPair, mut child: Child) -> std::io::Result<(Self, mpsc::Receiver<Bytes>)> {
        let pid = child.id().unwrap_or(0);
        let master = pty.master;
        let master_raw: RawFd = master.as_raw_fd();

        // Dup the master: one fd for the writer, one for the reader. The
        // original stays alive for resize ioctls.
        let writer_fd: RawFd = unsafe { libc::dup(master_raw) };
        if writer_fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let reader_fd: RawFd = unsafe { libc::dup(master_raw) };
        if reader_fd < 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(writer_fd);
            }
            return Err(err);
        }

        // SAFETY: we own these file descriptors via dup
        let master_write =
            tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(writer_fd) });
        let master_read =
            tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(reader_fd) });

        let master = Arc::new(master);

        // Writer task: the only path through which input and resizes reach
        // the PTY, so their relative order is preserved.
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<PtyCommand>();
        let resize_master = Arc::clone(&master);
        let writer_task = tokio::spawn(async move {
            let mut writer = master_write;
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    PtyCommand::Write(data) => {
                        if writer.write_all(&data).await.is_err() {
                            break;
                        }
                        if writer.flush().await.is_err() {
                            break;
                        }
                    }
                    PtyCommand::Resize { cols, rows } => {
                        if let Err(e) = resize_pty(&resize_master, cols, rows) {
                            warn!("PTY resize to {cols}x{rows} failed: {e}");
                        }
                    }
                }
            }
        });

        // Reader task: master → output channel, with short-window coalescing.
        let (out_tx, out_rx) = mpsc::channel::<Bytes>(OUTPUT_CHANNEL);
        let reader_task = tokio::spawn(async move {
            let mut reader = master_read;
            let mut tmp = [0u8; READ_BUF];
            'outer: loop {
                let n = match reader.read(&mut tmp).await {
                    // A read error (EIO on a closed pty) is a normal child exit.
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let mut chunk = BytesMut::from(&tmp[..n]);
                let mut eof = false;
                while chunk.len() < COALESCE_LIMIT {
                    match tokio::time::timeout(COALESCE_WINDOW, reader.read(&mut tmp)).await {
                        Ok(Ok(0)) | Ok(Err(_)) => {
                            eof = true;
                            break;
                        }
                        Ok(Ok(more)) => chunk.extend_from_slice(&tmp[..more]),
                        Err(_) => break,
                    }
                }
                if out_tx.send(chunk.freeze()).await.is_err() {
                    break 'outer;
                }
                if eof {
                    break;
                }
            }
            debug!("PTY reader finished");
        });

        // Reaper task: wait on the child, publish the exit status.
        let (exit_tx, exit_rx) = watch::channel::<Option<ExitInfo>>(None);
        let reaper_task = tokio::spawn(async move {
            let info = match child.wait().await {
                Ok(status) => ExitInfo {
                    code: status.code(),
                    signal: status.signal(),
                },
                Err(e) => {
                    warn!("Child wait error: {e}");
                    ExitInfo {
                        code: Some(-1),
                        signal: None,
                    }
                }
            };
            let _ = exit_tx.send(Some(info));
        });

        Ok((
            Self {
                pid,
                cmd_tx,
                exit_rx,
                tasks: vec![writer_task, reader_task, reaper_task],
            },
            out_rx,
        ))
    }

    /// OS process id of the child.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Queue a command for the writer task.
    pub fn send(&self, cmd: PtyCommand) -> CoreResult<()> {
        self.cmd_tx.send(cmd).map_err(|_| CoreError::SessionExited)
    }

    /// Queue raw input bytes.
    pub fn write(&self, data: Bytes) -> CoreResult<()> {
        self.send(PtyCommand::Write(data))
    }

    /// Queue a window resize.
    pub fn resize(&self, cols: u16, rows: u16) -> CoreResult<()> {
        self.send(PtyCommand::Resize { cols, rows })
    }

    /// Send a signal to the child's process group, best-effort.
    ///
    /// The child is a session leader via `setsid()`, so its pgid equals its
    /// pid and `kill(-pgid, …)` reaches the whole process tree.
    pub fn signal(&self, signal: i32) -> CoreResult<()> {
        #[allow(clippy::cast_possible_wrap)]
        let pgid = self.pid as i32;
        if pgid <= 0 {
            return Err(CoreError::ControlMessageFailed("no process group".into()));
        }
        let ret = unsafe { libc::kill(-pgid, signal) };
        if ret == 0 {
            Ok(())
        } else {
            Err(CoreError::ControlMessageFailed(format!(
                "kill(-{pgid}, {signal}) failed: {}",
                std::io::Error::last_os_error()
            )))
        }
    }

    /// Watch for the child's exit status.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    /// Exit status if the child has already been reaped.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Abort the background tasks (used on forced teardown).
    pub fn abort_tasks(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
