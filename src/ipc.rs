//! Per-session IPC server on a Unix domain socket.
//!
//! Each session gets one listener at `<controlDir>/ipc.sock`. Clients speak
//! the framed protocol from [`crate::protocol`]; every accepted connection
//! runs on its own task, bridging its subscription and the socket, so a
//! stalled peer never affects the session or other clients.
//!
//! On accept the server immediately queues the session's current app status
//! (if any) as a STATUS_UPDATE frame. Per-frame dispatch:
//!
//! - STDIN_DATA → session input (and PTY output flows back out as 0x01 frames)
//! - CONTROL_CMD → resize / kill / reset-size
//! - STATUS_UPDATE → stored and broadcast to every other client
//! - HEARTBEAT → echoed immediately
//! - ERROR → logged and ignored
//!
//! Fatal framing errors and the connection limit elicit a single ERROR frame
//! followed by disconnect. Session exit closes the connection after all
//! buffered output has been written.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::protocol::{
    ControlCommand, ErrorFrame, FrameCodec, FrameType, StatusUpdate, WireFrame,
};
use crate::session::fanout::{Envelope, SinkKind};
use crate::session::Session;

/// A running IPC listener for one session.
pub struct IpcServer {
    path: PathBuf,
    accept_task: tokio::task::JoinHandle<()>,
}

impl IpcServer {
    /// Bind `<controlDir>/ipc.sock` (replacing a stale file from a previous
    /// run) and start accepting clients.
    pub fn spawn(
        session: Arc<Session>,
        path: PathBuf,
        max_connections: usize,
        max_frame: usize,
    ) -> std::io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        // Restrict the socket to the owning user for its whole lifetime.
        let old_umask = unsafe { libc::umask(0o177) };
        let listener = UnixListener::bind(&path);
        unsafe {
            libc::umask(old_umask);
        }
        let listener = listener?;

        let conns = Arc::new(AtomicUsize::new(0));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            session,
            conns,
            max_connections,
            max_frame,
        ));

        Ok(Self { path, accept_task })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Stop accepting and remove the socket file. Connected clients keep
    /// their streams until they disconnect on their own.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: UnixListener,
    session: Arc<Session>,
    conns: Arc<AtomicUsize>,
    max_connections: usize,
    max_frame: usize,
) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("IPC accept error: {e}");
                continue;
            }
        };

        let active = conns.fetch_add(1, Ordering::SeqCst);
        if active >= max_connections {
            conns.fetch_sub(1, Ordering::SeqCst);
            let err = CoreError::ConnectionLimit {
                limit: max_connections,
            };
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, FrameCodec::new(max_frame));
                let _ = framed.send(ErrorFrame::from_error(&err).into_frame()).await;
            });
            continue;
        }

        let session = Arc::clone(&session);
        let conns = Arc::clone(&conns);
        tokio::spawn(async move {
            handle_client(stream, session, max_frame).await;
            conns.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

/// How an envelope maps onto the wire.
enum Deliver {
    Frame(WireFrame),
    Skip,
    Close,
}

fn envelope_to_frame(envelope: Envelope) -> Deliver {
    match envelope {
        Envelope::Output(bytes) => Deliver::Frame(WireFrame::new(FrameType::StdinData, bytes)),
        Envelope::Status(update) => match serde_json::to_vec(&update) {
            Ok(json) => Deliver::Frame(WireFrame::new(FrameType::StatusUpdate, json)),
            Err(_) => Deliver::Skip,
        },
        // Resize has no wire representation on the IPC socket; WS viewers
        // receive it as a JSON event.
        Envelope::Resize { .. } => Deliver::Skip,
        Envelope::Resync => Deliver::Frame(
            ErrorFrame {
                code: "RESYNC".to_string(),
                message: "output dropped for this connection; state may have a gap".to_string(),
                details: None,
            }
            .into_frame(),
        ),
        // Connection close after drain is the exit notification.
        Envelope::Exit(_) => Deliver::Close,
    }
}

async fn handle_client(stream: UnixStream, session: Arc<Session>, max_frame: usize) {
    let framed = Framed::new(stream, FrameCodec::new(max_frame));
    let (mut sink, mut frames) = framed.split();

    let mut sub = match session.subscribe(SinkKind::IpcClient).await {
        Ok(sub) => sub,
        Err(e) => {
            let _ = sink.send(ErrorFrame::from_error(&e).into_frame()).await;
            let _ = sink.close().await;
            return;
        }
    };
    let sub_id = sub.id();
    debug!("IPC client {sub_id} connected");

    // One loop owns the sink and bridges both directions: subscription
    // envelopes out, frame dispatch in. Exits when the peer disconnects, the
    // session exits, the subscriber is evicted, or a fatal protocol error.
    loop {
        tokio::select! {
            envelope = sub.recv() => match envelope {
                Some(envelope) => match envelope_to_frame(envelope) {
                    Deliver::Frame(frame) => {
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Deliver::Skip => {}
                    Deliver::Close => break,
                },
                None => {
                    if sub.was_evicted() {
                        let err = CoreError::Backpressure;
                        let frame = ErrorFrame::from_error(&err)
                            .with_details(serde_json::json!({ "dropped": sub.dropped() }))
                            .into_frame();
                        let _ = sink.send(frame).await;
                    }
                    break;
                }
            },
            incoming = frames.next() => match incoming {
                None => break,
                Some(Err(e)) => {
                    let core = CoreError::MalformedFrame(e.to_string());
                    let _ = sink.send(ErrorFrame::from_error(&core).into_frame()).await;
                    break;
                }
                Some(Ok(frame)) => match dispatch_frame(&session, sub_id, frame).await {
                    Ok(Some(reply)) => {
                        if sink.send(reply).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let fatal = e.is_fatal_for_connection();
                        let _ = sink.send(ErrorFrame::from_error(&e).into_frame()).await;
                        if fatal {
                            break;
                        }
                    }
                },
            },
        }
    }

    session.unsubscribe(sub_id).await;
    let _ = sink.close().await;
    debug!("IPC client {sub_id} disconnected");
}

/// Handle one inbound frame. Returns an immediate reply frame, if any.
async fn dispatch_frame(
    session: &Arc<Session>,
    sub_id: u64,
    frame: WireFrame,
) -> CoreResult<Option<WireFrame>> {
    match frame.frame_type() {
        None => Err(CoreError::InvalidMessageType(frame.kind)),
        Some(FrameType::StdinData) => {
            session.send_stdin(frame.payload).await?;
            Ok(None)
        }
        Some(FrameType::ControlCmd) => {
            let cmd: ControlCommand = serde_json::from_slice(&frame.payload)
                .map_err(|e| CoreError::MessageProcessing(format!("invalid control payload: {e}")))?;
            session.send_control(cmd).await?;
            Ok(None)
        }
        Some(FrameType::StatusUpdate) => {
            let update: StatusUpdate = serde_json::from_slice(&frame.payload)
                .map_err(|e| CoreError::MessageProcessing(format!("invalid status payload: {e}")))?;
            session.set_app_status(update, Some(sub_id)).await;
            Ok(None)
        }
        Some(FrameType::Heartbeat) => Ok(Some(WireFrame::empty(FrameType::Heartbeat))),
        Some(FrameType::Error) => {
            warn!(
                "IPC client reported error: {}",
                String::from_utf8_lossy(&frame.payload)
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::{self, SessionMeta, TitleMode};
    use crate::session::SessionTuning;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::time::Duration;

    fn tuning() -> SessionTuning {
        SessionTuning {
            subscriber_queue_len: 256,
            backpressure_grace: Duration::from_secs(30),
            max_payload: 1024 * 1024,
            recording_queue_len: 1024,
            record_input: false,
        }
    }

    async fn cat_session(dir: &std::path::Path) -> Arc<Session> {
        let meta = SessionMeta {
            id: "ipc-test".into(),
            name: "cat".into(),
            command: vec!["/bin/cat".into()],
            cwd: "/".into(),
            env: HashMap::new(),
            cols: 80,
            rows: 24,
            pid: None,
            created_at: store::now_secs(),
            title_mode: TitleMode::default(),
            shell: false,
        };
        Session::spawn(meta, dir.to_path_buf(), &tuning(), None)
            .await
            .unwrap()
    }

    type Client = Framed<UnixStream, FrameCodec>;

    async fn connect(path: &std::path::Path) -> Client {
        let stream = UnixStream::connect(path).await.unwrap();
        Framed::new(stream, FrameCodec::default())
    }

    async fn recv_frame(client: &mut Client) -> WireFrame {
        tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("frame error")
    }

    #[tokio::test]
    async fn test_fanout_to_two_clients_and_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let session = cat_session(dir.path()).await;
        let sock = store::socket_path(dir.path());
        let _server = IpcServer::spawn(Arc::clone(&session), sock.clone(), 64, 1024 * 1024)
            .unwrap();

        let mut a = connect(&sock).await;
        let mut b = connect(&sock).await;
        // Let both subscriptions register before producing output.
        tokio::time::sleep(Duration::from_millis(100)).await;

        a.send(WireFrame::new(FrameType::StdinData, &b"hello\n"[..]))
            .await
            .unwrap();

        for client in [&mut a, &mut b] {
            let frame = recv_frame(client).await;
            assert_eq!(frame.frame_type(), Some(FrameType::StdinData));
            assert!(String::from_utf8_lossy(&frame.payload).contains("hello"));
        }

        // Heartbeat echoes back on the same connection.
        a.send(WireFrame::empty(FrameType::Heartbeat)).await.unwrap();
        let echo = recv_frame(&mut a).await;
        assert_eq!(echo.frame_type(), Some(FrameType::Heartbeat));

        session.kill(libc::SIGKILL, Duration::from_secs(3)).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_broadcast_and_replay_on_accept() {
        let dir = tempfile::tempdir().unwrap();
        let session = cat_session(dir.path()).await;
        let sock = store::socket_path(dir.path());
        let _server = IpcServer::spawn(Arc::clone(&session), sock.clone(), 64, 1024 * 1024)
            .unwrap();

        let mut a = connect(&sock).await;
        let mut b = connect(&sock).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = br#"{"app":"claude","status":"thinking"}"#;
        a.send(WireFrame::new(FrameType::StatusUpdate, &status[..]))
            .await
            .unwrap();

        let frame = recv_frame(&mut b).await;
        assert_eq!(frame.frame_type(), Some(FrameType::StatusUpdate));
        let update: StatusUpdate = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(update.app, "claude");

        // A new client gets the stored status immediately on accept.
        let mut c = connect(&sock).await;
        let frame = recv_frame(&mut c).await;
        assert_eq!(frame.frame_type(), Some(FrameType::StatusUpdate));

        session.kill(libc::SIGKILL, Duration::from_secs(3)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_type_gets_error_frame() {
        let dir = tempfile::tempdir().unwrap();
        let session = cat_session(dir.path()).await;
        let sock = store::socket_path(dir.path());
        let _server = IpcServer::spawn(Arc::clone(&session), sock.clone(), 64, 1024 * 1024)
            .unwrap();

        let mut client = connect(&sock).await;
        client
            .send(WireFrame {
                kind: 0x7f,
                payload: Bytes::new(),
            })
            .await
            .unwrap();

        let frame = recv_frame(&mut client).await;
        assert_eq!(frame.frame_type(), Some(FrameType::Error));
        let err: ErrorFrame = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(err.code, "INVALID_MESSAGE_TYPE");

        session.kill(libc::SIGKILL, Duration::from_secs(3)).await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_limit_rejects_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let session = cat_session(dir.path()).await;
        let sock = store::socket_path(dir.path());
        let _server =
            IpcServer::spawn(Arc::clone(&session), sock.clone(), 1, 1024 * 1024).unwrap();

        let _first = connect(&sock).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut second = connect(&sock).await;
        let frame = recv_frame(&mut second).await;
        assert_eq!(frame.frame_type(), Some(FrameType::Error));
        let err: ErrorFrame = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(err.code, "CONNECTION_LIMIT");

        session.kill(libc::SIGKILL, Duration::from_secs(3)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let session = cat_session(dir.path()).await;
        let sock = store::socket_path(dir.path());
        std::fs::write(&sock, b"stale").unwrap();

        let _server = IpcServer::spawn(Arc::clone(&session), sock.clone(), 64, 1024 * 1024)
            .unwrap();
        let mut client = connect(&sock).await;
        client.send(WireFrame::empty(FrameType::Heartbeat)).await.unwrap();
        let echo = recv_frame(&mut client).await;
        assert_eq!(echo.frame_type(), Some(FrameType::Heartbeat));

        session.kill(libc::SIGKILL, Duration::from_secs(3)).await.unwrap();
    }
}
