//! The WebSocket session state machine: establish, banner, authenticate,
//! spawn, pump, close. One instance per browser connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::protocol::{
    banner_frames, output_frame, parse_auth, parse_client_command, parse_window_size, pong_frame,
    ClientCommand,
};
use crate::pty::PtyHandle;
use crate::queue::{OutputFrame, OutputQueue};
use crate::registry::Registry;

/// The fragment-reassembly cap mentioned in the design notes: tungstenite
/// already defragments multi-frame messages for us, so this bounds the
/// message itself rather than a hand-rolled assembly buffer.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// The shareable, thread-safe half of a Session: everything the registry,
/// the writer task, and the PTY reader thread need to touch.
pub struct SessionHandle {
    pub id: Uuid,
    pub peer_addr: String,
    pub hostname: String,
    config: Arc<Config>,
    initialized: AtomicBool,
    authenticated: AtomicBool,
    running: AtomicBool,
    /// Claimed synchronously (compare-exchange) the moment a JSON_DATA
    /// message is accepted, before the blocking fork/exec even starts.
    /// `has_child()` only goes true once `spawn_blocking` returns, which is
    /// too late to stop a second JSON_DATA processed in the meantime.
    spawn_claimed: AtomicBool,
    size: Mutex<(u16, u16)>,
    pty: Mutex<Option<PtyHandle>>,
    pub queue: Arc<OutputQueue>,
    pub close_notify: Arc<Notify>,
}

impl SessionHandle {
    fn new(id: Uuid, peer_addr: String, hostname: String, config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer_addr,
            hostname,
            config,
            initialized: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            running: AtomicBool::new(false),
            spawn_claimed: AtomicBool::new(false),
            size: Mutex::new((0, 0)),
            pty: Mutex::new(None),
            queue: Arc::new(OutputQueue::new()),
            close_notify: Arc::new(Notify::new()),
        })
    }

    #[cfg(test)]
    pub fn new_for_test() -> Arc<Self> {
        Self::new(
            Uuid::new_v4(),
            "127.0.0.1:0".to_string(),
            "localhost".to_string(),
            Arc::new(crate::config::test_support::minimal_config()),
        )
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn has_child(&self) -> bool {
        self.pty.lock().unwrap().is_some()
    }

    /// Atomically claims the right to spawn this session's one-and-only
    /// child. Returns `true` for exactly one caller across the session's
    /// lifetime, even if two JSON_DATA messages race ahead of the blocking
    /// fork/exec that eventually sets `pty`.
    fn claim_spawn(&self) -> bool {
        self.spawn_claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Signals the reader thread and writer task to stop and tears the
    /// child process down. Called both from the session's own close path
    /// and from a process-wide shutdown fan-out.
    pub fn request_close(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.close_notify.notify_waiters();
        if let Some(pty) = self.pty.lock().unwrap().take() {
            pty.terminate(self.config.sig_code);
        }
    }
}

/// Runs one session to completion: sends the banner, then pumps input and
/// output until the WebSocket closes or the child exits.
pub async fn run<S>(
    ws: WebSocketStream<S>,
    config: Arc<Config>,
    registry: Arc<Registry>,
    peer_addr: String,
    hostname: String,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = Uuid::new_v4();
    let handle = SessionHandle::new(id, peer_addr.clone(), hostname.clone(), config.clone());
    registry.insert(id, handle.clone());
    info!(%id, peer = %peer_addr, host = %hostname, clients = registry.count(), "WS established");

    let (mut ws_write, mut ws_read) = ws.split();

    let argv0 = config.argv.first().map(String::as_str).unwrap_or("");
    for frame in banner_frames(argv0, &hostname, config.reconnect, &config.client_opt) {
        if let Err(e) = ws_write.send(Message::Text(frame)).await {
            warn!(%id, "failed to send banner frame: {e}");
            registry.remove(&id);
            return;
        }
    }
    handle.initialized.store(true, Ordering::Release);

    let writer_handle = handle.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            let frame = writer_handle.queue.wait_and_pop().await;
            match frame {
                OutputFrame::Data(bytes) => {
                    if ws_write.send(Message::Text(output_frame(&bytes))).await.is_err() {
                        writer_handle.request_close();
                        break;
                    }
                }
                OutputFrame::Raw(text) => {
                    if ws_write.send(Message::Text(text)).await.is_err() {
                        writer_handle.request_close();
                        break;
                    }
                }
                OutputFrame::Eof => {
                    let _ = ws_write
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        })))
                        .await;
                    writer_handle.request_close();
                    break;
                }
                OutputFrame::ReadError => {
                    let _ = ws_write
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Error,
                            reason: "".into(),
                        })))
                        .await;
                    writer_handle.request_close();
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = handle.close_notify.notified() => {
                break;
            }
            msg = ws_read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !dispatch(text.into_bytes(), &handle, &config).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if !dispatch(data, &handle, &config).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {
                        // Transport-level control frames; tungstenite answers pings itself.
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(%id, "WS closed by client");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(%id, "WS error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    handle.request_close();
    writer_task.abort();
    registry.remove(&id);
    info!(%id, clients = registry.count(), "WS closed");
}

/// Handles one complete client message. Returns `false` if the session
/// should close.
async fn dispatch(buf: Vec<u8>, handle: &Arc<SessionHandle>, config: &Arc<Config>) -> bool {
    let command = match parse_client_command(&buf) {
        Ok(c) => c,
        Err(e) => {
            warn!(id = %handle.id, "{e}");
            return false;
        }
    };

    if !matches!(command, ClientCommand::Json(_))
        && config.credential.is_some()
        && !handle.is_authenticated()
    {
        warn!(id = %handle.id, "WS client not authenticated");
        return false;
    }

    match command {
        ClientCommand::Input(payload) => {
            if config.readonly {
                return true;
            }
            let pty = handle.pty.lock().unwrap();
            match pty.as_ref() {
                Some(pty) => match pty.write(payload) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(id = %handle.id, "write INPUT to pty failed: {e}");
                        false
                    }
                },
                None => true, // no PTY yet; drop per spec
            }
        }
        ClientCommand::Ping => {
            handle.queue.push(OutputFrame::Raw(pong_frame()));
            true
        }
        ClientCommand::Resize(payload) => {
            match parse_window_size(payload) {
                Ok(resize) => {
                    *handle.size.lock().unwrap() = (resize.columns, resize.rows);
                    if let Some(pty) = handle.pty.lock().unwrap().as_ref() {
                        if let Err(e) = pty.resize(resize.columns, resize.rows) {
                            warn!(id = %handle.id, "{e}");
                        }
                    }
                }
                Err(e) => warn!(id = %handle.id, "invalid resize payload: {e}"),
            }
            true
        }
        ClientCommand::Json(payload) => {
            if !handle.claim_spawn() {
                return true; // already spawned (or spawning); ignore per spec
            }
            if config.credential.is_some() {
                let token = parse_auth(payload).ok().and_then(|a| a.auth_token);
                if !config.check_auth_token(token.as_deref()) {
                    warn!(id = %handle.id, "WS authentication failed");
                    return false;
                }
            }
            handle.authenticated.store(true, Ordering::Release);
            spawn_child(handle.clone(), config.clone());
            true
        }
    }
}

/// Spawns the session's child process off the async runtime (PTY allocation
/// and fork/exec are blocking syscalls) and starts a dedicated reader thread
/// that feeds PTY output into the session's queue until EOF or error.
fn spawn_child(handle: Arc<SessionHandle>, config: Arc<Config>) {
    tokio::spawn(async move {
        let argv = config.argv.clone();
        let size = *handle.size.lock().unwrap();
        let initial_size = if size.0 > 0 && size.1 > 0 { Some(size) } else { None };

        let spawned = tokio::task::spawn_blocking(move || PtyHandle::spawn(&argv, initial_size)).await;

        let pty = match spawned {
            Ok(Ok(pty)) => pty,
            Ok(Err(e)) => {
                warn!(id = %handle.id, "failed to spawn child: {e}");
                handle.queue.push(OutputFrame::ReadError);
                return;
            }
            Err(e) => {
                warn!(id = %handle.id, "spawn_blocking join error: {e}");
                handle.queue.push(OutputFrame::ReadError);
                return;
            }
        };

        let mut reader = match pty.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => {
                warn!(id = %handle.id, "failed to clone pty reader: {e}");
                handle.queue.push(OutputFrame::ReadError);
                return;
            }
        };

        *handle.pty.lock().unwrap() = Some(pty);

        let reader_handle = handle.clone();
        tokio::task::spawn_blocking(move || {
            use std::io::Read;
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        reader_handle.queue.push(OutputFrame::Eof);
                        break;
                    }
                    Ok(n) => reader_handle.queue.push(OutputFrame::Data(buf[..n].to_vec())),
                    Err(e) => {
                        warn!(id = %reader_handle.id, "pty read failed: {e}");
                        reader_handle.queue.push(OutputFrame::ReadError);
                        break;
                    }
                }
            }
        });
    });
}
