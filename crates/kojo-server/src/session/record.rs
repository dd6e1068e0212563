//! The per-session record: mutable state, subscriber fan-out, input and
//! resize plumbing, prompt-detector hooks, and the epoch signals the
//! manager's loops coordinate on.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use kojo_core::{KojoError, KojoResult, SessionInfo, SessionStatus};

use super::prompt::{PromptScanner, YoloApproval};
use super::pty::PtyHandle;
use super::ring_buffer::RingBuffer;
use super::tmux;
use super::tools::Tool;

/// Subscriber channel capacity in chunks. A subscriber that falls this far
/// behind starts losing chunks rather than stalling the session.
const SUBSCRIBER_CAPACITY: usize = 1024;

/// Debug-tail channel capacity in strings.
const DEBUG_CAPACITY: usize = 16;

const WRITE_RETRIES: u32 = 5;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Handle for removing a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// One session: a child process, its I/O streams, and everyone watching.
pub struct Session {
    pub id: String,
    pub tool: Tool,
    pub work_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub internal: bool,
    pub parent_id: Option<String>,

    pub(crate) scrollback: RingBuffer,
    state: StdMutex<State>,
    subs: StdMutex<Subscribers>,
}

/// Mutable per-epoch state, guarded by the record mutex.
pub(crate) struct State {
    pub args: Vec<String>,
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
    pub yolo_mode: bool,
    pub tool_session_id: Option<String>,
    pub mux_name: Option<String>,
    /// True while Restart is in progress; blocks Stop and a second Restart.
    pub restarting: bool,

    pub pty: Option<Arc<PtyHandle>>,

    // pipe-pane: raw pane output captured via FIFO (bypasses tmux
    // screen-diff batching)
    pub raw_pipe: Option<Arc<File>>,
    pub raw_pipe_path: Option<PathBuf>,

    /// Last accepted dimensions, for resize deduplication (mobile clients
    /// send frequent resize events).
    pub last_cols: u16,
    pub last_rows: u16,

    /// Trailing output captured on exit, for persistence.
    pub last_output: Vec<u8>,

    pub scanner: PromptScanner,

    /// Closed (set true) once per epoch when the session terminates.
    pub done: Arc<watch::Sender<bool>>,
    /// Closed when the current read loop returns.
    pub read_done: Arc<watch::Sender<bool>>,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    chunks: HashMap<u64, mpsc::Sender<Vec<u8>>>,
    debug: HashMap<u64, mpsc::Sender<String>>,
}

pub(crate) struct NewSessionParams {
    pub id: String,
    pub tool: Tool,
    pub work_dir: PathBuf,
    pub args: Vec<String>,
    pub yolo_mode: bool,
    pub parent_id: Option<String>,
    pub tool_session_id: Option<String>,
    pub mux_name: Option<String>,
    pub scrollback_bytes: usize,
}

pub(crate) fn new_signal() -> Arc<watch::Sender<bool>> {
    Arc::new(watch::channel(false).0)
}

impl Session {
    /// A freshly created, running session.
    pub(crate) fn new(params: NewSessionParams) -> Self {
        let internal = params.tool.is_internal();
        Self {
            id: params.id,
            tool: params.tool,
            work_dir: params.work_dir,
            created_at: Utc::now(),
            internal,
            parent_id: params.parent_id,
            scrollback: RingBuffer::new(params.scrollback_bytes),
            state: StdMutex::new(State {
                args: params.args,
                status: SessionStatus::Running,
                exit_code: None,
                yolo_mode: params.yolo_mode,
                tool_session_id: params.tool_session_id.clone(),
                mux_name: params.mux_name,
                restarting: false,
                pty: None,
                raw_pipe: None,
                raw_pipe_path: None,
                last_cols: 0,
                last_rows: 0,
                last_output: Vec::new(),
                scanner: PromptScanner::new(
                    params.tool.prints_session_id() && params.tool_session_id.is_none(),
                ),
                done: new_signal(),
                read_done: new_signal(),
            }),
            subs: StdMutex::new(Subscribers::default()),
        }
    }

    /// A session rebuilt from persisted metadata, exited until the manager
    /// reattaches it.
    pub(crate) fn restore(
        info: &SessionInfo,
        tool: Tool,
        created_at: DateTime<Utc>,
        last_output: Vec<u8>,
        scrollback_bytes: usize,
    ) -> Self {
        Self {
            id: info.id.clone(),
            tool,
            work_dir: PathBuf::from(&info.work_dir),
            created_at,
            internal: info.internal || tool.is_internal(),
            parent_id: info.parent_id.clone(),
            scrollback: RingBuffer::new(scrollback_bytes),
            state: StdMutex::new(State {
                args: info.args.clone(),
                status: SessionStatus::Exited,
                exit_code: info.exit_code,
                yolo_mode: info.yolo_mode,
                tool_session_id: info.tool_session_id.clone(),
                mux_name: info.mux_name.clone(),
                restarting: false,
                pty: None,
                raw_pipe: None,
                raw_pipe_path: None,
                last_cols: info.last_cols.unwrap_or(0),
                last_rows: info.last_rows.unwrap_or(0),
                last_output,
                scanner: PromptScanner::new(
                    tool.prints_session_id() && info.tool_session_id.is_none(),
                ),
                done: new_signal(),
                read_done: new_signal(),
            }),
            subs: StdMutex::new(Subscribers::default()),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn subs_lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a subscriber. The scrollback snapshot is taken under the
    /// subscriber lock, so the returned channel carries exactly the chunks
    /// produced after the snapshot: no duplication, no gap.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<Vec<u8>>, Vec<u8>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let mut subs = self.subs_lock();
        subs.next_id += 1;
        let id = subs.next_id;
        subs.chunks.insert(id, tx);
        let snapshot = self.scrollback.snapshot();
        drop(subs);
        (SubscriberId(id), rx, snapshot)
    }

    /// Remove a subscriber; dropping its sender closes the stream.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subs_lock().chunks.remove(&id.0);
    }

    /// Register a debug observer for cleaned prompt-detector tails.
    pub fn subscribe_debug(&self) -> (SubscriberId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(DEBUG_CAPACITY);
        let mut subs = self.subs_lock();
        subs.next_id += 1;
        let id = subs.next_id;
        subs.debug.insert(id, tx);
        (SubscriberId(id), rx)
    }

    pub fn unsubscribe_debug(&self, id: SubscriberId) {
        self.subs_lock().debug.remove(&id.0);
    }

    /// Consume one output chunk: append to scrollback, fan out to
    /// subscribers, feed the id capture and the prompt detector. Returns
    /// an approval when yolo mode matched a prompt.
    pub(crate) fn ingest(&self, data: &[u8]) -> Option<YoloApproval> {
        {
            // Scrollback write and broadcast happen under the subscriber
            // lock so a concurrent subscribe() observes either both or
            // neither (keeps snapshot+stream free of gaps and duplicates).
            let subs = self.subs_lock();
            self.scrollback.write(data);
            for tx in subs.chunks.values() {
                // slow consumer: drop the chunk, never block the session
                let _ = tx.try_send(data.to_vec());
            }
        }

        self.capture_tool_session_id(data);

        let (approval, debug_tail) = self.check_yolo(data);
        if !debug_tail.is_empty() {
            self.broadcast_debug(&debug_tail);
        }
        approval
    }

    fn broadcast_debug(&self, tail: &str) {
        let subs = self.subs_lock();
        for tx in subs.debug.values() {
            let _ = tx.try_send(tail.to_string());
        }
    }

    /// Send input bytes to the attach PTY.
    ///
    /// The PTY is transiently absent while a reattach is in flight; retry
    /// briefly instead of dropping user input, bailing out early if the
    /// session terminates during the wait.
    pub async fn write(&self, data: &[u8]) -> KojoResult<()> {
        let mut done = self.done();
        for attempt in 0..WRITE_RETRIES {
            let writer = self.state().pty.as_ref().map(|p| p.writer());
            if let Some(writer) = writer {
                let mut w = writer.lock().await;
                w.write_all(data)?;
                w.flush()?;
                return Ok(());
            }
            if attempt < WRITE_RETRIES - 1 {
                tokio::select! {
                    _ = tokio::time::sleep(WRITE_RETRY_DELAY) => {}
                    _ = done.wait_for(|d| *d) => return Err(KojoError::Closed),
                }
            }
        }
        Err(KojoError::Closed)
    }

    /// Set the PTY window size; for mux-backed sessions also resize the
    /// tmux window when the dimensions actually changed.
    pub async fn resize(&self, cols: u16, rows: u16) -> KojoResult<()> {
        let (pty, mux_name, prev) = {
            let st = self.state();
            (st.pty.clone(), st.mux_name.clone(), (st.last_cols, st.last_rows))
        };
        let Some(pty) = pty else {
            return Err(KojoError::Closed);
        };
        pty.resize(cols, rows)?;

        if let Some(name) = mux_name.as_deref() {
            if (cols, rows) != prev {
                if let Err(e) = tmux::resize_window(name, cols, rows).await {
                    // dedup state stays untouched so the resize is retried
                    // on the next event
                    debug!(session = %name, error = %e, "tmux resize failed");
                    return Ok(());
                }
            }
        }

        let mut st = self.state();
        st.last_cols = cols;
        st.last_rows = rows;
        Ok(())
    }

    /// Immutable snapshot of the session metadata.
    pub fn info(&self) -> SessionInfo {
        let st = self.state();
        SessionInfo {
            id: self.id.clone(),
            tool: self.tool.name().to_string(),
            work_dir: self.work_dir.to_string_lossy().into_owned(),
            args: st.args.clone(),
            status: st.status,
            exit_code: st.exit_code,
            yolo_mode: st.yolo_mode,
            internal: self.internal,
            created_at: self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            tool_session_id: st.tool_session_id.clone(),
            parent_id: self.parent_id.clone(),
            mux_name: st.mux_name.clone(),
            last_output: if st.last_output.is_empty() {
                None
            } else {
                Some(BASE64.encode(&st.last_output))
            },
            last_cols: (st.last_cols > 0).then_some(st.last_cols),
            last_rows: (st.last_rows > 0).then_some(st.last_rows),
        }
    }

    /// Signal that resolves when the current epoch terminates.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.state().done.subscribe()
    }

    pub(crate) fn close_done(&self) {
        let done = self.state().done.clone();
        let _ = done.send(true);
    }

    pub fn is_running(&self) -> bool {
        self.state().status == SessionStatus::Running
    }

    pub(crate) fn read_done_rx(&self) -> watch::Receiver<bool> {
        self.state().read_done.subscribe()
    }

    /// Detach the raw-pipe handle and path for cleanup.
    pub(crate) fn take_pipe(&self) -> (Option<Arc<File>>, Option<PathBuf>) {
        let mut st = self.state();
        (st.raw_pipe.take(), st.raw_pipe_path.take())
    }

    pub fn set_yolo_mode(&self, enabled: bool) {
        let mut st = self.state();
        st.yolo_mode = enabled;
        st.scanner.clear_approval_tail();
    }

    pub fn is_yolo_mode(&self) -> bool {
        self.state().yolo_mode
    }

    /// Feed a chunk to the approval detector. Inactive unless yolo mode is
    /// armed. Returns the approval (if matched) and the cleaned tail.
    pub fn check_yolo(&self, data: &[u8]) -> (Option<YoloApproval>, String) {
        let mut st = self.state();
        if !st.yolo_mode {
            return (None, String::new());
        }
        st.scanner.check_approval(data)
    }

    /// Try to capture a tool-reported session id from output. Only the
    /// first capture of an epoch sticks.
    pub fn capture_tool_session_id(&self, data: &[u8]) {
        let mut st = self.state();
        if st.tool_session_id.is_some() {
            return;
        }
        if let Some(id) = st.scanner.capture_session_id(data) {
            st.tool_session_id = Some(id);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("tool", &self.tool)
            .finish()
    }
}
