//! Session lifecycle management.
//!
//! The manager owns the session map, starts and reattaches tmux-backed
//! sessions, runs the per-session loops, recovers persisted sessions on
//! startup, and orchestrates graceful and forced termination.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use portable_pty::CommandBuilder;
use tokio::sync::oneshot;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use kojo_core::{KojoError, KojoResult, SessionStatus};

use crate::config::ServerConfig;

use super::pty::{default_winsize, PtyHandle};
use super::record::{new_signal, NewSessionParams, Session};
use super::store::Store;
use super::tmux;
use super::tools::{self, Tool};

/// Maximum time to wait for the read loop to finish draining output after
/// the session process exits. Closing a FIFO fd opened with O_RDWR may not
/// reliably interrupt a blocked read() on some kernels, so a timeout keeps
/// finalization from leaving the session stuck in "running" forever.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Maximum time to wait for the attach process to exit after being killed.
const EXIT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period between SIGTERM and SIGKILL after Stop.
const SIGKILL_DELAY: Duration = Duration::from_secs(5);

/// Per-session wait during StopAll for direct-PTY sessions.
const STOP_ALL_WAIT: Duration = Duration::from_secs(10);

const PANE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MAX_CONSECUTIVE_PANE_ERRORS: u32 = 10;

/// Trailing scrollback preserved as lastOutput when a session exits.
const MAX_LAST_OUTPUT: usize = 8192;

const READ_CHUNK: usize = 32 * 1024;
const YOLO_WRITE_DELAY: Duration = Duration::from_millis(100);

type ExitCallback = Box<dyn Fn(&Arc<Session>) + Send + Sync>;

/// Owns every session record and the loops that keep them alive.
pub struct Manager {
    sessions: StdMutex<HashMap<String, Arc<Session>>>,
    store: Store,
    scrollback_bytes: usize,
    shutting_down: AtomicBool,
    on_session_exit: StdMutex<Option<ExitCallback>>,
}

/// Blocking reader over the shared pipe-pane FIFO handle.
struct FifoReader(Arc<std::fs::File>);

impl Read for FifoReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut file = &*self.0;
        file.read(buf)
    }
}

struct MuxAttach {
    pty: PtyHandle,
    raw_pipe: Option<std::fs::File>,
    raw_pipe_path: Option<std::path::PathBuf>,
}

impl Manager {
    /// Build the manager: restore persisted sessions (reattaching those
    /// whose tmux sessions survived) and clean up orphans.
    ///
    /// Orphaned tmux sessions are only killed when the persisted state
    /// loaded successfully. On a load failure "known" would be empty and
    /// every live kojo_ session would be killed by mistake.
    pub async fn new(config: &ServerConfig) -> Arc<Manager> {
        let manager = Arc::new(Manager {
            sessions: StdMutex::new(HashMap::new()),
            store: Store::new(config.sessions_file.clone(), config.retention_days),
            scrollback_bytes: config.scrollback_bytes,
            shutting_down: AtomicBool::new(false),
            on_session_exit: StdMutex::new(None),
        });
        let load_ok = manager.load_persisted_sessions().await;
        if load_ok {
            manager.cleanup_orphaned_sessions().await;
        }
        manager
    }

    /// Register the observer invoked once per session exit.
    pub fn set_on_session_exit<F>(&self, f: F)
    where
        F: Fn(&Arc<Session>) + Send + Sync + 'static,
    {
        let mut slot = self
            .on_session_exit
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(Box::new(f));
    }

    fn sessions_lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Restore previously saved sessions. Tmux-backed sessions whose pane
    /// is still running are reattached and monitored again. Returns true
    /// when the persisted state was loaded successfully (or was empty).
    async fn load_persisted_sessions(self: &Arc<Self>) -> bool {
        let infos = match self.store.load().await {
            Ok(infos) => infos,
            Err(e) => {
                error!(error = %e, "failed to load persisted sessions, skipping orphan cleanup");
                return false;
            }
        };

        let count = infos.len();
        for info in infos {
            let Some(tool) = Tool::parse(&info.tool) else {
                warn!(id = %info.id, tool = %info.tool, "skipping persisted session with unknown tool");
                continue;
            };
            let created_at = DateTime::parse_from_rfc3339(&info.created_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            let last_output = info
                .last_output
                .as_deref()
                .map(|encoded| BASE64.decode(encoded).unwrap_or_default())
                .unwrap_or_default();

            let session = Arc::new(Session::restore(
                &info,
                tool,
                created_at,
                last_output,
                self.scrollback_bytes,
            ));

            let mut restored = false;

            if let Some(mux_name) = info.mux_name.clone() {
                if tmux::has_session(&mux_name).await {
                    match tmux::pane_dead(&mux_name).await {
                        Ok((false, _)) => {
                            restored = self.reattach_restored(&session, &mux_name).await;
                        }
                        Ok((true, exit_code)) => {
                            session.state().exit_code = Some(exit_code);
                            let _ = tmux::kill_session(&mux_name).await;
                        }
                        Err(e) => {
                            // can't determine pane state; kill to avoid an orphan
                            warn!(id = %info.id, mux = %mux_name, error = %e,
                                "failed to check tmux pane state, killing session");
                            let _ = tmux::kill_session(&mux_name).await;
                        }
                    }
                }
            }

            if !restored {
                session.close_done();
            }

            self.sessions_lock().insert(info.id.clone(), session);
        }

        if count > 0 {
            info!(count, "restored persisted sessions");
        }
        true
    }

    /// Attach a PTY and pipe-pane to a persisted session whose pane is
    /// still running.
    async fn reattach_restored(self: &Arc<Self>, session: &Arc<Session>, mux_name: &str) -> bool {
        tmux::ensure_server_config().await;

        let (raw_pipe, raw_pipe_path) = match tmux::start_pipe_pane(mux_name).await {
            Ok((file, path)) => (Some(Arc::new(file)), Some(path)),
            Err(e) => {
                warn!(id = %session.id, error = %e, "pipe-pane setup failed on restore");
                (None, None)
            }
        };

        let size = {
            let st = session.state();
            default_winsize(st.last_cols, st.last_rows)
        };
        let pty = match PtyHandle::spawn(tmux::attach_command(mux_name), size) {
            Ok(pty) => Arc::new(pty),
            Err(e) => {
                tmux::cleanup_pipe_pane(mux_name, raw_pipe, raw_pipe_path).await;
                error!(id = %session.id, error = %e, "failed to reattach persisted tmux session");
                let _ = tmux::kill_session(mux_name).await;
                return false;
            }
        };

        let has_pipe = raw_pipe.is_some();
        {
            let mut st = session.state();
            st.pty = Some(pty);
            st.raw_pipe = raw_pipe;
            st.raw_pipe_path = raw_pipe_path;
            st.status = SessionStatus::Running;
            st.exit_code = None;
            st.last_output = Vec::new();
            st.read_done = new_signal();
        }

        // Seed the scrollback with the current screen so the terminal is
        // not blank after a host restart: pipe-pane only carries new
        // output. In fallback mode the attach PTY redraws by itself.
        if has_pipe {
            if let Some(content) = tmux::capture_pane_content(mux_name).await {
                if !content.is_empty() {
                    session.scrollback.write(&content);
                }
            }
        }

        self.start_loops(session);
        info!(id = %session.id, mux = %mux_name, "reattached to persisted tmux session");
        true
    }

    /// Kill kojo_ tmux sessions that no loaded record claims, and sweep
    /// stale FIFO files left behind by crashes.
    async fn cleanup_orphaned_sessions(&self) {
        let names = match tmux::list_kojo_sessions().await {
            Ok(names) => names,
            Err(e) => {
                debug!(error = %e, "failed to list tmux sessions for cleanup");
                return;
            }
        };

        let known: HashSet<String> = {
            let sessions = self.sessions_lock();
            sessions
                .values()
                .filter_map(|s| {
                    let st = s.state();
                    if st.status == SessionStatus::Running {
                        st.mux_name.clone()
                    } else {
                        None
                    }
                })
                .collect()
        };

        for name in names {
            if !known.contains(&name) {
                info!(name = %name, "killing orphaned tmux session");
                let _ = tmux::kill_session(&name).await;
            }
        }

        if let Ok(entries) = std::fs::read_dir(tmux::fifo_dir()) {
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let Some(name) = file_name.to_str().and_then(|n| n.strip_suffix(".pipe")) else {
                    continue;
                };
                if !known.contains(name) {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
    }

    /// Start a new session for `tool_name` in `work_dir`.
    ///
    /// The stored args are exactly the caller's args; injected resume or
    /// session-id flags only affect the launch command.
    pub async fn create(
        self: &Arc<Self>,
        tool_name: &str,
        work_dir: &std::path::Path,
        args: Vec<String>,
        yolo_mode: bool,
        parent_id: Option<String>,
    ) -> KojoResult<Arc<Session>> {
        let (tool, tool_path) = tools::resolve_tool(tool_name)?;

        if !work_dir.is_dir() {
            return Err(KojoError::WorkDir(work_dir.display().to_string()));
        }

        let id = tools::generate_id();

        let mut tool_session_id = None;
        let mut run_args = args.clone();
        match tool {
            // claude: assign a stable session id up front so --resume works later
            Tool::Claude => {
                let (prepared, tsid) = tools::prepare_claude_args(&args);
                run_args = prepared;
                tool_session_id = tsid;
            }
            // internal tmux tool: fixed attach-or-create invocation
            Tool::Tmux => {
                let name = tmux::session_name(&id);
                run_args = vec![
                    "new-session".into(),
                    "-A".into(),
                    "-s".into(),
                    name.clone(),
                    "-c".into(),
                    work_dir.display().to_string(),
                ];
                tool_session_id = Some(name);
            }
            // codex: session id is captured from PTY output in the read loop
            // gemini: no session id mechanism; restarts use --resume latest
            Tool::Codex | Tool::Gemini => {}
        }

        let mut mux_name = None;
        let mut raw_pipe = None;
        let mut raw_pipe_path = None;
        let pty;

        if tool.is_user() {
            // User tools run inside a tmux session for crash resilience.
            let name = tmux::session_name(&id);
            let attach = self
                .start_mux_attach(&name, work_dir, &tool_path, &run_args, 0, 0)
                .await?;
            pty = Arc::new(attach.pty);
            raw_pipe = attach.raw_pipe.map(Arc::new);
            raw_pipe_path = attach.raw_pipe_path;
            mux_name = Some(name);
        } else {
            // Internal tools (tmux) get a direct PTY.
            let mut cmd = CommandBuilder::new(&tool_path);
            cmd.args(run_args.iter());
            cmd.cwd(work_dir);
            pty = Arc::new(PtyHandle::spawn(cmd, default_winsize(0, 0))?);
        }

        let session = Arc::new(Session::new(NewSessionParams {
            id: id.clone(),
            tool,
            work_dir: work_dir.to_path_buf(),
            args,
            yolo_mode,
            parent_id: parent_id.clone(),
            tool_session_id,
            mux_name: mux_name.clone(),
            scrollback_bytes: self.scrollback_bytes,
        }));
        {
            let mut st = session.state();
            st.pty = Some(pty.clone());
            st.raw_pipe = raw_pipe.clone();
            st.raw_pipe_path = raw_pipe_path.clone();
        }

        // Atomic check-and-register: when a duplicate child was created
        // concurrently, ours loses and is torn down again.
        let existing = {
            let mut sessions = self.sessions_lock();
            let duplicate = parent_id.as_deref().and_then(|pid| {
                sessions
                    .values()
                    .find(|s| {
                        s.parent_id.as_deref() == Some(pid) && s.tool == tool && s.is_running()
                    })
                    .cloned()
            });
            match duplicate {
                Some(existing) => Some(existing),
                None => {
                    sessions.insert(id.clone(), session.clone());
                    None
                }
            }
        };
        if let Some(existing) = existing {
            pty.kill();
            let _ = pty.wait().await;
            if let Some(name) = mux_name.as_deref() {
                tmux::cleanup_pipe_pane(name, raw_pipe, raw_pipe_path).await;
                let _ = tmux::kill_session(name).await;
            }
            return Ok(existing);
        }

        // mouse reporting for the terminal tab, where the UI forwards
        // wheel events as mouse sequences
        if tool == Tool::Tmux {
            let tsid = session.state().tool_session_id.clone();
            if let Some(tsid) = tsid {
                tmux::enable_mouse(&tsid).await;
            }
        }

        self.start_loops(&session);

        info!(id = %id, tool = %tool.name(), work_dir = %work_dir.display(), "session created");
        self.save().await;
        Ok(session)
    }

    /// Relaunch an exited session, resuming the tool's conversation where
    /// it supports that. Preserves the original args.
    pub async fn restart(self: &Arc<Self>, id: &str) -> KojoResult<Arc<Session>> {
        let session = self
            .get(id)
            .ok_or_else(|| KojoError::SessionNotFound(id.to_string()))?;

        let (args, tool_session_id, mut mux_name, cols, rows) = {
            let mut st = session.state();
            if st.status == SessionStatus::Running || st.restarting {
                return Err(KojoError::SessionRunning(id.to_string()));
            }
            // blocks Stop and a concurrent Restart until we are done
            st.restarting = true;
            (
                st.args.clone(),
                st.tool_session_id.clone(),
                st.mux_name.clone(),
                st.last_cols,
                st.last_rows,
            )
        };
        let tool = session.tool;
        let work_dir = session.work_dir.clone();

        let tool_path = match which::which(tool.name()) {
            Ok(path) => path,
            Err(_) => {
                session.state().restarting = false;
                return Err(KojoError::ToolNotFound(tool.name().to_string()));
            }
        };

        // Clean up the old pipe-pane FIFO if it exists.
        let (old_pipe, old_path) = session.take_pipe();
        if old_pipe.is_some() || old_path.is_some() {
            if let Some(name) = mux_name.as_deref() {
                tmux::cleanup_pipe_pane(name, old_pipe, old_path).await;
            }
        }

        // Kill the old tmux session if it is still around.
        if let Some(name) = mux_name.as_deref() {
            if tmux::has_session(name).await {
                let _ = tmux::kill_session(name).await;
            }
        }

        let restart_args = tool.restart_args(&args, tool_session_id.as_deref());

        let pty;
        let mut raw_pipe = None;
        let mut raw_pipe_path = None;

        if tool.is_user() {
            let name = mux_name
                .take()
                .unwrap_or_else(|| tmux::session_name(&session.id));
            match self
                .start_mux_attach(&name, &work_dir, &tool_path, &restart_args, cols, rows)
                .await
            {
                Ok(attach) => {
                    pty = Arc::new(attach.pty);
                    raw_pipe = attach.raw_pipe.map(Arc::new);
                    raw_pipe_path = attach.raw_pipe_path;
                    mux_name = Some(name);
                }
                Err(e) => {
                    session.state().restarting = false;
                    return Err(e);
                }
            }
        } else {
            let mut cmd = CommandBuilder::new(&tool_path);
            cmd.args(restart_args.iter());
            cmd.cwd(&work_dir);
            match PtyHandle::spawn(cmd, default_winsize(0, 0)) {
                Ok(handle) => pty = Arc::new(handle),
                Err(e) => {
                    session.state().restarting = false;
                    return Err(e);
                }
            }
        }

        {
            let mut st = session.state();
            st.pty = Some(pty);
            st.mux_name = mux_name;
            st.raw_pipe = raw_pipe;
            st.raw_pipe_path = raw_pipe_path;
            st.status = SessionStatus::Running;
            st.exit_code = None;
            st.last_output = Vec::new();
            st.restarting = false;
            // fresh epoch: new termination signals; args keep the original
            // invocation (without the injected resume flags)
            st.done = new_signal();
            st.read_done = new_signal();
        }

        self.start_loops(&session);

        info!(id = %id, tool = %tool.name(), "session restarted");
        self.save().await;
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions_lock().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions_lock().values().cloned().collect()
    }

    /// First running child of `parent_id` with the given tool, or any
    /// matching child when none are running.
    pub fn find_child(&self, parent_id: &str, tool: Tool) -> Option<Arc<Session>> {
        let sessions = self.sessions_lock();
        let mut fallback = None;
        for s in sessions.values() {
            if s.parent_id.as_deref() == Some(parent_id) && s.tool == tool {
                if s.is_running() {
                    return Some(s.clone());
                }
                fallback = Some(s.clone());
            }
        }
        fallback
    }

    fn child_sessions(&self, parent_id: &str, tool: Tool) -> Vec<Arc<Session>> {
        self.sessions_lock()
            .values()
            .filter(|s| s.parent_id.as_deref() == Some(parent_id) && s.tool == tool)
            .cloned()
            .collect()
    }

    /// Terminate a running session: kill its tmux session (SIGHUP to the
    /// tool), stop its terminal-tab children, SIGTERM the attach/direct
    /// process and escalate to SIGKILL after a grace period.
    pub async fn stop(&self, id: &str) -> KojoResult<()> {
        let session = self
            .get(id)
            .ok_or_else(|| KojoError::SessionNotFound(id.to_string()))?;
        self.signal_stop(&session).await?;
        self.stop_children(&session.id).await;
        Ok(())
    }

    async fn signal_stop(&self, session: &Arc<Session>) -> KojoResult<()> {
        let (pty, tool_session_id, mux_name) = {
            let st = session.state();
            if st.status != SessionStatus::Running || st.restarting {
                return Err(KojoError::SessionNotRunning(session.id.clone()));
            }
            (st.pty.clone(), st.tool_session_id.clone(), st.mux_name.clone())
        };

        // Killing the backing tmux session delivers SIGHUP to the tool.
        if let Some(name) = mux_name.as_deref() {
            let _ = tmux::kill_session(name).await;
        }

        // The internal tmux tool owns a tmux session of its own.
        if session.tool == Tool::Tmux {
            if let Some(tsid) = tool_session_id.as_deref() {
                let _ = tmux::kill_session(tsid).await;
            }
        }

        if let Some(pty) = pty {
            pty.signal_term();
            let mut done = session.done();
            tokio::spawn(async move {
                tokio::select! {
                    _ = done.wait_for(|d| *d) => {}
                    _ = tokio::time::sleep(SIGKILL_DELAY) => {
                        pty.kill();
                    }
                }
            });
        }

        Ok(())
    }

    async fn stop_children(&self, parent_id: &str) {
        for child in self.child_sessions(parent_id, Tool::Tmux) {
            if child.is_running() {
                if let Err(e) = self.signal_stop(&child).await {
                    debug!(id = %child.id, error = %e, "child stop skipped");
                }
            }
        }
    }

    /// Shut everything down. Direct-PTY sessions are stopped and awaited;
    /// tmux-backed sessions are only detached (attach process killed,
    /// pipe-pane stopped, PTY closed) so their tmux sessions survive the
    /// host restart.
    pub async fn stop_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let mut direct = Vec::new();
        let mut mux_backed = Vec::new();
        {
            let sessions = self.sessions_lock();
            for s in sessions.values() {
                let st = s.state();
                if st.status != SessionStatus::Running {
                    continue;
                }
                if st.mux_name.is_some() {
                    mux_backed.push(s.clone());
                } else {
                    direct.push(s.clone());
                }
            }
        }

        for s in &direct {
            let _ = self.signal_stop(s).await;
        }
        for s in &direct {
            let mut done = s.done();
            let _ = timeout(STOP_ALL_WAIT, done.wait_for(|d| *d)).await;
        }

        for s in &mux_backed {
            // Stop pipe-pane first to avoid orphaned cat processes.
            let (pipe, path) = s.take_pipe();
            let (pty, mux_name) = {
                let mut st = s.state();
                (st.pty.take(), st.mux_name.clone())
            };
            if let Some(name) = mux_name.as_deref() {
                tmux::cleanup_pipe_pane(name, pipe, path).await;
            }
            if let Some(pty) = pty {
                pty.kill();
            }
        }
    }

    /// Persist all sessions to disk. Called on shutdown.
    pub async fn save_all(&self) {
        self.save().await;
    }

    async fn save(&self) {
        let infos: Vec<_> = {
            let sessions = self.sessions_lock();
            sessions.values().map(|s| s.info()).collect()
        };
        self.store.save(&infos).await;
    }

    /// Create the tmux session, set up pipe-pane, and attach via PTY.
    /// Shared by create and restart.
    async fn start_mux_attach(
        &self,
        name: &str,
        work_dir: &std::path::Path,
        tool_path: &std::path::Path,
        args: &[String],
        cols: u16,
        rows: u16,
    ) -> KojoResult<MuxAttach> {
        let shell_cmd = tmux::build_shell_command(tool_path, args);
        tmux::new_session(name, work_dir, &shell_cmd, true).await?;

        // Best effort: without pipe-pane we fall back to reading the
        // attach PTY alone.
        let (raw_pipe, raw_pipe_path) = match tmux::start_pipe_pane(name).await {
            Ok((file, path)) => (Some(file), Some(path)),
            Err(e) => {
                warn!(mux = %name, error = %e, "pipe-pane setup failed");
                (None, None)
            }
        };

        match PtyHandle::spawn(tmux::attach_command(name), default_winsize(cols, rows)) {
            Ok(pty) => Ok(MuxAttach {
                pty,
                raw_pipe,
                raw_pipe_path,
            }),
            Err(e) => {
                tmux::cleanup_pipe_pane(name, raw_pipe.map(Arc::new), raw_pipe_path).await;
                let _ = tmux::kill_session(name).await;
                Err(KojoError::Pty(format!(
                    "failed to attach to tmux session: {e}"
                )))
            }
        }
    }

    /// Start the background loops for a session.
    fn start_loops(self: &Arc<Self>, session: &Arc<Session>) {
        self.spawn_read_loop(session);
        let (has_pipe, has_mux) = {
            let st = session.state();
            (st.raw_pipe.is_some(), st.mux_name.is_some())
        };
        if has_pipe {
            self.spawn_drain_loop(session);
        }
        if has_mux {
            let manager = self.clone();
            let session = session.clone();
            tokio::spawn(async move { manager.mux_wait_loop(session).await });
        } else {
            self.spawn_wait_loop(session);
        }
    }

    /// Read session output, preferring the raw pipe (complete capture)
    /// over the attach PTY (subject to screen-diff batching). Each chunk
    /// flows through scrollback, fan-out and the prompt detector; on an
    /// approval match the affirmative reply is written after a short delay.
    fn spawn_read_loop(&self, session: &Arc<Session>) {
        let session = session.clone();
        let (reader, read_done) = {
            let st = session.state();
            let read_done = st.read_done.clone();
            let reader: Option<Box<dyn Read + Send>> = if let Some(pipe) = st.raw_pipe.clone() {
                Some(Box::new(FifoReader(pipe)))
            } else if let Some(pty) = st.pty.as_ref() {
                pty.clone_reader().ok()
            } else {
                None
            };
            (reader, read_done)
        };
        let Some(mut reader) = reader else {
            let _ = read_done.send(true);
            return;
        };

        let handle = tokio::runtime::Handle::current();
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Some(approval) = session.ingest(&buf[..n]) {
                            info!(id = %session.id, matched = %approval.matched, "yolo auto-approve");
                            let s = session.clone();
                            handle.spawn(async move {
                                tokio::time::sleep(YOLO_WRITE_DELAY).await;
                                if !s.is_yolo_mode() {
                                    return;
                                }
                                if let Err(e) = s.write(b"\r").await {
                                    debug!(id = %s.id, error = %e, "yolo write error");
                                }
                            });
                        }
                    }
                    Err(e) => {
                        debug!(id = %session.id, error = %e, "pty read error");
                        break;
                    }
                }
            }
            let _ = read_done.send(true);
        });
    }

    /// Read and discard attach-PTY output so tmux is never back-pressured.
    /// Only used while pipe-pane carries the real output stream.
    fn spawn_drain_loop(&self, session: &Arc<Session>) {
        let reader = {
            let st = session.state();
            st.pty.as_ref().and_then(|p| p.clone_reader().ok())
        };
        let Some(mut reader) = reader else { return };
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });
    }

    /// Monitor a direct-PTY process (internal tools only).
    fn spawn_wait_loop(self: &Arc<Self>, session: &Arc<Session>) {
        let manager = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let pty = session.state().pty.clone();
            let Some(pty) = pty else { return };
            let exit_code = pty.wait().await.unwrap_or(0);

            // Close the PTY so the read loop drains what remains and exits.
            session.state().pty = None;
            let mut read_done = session.read_done_rx();
            let _ = read_done.wait_for(|d| *d).await;

            manager.complete_exit(&session, exit_code).await;
        });
    }

    /// Monitor a tmux-backed session by polling pane status and watching
    /// the attach process.
    async fn mux_wait_loop(self: Arc<Self>, session: Arc<Session>) {
        let mut attach_exited = self.spawn_attach_reaper(&session);
        let mut ticker = interval(PANE_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut consecutive_errors = 0u32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.shutting_down() {
                        return;
                    }
                    let mux_name = session.state().mux_name.clone();
                    let Some(mux_name) = mux_name else { return };

                    if !tmux::has_session(&mux_name).await {
                        // tmux session gone entirely
                        self.finalize_mux_session(&session, 1, attach_exited).await;
                        return;
                    }

                    match tmux::pane_dead(&mux_name).await {
                        Err(e) => {
                            consecutive_errors += 1;
                            if consecutive_errors >= MAX_CONSECUTIVE_PANE_ERRORS {
                                error!(id = %session.id, error = %e,
                                    "tmux pane check failed repeatedly, finalizing session");
                                let _ = tmux::kill_session(&mux_name).await;
                                self.finalize_mux_session(&session, 1, attach_exited).await;
                                return;
                            }
                            continue;
                        }
                        Ok((true, exit_code)) => {
                            let _ = tmux::kill_session(&mux_name).await;
                            self.finalize_mux_session(&session, exit_code, attach_exited).await;
                            return;
                        }
                        Ok((false, _)) => {
                            consecutive_errors = 0;
                        }
                    }

                    // If pipe-pane died while the pane still runs, force a
                    // reattach by killing the attach process; the handler
                    // below recreates pipe-pane and the read loop.
                    let (has_pipe, read_dead, pty) = {
                        let st = session.state();
                        let read_done = *st.read_done.borrow();
                        (st.raw_pipe.is_some(), read_done, st.pty.clone())
                    };
                    if has_pipe && read_dead {
                        warn!(id = %session.id, "pipe-pane FIFO lost, forcing reattach");
                        let (pipe, path) = session.take_pipe();
                        tmux::cleanup_pipe_pane(&mux_name, pipe, path).await;
                        if let Some(pty) = pty {
                            pty.kill();
                        }
                    }
                }

                _ = &mut attach_exited => {
                    if self.shutting_down() {
                        return;
                    }

                    // Close only the attach PTY; the drain loop exits on its
                    // own, and pipe-pane stays alive so the read loop keeps
                    // capturing output.
                    let (mux_name, mut has_pipe) = {
                        let mut st = session.state();
                        st.pty = None;
                        (st.mux_name.clone(), st.raw_pipe.is_some())
                    };
                    let Some(mux_name) = mux_name else { return };

                    if !has_pipe {
                        // the read loop was on the attach PTY; wait for it
                        self.await_read_done(&session).await;
                    } else if *session.read_done_rx().borrow() {
                        // read loop died concurrently (FIFO failure just
                        // before attach exit): clean up so reattach does a
                        // full recreation instead of assuming it is healthy
                        let (pipe, path) = session.take_pipe();
                        tmux::cleanup_pipe_pane(&mux_name, pipe, path).await;
                        has_pipe = false;
                    }

                    if !tmux::has_session(&mux_name).await {
                        if has_pipe {
                            self.teardown_pipe(&session, &mux_name).await;
                        }
                        self.complete_exit(&session, 1).await;
                        return;
                    }

                    let (dead, exit_code) = tmux::pane_dead(&mux_name).await.unwrap_or((false, 0));
                    if dead {
                        let _ = tmux::kill_session(&mux_name).await;
                        if has_pipe {
                            self.teardown_pipe(&session, &mux_name).await;
                        }
                        self.complete_exit(&session, exit_code).await;
                        return;
                    }

                    // tmux session still alive with a running pane → reattach
                    if let Err(e) = self.reattach_mux(&session).await {
                        error!(id = %session.id, error = %e, "failed to reattach tmux");
                        if has_pipe {
                            self.teardown_pipe(&session, &mux_name).await;
                        }
                        self.complete_exit(&session, 1).await;
                        return;
                    }

                    // new reaper for the new attach process
                    attach_exited = self.spawn_attach_reaper(&session);
                }
            }
        }
    }

    fn spawn_attach_reaper(&self, session: &Arc<Session>) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let pty = session.state().pty.clone();
        tokio::spawn(async move {
            if let Some(pty) = pty {
                let _ = pty.wait().await;
            }
            let _ = tx.send(());
        });
        rx
    }

    async fn teardown_pipe(&self, session: &Arc<Session>, mux_name: &str) {
        let (pipe, path) = session.take_pipe();
        tmux::cleanup_pipe_pane(mux_name, pipe, path).await;
        self.await_read_done(session).await;
    }

    /// The pane is dead or the tmux session is gone: kill the attach
    /// process, release the pipe, drain, and finalize.
    async fn finalize_mux_session(
        &self,
        session: &Arc<Session>,
        exit_code: i32,
        attach_exited: oneshot::Receiver<()>,
    ) {
        let pty = session.state().pty.clone();
        if let Some(pty) = pty {
            pty.kill();
        }

        if timeout(EXIT_KILL_TIMEOUT, attach_exited).await.is_err() {
            warn!(id = %session.id, "attach process did not exit in time after kill");
        }

        let mux_name = session.state().mux_name.clone();
        let (pipe, path) = session.take_pipe();
        if let Some(name) = mux_name.as_deref() {
            tmux::cleanup_pipe_pane(name, pipe, path).await;
        }
        session.state().pty = None;

        self.await_read_done(session).await;
        self.complete_exit(session, exit_code).await;
    }

    /// Create a new PTY attach to an existing tmux session. An active
    /// pipe-pane with a live read loop is kept running; otherwise the
    /// pipe-pane and read loop are recreated from scratch.
    async fn reattach_mux(&self, session: &Arc<Session>) -> KojoResult<()> {
        let (mux_name, mut pipe_active, read_dead) = {
            let st = session.state();
            let read_done = *st.read_done.borrow();
            (st.mux_name.clone(), st.raw_pipe.is_some(), read_done)
        };
        let Some(mux_name) = mux_name else {
            return Err(KojoError::Tmux("session has no tmux name".into()));
        };

        // Double-check: pipe-pane can look active while the read loop died
        // between the caller's check and here; clean up and recreate.
        if pipe_active && read_dead {
            let (pipe, path) = session.take_pipe();
            tmux::cleanup_pipe_pane(&mux_name, pipe, path).await;
            pipe_active = false;
        }

        tmux::ensure_server_config().await;

        let mut new_pipe = None;
        let mut new_pipe_path = None;
        if !pipe_active {
            match tmux::start_pipe_pane(&mux_name).await {
                Ok((file, path)) => {
                    new_pipe = Some(Arc::new(file));
                    new_pipe_path = Some(path);
                }
                Err(e) => {
                    warn!(id = %session.id, error = %e, "pipe-pane setup failed on reattach");
                }
            }
        }

        let size = {
            let st = session.state();
            default_winsize(st.last_cols, st.last_rows)
        };
        let pty = match PtyHandle::spawn(tmux::attach_command(&mux_name), size) {
            Ok(pty) => Arc::new(pty),
            Err(e) => {
                if new_pipe.is_some() {
                    tmux::cleanup_pipe_pane(&mux_name, new_pipe, new_pipe_path).await;
                }
                return Err(KojoError::Pty(format!("reattach pty spawn: {e}")));
            }
        };

        let started_new_pipe = new_pipe.is_some();
        {
            let mut st = session.state();
            st.pty = Some(pty);
            if let Some(pipe) = new_pipe {
                st.raw_pipe = Some(pipe);
                st.raw_pipe_path = new_pipe_path;
                st.read_done = new_signal();
            }
        }

        // A new read loop only when a new pipe-pane was created; an
        // existing read loop keeps consuming the old FIFO.
        if started_new_pipe {
            self.spawn_read_loop(session);
        }
        // Always drain the fresh attach PTY while pipe-pane is capturing.
        let pipe_capturing = session.state().raw_pipe.is_some();
        if pipe_capturing {
            self.spawn_drain_loop(session);
        }

        info!(id = %session.id, mux = %mux_name, "reattached to tmux session");
        Ok(())
    }

    /// Wait for the read loop to finish, bounded by the drain timeout so a
    /// blocked FIFO read cannot wedge finalization.
    async fn await_read_done(&self, session: &Arc<Session>) {
        let mut rx = session.read_done_rx();
        if timeout(EXIT_DRAIN_TIMEOUT, rx.wait_for(|d| *d)).await.is_err() {
            warn!(id = %session.id, "read loop did not exit in time, proceeding with session exit");
        }
    }

    /// Capture final output, flip the session to exited, persist, cascade
    /// to children and notify. Shared by every exit path.
    async fn complete_exit(&self, session: &Arc<Session>, exit_code: i32) {
        let mut tail = session.scrollback.snapshot();
        if tail.len() > MAX_LAST_OUTPUT {
            tail.drain(..tail.len() - MAX_LAST_OUTPUT);
        }

        {
            let mut st = session.state();
            st.status = SessionStatus::Exited;
            st.last_output = tail;
            st.exit_code = Some(exit_code);
        }
        session.close_done();
        self.save().await;

        self.stop_children(&session.id).await;

        info!(id = %session.id, exit_code, "session exited");

        let callback = self
            .on_session_exit
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(cb) = callback.as_ref() {
            cb(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::SecondsFormat;
    use kojo_core::SessionInfo;

    fn test_config(dir: &std::path::Path) -> ServerConfig {
        ServerConfig {
            scrollback_bytes: 64 * 1024,
            retention_days: 7,
            sessions_file: Some(dir.join("sessions.json")),
        }
    }

    fn exited_info(id: &str, parent_id: Option<&str>, tool: &str) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            tool: tool.to_string(),
            work_dir: "/tmp".into(),
            args: vec!["--model".into(), "opus".into()],
            status: SessionStatus::Exited,
            exit_code: Some(2),
            yolo_mode: true,
            internal: false,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            tool_session_id: Some("abc-123".into()),
            parent_id: parent_id.map(String::from),
            mux_name: None,
            last_output: Some(BASE64.encode(b"goodbye")),
            last_cols: Some(100),
            last_rows: Some(40),
        }
    }

    #[tokio::test]
    async fn restores_exited_sessions_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        Store::new(config.sessions_file.clone(), 7)
            .save(&[exited_info("s_restored", None, "claude")])
            .await;

        let manager = Manager::new(&config).await;

        let session = manager.get("s_restored").expect("restored session");
        assert!(!session.is_running());
        let info = session.info();
        assert_eq!(info.status, SessionStatus::Exited);
        assert_eq!(info.exit_code, Some(2));
        assert_eq!(info.args, vec!["--model".to_string(), "opus".to_string()]);
        assert_eq!(info.tool_session_id.as_deref(), Some("abc-123"));
        assert_eq!(info.last_output.as_deref(), Some(BASE64.encode(b"goodbye").as_str()));
        assert_eq!(info.last_cols, Some(100));
        // done is already closed for a non-restored session
        assert!(*session.done().borrow());
    }

    #[tokio::test]
    async fn malformed_store_file_keeps_manager_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::write(dir.path().join("sessions.json"), "{").unwrap();

        let manager = Manager::new(&config).await;
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn unknown_persisted_tools_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        Store::new(config.sessions_file.clone(), 7)
            .save(&[exited_info("s_weird", None, "bash")])
            .await;

        let manager = Manager::new(&config).await;
        assert!(manager.get("s_weird").is_none());
    }

    #[tokio::test]
    async fn find_child_prefers_running_over_exited() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        Store::new(config.sessions_file.clone(), 7)
            .save(&[
                exited_info("s_parent", None, "claude"),
                exited_info("s_child_a", Some("s_parent"), "tmux"),
                exited_info("s_child_b", Some("s_parent"), "tmux"),
            ])
            .await;

        let manager = Manager::new(&config).await;

        // all exited: any matching child is an acceptable fallback
        let child = manager.find_child("s_parent", Tool::Tmux).expect("fallback child");
        assert!(child.id.starts_with("s_child_"));

        // mark one running: it must win
        manager
            .get("s_child_b")
            .unwrap()
            .state()
            .status = SessionStatus::Running;
        let child = manager.find_child("s_parent", Tool::Tmux).unwrap();
        assert_eq!(child.id, "s_child_b");

        assert!(manager.find_child("s_parent", Tool::Claude).is_none());
        assert!(manager.find_child("s_nobody", Tool::Tmux).is_none());
    }

    #[tokio::test]
    async fn create_rejects_tools_outside_the_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(&test_config(dir.path())).await;

        let err = manager
            .create("bash", std::path::Path::new("/tmp"), vec![], false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, KojoError::UnsupportedTool(_)));
    }

    #[tokio::test]
    async fn stop_rejects_sessions_that_are_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        Store::new(config.sessions_file.clone(), 7)
            .save(&[exited_info("s_done", None, "claude")])
            .await;

        let manager = Manager::new(&config).await;
        let err = manager.stop("s_done").await.unwrap_err();
        assert!(matches!(err, KojoError::SessionNotRunning(_)));

        let err = manager.stop("s_missing").await.unwrap_err();
        assert!(matches!(err, KojoError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn restart_rejects_running_and_restarting_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        Store::new(config.sessions_file.clone(), 7)
            .save(&[exited_info("s_r", None, "claude")])
            .await;

        let manager = Manager::new(&config).await;
        let session = manager.get("s_r").unwrap();

        session.state().status = SessionStatus::Running;
        let err = manager.restart("s_r").await.unwrap_err();
        assert!(matches!(err, KojoError::SessionRunning(_)));

        session.state().status = SessionStatus::Exited;
        session.state().restarting = true;
        let err = manager.restart("s_r").await.unwrap_err();
        assert!(matches!(err, KojoError::SessionRunning(_)));
    }

    #[tokio::test]
    async fn save_all_persists_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = Store::new(config.sessions_file.clone(), 7);
        store
            .save(&[
                exited_info("s_1", None, "claude"),
                exited_info("s_2", None, "codex"),
            ])
            .await;

        let manager = Manager::new(&config).await;
        manager.save_all().await;

        let reloaded = store.load().await.unwrap();
        assert_eq!(reloaded.len(), 2);
        // args survive the round trip untouched
        assert!(reloaded
            .iter()
            .all(|i| i.args == vec!["--model".to_string(), "opus".to_string()]));
    }
}
