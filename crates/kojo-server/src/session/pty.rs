//! PTY wrapper using portable-pty.
//!
//! Spawns a command on a pseudo-terminal of a given size and exposes the
//! pieces the session loops need: cloned blocking readers, a shared
//! writer, resize, and child lifecycle (wait/signal/kill).

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::Mutex;

use kojo_core::{KojoError, KojoResult};

pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 36;

/// Window size with a fallback when either dimension is unknown.
pub fn default_winsize(cols: u16, rows: u16) -> PtySize {
    let (cols, rows) = if cols == 0 || rows == 0 {
        (DEFAULT_COLS, DEFAULT_ROWS)
    } else {
        (cols, rows)
    };
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A spawned process bound to a PTY.
pub struct PtyHandle {
    /// The master for resize and reader cloning (Mutex because MasterPty is not Sync).
    master: Arc<StdMutex<Box<dyn MasterPty + Send>>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn Child + Send>>>,
    /// Killer cloned at spawn time so kill never contends with wait().
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Spawn `cmd` on a fresh PTY at the given size.
    pub fn spawn(mut cmd: CommandBuilder, size: PtySize) -> KojoResult<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size)
            .map_err(|e| KojoError::Pty(format!("failed to open pty: {e}")))?;

        // portable-pty builds commands with an empty environment; carry the
        // host environment over and force TERM like a desktop terminal.
        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| KojoError::Pty(format!("failed to spawn command: {e}")))?;
        let pid = child.process_id();
        let killer = child.clone_killer();

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| KojoError::Pty(format!("failed to take pty writer: {e}")))?;

        Ok(Self {
            master: Arc::new(StdMutex::new(pair.master)),
            writer: Arc::new(Mutex::new(writer)),
            child: Arc::new(Mutex::new(child)),
            killer: StdMutex::new(killer),
            pid,
        })
    }

    /// Clone a blocking reader of the PTY output, for use in a
    /// spawn_blocking read loop.
    pub fn clone_reader(&self) -> KojoResult<Box<dyn Read + Send>> {
        let master = self
            .master
            .lock()
            .map_err(|_| KojoError::Pty("pty master lock poisoned".into()))?;
        master
            .try_clone_reader()
            .map_err(|e| KojoError::Pty(format!("failed to clone pty reader: {e}")))
    }

    /// Shared writer for the PTY input.
    pub fn writer(&self) -> Arc<Mutex<Box<dyn Write + Send>>> {
        self.writer.clone()
    }

    /// Resize the PTY window.
    pub fn resize(&self, cols: u16, rows: u16) -> KojoResult<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| KojoError::Pty("pty master lock poisoned".into()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| KojoError::Pty(format!("pty resize failed: {e}")))
    }

    /// Wait for the child to exit. Returns the exit code.
    pub async fn wait(&self) -> KojoResult<i32> {
        let child = self.child.clone();
        let status = tokio::task::spawn_blocking(move || child.blocking_lock().wait())
            .await
            .map_err(|e| KojoError::Pty(format!("join error: {e}")))?
            .map_err(|e| KojoError::Pty(format!("wait error: {e}")))?;
        Ok(status.exit_code() as i32)
    }

    /// Deliver SIGTERM to the child, if it is still identifiable.
    pub fn signal_term(&self) {
        if let Some(pid) = self.pid {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    /// Force-kill the child. Does not reap it; a wait() elsewhere does.
    pub fn kill(&self) {
        if let Ok(mut killer) = self.killer.lock() {
            let _ = killer.kill();
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl std::fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyHandle").field("pid", &self.pid).finish()
    }
}
