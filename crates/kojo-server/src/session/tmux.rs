//! tmux adapter.
//!
//! Thin procedural wrapper around the tmux command line. Sessions created
//! here carry the `kojo_` name prefix so orphans can be recognized after a
//! crash. Arguments are always passed as argv vectors; the few values that
//! end up inside shell strings (tool path, FIFO path, shell path) are
//! single-quote escaped.

use std::fs::File;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use nix::fcntl::{fcntl, open, FcntlArg, OFlag};
use nix::sys::stat::Mode;
use portable_pty::CommandBuilder;
use tokio::process::Command;

use kojo_core::{KojoError, KojoResult};

pub const SESSION_PREFIX: &str = "kojo_";

/// tmux session name for a kojo session id.
pub fn session_name(id: &str) -> String {
    format!("{SESSION_PREFIX}{id}")
}

/// Directory holding the pipe-pane FIFOs.
pub fn fifo_dir() -> PathBuf {
    std::env::temp_dir().join("kojo")
}

/// Wrap a string in single quotes, escaping any embedded single quotes.
/// e.g. `it's` → `'it'\''s'`
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Construct a shell-safe command string from a tool path and arguments.
pub fn build_shell_command(tool_path: &Path, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(1 + args.len());
    parts.push(shell_quote(&tool_path.to_string_lossy()));
    for a in args {
        parts.push(shell_quote(a));
    }
    parts.join(" ")
}

/// The user's login shell path from $SHELL, falling back to /bin/zsh.
pub fn login_shell_path() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/zsh".to_string())
}

/// Shell line that execs the user's login shell with a clean PATH, so PATH
/// is rebuilt from scratch by the user's profile, reproducing a desktop
/// terminal environment.
pub fn login_shell_command() -> String {
    format!("unset PATH; exec {} -l", shell_quote(&login_shell_path()))
}

async fn run(args: &[&str]) -> std::io::Result<Output> {
    Command::new("tmux").args(args).output().await
}

async fn run_ok(args: &[&str]) -> KojoResult<()> {
    let out = run(args)
        .await
        .map_err(|e| KojoError::Tmux(format!("tmux {}: {e}", args[0])))?;
    if !out.status.success() {
        return Err(KojoError::Tmux(format!(
            "tmux {}: {}",
            args[0],
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok(())
}

/// Ensure the tmux server has terminal-overrides set to disable the
/// alternate screen (smcup/rmcup) for the outer terminal.
///
/// Without this, tmux attach sends `\e[?1049h`, which puts xterm.js into
/// alternate-screen mode: no scrollback, and mouse wheel converted to
/// arrow keys so the shell cycles command history instead of scrolling.
///
/// Idempotent: checks whether the override already exists before
/// appending it, and safe to call before every attach (a tmux server
/// restart would lose the previous setting).
pub async fn ensure_server_config() {
    let Ok(out) = run(&["show-options", "-s", "terminal-overrides"]).await else {
        return;
    };
    if !out.status.success() {
        return; // tmux server not running; set when a session is created
    }
    if String::from_utf8_lossy(&out.stdout).contains("smcup@:rmcup@") {
        return; // already set
    }
    let _ = run(&[
        "set-option",
        "-s",
        "-a",
        "terminal-overrides",
        ",xterm-256color:smcup@:rmcup@",
    ])
    .await;
}

/// Create a detached tmux session running `shell_cmd`, with remain-on-exit
/// enabled. When `disable_prefix` is set, prefix keys, status bar and mouse
/// are also turned off so tmux is transparent for user-facing tools.
pub async fn new_session(
    name: &str,
    work_dir: &Path,
    shell_cmd: &str,
    disable_prefix: bool,
) -> KojoResult<()> {
    // Wrap in a login shell so PATH, SSH agent, credential helpers etc.
    // match the user's standard terminal environment. PATH is unset first
    // so the login shell rebuilds it from scratch.
    let shell = login_shell_path();
    let wrapped = format!(
        "unset PATH; {} -lc {}",
        shell_quote(&shell),
        shell_quote(shell_cmd)
    );

    let work_dir = work_dir.to_string_lossy();
    run_ok(&[
        "new-session",
        "-d",
        "-s",
        name,
        "-c",
        &work_dir,
        "-x",
        "120",
        "-y",
        "36",
        &wrapped,
    ])
    .await?;

    // Keep the pane around after the process exits so the exit status can
    // still be queried.
    run_ok(&["set-option", "-t", name, "remain-on-exit", "on"]).await?;
    run_ok(&["set-option", "-t", name, "default-terminal", "xterm-256color"]).await?;

    if disable_prefix {
        // Pass Ctrl+B through to the tool instead of tmux.
        let _ = run(&["set-option", "-t", name, "prefix", "None"]).await;
        let _ = run(&["set-option", "-t", name, "prefix2", "None"]).await;
        // Keep the status bar out of the mobile UI.
        let _ = run(&["set-option", "-t", name, "status", "off"]).await;
        let _ = run(&["set-option", "-t", name, "mouse", "off"]).await;
    }

    ensure_server_config().await;

    Ok(())
}

/// Command that attaches to the named tmux session, ready to be spawned
/// on a PTY.
pub fn attach_command(name: &str) -> CommandBuilder {
    let mut cmd = CommandBuilder::new("tmux");
    cmd.args(["attach-session", "-t", name]);
    cmd
}

pub async fn kill_session(name: &str) -> KojoResult<()> {
    run_ok(&["kill-session", "-t", name]).await
}

pub async fn has_session(name: &str) -> bool {
    matches!(run(&["has-session", "-t", name]).await, Ok(out) if out.status.success())
}

/// Whether the pane in the named session is dead, and its exit code.
pub async fn pane_dead(name: &str) -> KojoResult<(bool, i32)> {
    let out = run(&[
        "display-message",
        "-t",
        name,
        "-p",
        "#{pane_dead}:#{pane_dead_status}",
    ])
    .await
    .map_err(|e| KojoError::Tmux(format!("tmux display-message: {e}")))?;
    if !out.status.success() {
        return Err(KojoError::Tmux(format!(
            "tmux display-message: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    let text = String::from_utf8_lossy(&out.stdout);
    let line = text.trim();
    let Some((dead, status)) = line.split_once(':') else {
        return Err(KojoError::Tmux(format!("unexpected tmux output: {line}")));
    };
    if dead != "1" {
        return Ok((false, 0));
    }
    // dead but unparseable status counts as a plain failure
    Ok((true, status.parse().unwrap_or(1)))
}

/// Enable mouse mode so the session receives mouse-wheel escape sequences
/// from the web UI for per-pane scrolling.
pub async fn enable_mouse(name: &str) {
    let _ = run(&["set-option", "-t", name, "mouse", "on"]).await;
}

/// Resize the window of the named tmux session.
pub async fn resize_window(name: &str, cols: u16, rows: u16) -> KojoResult<()> {
    let cols = cols.to_string();
    let rows = rows.to_string();
    run_ok(&["resize-window", "-t", name, "-x", &cols, "-y", &rows]).await
}

/// Set up pipe-pane to capture raw pane output through a named FIFO.
///
/// pipe-pane carries the bytes the tool writes to its PTY before tmux's
/// terminal emulator processes them, so fast output is not lost to
/// screen-diff batching toward attached clients. Returns the opened FIFO
/// and its path; the caller must eventually run [`cleanup_pipe_pane`].
pub async fn start_pipe_pane(name: &str) -> KojoResult<(File, PathBuf)> {
    let dir = fifo_dir();
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true).mode(0o700);
    builder
        .create(&dir)
        .map_err(|e| KojoError::Tmux(format!("mkdir: {e}")))?;

    let path = dir.join(format!("{name}.pipe"));

    // Remove a stale FIFO from a previous run.
    let _ = std::fs::remove_file(&path);

    nix::unistd::mkfifo(&path, Mode::from_bits_truncate(0o600))
        .map_err(|e| KojoError::Tmux(format!("mkfifo: {e}")))?;

    // Open with O_RDWR so this fd acts as both reader and writer: read()
    // then never returns EOF when the pipe-pane writer (cat) has not yet
    // opened the FIFO, or drops out momentarily during reattach.
    // O_NONBLOCK keeps the open itself from blocking.
    let fd = match open(&path, OFlag::O_RDWR | OFlag::O_NONBLOCK, Mode::empty()) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = std::fs::remove_file(&path);
            return Err(KojoError::Tmux(format!("open fifo: {e}")));
        }
    };
    // Clear O_NONBLOCK so reads block normally until data arrives.
    if let Err(e) = fcntl(fd, FcntlArg::F_SETFL(OFlag::empty())) {
        let _ = nix::unistd::close(fd);
        let _ = std::fs::remove_file(&path);
        return Err(KojoError::Tmux(format!("set blocking: {e}")));
    }
    let file = unsafe { File::from_raw_fd(fd) };

    // Start pipe-pane only now: the writer (cat) can open the FIFO
    // immediately because our reader fd is already registered.
    // -o = output only; exec avoids leaving an extra sh process.
    let pipe_cmd = format!("exec cat > {}", shell_quote(&path.to_string_lossy()));
    if let Err(e) = run_ok(&["pipe-pane", "-t", name, "-o", &pipe_cmd]).await {
        drop(file);
        let _ = std::fs::remove_file(&path);
        return Err(KojoError::Tmux(format!("pipe-pane: {e}")));
    }

    Ok((file, path))
}

/// Stop pipe-pane, close the FIFO handle, and remove the FIFO file.
pub async fn cleanup_pipe_pane(name: &str, file: Option<Arc<File>>, path: Option<PathBuf>) {
    if has_session(name).await {
        // pipe-pane without a command stops the active pipe
        let _ = run(&["pipe-pane", "-t", name]).await;
    }
    drop(file);
    if let Some(path) = path {
        let _ = std::fs::remove_file(path);
    }
}

/// Current visible pane content with escape sequences, or None on failure.
/// Used once after reattach to seed the scrollback.
pub async fn capture_pane_content(name: &str) -> Option<Vec<u8>> {
    let out = run(&["capture-pane", "-t", name, "-p", "-e"]).await.ok()?;
    if !out.status.success() {
        return None;
    }
    Some(out.stdout)
}

/// Names of all tmux sessions carrying the kojo prefix.
pub async fn list_kojo_sessions() -> KojoResult<Vec<String>> {
    let out = run(&["list-sessions", "-F", "#{session_name}"])
        .await
        .map_err(|e| KojoError::Tmux(format!("tmux list-sessions: {e}")))?;
    if !out.status.success() {
        // tmux exits 1 when no server is running (no sessions)
        if out.status.code() == Some(1) {
            return Ok(Vec::new());
        }
        return Err(KojoError::Tmux(format!(
            "tmux list-sessions: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&out.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with(SESSION_PREFIX))
        .map(String::from)
        .collect())
}

/// The closed allowlist of actions that can target a session. Returns the
/// tmux argv for a known action name, None otherwise.
fn action_args(action: &str, target: &str) -> Option<Vec<String>> {
    let args: Vec<&str> = match action {
        "kill-pane" => vec!["kill-pane", "-t", target],
        "new-window" => vec!["new-window", "-t", target],
        "prev-window" => vec!["previous-window", "-t", target],
        "next-window" => vec!["next-window", "-t", target],
        "split-h" => vec!["split-window", "-v", "-t", target],
        "split-v" => vec!["split-window", "-h", "-t", target],
        "select-pane" => {
            return Some(vec![
                "select-pane".into(),
                "-t".into(),
                format!("{target}:.+"),
            ])
        }
        "resize-pane-z" => vec!["resize-pane", "-t", target, "-Z"],
        "choose-tree" => vec!["choose-tree", "-t", target],
        "copy-mode" => vec!["copy-mode", "-t", target],
        _ => return None,
    };
    Some(args.into_iter().map(String::from).collect())
}

/// Execute an allowlisted action against the named session.
pub async fn run_action(name: &str, action: &str) -> KojoResult<()> {
    let args =
        action_args(action, name).ok_or_else(|| KojoError::UnknownAction(action.to_string()))?;
    let refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let out = run(&refs)
        .await
        .map_err(|e| KojoError::Tmux(format!("tmux {action}: {e}")))?;
    if !out.status.success() {
        return Err(KojoError::Tmux(format!(
            "tmux {action}: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok(())
}
