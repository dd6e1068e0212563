//! Tool registry: the closed allowlist of programs a session may run,
//! with per-tool resume semantics.

use std::collections::HashMap;
use std::path::PathBuf;

use kojo_core::{KojoError, KojoResult, ToolInfo};

/// A program from the allowlist.
///
/// User tools run inside a tmux session for crash resilience; the internal
/// tmux tool is a direct-PTY session created to back another session's
/// terminal tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Claude,
    Codex,
    Gemini,
    Tmux,
}

impl Tool {
    pub const USER_TOOLS: [Tool; 3] = [Tool::Claude, Tool::Codex, Tool::Gemini];

    pub fn parse(name: &str) -> Option<Tool> {
        match name {
            "claude" => Some(Tool::Claude),
            "codex" => Some(Tool::Codex),
            "gemini" => Some(Tool::Gemini),
            "tmux" => Some(Tool::Tmux),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Tool::Claude => "claude",
            Tool::Codex => "codex",
            Tool::Gemini => "gemini",
            Tool::Tmux => "tmux",
        }
    }

    pub fn is_user(&self) -> bool {
        !self.is_internal()
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Tool::Tmux)
    }

    /// Whether the tool prints its session id to the terminal, to be
    /// captured by the prompt scanner.
    pub fn prints_session_id(&self) -> bool {
        matches!(self, Tool::Codex)
    }

    /// Build the arguments for restarting a session of this tool.
    ///
    /// Resume flags present in the original invocation are stripped before
    /// the tool's own resume form is appended, so restarts never stack
    /// conflicting continuation flags.
    pub fn restart_args(&self, orig: &[String], tool_session_id: Option<&str>) -> Vec<String> {
        match self {
            Tool::Claude => {
                let mut args = strip_resume_flags(orig, true);
                match tool_session_id {
                    Some(id) => {
                        args.push("--resume".into());
                        args.push(id.into());
                    }
                    None => args.push("--continue".into()),
                }
                args
            }
            // codex uses a subcommand: `codex resume <SESSION_ID>`
            Tool::Codex => match tool_session_id {
                Some(id) => vec!["resume".into(), id.into()],
                None => vec!["resume".into(), "--last".into()],
            },
            Tool::Gemini => {
                let mut args = strip_resume_flags(orig, false);
                args.push("--resume".into());
                args.push("latest".into());
                args
            }
            Tool::Tmux => match tool_session_id {
                Some(id) => vec!["new-session".into(), "-A".into(), "-s".into(), id.into()],
                None => orig.to_vec(),
            },
        }
    }
}

/// Remove `--resume`/`-r` (with its value) and, when requested,
/// `--continue`/`-c` from an argument list.
fn strip_resume_flags(args: &[String], strip_continue: bool) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len() + 2);
    let mut skip_next = false;
    for a in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if a == "--resume" || a == "-r" {
            skip_next = true;
            continue;
        }
        if strip_continue && (a == "--continue" || a == "-c") {
            continue;
        }
        out.push(a.clone());
    }
    out
}

/// For claude: reuse an existing `--session-id` from the arguments, or
/// assign a fresh UUID and inject the flag so the session can be resumed
/// later. Returns the launch arguments and the tool session id.
pub fn prepare_claude_args(args: &[String]) -> (Vec<String>, Option<String>) {
    for (i, a) in args.iter().enumerate() {
        if a == "--session-id" {
            return (args.to_vec(), args.get(i + 1).cloned());
        }
        if let Some(v) = a.strip_prefix("--session-id=") {
            return (args.to_vec(), Some(v.to_string()));
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    let mut run_args = args.to_vec();
    run_args.push("--session-id".into());
    run_args.push(id.clone());
    (run_args, Some(id))
}

/// Validate a tool name against the allowlist and resolve its absolute path.
pub fn resolve_tool(name: &str) -> KojoResult<(Tool, PathBuf)> {
    let tool = Tool::parse(name).ok_or_else(|| KojoError::UnsupportedTool(name.to_string()))?;
    let path =
        which::which(tool.name()).map_err(|_| KojoError::ToolNotFound(name.to_string()))?;
    Ok((tool, path))
}

/// Which user-facing tools are available on this host.
pub fn tool_availability() -> HashMap<String, ToolInfo> {
    Tool::USER_TOOLS
        .iter()
        .map(|tool| {
            let path = which::which(tool.name()).ok();
            (
                tool.name().to_string(),
                ToolInfo {
                    available: path.is_some(),
                    path: path
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                },
            )
        })
        .collect()
}

/// Random session id: "s_" followed by 8 random bytes, hex-encoded.
pub fn generate_id() -> String {
    use rand::Rng;
    let bytes: [u8; 8] = rand::thread_rng().gen();
    format!("s_{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_rejects_unknown_tools() {
        assert!(Tool::parse("claude").is_some());
        assert!(Tool::parse("tmux").is_some());
        assert!(Tool::parse("bash").is_none());
        assert!(Tool::parse("").is_none());
    }

    #[test]
    fn claude_restart_appends_resume_with_id() {
        let out = Tool::Claude.restart_args(&args(&["--model", "opus"]), Some("abc-123"));
        assert_eq!(out, args(&["--model", "opus", "--resume", "abc-123"]));
    }

    #[test]
    fn claude_restart_strips_prior_resume_and_continue() {
        let orig = args(&["--resume", "old-id", "--continue", "--model", "opus", "-c"]);
        let out = Tool::Claude.restart_args(&orig, Some("new-id"));
        assert_eq!(out, args(&["--model", "opus", "--resume", "new-id"]));
    }

    #[test]
    fn claude_restart_falls_back_to_continue() {
        let out = Tool::Claude.restart_args(&args(&["--model", "opus"]), None);
        assert_eq!(out, args(&["--model", "opus", "--continue"]));
    }

    #[test]
    fn codex_restart_uses_subcommand() {
        assert_eq!(
            Tool::Codex.restart_args(&args(&["--foo"]), Some("abc")),
            args(&["resume", "abc"])
        );
        assert_eq!(
            Tool::Codex.restart_args(&args(&["--foo"]), None),
            args(&["resume", "--last"])
        );
    }

    #[test]
    fn gemini_restart_always_resumes_latest() {
        let out = Tool::Gemini.restart_args(&args(&["-r", "old", "--flag"]), None);
        assert_eq!(out, args(&["--flag", "--resume", "latest"]));
    }

    #[test]
    fn tmux_restart_reattaches_by_session_id() {
        let out = Tool::Tmux.restart_args(&args(&["ignored"]), Some("kojo_s_1"));
        assert_eq!(out, args(&["new-session", "-A", "-s", "kojo_s_1"]));
        let out = Tool::Tmux.restart_args(&args(&["orig"]), None);
        assert_eq!(out, args(&["orig"]));
    }

    #[test]
    fn claude_args_reuse_existing_session_id() {
        let (run, id) = prepare_claude_args(&args(&["--session-id", "given", "--model", "opus"]));
        assert_eq!(id.as_deref(), Some("given"));
        assert_eq!(run, args(&["--session-id", "given", "--model", "opus"]));

        let (run, id) = prepare_claude_args(&args(&["--session-id=inline"]));
        assert_eq!(id.as_deref(), Some("inline"));
        assert_eq!(run, args(&["--session-id=inline"]));
    }

    #[test]
    fn claude_args_inject_session_id() {
        let orig = args(&["--model", "opus"]);
        let (run, id) = prepare_claude_args(&orig);
        let id = id.expect("id assigned");
        assert_eq!(run.len(), orig.len() + 2);
        assert_eq!(&run[..2], &orig[..]);
        assert_eq!(run[2], "--session-id");
        assert_eq!(run[3], id);
        // original args are left untouched for persistence
        assert_eq!(orig, args(&["--model", "opus"]));
    }

    #[test]
    fn generated_ids_are_prefixed_hex() {
        let id = generate_id();
        assert!(id.starts_with("s_"));
        assert_eq!(id.len(), 2 + 16);
        assert!(id[2..].bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
