use thiserror::Error;

/// Errors produced by the session core.
#[derive(Debug, Error)]
pub enum KojoError {
    #[error("unsupported tool: {0}")]
    UnsupportedTool(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("working directory does not exist: {0}")]
    WorkDir(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session is still running: {0}")]
    SessionRunning(String),

    #[error("session not running: {0}")]
    SessionNotRunning(String),

    #[error("unknown tmux action: {0}")]
    UnknownAction(String),

    #[error("tmux: {0}")]
    Tmux(String),

    #[error("pty: {0}")]
    Pty(String),

    #[error("store: {0}")]
    Store(String),

    #[error("config: {0}")]
    Config(String),

    #[error("session stream closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type KojoResult<T> = Result<T, KojoError>;
