//! Serialized session metadata.
//!
//! These types define the persistence format of the sessions file and the
//! JSON shape handed to API collaborators. Field names and encodings are
//! stable: integers are JSON numbers, `lastOutput` is standard base64 of
//! the raw bytes, `createdAt` is RFC-3339 with UTC zone.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Exited,
}

/// Snapshot of a session's metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub tool: String,
    pub work_dir: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub yolo_mode: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub internal: bool,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mux_name: Option<String>,
    /// Base64-encoded trailing output captured when the session exited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rows: Option<u16>,
}

/// Availability of a user-facing tool on this host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub available: bool,
    pub path: String,
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_serializes_with_wire_field_names() {
        let info = SessionInfo {
            id: "s_0011223344556677".into(),
            tool: "claude".into(),
            work_dir: "/tmp/x".into(),
            args: vec!["--model".into(), "opus".into()],
            status: SessionStatus::Exited,
            exit_code: Some(0),
            yolo_mode: false,
            internal: false,
            created_at: "2026-08-02T00:00:00Z".into(),
            tool_session_id: None,
            parent_id: None,
            mux_name: Some("kojo_s_0011223344556677".into()),
            last_output: Some("aGVsbG8=".into()),
            last_cols: Some(120),
            last_rows: Some(36),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["workDir"], "/tmp/x");
        assert_eq!(json["status"], "exited");
        assert_eq!(json["exitCode"], 0);
        assert_eq!(json["muxName"], "kojo_s_0011223344556677");
        assert_eq!(json["lastOutput"], "aGVsbG8=");
        assert_eq!(json["lastCols"], 120);
        // omit-empty fields stay out of the document entirely
        assert!(json.get("internal").is_none());
        assert!(json.get("toolSessionId").is_none());
        assert!(json.get("parentId").is_none());
    }

    #[test]
    fn info_roundtrips_minimal_record() {
        let json = r#"{"id":"s_1","tool":"codex","workDir":"/w","status":"running","yoloMode":true,"createdAt":"2026-08-02T00:00:00Z"}"#;
        let info: SessionInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.status, SessionStatus::Running);
        assert!(info.yolo_mode);
        assert!(info.args.is_empty());
        assert!(info.exit_code.is_none());
        assert!(info.mux_name.is_none());
    }
}
