//! Approval-prompt detection and tool session-id capture.
//!
//! Terminal output is noisy: interactive tools repaint with CSI/OSC
//! sequences and split prompts across reads. The scanner keeps rolling
//! tails of recent output, strips control sequences, and matches against
//! the normalized text so prompts survive chunk boundaries and repaints.

use regex::bytes::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// Trailing output window scanned for approval prompts.
const APPROVAL_TAIL_BYTES: usize = 4096;

/// Trailing output window scanned for a printed session id.
const ID_TAIL_BYTES: usize = 256;

/// Terminal control sequences, replaced with a space to preserve word
/// boundaries: CSI (`ESC [` params final), OSC (`ESC ]` … BEL or ST),
/// and charset designators (`ESC ( x` / `ESC ) x`).
static CONTROL_SEQ: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?-u)\x1b\[[0-?]*[ -/]*[@-~]|\x1b\].*?(?:\x07|\x1b\\)|\x1b[()][0-9A-B]")
        .expect("control-sequence regex compiles")
});

static MULTI_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?-u)[ \t]{2,}").expect("multi-space regex compiles"));

/// "Do you ...? ... 1. Yes"; blank lines may separate question and options.
static APPROVAL_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i-u)Do you \S[^\n]*\?[\s\S]{0,200}?1\.\s*Yes")
        .expect("approval-prompt regex compiles")
});

/// Codex prints "session id: <UUID>" on startup.
static TOOL_SESSION_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i-u)session id: ([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})")
        .expect("session-id regex compiles")
});

/// Broadcast when an approval prompt is auto-answered.
#[derive(Debug, Clone, Serialize)]
pub struct YoloApproval {
    pub matched: String,
    pub response: String,
}

/// Per-session stateful scanner over the output stream.
#[derive(Debug)]
pub struct PromptScanner {
    approval_tail: Vec<u8>,
    id_tail: Vec<u8>,
    /// Whether this session's tool prints a session id worth capturing.
    id_capture: bool,
    id_captured: bool,
}

impl PromptScanner {
    pub fn new(capture_session_id: bool) -> Self {
        Self {
            approval_tail: Vec::new(),
            id_tail: Vec::new(),
            id_capture: capture_session_id,
            id_captured: false,
        }
    }

    /// Append `data` to the rolling tail and scan for an approval prompt.
    ///
    /// Returns the approval on a match (the tail is cleared so the same
    /// prompt cannot match twice) and the cleaned tail text for debug
    /// observers.
    pub fn check_approval(&mut self, data: &[u8]) -> (Option<YoloApproval>, String) {
        self.approval_tail.extend_from_slice(data);
        if self.approval_tail.len() > APPROVAL_TAIL_BYTES {
            let excess = self.approval_tail.len() - APPROVAL_TAIL_BYTES;
            self.approval_tail.drain(..excess);
        }

        let clean = normalize(&strip_control_sequences(&self.approval_tail));
        let clean_str = String::from_utf8_lossy(&clean).into_owned();

        match APPROVAL_PROMPT.find(&clean) {
            Some(m) => {
                let matched = String::from_utf8_lossy(&clean[m.start()..m.end()]).into_owned();
                self.approval_tail.clear();
                (
                    Some(YoloApproval {
                        matched,
                        response: String::new(),
                    }),
                    clean_str,
                )
            }
            None => (None, clean_str),
        }
    }

    /// Drop the approval tail (used when yolo mode toggles).
    pub fn clear_approval_tail(&mut self) {
        self.approval_tail.clear();
    }

    /// Scan for a printed tool session id. Captures at most once; after a
    /// capture the buffer is released and scanning is disabled.
    pub fn capture_session_id(&mut self, data: &[u8]) -> Option<String> {
        if !self.id_capture || self.id_captured {
            return None;
        }

        self.id_tail.extend_from_slice(data);
        if self.id_tail.len() > ID_TAIL_BYTES {
            let excess = self.id_tail.len() - ID_TAIL_BYTES;
            self.id_tail.drain(..excess);
        }

        let clean = strip_control_sequences(&self.id_tail);
        let caps = TOOL_SESSION_ID.captures(&clean)?;
        let id = String::from_utf8_lossy(&caps[1]).into_owned();
        self.id_captured = true;
        self.id_tail = Vec::new();
        Some(id)
    }
}

/// Replace control sequences with a single space.
fn strip_control_sequences(data: &[u8]) -> Vec<u8> {
    CONTROL_SEQ.replace_all(data, &b" "[..]).into_owned()
}

/// Normalize CR/CRLF to LF and collapse runs of spaces and tabs.
fn normalize(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\r' {
            if data.get(i + 1) != Some(&b'\n') {
                out.push(b'\n');
            }
            i += 1;
            continue;
        }
        out.push(data[i]);
        i += 1;
    }
    MULTI_SPACE.replace_all(&out, &b" "[..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> PromptScanner {
        PromptScanner::new(false)
    }

    #[test]
    fn basic_match() {
        let mut s = scanner();
        let (approval, _) = s.check_approval("Do you want to proceed? ❯ 1. Yes".as_bytes());
        assert!(approval.is_some(), "expected match for basic prompt");
    }

    #[test]
    fn long_prompt_with_ansi() {
        let mut s = scanner();

        // A long command display with heavy ANSI codes that would push the
        // prompt out of a 512-byte buffer but fits in 4096.
        let mut data = String::new();
        for _ in 0..100 {
            data.push_str("\x1b[1;32m"); // SGR bold green
            data.push_str("\x1b[?25l"); // DEC hide cursor
            data.push_str("some output line\r\n");
            data.push_str("\x1b[0m"); // SGR reset
            data.push_str("\x1b[?25h"); // DEC show cursor
        }
        data.push_str("Do you want to proceed? ❯ 1. Yes");
        assert!(data.len() > 512);

        let (approval, _) = s.check_approval(data.as_bytes());
        assert!(approval.is_some(), "expected match for long prompt with ANSI codes");
    }

    #[test]
    fn prompt_split_across_chunks() {
        let mut s = scanner();

        let mut chunk1 = String::new();
        for _ in 0..50 {
            chunk1.push_str("\x1b[1;32m");
            chunk1.push_str("output line content\r\n");
            chunk1.push_str("\x1b[0m");
        }
        chunk1.push_str("Do you want to proceed?");
        assert!(chunk1.len() > 512);

        // First chunk: no match yet (missing "1. Yes")
        let (approval, _) = s.check_approval(chunk1.as_bytes());
        assert!(approval.is_none(), "should not match without options");

        // Second chunk: options arrive; the retained tail still holds the question
        let chunk2 = "\x1b[1m\r\n  ❯ \x1b[32m1. Yes\x1b[0m\r\n    2. No\r\n";
        let (approval, _) = s.check_approval(chunk2.as_bytes());
        assert!(approval.is_some(), "expected match after second chunk");
    }

    #[test]
    fn tail_truncated_to_window() {
        let mut s = scanner();

        // Exceed the tail size to verify only the trailing window is kept.
        let filler = vec![b'x'; APPROVAL_TAIL_BYTES + 100];
        let (approval, _) = s.check_approval(&filler);
        assert!(approval.is_none());

        let (approval, _) = s.check_approval("Do you want to proceed? ❯ 1. Yes".as_bytes());
        assert!(approval.is_some(), "expected match after tail truncation");
    }

    #[test]
    fn no_rematch_after_clear() {
        let mut s = scanner();

        let (approval, _) = s.check_approval("Do you want to proceed? ❯ 1. Yes".as_bytes());
        assert!(approval.is_some(), "expected first match");

        // The tail was cleared on match; unrelated follow-up must not re-match.
        let (approval, _) = s.check_approval(b"some follow-up output");
        assert!(approval.is_none(), "expected no re-match after tail was cleared");
    }

    #[test]
    fn no_match_on_plain_output() {
        let mut s = scanner();
        let (approval, _) = s.check_approval(b"some random output without any prompt");
        assert!(approval.is_none());
    }

    #[test]
    fn strips_dec_private_mode() {
        let clean = strip_control_sequences(b"\x1b[?25hvisible\x1b[?25l");
        assert_eq!(String::from_utf8_lossy(&clean).trim(), "visible");
    }

    #[test]
    fn strips_tilde_terminated_csi() {
        // Function key sequences like F5 (ESC [ 15 ~) are CSI with final byte '~'.
        let clean = strip_control_sequences(b"\x1b[15~visible\x1b[2~");
        assert_eq!(String::from_utf8_lossy(&clean).trim(), "visible");
    }

    #[test]
    fn strips_osc_with_bel_and_st() {
        let clean = strip_control_sequences(b"\x1b]0;title\x07visible\x1b]2;other\x1b\\");
        assert_eq!(String::from_utf8_lossy(&clean).trim(), "visible");
    }

    #[test]
    fn strips_charset_designators() {
        let clean = strip_control_sequences(b"\x1b(Bvisible\x1b)0");
        assert_eq!(String::from_utf8_lossy(&clean).trim(), "visible");
    }

    #[test]
    fn normalizes_cr_and_crlf() {
        let out = normalize(b"a\r\nb\rc");
        assert_eq!(out, b"a\nb\nc");
    }

    #[test]
    fn captures_session_id_once() {
        let mut s = PromptScanner::new(true);
        let id = s.capture_session_id(b"session id: 0f2b2a2c-1111-2222-3333-444455556666\r\n");
        assert_eq!(
            id.as_deref(),
            Some("0f2b2a2c-1111-2222-3333-444455556666")
        );

        // Capture is disabled for the rest of the epoch.
        let id = s.capture_session_id(b"session id: aaaaaaaa-bbbb-cccc-dddd-eeeeffff0000\r\n");
        assert!(id.is_none());
    }

    #[test]
    fn captures_session_id_across_chunks() {
        let mut s = PromptScanner::new(true);
        assert!(s.capture_session_id(b"\x1b[1msession id: 0f2b2a2c-1111-").is_none());
        let id = s.capture_session_id(b"2222-3333-444455556666\r\n");
        assert_eq!(
            id.as_deref(),
            Some("0f2b2a2c-1111-2222-3333-444455556666")
        );
    }

    #[test]
    fn capture_disabled_for_other_tools() {
        let mut s = PromptScanner::new(false);
        let id = s.capture_session_id(b"session id: 0f2b2a2c-1111-2222-3333-444455556666\r\n");
        assert!(id.is_none());
    }
}
