//! Frames exchanged over the run websocket.

use serde::{Deserialize, Serialize};

/// A chunk of program input sent by the client.
///
/// A well-behaved client sends any number of data frames followed by exactly
/// one frame with `eof` set, which may itself carry data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdinFrame {
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub eof: bool,
}

impl StdinFrame {
    /// A data frame.
    pub fn data(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            eof: false,
        }
    }

    /// The final frame of the input stream.
    pub fn eof(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            eof: true,
        }
    }
}

/// A chunk of program output sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFrame {
    pub msg: String,
    #[serde(rename = "isStderr")]
    pub is_stderr: bool,
}

impl OutputFrame {
    pub fn stdout(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            is_stderr: false,
        }
    }

    pub fn stderr(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            is_stderr: true,
        }
    }
}

/// Websocket close codes used to report how a run ended.
pub mod close_code {
    /// The program ran and exited; the reason carries its exit status.
    pub const NORMAL: u16 = 1000;
    /// The client went away.
    pub const GOING_AWAY: u16 = 1001;
    /// The run request carried a missing, malformed or unknown token.
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// The run failed; the reason carries the failure description.
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Maximum number of bytes allowed in a close frame reason.
pub const MAX_CLOSE_REASON_LEN: usize = 123;

/// How the server ends a run connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    pub code: u16,
    pub reason: String,
}

impl CloseStatus {
    /// Builds a close status, truncating the reason on a char boundary so it
    /// fits in a close frame.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        if reason.len() > MAX_CLOSE_REASON_LEN {
            let mut end = MAX_CLOSE_REASON_LEN;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason.truncate(end);
        }
        Self { code, reason }
    }

    pub fn normal(reason: impl Into<String>) -> Self {
        Self::new(close_code::NORMAL, reason)
    }

    pub fn invalid_payload(reason: impl Into<String>) -> Self {
        Self::new(close_code::INVALID_PAYLOAD, reason)
    }

    pub fn internal_error(reason: impl Into<String>) -> Self {
        Self::new(close_code::INTERNAL_ERROR, reason)
    }

    pub fn is_normal(&self) -> bool {
        self.code == close_code::NORMAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_truncated_on_char_boundary() {
        let reason = "ü".repeat(100);
        let status = CloseStatus::internal_error(reason);
        assert!(status.reason.len() <= MAX_CLOSE_REASON_LEN);
        assert_eq!(status.reason.len() % 2, 0);
        assert_eq!(status.code, close_code::INTERNAL_ERROR);
    }

    #[test]
    fn test_short_close_reason_untouched() {
        let status = CloseStatus::normal("program exited with code 0");
        assert_eq!(status.reason, "program exited with code 0");
        assert!(status.is_normal());
    }
}
