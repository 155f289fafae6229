//! Type definitions for the playground wire protocol
//!
//! This crate is the shared contract between the playground server and the
//! browser client. Compile requests and responses travel as JSON over plain
//! HTTP; program I/O travels as JSON text frames over a websocket, one frame
//! per chunk of stdin, stdout or stderr.
//!
//! ## Example
//!
//! ```rust
//! use sandpit_types::{OutputFrame, Token};
//!
//! let token: Token = "42".parse().unwrap();
//! assert_eq!(token.get(), 42);
//!
//! let frame = OutputFrame::stdout("hi");
//! assert_eq!(
//!     serde_json::to_string(&frame).unwrap(),
//!     r#"{"msg":"hi","isStderr":false}"#
//! );
//! ```

pub mod frames;
pub mod health;
pub mod types;

pub use frames::*;
pub use health::*;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_response_serialization() {
        let response = CompileResponse {
            return_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            token: Token::new(1234),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["returnCode"], 0);
        assert_eq!(json["error"], serde_json::Value::Null);
        assert_eq!(json["token"], "1234");
    }

    #[test]
    fn test_compile_response_with_error() {
        let response = CompileResponse {
            return_code: 1,
            stdout: String::new(),
            stderr: "syntax error".to_string(),
            error: Some("exit status: 1".to_string()),
            token: Token::new(7),
        };
        let json = serde_json::to_string(&response).unwrap();
        let deserialized: CompileResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(response, deserialized);
    }

    #[test]
    fn test_stdin_frame_without_eof_field() {
        let frame: StdinFrame = serde_json::from_str(r#"{"msg":"abc"}"#).unwrap();
        assert_eq!(frame.msg, "abc");
        assert!(!frame.eof);
    }

    #[test]
    fn test_stdin_frame_eof_without_msg() {
        let frame: StdinFrame = serde_json::from_str(r#"{"eof":true}"#).unwrap();
        assert!(frame.msg.is_empty());
        assert!(frame.eof);
    }

    #[test]
    fn test_output_frame_stderr_tag() {
        let frame = OutputFrame::stderr("boom");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["isStderr"], true);
        assert_eq!(json["msg"], "boom");
    }
}
