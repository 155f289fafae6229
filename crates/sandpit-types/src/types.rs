//! Core types for the compile endpoint.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Opaque identifier for one compiled artifact.
///
/// Tokens are 63-bit values so they survive a round trip through signed
/// 64-bit integers. On the wire they are always decimal strings, since
/// browsers cannot represent every 63-bit integer as a JSON number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

impl Token {
    /// Largest value a token may take.
    pub const MAX: u64 = i64::MAX as u64;

    /// Wraps a raw value, clearing the top bit.
    pub fn new(value: u64) -> Self {
        Self(value & Self::MAX)
    }

    /// The raw token value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors produced when parsing a token from its decimal form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenParseError {
    #[error("token is empty")]
    Empty,
    #[error("token is not a decimal integer: {0}")]
    NotDecimal(String),
    #[error("token is out of range: {0}")]
    OutOfRange(String),
}

impl FromStr for Token {
    type Err = TokenParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TokenParseError::Empty);
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TokenParseError::NotDecimal(s.to_string()));
        }
        let value: u64 = s
            .parse()
            .map_err(|_| TokenParseError::OutOfRange(s.to_string()))?;
        if value > Self::MAX {
            return Err(TokenParseError::OutOfRange(s.to_string()));
        }
        Ok(Self(value))
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
            Repr::Number(value) if value <= Token::MAX => Ok(Token(value)),
            Repr::Number(value) => Err(serde::de::Error::custom(
                TokenParseError::OutOfRange(value.to_string()),
            )),
        }
    }
}

/// Body of a `POST /compile` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileRequest {
    /// The program source text.
    pub src: String,
}

/// Result of a compilation, sent verbatim to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileResponse {
    /// Exit code of the compiler, `-1` if it was killed by a signal.
    pub return_code: i32,
    /// Everything the compiler wrote to stdout.
    pub stdout: String,
    /// Everything the compiler wrote to stderr.
    pub stderr: String,
    /// `null` unless the compilation failed.
    pub error: Option<String>,
    /// Token under which the artifact can be run.
    pub token: Token,
}

impl CompileResponse {
    /// Whether the compilation produced a runnable artifact.
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.return_code == 0
    }
}
