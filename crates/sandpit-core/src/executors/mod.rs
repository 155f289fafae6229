//! Sandboxed execution of compiled programs.
//!
//! The engine runs one artifact per call with bounded concurrency, a hard
//! wall-clock limit and cooperative cancellation, streaming the program's
//! standard I/O through caller-supplied endpoints.

pub mod admission;
pub mod engine;

pub use admission::{Admission, AdmissionSlot};
pub use engine::{ExecutionEngine, FailureReason, RunOutcome, RunRequest};
