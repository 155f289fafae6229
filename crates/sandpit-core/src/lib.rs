//! Compile-and-run engine for an online code playground.
//!
//! Untrusted source is handed to an external compiler, and the resulting
//! native binary is executed under a syscall filter and cgroup limits while
//! its standard I/O is streamed over a message transport.
//!
//! The pieces, leaf first:
//!
//! - [`registry`]: tracks compiled artifacts by opaque token
//! - [`compiler`]: invokes the external compiler
//! - [`sandbox`]: confinement applied to every child process
//! - [`executors`]: bounded, time-limited, cancellable execution
//! - [`mux`]: transport frames to and from byte streams
//! - [`playground`]: compile and run sessions built from the above

pub mod compiler;
pub mod config;
pub mod errors;
pub mod executors;
pub mod mux;
pub mod playground;
pub mod registry;
pub mod sandbox;

pub use compiler::{CompileOutcome, Compiler};
pub use config::{ConfigLoader, SandpitConfig};
pub use errors::*;
pub use executors::{ExecutionEngine, FailureReason, RunOutcome, RunRequest};
pub use mux::{FrameWriter, InboundFrame, OutputChannels, StdinReader};
pub use playground::Playground;
pub use registry::{ArtifactRecord, ArtifactRegistry};
pub use sandbox::{build_sandbox, Confinement, NoopSandbox, Sandbox};
