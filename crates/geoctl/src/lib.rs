//! Process-boundary plumbing for driving geometry worker subprocesses.
//!
//! A controller spawns a long-lived worker, performs a one-line handshake,
//! then exchanges JSON values one line at a time over the worker's stdin and
//! stdout. Requests and responses are strictly ordered: one request, one
//! response, no pipelining. stderr is a diagnostic channel, forwarded to
//! tracing and never parsed as protocol.
//!
//! The crate has two halves:
//! - [`Session`]: the controller side — spawn, handshake, call, close
//! - [`run_worker`]: the worker side — serve requests until termination,
//!   abort, end of input, or an OS signal
//!
//! Distinguished protocol values (the string `"abort"`, JSON `null` for
//! termination, the string `"closing"` acknowledgement) live in
//! [`bridge::protocol`].

pub mod bridge;
pub mod session;
pub mod shutdown;
pub mod worker;

pub use bridge::codec::{FrameError, JsonLinesCodec, MAX_FRAME_BYTES};
pub use session::{BinarySpawner, Session, SessionConfig, SessionError, SpawnError, WorkerSpawner};
pub use worker::{EchoResponder, RespondError, Responder, ScriptedResponder, WorkerExit, run_worker};
