//! Wire bridge between controller and worker.
//!
//! - **codec**: newline-delimited JSON framing over AsyncRead/AsyncWrite
//! - **protocol**: the few values with transport meaning (abort, termination,
//!   closing, success marker) plus scripted-mock scenarios

pub mod codec;
pub mod protocol;
