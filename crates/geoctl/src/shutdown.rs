//! Signal shutdown handling for the worker process.
//!
//! Converts asynchronous SIGINT/SIGTERM delivery into a deterministic exit:
//! the worker run loop selects on [`termination_signal`], logs the signal to
//! stderr (the diagnostic channel), and exits with a status equal to the
//! signal number. Signals never produce protocol output on stdout, unlike the
//! cooperative termination request, which is handled between a completed read
//! and the next write.

/// Numeric value of SIGINT, used as the worker exit status after interrupt.
pub const SIGINT_CODE: i32 = 2;

/// Numeric value of SIGTERM, used as the worker exit status after terminate.
pub const SIGTERM_CODE: i32 = 15;

/// Wait for SIGINT or SIGTERM, resolving to the numeric signal value.
///
/// Listeners are installed when the future is first polled, once per run
/// loop; the only side effects of delivery are a diagnostic log line and a
/// process exit performed by the caller.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This can only happen if the
/// tokio runtime is not properly initialized — an unrecoverable configuration
/// error that should fail fast at worker startup.
#[cfg(unix)]
pub async fn termination_signal() -> i32 {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())
        .expect("failed to install SIGINT handler - is the tokio runtime configured correctly?");
    let mut terminate = signal(SignalKind::terminate())
        .expect("failed to install SIGTERM handler - is the tokio runtime configured correctly?");

    tokio::select! {
        _ = interrupt.recv() => SIGINT_CODE,
        _ = terminate.recv() => SIGTERM_CODE,
    }
}

/// Non-unix fallback: only Ctrl+C is observable.
#[cfg(not(unix))]
pub async fn termination_signal() -> i32 {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler - is the tokio runtime configured correctly?");
    SIGINT_CODE
}
