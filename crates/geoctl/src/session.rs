//! Controller-side worker session.
//!
//! Owns one spawned worker process and its three standard streams, sequences
//! the one-line handshake, and exposes the strictly ordered request/response
//! call protocol plus cooperative shutdown. The protocol is one-in-one-out:
//! a request is never written while a response is outstanding, so a session
//! is driven by a single owner and sessions share no state.
//!
//! Flow:
//! 1. Spawn the worker with piped stdin/stdout/stderr
//! 2. Handshake: write one command line, read one response line
//! 3. `call` per request; abort is the designed asymmetry (no response)
//! 4. `close`: termination request, closing acknowledgement, drain, reap

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::bridge::codec::{FrameError, JsonLinesCodec};
use crate::bridge::protocol;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<Child, SpawnError>;
}

/// Spawns a worker executable with piped stdio.
///
/// Environment variables set via [`with_env`](Self::with_env) are exported
/// to the child on top of the inherited environment; controller settings
/// reach the worker as `CELER_*` variables this way.
pub struct BinarySpawner {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl BinarySpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for BinarySpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        let child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// Session timeouts.
///
/// The handshake window is wide because it covers the worker's one-time
/// initialization (loading a geometry model can take minutes); steady-state
/// calls get a tighter deadline.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
    pub close_timeout: Duration,
    /// Per-stage wait when escalating SIGINT -> SIGTERM -> SIGKILL on an
    /// unresponsive worker during close.
    pub kill_escalation_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(300),
            call_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(5),
            kill_escalation_timeout: Duration::from_millis(200),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// A line from the worker could not be parsed as JSON. Fatal to the
    /// session; carries the raw line.
    #[error("malformed frame from worker: {line:?}")]
    MalformedFrame { line: String },

    /// Worker output ended while a response was expected (not via abort or
    /// termination). Usually a worker crash; restart policy is the caller's.
    #[error("worker output ended while a response was expected")]
    PeerClosed,

    /// A response arrived when none was expected, or an acknowledgement was
    /// not what the protocol requires. Fatal to the session.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A blocking operation exceeded its deadline. The expected line is
    /// still outstanding, so the session refuses further traffic until the
    /// worker is killed ([`Self::PendingResponse`]).
    #[error("timed out after {0:?} waiting for worker")]
    Timeout(Duration),

    /// A previous exchange timed out and its response is still outstanding;
    /// writing a new request would pair it with the stale response. Resolved
    /// only by killing the worker ([`Session::kill`] or [`Session::close`]).
    #[error("a response from a timed-out exchange is still outstanding")]
    PendingResponse,

    #[error("session is closed")]
    Closed,

    #[error("handshake not performed")]
    NotReady,

    #[error("worker i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    AwaitingHandshake,
    Ready,
    Closed,
}

/// One spawned worker process and its protocol streams.
pub struct Session {
    child: Option<Child>,
    writer: Option<FramedWrite<ChildStdin, JsonLinesCodec<Value>>>,
    reader: Option<FramedRead<ChildStdout, JsonLinesCodec<Value>>>,
    stderr_task: Option<JoinHandle<()>>,
    status: Option<ExitStatus>,
    state: SessionState,
    /// A read timed out with its line still in flight; no further writes
    /// until the worker is killed, or the pairing of requests to responses
    /// silently shifts by one.
    awaiting_response: bool,
    config: SessionConfig,
}

impl Session {
    /// Spawn a worker and wire up its streams. The session is not usable for
    /// calls until [`handshake`](Self::handshake) completes.
    pub async fn spawn(
        spawner: &dyn WorkerSpawner,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let mut child = spawner
            .spawn()
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Spawn("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Spawn("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SessionError::Spawn("stderr not captured".to_string()))?;

        // The worker's stderr is a diagnostic channel, never parsed as
        // protocol; forward it line by line into tracing.
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(target: "geoctl::worker", "{}", line);
            }
        });

        debug!(pid = child.id(), "worker spawned");

        Ok(Self {
            child: Some(child),
            writer: Some(FramedWrite::new(stdin, JsonLinesCodec::new())),
            reader: Some(FramedRead::new(stdout, JsonLinesCodec::new())),
            stderr_task: Some(stderr_task),
            status: None,
            state: SessionState::AwaitingHandshake,
            awaiting_response: false,
            config,
        })
    }

    /// OS process id of the worker, if it has not been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Exit status of the worker, once it has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Perform the mandatory first exchange: write the handshake command,
    /// read back exactly one response line.
    ///
    /// The response payload is opaque here; if it encodes a failure the
    /// caller must treat the session as unusable and close it. Transport
    /// failures (malformed frame, stream end) close the session themselves.
    pub async fn handshake(&mut self, command: &Value) -> Result<Value, SessionError> {
        match self.state {
            SessionState::AwaitingHandshake => {}
            SessionState::Ready => {
                return Err(SessionError::ProtocolViolation(
                    "handshake already performed".to_string(),
                ));
            }
            SessionState::Closed => return Err(SessionError::Closed),
        }
        if self.awaiting_response {
            return Err(SessionError::PendingResponse);
        }

        self.send(command).await?;
        let response = self.recv_or_release(self.config.handshake_timeout).await?;
        self.state = SessionState::Ready;
        Ok(response)
    }

    /// Send one request and read its response.
    ///
    /// Returns `Ok(Some(response))` for ordinary requests. The abort request
    /// is the protocol's designed asymmetry: it yields no response line; the
    /// worker exits and its output stream ends. That path reaps the worker
    /// and returns `Ok(None)`.
    ///
    /// A timed-out call leaves its response line in flight; until the
    /// worker is killed, further calls fail with
    /// [`SessionError::PendingResponse`] rather than pair a new request
    /// with the stale response.
    pub async fn call(&mut self, request: &Value) -> Result<Option<Value>, SessionError> {
        match self.state {
            SessionState::Ready => {}
            SessionState::AwaitingHandshake => return Err(SessionError::NotReady),
            SessionState::Closed => return Err(SessionError::Closed),
        }
        if self.awaiting_response {
            return Err(SessionError::PendingResponse);
        }
        if protocol::is_termination(request) {
            return Err(SessionError::ProtocolViolation(
                "termination request is sent by close()".to_string(),
            ));
        }

        self.send(request).await?;

        if protocol::is_abort(request) {
            return self.finish_abort().await.map(|()| None);
        }

        let response = self.recv_or_release(self.config.call_timeout).await?;
        Ok(Some(response))
    }

    /// Cooperatively shut the worker down and release every handle.
    ///
    /// Sends the termination request, expects the closing acknowledgement
    /// followed by end of stream, then waits for process exit — escalating
    /// SIGINT/SIGTERM/SIGKILL if the worker hangs. Idempotent: closing a
    /// closed session is a no-op and never double-releases.
    ///
    /// If a timed-out exchange left a line in flight, the cooperative
    /// handover is off the table and this tears the worker down forcibly
    /// instead, as [`kill`](Self::kill) would.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        if self.awaiting_response {
            // A stale line (or post-abort end of stream) is still in flight;
            // the cooperative exchange cannot be sequenced any more.
            return self.kill().await;
        }
        self.state = SessionState::Closed;

        if let Some(writer) = self.writer.as_mut() {
            match writer.send(protocol::termination_request()).await {
                Ok(()) => {}
                Err(FrameError::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    // Expected race: the worker already exited during an
                    // intentional shutdown. Logged, not raised.
                    debug!("worker closed its input before the termination request");
                }
                Err(e) => warn!(error = %e, "failed to send termination request"),
            }
        }
        // Drop stdin so a worker reading to end of input also stops.
        self.writer = None;

        let mut result = Ok(());
        if self.reader.is_some() {
            // The line following the termination request must be the
            // closing acknowledgement, then end of stream.
            match self.read_frame(self.config.close_timeout).await {
                Ok(Some(v)) if protocol::is_closing(&v) => {
                    result = self.drain_after_closing().await;
                }
                Ok(Some(v)) => {
                    result = Err(SessionError::ProtocolViolation(format!(
                        "unexpected closing acknowledgement: {v}"
                    )));
                }
                Ok(None) => {
                    debug!("worker output ended without a closing acknowledgement");
                }
                Err(e) => {
                    warn!(error = %e, "error waiting for closing acknowledgement");
                }
            }
        }
        self.reader = None;

        self.reap_with_escalation().await;
        self.finish_stderr().await;
        result
    }

    /// Forcibly terminate the worker and release every handle.
    ///
    /// This is the cancellation path for an in-flight exchange: killing the
    /// process unblocks any pending read with end of stream. Idempotent.
    pub async fn kill(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        self.awaiting_response = false;
        self.writer = None;
        self.reader = None;

        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "failed to kill worker");
            }
            match child.wait().await {
                Ok(status) => self.status = Some(status),
                Err(e) => warn!(error = %e, "failed to reap killed worker"),
            }
        }
        self.finish_stderr().await;
        Ok(())
    }

    /// Wait for the worker process to exit without closing the streams.
    ///
    /// Used when the worker is expected to terminate on its own, e.g. after
    /// an OS signal was delivered to it.
    pub async fn wait(&mut self) -> Result<ExitStatus, SessionError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let child = self.child.as_mut().ok_or(SessionError::Closed)?;
        let status = child.wait().await?;
        self.status = Some(status);
        Ok(status)
    }

    // ── Internal plumbing ────────────────────────────────────────────────

    async fn send(&mut self, value: &Value) -> Result<(), SessionError> {
        let writer = self.writer.as_mut().ok_or(SessionError::Closed)?;
        match writer.send(value.clone()).await {
            Ok(()) => Ok(()),
            Err(FrameError::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                // The worker's read end is gone: it exited before we wrote.
                self.release_after_failure().await;
                Err(SessionError::PeerClosed)
            }
            Err(FrameError::Io(e)) => Err(SessionError::Io(e)),
            Err(e) => Err(SessionError::ProtocolViolation(e.to_string())),
        }
    }

    /// Read one frame. `Ok(None)` is end of stream; `Err(Timeout)` leaves
    /// the stream untouched.
    async fn read_frame(&mut self, deadline: Duration) -> Result<Option<Value>, SessionError> {
        let reader = self.reader.as_mut().ok_or(SessionError::Closed)?;
        match tokio::time::timeout(deadline, reader.next()).await {
            Err(_) => Err(SessionError::Timeout(deadline)),
            Ok(None) => Ok(None),
            Ok(Some(Ok(value))) => Ok(Some(value)),
            Ok(Some(Err(FrameError::Malformed { line, .. }))) => {
                Err(SessionError::MalformedFrame { line })
            }
            Ok(Some(Err(e @ FrameError::TooLong))) => {
                Err(SessionError::ProtocolViolation(e.to_string()))
            }
            Ok(Some(Err(FrameError::Io(e)))) => Err(SessionError::Io(e)),
        }
    }

    /// Read the response to an ordinary request. Fatal failures (malformed
    /// frame, unexpected stream end) release the worker before returning, so
    /// every exit path of `call` leaves the session closeable exactly once.
    async fn recv_or_release(&mut self, deadline: Duration) -> Result<Value, SessionError> {
        match self.read_frame(deadline).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => {
                self.release_after_failure().await;
                Err(SessionError::PeerClosed)
            }
            Err(e @ SessionError::Timeout(_)) => {
                self.awaiting_response = true;
                Err(e)
            }
            Err(e) => {
                self.release_after_failure().await;
                Err(e)
            }
        }
    }

    /// After an abort request: no response may follow; the worker's output
    /// ends and the process exits (status 1 by convention).
    async fn finish_abort(&mut self) -> Result<(), SessionError> {
        let outcome = self.read_frame(self.config.call_timeout).await;
        match outcome {
            Ok(None) => {
                self.release_after_failure().await;
                debug!(status = ?self.status, "worker exited after abort");
                Ok(())
            }
            Ok(Some(v)) => {
                self.release_after_failure().await;
                Err(SessionError::ProtocolViolation(format!(
                    "unexpected response after abort: {v}"
                )))
            }
            Err(e @ SessionError::Timeout(_)) => {
                self.awaiting_response = true;
                Err(e)
            }
            Err(e) => {
                self.release_after_failure().await;
                Err(e)
            }
        }
    }

    /// After the closing acknowledgement the stream must end.
    async fn drain_after_closing(&mut self) -> Result<(), SessionError> {
        match self.read_frame(self.config.close_timeout).await {
            Ok(None) => Ok(()),
            Ok(Some(v)) => Err(SessionError::ProtocolViolation(format!(
                "output after closing acknowledgement: {v}"
            ))),
            Err(SessionError::Timeout(d)) => {
                warn!("worker did not close its output within {d:?}");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "error draining worker output");
                Ok(())
            }
        }
    }

    /// Release streams and reap the process after a fatal protocol failure.
    /// The session transitions to closed; a later `close()` is a no-op.
    async fn release_after_failure(&mut self) {
        self.state = SessionState::Closed;
        self.awaiting_response = false;
        self.writer = None;
        self.reader = None;
        self.reap_with_escalation().await;
        self.finish_stderr().await;
    }

    /// Wait for exit; if the worker hangs, escalate SIGINT -> SIGTERM ->
    /// SIGKILL with a short wait at each stage.
    async fn reap_with_escalation(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let stage = self.config.kill_escalation_timeout;

        if let Ok(status) = tokio::time::timeout(stage, child.wait()).await {
            self.store_status(status);
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGKILL] {
                let Some(pid) = child.id() else { break };
                warn!(pid, signal = %sig, "worker did not exit, escalating");
                if let Err(e) = kill(Pid::from_raw(pid as i32), sig) {
                    warn!(error = %e, "failed to signal worker");
                }
                if let Ok(status) = tokio::time::timeout(stage, child.wait()).await {
                    self.store_status(status);
                    return;
                }
            }
        }

        // Last resort (non-unix, or the process id was already gone).
        let _ = child.start_kill();
        match child.wait().await {
            Ok(status) => self.status = Some(status),
            Err(e) => warn!(error = %e, "failed to reap worker"),
        }
    }

    fn store_status(&mut self, status: std::io::Result<ExitStatus>) {
        match status {
            Ok(status) => {
                debug!(%status, "worker exited");
                self.status = Some(status);
            }
            Err(e) => warn!(error = %e, "failed to reap worker"),
        }
    }

    /// Let the stderr forwarder flush its tail, then stop it.
    async fn finish_stderr(&mut self) {
        if let Some(mut task) = self.stderr_task.take() {
            if tokio::time::timeout(Duration::from_secs(1), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_and_builder() {
        let config = SessionConfig::new()
            .with_call_timeout(Duration::from_secs(5))
            .with_close_timeout(Duration::from_secs(1));
        assert_eq!(config.call_timeout, Duration::from_secs(5));
        assert_eq!(config.close_timeout, Duration::from_secs(1));
        assert_eq!(config.handshake_timeout, Duration::from_secs(300));
    }

    #[test]
    fn spawner_builder_accumulates() {
        let spawner = BinarySpawner::new("celer-geo")
            .with_arg("-")
            .with_env("CELER_PROFILING", "1")
            .with_env("CELER_G4ORG_VERBOSE", "0");
        assert_eq!(spawner.args, vec!["-".to_string()]);
        assert_eq!(spawner.env.len(), 2);
    }

    #[test]
    fn error_display_names_the_condition() {
        let e = SessionError::MalformedFrame {
            line: "oops".to_string(),
        };
        assert!(e.to_string().contains("malformed frame"));
        assert!(e.to_string().contains("oops"));

        let e = SessionError::Timeout(Duration::from_secs(3));
        assert!(e.to_string().contains("3s"));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let spawner = BinarySpawner::new("/nonexistent/worker-binary");
        match Session::spawn(&spawner, SessionConfig::default()).await {
            Err(SessionError::Spawn(_)) => {}
            other => panic!("expected Spawn error, got {:?}", other.map(|_| ())),
        }
    }
}
