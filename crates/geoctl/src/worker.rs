//! Worker-side protocol runtime.
//!
//! The child half of the session protocol: reads one JSON request per line
//! from stdin and answers one response line on stdout, flushed before the
//! next read. The first exchange is the handshake; after it the loop is
//! strictly one-request-one-response except for the abort request (no
//! response, exit 1) and the termination request / end of input (closing
//! line, exit 0). OS signals are routed through
//! [`crate::shutdown::termination_signal`] and exit with the signal number.
//!
//! Response generation is a strategy seam ([`Responder`]) so the echo and
//! scripted mock variants share one runtime.

use std::collections::VecDeque;
use std::io;
use std::pin::pin;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{FrameError, JsonLinesCodec};
use crate::bridge::protocol::{self, Scenario, ScenarioStep};
use crate::shutdown::termination_signal;

/// Error from a responder strategy.
///
/// Fails the worker loudly: the run loop logs it and exits abnormally
/// without writing a response line.
#[derive(Debug, thiserror::Error)]
pub enum RespondError {
    #[error("unexpected request: got {got}, expected {expected}")]
    UnexpectedRequest { got: Value, expected: Value },

    #[error("script exhausted: no scripted response for {got}")]
    ScriptExhausted { got: Value },
}

/// Strategy for generating the handshake response and per-request responses.
#[async_trait]
pub trait Responder: Send {
    /// Answer the one-time handshake command.
    async fn handshake(&mut self, command: Value) -> Result<Value, RespondError>;

    /// Answer one data request. Called once per request, in order.
    async fn respond(&mut self, request: Value) -> Result<Value, RespondError>;
}

/// Echo strategy: every payload comes back as `["success", payload]`.
pub struct EchoResponder;

#[async_trait]
impl Responder for EchoResponder {
    async fn handshake(&mut self, command: Value) -> Result<Value, RespondError> {
        Ok(protocol::success_response(command))
    }

    async fn respond(&mut self, request: Value) -> Result<Value, RespondError> {
        Ok(protocol::success_response(request))
    }
}

/// Scripted strategy: the handshake command is echoed back verbatim, then
/// each request must exactly match the next [`ScenarioStep`] and is answered
/// with its prescripted response. Any mismatch is fatal to the worker.
pub struct ScriptedResponder {
    steps: VecDeque<ScenarioStep>,
}

impl ScriptedResponder {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            steps: scenario.steps.into(),
        }
    }
}

#[async_trait]
impl Responder for ScriptedResponder {
    async fn handshake(&mut self, command: Value) -> Result<Value, RespondError> {
        Ok(command)
    }

    async fn respond(&mut self, request: Value) -> Result<Value, RespondError> {
        let step = self
            .steps
            .pop_front()
            .ok_or_else(|| RespondError::ScriptExhausted {
                got: request.clone(),
            })?;
        if request != step.request {
            return Err(RespondError::UnexpectedRequest {
                got: request,
                expected: step.request,
            });
        }
        Ok(step.response)
    }
}

/// Terminal outcome of the worker run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Termination request or end of input; the closing line was written.
    Closed,
    /// Abort request received; no response line was written.
    Aborted,
    /// Responder or transport failure; no response line was written.
    Failed,
}

impl WorkerExit {
    /// Process exit code for this outcome. Signal exits never reach here;
    /// they terminate the process directly with the signal number.
    pub fn code(self) -> i32 {
        match self {
            Self::Closed => 0,
            Self::Aborted => 1,
            // EX_SOFTWARE, distinct from abort's 1 and from signal numbers.
            Self::Failed => 70,
        }
    }
}

/// Run the worker event loop over the given input/output streams.
///
/// Reads frames from `input`, writes responses to `output`. Returns when the
/// protocol reaches a terminal state; the caller maps [`WorkerExit`] to a
/// process exit code. A SIGINT/SIGTERM delivered at any point logs one
/// diagnostic line and exits the process with the signal number without
/// touching the protocol stream.
pub async fn run_worker<H, R, W>(mut responder: H, input: R, output: W) -> WorkerExit
where
    H: Responder,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FramedRead::new(input, JsonLinesCodec::<Value>::new());
    let mut writer = FramedWrite::new(output, JsonLinesCodec::<Value>::new());
    let mut signal = pin!(termination_signal());
    let mut handshaken = false;

    loop {
        let frame = tokio::select! {
            biased;

            signum = &mut signal => {
                tracing::info!(signal = signum, "caught termination signal");
                std::process::exit(signum);
            }

            frame = reader.next() => frame,
        };

        match frame {
            None => {
                // The controller stopped sending without a termination
                // request; historically the same as a graceful close.
                tracing::debug!("end of input, closing");
                send_closing(&mut writer).await;
                return WorkerExit::Closed;
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "input frame error");
                return WorkerExit::Failed;
            }
            Some(Ok(value)) if protocol::is_abort(&value) => {
                tracing::warn!("abort requested");
                return WorkerExit::Aborted;
            }
            Some(Ok(value)) if protocol::is_termination(&value) => {
                tracing::debug!("termination requested, closing");
                send_closing(&mut writer).await;
                return WorkerExit::Closed;
            }
            Some(Ok(value)) => {
                let result = if handshaken {
                    responder.respond(value).await
                } else {
                    handshaken = true;
                    responder.handshake(value).await
                };

                let response = match result {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::error!(error = %e, "responder failed");
                        return WorkerExit::Failed;
                    }
                };

                match writer.send(response).await {
                    Ok(()) => {}
                    Err(FrameError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                        // Expected race: the controller closed its read end
                        // during shutdown. The next read will see EOF.
                        tracing::warn!("broken pipe writing response");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to write response");
                        return WorkerExit::Failed;
                    }
                }
            }
        }
    }
}

/// Write the closing acknowledgement, tolerating a peer that already left.
async fn send_closing<W>(writer: &mut FramedWrite<W, JsonLinesCodec<Value>>)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = writer.send(protocol::closing_line()).await {
        tracing::warn!(error = %e, "failed to write closing line");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::DuplexStream;

    struct Harness {
        writer: FramedWrite<DuplexStream, JsonLinesCodec<Value>>,
        reader: FramedRead<DuplexStream, JsonLinesCodec<Value>>,
        worker: tokio::task::JoinHandle<WorkerExit>,
    }

    /// Wire a responder to in-memory streams, controller side returned.
    fn start<H: Responder + 'static>(responder: H) -> Harness {
        let (ctl_out, wrk_in) = tokio::io::duplex(64 * 1024);
        let (wrk_out, ctl_in) = tokio::io::duplex(64 * 1024);

        let worker = tokio::spawn(run_worker(responder, wrk_in, wrk_out));

        Harness {
            writer: FramedWrite::new(ctl_out, JsonLinesCodec::new()),
            reader: FramedRead::new(ctl_in, JsonLinesCodec::new()),
            worker,
        }
    }

    impl Harness {
        async fn send(&mut self, value: Value) {
            self.writer.send(value).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Value> {
            self.reader.next().await.map(|r| r.unwrap())
        }
    }

    #[tokio::test]
    async fn echo_handshake_then_roundtrip() {
        let mut h = start(EchoResponder);

        h.send(json!("hello")).await;
        assert_eq!(h.recv().await, Some(json!(["success", "hello"])));

        h.send(json!(["foo", "bar"])).await;
        assert_eq!(h.recv().await, Some(json!(["success", ["foo", "bar"]])));

        h.send(Value::Null).await;
        assert_eq!(h.recv().await, Some(json!("closing")));
        assert_eq!(h.recv().await, None);
        assert_eq!(h.worker.await.unwrap(), WorkerExit::Closed);
    }

    #[tokio::test]
    async fn abort_produces_no_response() {
        let mut h = start(EchoResponder);

        h.send(json!("hello")).await;
        assert_eq!(h.recv().await, Some(json!(["success", "hello"])));

        h.send(json!("abort")).await;
        assert_eq!(h.recv().await, None);
        assert_eq!(h.worker.await.unwrap(), WorkerExit::Aborted);
    }

    #[tokio::test]
    async fn end_of_input_closes_gracefully() {
        let mut h = start(EchoResponder);

        h.send(json!("hello")).await;
        assert_eq!(h.recv().await, Some(json!(["success", "hello"])));

        drop(h.writer);
        assert_eq!(h.reader.next().await.map(|r| r.unwrap()), Some(json!("closing")));
        assert!(h.reader.next().await.is_none());
        assert_eq!(h.worker.await.unwrap(), WorkerExit::Closed);
    }

    #[tokio::test]
    async fn scripted_answers_matching_request() {
        let scenario = Scenario {
            steps: vec![ScenarioStep {
                request: json!({"geometry": "orange", "volumes": true}),
                response: json!({"volumes": ["[EXTERIOR]", "inner", "world"]}),
            }],
        };
        let mut h = start(ScriptedResponder::new(scenario));

        h.send(json!({"geometry_file": "g.orng"})).await;
        assert_eq!(h.recv().await, Some(json!({"geometry_file": "g.orng"})));

        h.send(json!({"geometry": "orange", "volumes": true})).await;
        assert_eq!(
            h.recv().await,
            Some(json!({"volumes": ["[EXTERIOR]", "inner", "world"]}))
        );

        h.send(Value::Null).await;
        assert_eq!(h.recv().await, Some(json!("closing")));
        assert_eq!(h.worker.await.unwrap(), WorkerExit::Closed);
    }

    #[tokio::test]
    async fn scripted_mismatch_fails_without_response() {
        let scenario = Scenario {
            steps: vec![ScenarioStep {
                request: json!({"geometry": "orange"}),
                response: json!({"volumes": []}),
            }],
        };
        let mut h = start(ScriptedResponder::new(scenario));

        h.send(json!({"geometry_file": "g.orng"})).await;
        assert_eq!(h.recv().await, Some(json!({"geometry_file": "g.orng"})));

        h.send(json!({"geometry": "geant4"})).await;
        assert_eq!(h.recv().await, None);
        assert_eq!(h.worker.await.unwrap(), WorkerExit::Failed);
    }

    #[tokio::test]
    async fn scripted_exhaustion_fails() {
        let mut h = start(ScriptedResponder::new(Scenario { steps: vec![] }));

        h.send(json!({"geometry_file": "g.orng"})).await;
        assert_eq!(h.recv().await, Some(json!({"geometry_file": "g.orng"})));

        h.send(json!({"geometry": "orange"})).await;
        assert_eq!(h.recv().await, None);
        assert_eq!(h.worker.await.unwrap(), WorkerExit::Failed);
    }

    #[tokio::test]
    async fn malformed_input_fails_worker() {
        use tokio::io::AsyncWriteExt;

        let (mut ctl_out, wrk_in) = tokio::io::duplex(1024);
        let (wrk_out, ctl_in) = tokio::io::duplex(1024);
        let worker = tokio::spawn(run_worker(EchoResponder, wrk_in, wrk_out));
        let mut reader = FramedRead::new(ctl_in, JsonLinesCodec::<Value>::new());

        ctl_out.write_all(b"not json\n").await.unwrap();
        assert!(reader.next().await.is_none());
        assert_eq!(worker.await.unwrap(), WorkerExit::Failed);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(WorkerExit::Closed.code(), 0);
        assert_eq!(WorkerExit::Aborted.code(), 1);
        assert_eq!(WorkerExit::Failed.code(), 70);
    }
}
