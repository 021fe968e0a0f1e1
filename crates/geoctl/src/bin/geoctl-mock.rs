//! Mock geometry worker for exercising controllers end to end.
//!
//! Speaks the full line protocol over real stdin/stdout in two modes:
//!
//! - `echo` (default): answers every payload with `["success", payload]`
//! - `scripted <scenario.json>`: echoes the handshake command back, then
//!   answers each request from a prescripted list, failing loudly on the
//!   first mismatch
//!
//! All diagnostics go to stderr (`GEOCTL_LOG` controls the filter); stdout
//! carries only protocol lines. Exit codes: 0 clean close, 1 abort, 2 bad
//! invocation, 70 internal failure, signal number on SIGINT/SIGTERM.

use std::process;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use geoctl::bridge::protocol::Scenario;
use geoctl::worker::{EchoResponder, ScriptedResponder, run_worker};

enum Mode {
    Echo,
    Scripted(Scenario),
}

fn usage(program: &str) -> ! {
    eprintln!("Usage: {program} [echo | scripted <scenario.json>]");
    eprintln!();
    eprintln!("Modes:");
    eprintln!("  echo                      Answer every request with [\"success\", request]");
    eprintln!("  scripted <scenario.json>  Answer requests from a scripted scenario file");
    process::exit(2);
}

fn parse_args() -> Mode {
    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "geoctl-mock".to_string());

    let mode = match args.next().as_deref() {
        None | Some("echo") => Mode::Echo,
        Some("scripted") => {
            let Some(path) = args.next() else {
                eprintln!("Error: scripted mode requires a scenario file");
                usage(&program);
            };
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    eprintln!("Error: failed to read {path}: {e}");
                    process::exit(2);
                }
            };
            match Scenario::from_json(&text) {
                Ok(scenario) => Mode::Scripted(scenario),
                Err(e) => {
                    eprintln!("Error: invalid scenario in {path}: {e}");
                    process::exit(2);
                }
            }
        }
        Some(other) => {
            eprintln!("Error: unknown mode {other:?}");
            usage(&program);
        }
    };

    if args.next().is_some() {
        eprintln!("Error: too many arguments");
        usage(&program);
    }
    mode
}

fn init_tracing() {
    // stdout is the protocol stream; keep every diagnostic on stderr.
    let filter = EnvFilter::try_from_env("GEOCTL_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

async fn serve(mode: Mode) -> i32 {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    let exit = match mode {
        Mode::Echo => run_worker(EchoResponder, stdin, stdout).await,
        Mode::Scripted(scenario) => {
            run_worker(ScriptedResponder::new(scenario), stdin, stdout).await
        }
    };
    exit.code()
}

fn main() {
    let mode = parse_args();
    init_tracing();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            process::exit(70);
        }
    };

    let code = runtime.block_on(serve(mode));
    process::exit(code);
}
