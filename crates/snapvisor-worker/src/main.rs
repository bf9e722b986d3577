use serde::Deserialize;
use serde_json::{json, Value};
use snapvisor_core::backend::{terminate_job_target, SNAP_ID_ENV};
use snapvisor_core::command_protocol::{
    CommandFrame, CommandMethod, ExecuteSnapParams, JsonRpcError, JsonRpcNotification,
    JsonRpcResponse, SnapRpcParams, WorkerNotification, INTERNAL_ERROR, OK_RESULT,
    UNHANDLED_ERROR_METHOD,
};
use snapvisor_core::job_router::JobEnvelope;
use snapvisor_core::stream_mux::COMMAND_CHANNEL;
use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

struct WorkerConfig {
    execute_delay_ms: u64,
    execute_ok: bool,
    hang_on_terminate: bool,
    skip_ping: bool,
    shared: bool,
}

impl WorkerConfig {
    fn from_env() -> Self {
        Self {
            execute_delay_ms: std::env::var("SNAPVISOR_WORKER_EXECUTE_DELAY_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0),
            execute_ok: env_flag("SNAPVISOR_WORKER_EXECUTE_OK").unwrap_or(true),
            hang_on_terminate: env_flag("SNAPVISOR_WORKER_HANG_TERMINATE").unwrap_or(false),
            skip_ping: env_flag("SNAPVISOR_WORKER_SKIP_PING").unwrap_or(false),
            shared: env_flag("SNAPVISOR_WORKER_SHARED").unwrap_or(false),
        }
    }
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

enum Flow {
    Continue,
    Exit,
}

/// Writes command-channel frames back to the host, addressed to one job when
/// the transport is shared.
struct Outbox<'a, W: Write> {
    stdout: &'a mut W,
    job_id: Option<&'a str>,
}

impl<W: Write> Outbox<'_, W> {
    fn send(&mut self, command: Value) -> io::Result<()> {
        let frame = json!({ "name": COMMAND_CHANNEL, "data": command });
        let frame = match self.job_id {
            Some(job_id) => JobEnvelope {
                job_id: job_id.to_string(),
                data: frame,
                extra: None,
            }
            .into_value(),
            None => frame,
        };
        let payload = serde_json::to_string(&frame)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
        self.stdout.write_all(payload.as_bytes())?;
        self.stdout.write_all(b"\n")?;
        self.stdout.flush()
    }

    fn reply(&mut self, id: Value, outcome: Result<Value, JsonRpcError>) -> io::Result<()> {
        let response = match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::failure(id, error),
        };
        self.send(response.into_value())
    }

    fn notify(&mut self, notification: JsonRpcNotification) -> io::Result<()> {
        self.send(notification.into_value())
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("snapvisor_worker=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .try_init();

    let config = WorkerConfig::from_env();
    let snap_id = std::env::var(SNAP_ID_ENV).unwrap_or_default();
    tracing::info!(snap_id = %snap_id, shared = config.shared, "worker ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut terminated_jobs: HashSet<String> = HashSet::new();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let frame = match serde_json::from_str::<Value>(trimmed) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "dropping unparseable host frame");
                continue;
            }
        };

        let (job_id, mux_frame) = if config.shared {
            if let Some(target) = terminate_job_target(&frame) {
                tracing::info!(job_id = target, "job terminated by host");
                terminated_jobs.insert(target.to_string());
                continue;
            }
            let Some(job_id) = frame.get("jobId").and_then(Value::as_str) else {
                tracing::warn!("dropping frame without job id");
                continue;
            };
            if terminated_jobs.contains(job_id) {
                continue;
            }
            (
                Some(job_id.to_string()),
                frame.get("data").cloned().unwrap_or(Value::Null),
            )
        } else {
            (None, frame)
        };

        let channel = mux_frame.get("name").and_then(Value::as_str).unwrap_or_default();
        if channel != COMMAND_CHANNEL {
            tracing::debug!(channel, "ignoring frame for non-command channel");
            continue;
        }
        let command = mux_frame.get("data").cloned().unwrap_or(Value::Null);

        let mut outbox = Outbox {
            stdout: &mut stdout,
            job_id: job_id.as_deref(),
        };
        match handle_command(&config, command, &mut outbox) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Exit) => match job_id {
                Some(job_id) => {
                    terminated_jobs.insert(job_id);
                }
                None => break,
            },
            Err(_) => break,
        }
    }
    tracing::info!(snap_id = %snap_id, "worker exiting");
}

fn handle_command<W: Write>(
    config: &WorkerConfig,
    command: Value,
    outbox: &mut Outbox<'_, W>,
) -> io::Result<Flow> {
    let CommandFrame::Request { id, method, params } = CommandFrame::classify(command) else {
        return Ok(Flow::Continue);
    };

    let Some(method) = CommandMethod::parse(&method) else {
        outbox.reply(id, Err(JsonRpcError::method_not_found(&method)))?;
        return Ok(Flow::Continue);
    };

    match method {
        CommandMethod::Ping => {
            if !config.skip_ping {
                outbox.reply(id, Ok(json!(OK_RESULT)))?;
            }
        }
        CommandMethod::ExecuteSnap => {
            if config.execute_delay_ms > 0 {
                thread::sleep(Duration::from_millis(config.execute_delay_ms));
            }
            let outcome =
                match serde_json::from_value::<ExecuteSnapParams>(params.unwrap_or(Value::Null)) {
                    Err(err) => Err(JsonRpcError::invalid_params(err.to_string())),
                    Ok(_) if !config.execute_ok => {
                        Err(JsonRpcError::internal("snap execution failed"))
                    }
                    Ok(params) => {
                        tracing::info!(
                            snap_id = %params.snap_id,
                            source_bytes = params.source_code.len(),
                            endowments = params.endowments.len(),
                            "snap executed"
                        );
                        Ok(json!(OK_RESULT))
                    }
                };
            outbox.reply(id, outcome)?;
        }
        CommandMethod::Terminate => {
            if config.hang_on_terminate {
                tracing::info!("ignoring terminate request");
                return Ok(Flow::Continue);
            }
            outbox.reply(id, Ok(json!(OK_RESULT)))?;
            return Ok(Flow::Exit);
        }
        CommandMethod::SnapRpc => {
            let outcome =
                match serde_json::from_value::<SnapRpcParams>(params.unwrap_or(Value::Null)) {
                    Ok(params) => run_handler(&params.request, outbox)?,
                    Err(err) => Err(JsonRpcError::invalid_params(err.to_string())),
                };
            outbox.reply(id, outcome)?;
        }
    }
    Ok(Flow::Continue)
}

#[derive(Deserialize, Default)]
struct ErrorSpec {
    code: Option<i64>,
    message: Option<String>,
    data: Option<Value>,
}

impl ErrorSpec {
    fn from_request(request: &Value) -> Self {
        request
            .get("params")
            .cloned()
            .and_then(|params| serde_json::from_value(params).ok())
            .unwrap_or_default()
    }

    fn into_error(self, fallback: &str) -> JsonRpcError {
        JsonRpcError {
            code: self.code.unwrap_or(INTERNAL_ERROR),
            message: self.message.unwrap_or_else(|| fallback.to_string()),
            data: self.data,
        }
    }
}

/// Built-in echo handler standing in for snap code.
fn run_handler<W: Write>(
    request: &Value,
    outbox: &mut Outbox<'_, W>,
) -> io::Result<Result<Value, JsonRpcError>> {
    let method = request.get("method").and_then(Value::as_str).unwrap_or_default();
    let outcome = match method {
        "ping" => Ok(json!("pong")),
        "fail" => Err(ErrorSpec::from_request(request).into_error("snap handler failed")),
        "emitUnhandled" => {
            let error = ErrorSpec::from_request(request).into_error("unhandled snap error");
            let notification = WorkerNotification::UnhandledError { error }.to_notification();
            if let Some(notification) = notification {
                outbox.notify(notification)?;
            }
            Ok(json!(OK_RESULT))
        }
        "emitMalformed" => {
            outbox.notify(JsonRpcNotification::new(
                UNHANDLED_ERROR_METHOD,
                Some(json!({ "error": "not a structured error" })),
            ))?;
            Ok(json!(OK_RESULT))
        }
        "outbound" => {
            let source = Some("fetch".to_string());
            for notification in [
                WorkerNotification::OutboundRequest {
                    source: source.clone(),
                },
                WorkerNotification::OutboundResponse { source },
            ] {
                if let Some(notification) = notification.to_notification() {
                    outbox.notify(notification)?;
                }
            }
            Ok(json!(OK_RESULT))
        }
        _ => Ok(request.clone()),
    };
    Ok(outcome)
}
