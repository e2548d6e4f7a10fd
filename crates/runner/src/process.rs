#![forbid(unsafe_code)]

//! External collaborator commands. One invocation per call: the operation name is appended to
//! the configured arguments, the request goes to stdin and the response comes back on stdout.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sm_pipeline::services::ServiceError;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// `EX_TEMPFAIL`: the tool asks to be retried later.
pub(crate) const EXIT_TEMPFAIL: i32 = 75;

const WAIT_POLL: Duration = Duration::from_millis(25);
const STDERR_TAIL_CHARS: usize = 600;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ToolCommand {
    pub(crate) program: String,
    #[serde(default)]
    pub(crate) args: Vec<String>,
    #[serde(default)]
    pub(crate) env: BTreeMap<String, String>,
    #[serde(default = "default_tool_timeout_ms")]
    pub(crate) timeout_ms: u64,
}

fn default_tool_timeout_ms() -> u64 {
    5 * 60 * 1_000
}

#[derive(Clone, Debug)]
pub(crate) struct ProcessTool {
    name: String,
    command: ToolCommand,
}

fn stderr_tail(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - STDERR_TAIL_CHARS).collect()
}

fn drain<R: Read + Send + 'static>(source: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut source) = source {
            let _ = source.read_to_end(&mut buf);
        }
        buf
    })
}

impl ProcessTool {
    pub(crate) fn new(name: impl Into<String>, command: ToolCommand) -> Self {
        Self {
            name: name.into(),
            command,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_millis(self.command.timeout_ms)
    }

    /// JSON request in, JSON response out.
    pub(crate) fn call_json<Req, Resp>(&self, op: &str, request: &Req) -> Result<Resp, ServiceError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.call_json_within(op, request, self.timeout())
    }

    /// Like [`Self::call_json`], but the tool is killed at `limit` when that comes before the
    /// configured timeout.
    pub(crate) fn call_json_within<Req, Resp>(
        &self,
        op: &str,
        request: &Req,
        limit: Duration,
    ) -> Result<Resp, ServiceError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let input = serde_json::to_vec(request)
            .map_err(|e| ServiceError::invalid(format!("{}: encode {op} request: {e}", self.name)))?;
        let output = self.run(op, &[], input, limit)?;
        serde_json::from_slice(&output)
            .map_err(|e| ServiceError::invalid(format!("{}: parse {op} response: {e}", self.name)))
    }

    /// Raw bytes in and out; `extra_args` follow the operation name.
    pub(crate) fn call_raw(
        &self,
        op: &str,
        extra_args: &[&str],
        input: Vec<u8>,
    ) -> Result<Vec<u8>, ServiceError> {
        self.run(op, extra_args, input, self.timeout())
    }

    fn spawn(&self, op: &str, extra_args: &[&str]) -> Result<Child, ServiceError> {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .arg(op)
            .args(extra_args)
            .envs(&self.command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.spawn().map_err(|e| {
            ServiceError::invalid(format!(
                "{}: failed to spawn {} ({op}): {e}",
                self.name, self.command.program
            ))
        })
    }

    fn run(
        &self,
        op: &str,
        extra_args: &[&str],
        input: Vec<u8>,
        limit: Duration,
    ) -> Result<Vec<u8>, ServiceError> {
        let started = Instant::now();
        let mut child = self.spawn(op, extra_args)?;

        let stdin = child.stdin.take();
        let writer = thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                let _ = stdin.write_all(&input);
            }
        });
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = self.wait(&mut child, op, limit.min(self.timeout()));
        let _ = writer.join();
        let out = stdout.join().unwrap_or_default();
        let err = stderr.join().unwrap_or_default();
        let status = status?;

        tracing::debug!(
            tool = %self.name,
            op,
            code = status.code(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tool finished"
        );
        if status.success() {
            return Ok(out);
        }
        let detail = format!(
            "{}: {op} exited with {}: {}",
            self.name,
            status
                .code()
                .map_or_else(|| "signal".to_string(), |code| code.to_string()),
            stderr_tail(&err)
        );
        if status.code() == Some(EXIT_TEMPFAIL) {
            Err(ServiceError::transient(detail))
        } else {
            Err(ServiceError::invalid(detail))
        }
    }

    /// Polls the child until it exits or `limit` passes; an overrun child is killed.
    fn wait(&self, child: &mut Child, op: &str, limit: Duration) -> Result<ExitStatus, ServiceError> {
        let deadline = Instant::now() + limit;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ServiceError::transient(format!(
                        "{}: wait for {op} failed: {e}",
                        self.name
                    )));
                }
            }
            if Instant::now() >= deadline {
                tracing::warn!(tool = %self.name, op, "tool deadline exceeded, killing");
                let _ = child.kill();
                let _ = child.wait();
                return Err(ServiceError::timeout(format!(
                    "{}: {op} exceeded {}ms",
                    self.name,
                    limit.as_millis()
                )));
            }
            thread::sleep(WAIT_POLL);
        }
    }
}
