//! Agent gateway backed by a CLI subprocess.
//!
//! Protocol, one JSON object per line:
//! - stdin: `{"type":"user-message","content":...,"parts":[...]}` once at
//!   start, then `{"type":"tool-response","toolCallId":...,"response":...}`
//!   for every answered interactive tool call.
//! - stdout: [`AgentEvent`]s.
//!
//! Cancelling kills the child; the event stream then ends.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use helm_core::agent::{AgentControl, AgentGateway, AgentPrompt, AgentRun, RunOptions};
use helm_core::errors::AgentError;
use helm_core::events::AgentEvent;

const EVENT_BUFFER: usize = 256;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessAgentConfig {
    pub binary: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Flag placed before the resume token, e.g. `--resume <token>`.
    pub resume_flag: String,
}

impl Default for ProcessAgentConfig {
    fn default() -> Self {
        Self {
            binary: "claude".into(),
            args: vec![
                "--print".into(),
                "--input-format".into(),
                "stream-json".into(),
                "--output-format".into(),
                "stream-json".into(),
            ],
            env: HashMap::new(),
            resume_flag: "--resume".into(),
        }
    }
}

pub struct ProcessAgent {
    config: ProcessAgentConfig,
}

impl ProcessAgent {
    pub fn new(config: ProcessAgentConfig) -> Self {
        Self { config }
    }

    fn command(&self, options: &RunOptions) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(token) = &options.resume_token {
            cmd.arg(&self.config.resume_flag).arg(token);
        }
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

#[async_trait]
impl AgentGateway for ProcessAgent {
    async fn run(&self, prompt: AgentPrompt, options: RunOptions) -> Result<AgentRun, AgentError> {
        let mut child = self
            .command(&options)
            .spawn()
            .map_err(|e| AgentError::Spawn(format!("{}: {e}", self.config.binary)))?;
        let pid = child.id();
        info!(binary = %self.config.binary, ?pid, resume = options.resume_token.is_some(), "agent process spawned");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Spawn("stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Spawn("stdout not piped".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "helm_agent::stderr", "{line}");
                }
            });
        }

        let first = json!({
            "type": "user-message",
            "content": prompt.content,
            "parts": prompt.parts,
        });
        write_line(&mut stdin, &first)
            .await
            .map_err(|e| AgentError::Spawn(format!("write prompt: {e}")))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();

        tokio::spawn(pump(child, stdin, stdout, event_tx, input_rx, kill.clone()));

        Ok(AgentRun {
            events: Box::pin(ReceiverStream::new(event_rx)),
            control: Arc::new(ProcessControl { kill, input_tx }),
        })
    }
}

async fn write_line(stdin: &mut ChildStdin, value: &Value) -> std::io::Result<()> {
    let mut line = value.to_string();
    line.push('\n');
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

/// Bridge the child's stdio until it exits or is killed.
async fn pump(
    mut child: Child,
    mut stdin: ChildStdin,
    stdout: ChildStdout,
    events: mpsc::Sender<Result<AgentEvent, AgentError>>,
    mut input: mpsc::UnboundedReceiver<Value>,
    kill: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut input_open = true;

    loop {
        tokio::select! {
            biased;
            () = kill.cancelled() => {
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "failed to kill agent process");
                }
                let _ = child.wait().await;
                debug!("agent process killed");
                return;
            }
            msg = input.recv(), if input_open => match msg {
                Some(value) => {
                    if let Err(e) = write_line(&mut stdin, &value).await {
                        warn!(error = %e, "failed to write to agent stdin");
                    }
                }
                None => input_open = false,
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<AgentEvent>(trimmed) {
                        Ok(event) => {
                            if events.send(Ok(event)).await.is_err() {
                                debug!("event receiver dropped, stopping agent");
                                let _ = child.start_kill();
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, line = %trimmed, "skipping malformed agent line"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = events.send(Err(AgentError::Stream(format!("read stdout: {e}")))).await;
                    break;
                }
            },
        }
    }

    let exited = tokio::select! {
        () = kill.cancelled() => None,
        status = child.wait() => Some(status),
    };
    let status = match exited {
        Some(status) => status,
        None => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    match status {
        Ok(status) if status.success() => debug!("agent process exited"),
        Ok(status) => {
            let _ = events
                .send(Err(AgentError::Stream(format!("agent exited with {status}"))))
                .await;
        }
        Err(e) => {
            let _ = events
                .send(Err(AgentError::Stream(format!("wait for agent: {e}"))))
                .await;
        }
    }
}

struct ProcessControl {
    kill: CancellationToken,
    input_tx: mpsc::UnboundedSender<Value>,
}

#[async_trait]
impl AgentControl for ProcessControl {
    async fn cancel(&self) -> Result<(), AgentError> {
        self.kill.cancel();
        Ok(())
    }

    async fn respond(&self, tool_call_id: &str, response: Value) -> Result<(), AgentError> {
        self.input_tx
            .send(json!({
                "type": "tool-response",
                "toolCallId": tool_call_id,
                "response": response,
            }))
            .map_err(|_| AgentError::Stream("agent process has exited".into()))
    }
}
