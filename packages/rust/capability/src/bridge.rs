//! Subprocess capability backend.
//!
//! Spawns a long-lived agent process and speaks JSON lines over its
//! stdin/stdout. The process announces itself with `{"type":"ready"}`; each
//! request carries an id echoed back in the response. The process is spawned
//! lazily on first use and respawned after a transport failure.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use dnacommit_shared::{DnaCommitError, Result, Stage};

use crate::CapabilityBackend;
use crate::protocol::{RequestMessage, ResponseMessage, Task, TaskReply};

/// How long to wait for the `ready` line after spawning.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-request timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Configuration for [`BridgeBackend`].
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Executable to spawn (e.g. `python3`).
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub request_timeout: Duration,
}

impl BridgeConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            working_dir: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Failure of a single bridge exchange.
enum ExchangeError {
    /// The pipe broke or the process vanished: drop the handle.
    Transport(String),
    /// The agent answered with an error for this request.
    Remote(String),
}

/// Handle to the spawned agent process.
struct BridgeHandle {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    request_counter: u64,
}

impl BridgeHandle {
    async fn spawn(config: &BridgeConfig) -> std::result::Result<Self, String> {
        info!(cmd = %config.command, args = ?config.args, "spawning capability bridge");

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Bridge logs go to parent stderr
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            format!(
                "failed to spawn bridge: {e}. Is `{}` installed?",
                config.command
            )
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| "failed to capture bridge stdin".to_string())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "failed to capture bridge stdout".to_string())?;

        let mut handle = Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            request_counter: 0,
        };

        match tokio::time::timeout(READY_TIMEOUT, handle.read_message()).await {
            Ok(Ok(ResponseMessage::Ready)) => {
                info!("bridge is ready");
                Ok(handle)
            }
            Ok(Ok(other)) => Err(format!("expected ready message, got: {other:?}")),
            Ok(Err(ExchangeError::Transport(e) | ExchangeError::Remote(e))) => Err(e),
            Err(_) => Err("bridge did not signal ready in time".into()),
        }
    }

    async fn read_message(&mut self) -> std::result::Result<ResponseMessage, ExchangeError> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| ExchangeError::Transport(format!("bridge read error: {e}")))?;
        if n == 0 {
            return Err(ExchangeError::Transport(
                "bridge closed stdout unexpectedly".into(),
            ));
        }
        serde_json::from_str(line.trim()).map_err(|e| {
            ExchangeError::Transport(format!(
                "invalid bridge message: {e} (got: {})",
                line.chars().take(200).collect::<String>()
            ))
        })
    }

    async fn send_task(&mut self, task: Task) -> std::result::Result<TaskReply, ExchangeError> {
        self.request_counter += 1;
        let id = format!("req-{}", self.request_counter);

        let request = RequestMessage::Task {
            id: id.clone(),
            task,
        };
        let mut json = serde_json::to_string(&request)
            .map_err(|e| ExchangeError::Remote(format!("failed to serialize request: {e}")))?;
        json.push('\n');

        self.stdin
            .write_all(json.as_bytes())
            .await
            .map_err(|e| ExchangeError::Transport(format!("failed to write to bridge: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| ExchangeError::Transport(format!("failed to flush bridge stdin: {e}")))?;

        match self.read_message().await? {
            ResponseMessage::Result { id: resp_id, reply } if resp_id == id => Ok(reply),
            ResponseMessage::Error { id: resp_id, error } if resp_id == id => {
                Err(ExchangeError::Remote(error))
            }
            other => Err(ExchangeError::Transport(format!(
                "out-of-sequence bridge message for {id}: {other:?}"
            ))),
        }
    }

    async fn shutdown(mut self) {
        if let Ok(mut json) = serde_json::to_string(&RequestMessage::Shutdown) {
            json.push('\n');
            let _ = self.stdin.write_all(json.as_bytes()).await;
            let _ = self.stdin.flush().await;
        }
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) => info!(?status, "bridge exited"),
            Ok(Err(e)) => warn!("bridge wait error: {e}"),
            Err(_) => {
                warn!("bridge did not exit, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Capability backend backed by a long-lived subprocess.
///
/// Requests are serialized through a single pipe.
pub struct BridgeBackend {
    config: BridgeConfig,
    handle: Mutex<Option<BridgeHandle>>,
}

impl BridgeBackend {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl CapabilityBackend for BridgeBackend {
    fn name(&self) -> &str {
        "bridge"
    }

    async fn invoke(&self, task: Task) -> Result<TaskReply> {
        let stage: Stage = task.stage();
        let mut guard = self.handle.lock().await;

        if guard.is_none() {
            let handle = BridgeHandle::spawn(&self.config)
                .await
                .map_err(|e| DnaCommitError::unavailable(stage, e))?;
            *guard = Some(handle);
        }
        let Some(handle) = guard.as_mut() else {
            return Err(DnaCommitError::unavailable(stage, "bridge not running"));
        };

        debug!(%stage, "sending bridge task");
        let outcome = tokio::time::timeout(self.config.request_timeout, handle.send_task(task)).await;
        match outcome {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(ExchangeError::Remote(e))) => Err(DnaCommitError::collaborator(stage, e)),
            Ok(Err(ExchangeError::Transport(e))) => {
                warn!(%stage, error = %e, "bridge transport failed, dropping process");
                *guard = None;
                Err(DnaCommitError::unavailable(stage, e))
            }
            Err(_) => {
                // The pipe may still carry the late reply; start fresh next time.
                *guard = None;
                Err(DnaCommitError::collaborator(
                    stage,
                    format!(
                        "bridge request timed out after {}s",
                        self.config.request_timeout.as_secs()
                    ),
                ))
            }
        }
    }

    async fn shutdown(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.shutdown().await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use dnacommit_shared::Payload;

    fn evaluate_task() -> Task {
        Task::Evaluate {
            payload: Payload {
                title: "Realtime API tips".into(),
                locator: "https://example.com/tips".into(),
                content: "...".into(),
                query: None,
                metadata: serde_json::Value::Null,
            },
        }
    }

    fn sh(script: &str) -> BridgeBackend {
        BridgeBackend::new(BridgeConfig::new(
            "sh",
            vec!["-c".into(), script.into()],
        ))
    }

    #[tokio::test]
    async fn handshake_and_reply() {
        let backend = sh(r#"echo '{"type":"ready"}'
read line
echo '{"type":"result","id":"req-1","reply":{"kind":"scores","scores":{"quality":0.9,"relevance":0.8,"novelty":0.7,"utility":0.85}}}'
read line"#);

        let reply = backend.invoke(evaluate_task()).await.expect("reply");
        match reply {
            TaskReply::Scores { scores } => assert_eq!(scores.quality, 0.9),
            other => panic!("unexpected {other:?}"),
        }
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn remote_error_is_per_item() {
        let backend = sh(r#"echo '{"type":"ready"}'
read line
echo '{"type":"error","id":"req-1","error":"rate limited"}'
read line"#);

        let err = backend.invoke(evaluate_task()).await.unwrap_err();
        assert!(matches!(err, DnaCommitError::Collaborator { stage: Stage::Evaluate, .. }));
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn missing_executable_is_unavailable() {
        let backend = BridgeBackend::new(BridgeConfig::new(
            "dnacommit-no-such-binary-for-tests",
            vec![],
        ));
        let err = backend.invoke(evaluate_task()).await.unwrap_err();
        assert!(matches!(err, DnaCommitError::CollaboratorUnavailable { .. }));
    }

    #[tokio::test]
    async fn early_exit_is_unavailable() {
        let backend = sh(r#"echo '{"type":"ready"}'"#);
        let err = backend.invoke(evaluate_task()).await.unwrap_err();
        assert!(matches!(err, DnaCommitError::CollaboratorUnavailable { .. }));
    }
}
