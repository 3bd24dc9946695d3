//! Container execution contract.
//!
//! A runner starts one agent container per invocation and reports progress
//! on a single-consumer event channel: first `Spawned` with the process
//! handle, then zero or more streamed `Output`s. The returned future
//! resolves when the container exits. Dropping the receiver only stops
//! delivery; the container keeps running until it exits or is killed.

pub mod docker;
#[cfg(test)]
pub mod testing;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::error::ContainerError;
use crate::types::RegisteredGroup;

pub use docker::{DockerConfig, DockerRunner};

/// Prompt sent to a standby container so it idles in its IPC poll loop.
pub const STANDBY_PROMPT: &str = "[STANDBY]";

/// Input handed to the agent on stdin.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInput {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_main: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_scheduled_task: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Credentials for the agent. Only ever written to container stdin.
    #[serde(skip)]
    pub secrets: Arc<HashMap<String, SecretString>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    Success,
    Error,
}

/// One result reported by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOutput {
    pub status: OutputStatus,
    /// Agent reply. Usually a string; other JSON is passed through as text.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub new_session_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ContainerOutput {
    pub fn success(result: Option<&str>) -> Self {
        Self {
            status: OutputStatus::Success,
            result: result.map(|r| serde_json::Value::String(r.to_string())),
            new_session_id: None,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: OutputStatus::Error,
            result: None,
            new_session_id: None,
            error: Some(message.into()),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.new_session_id = Some(session_id.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == OutputStatus::Error
    }

    /// The reply as text; `None` for session-update markers.
    pub fn result_text(&self) -> Option<String> {
        match &self.result {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

/// Progress of a single invocation.
#[derive(Debug)]
pub enum ContainerEvent {
    /// The process is running; the handle may be registered for piping.
    Spawned(ProcessHandle),
    /// A streamed result.
    Output(ContainerOutput),
}

/// Starts agent containers.
#[async_trait]
pub trait ContainerRunner: Send + Sync {
    /// Run one container to completion.
    async fn run(
        &self,
        group: &RegisteredGroup,
        input: ContainerInput,
        events: mpsc::UnboundedSender<ContainerEvent>,
    ) -> Result<ContainerOutput, ContainerError>;
}

/// Shared reference to a running container process.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    container_name: String,
    exited: AtomicBool,
    kill_tx: watch::Sender<bool>,
}

impl ProcessHandle {
    pub fn new(container_name: impl Into<String>) -> Self {
        let (kill_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(HandleInner {
                container_name: container_name.into(),
                exited: AtomicBool::new(false),
                kill_tx,
            }),
        }
    }

    pub fn container_name(&self) -> &str {
        &self.inner.container_name
    }

    pub fn has_exited(&self) -> bool {
        self.inner.exited.load(Ordering::SeqCst)
    }

    /// Called by the runner once the process is gone.
    pub fn mark_exited(&self) {
        self.inner.exited.store(true, Ordering::SeqCst);
    }

    /// Ask the runner to force-stop the container.
    pub fn kill(&self) {
        self.inner.kill_tx.send_replace(true);
    }

    pub fn kill_requested(&self) -> bool {
        *self.inner.kill_tx.borrow()
    }

    /// Resolves once `kill` has been called.
    pub async fn killed(&self) {
        let mut rx = self.inner.kill_tx.subscribe();
        // The sender lives in `inner`, so this only ends on a kill request.
        let _ = rx.wait_for(|killed| *killed).await;
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("container_name", &self.inner.container_name)
            .field("exited", &self.has_exited())
            .finish()
    }
}

/// Agent credentials read from the environment at spawn time.
pub fn read_secrets() -> HashMap<String, SecretString> {
    ["ANTHROPIC_API_KEY", "CLAUDE_CODE_OAUTH_TOKEN"]
        .into_iter()
        .filter_map(|key| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| (key.to_string(), SecretString::from(v)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_parses_camel_case_frames() {
        let output: ContainerOutput = serde_json::from_str(
            r#"{"status":"success","result":"hi","newSessionId":"s-1"}"#,
        )
        .unwrap();
        assert_eq!(output.status, OutputStatus::Success);
        assert_eq!(output.result_text().as_deref(), Some("hi"));
        assert_eq!(output.new_session_id.as_deref(), Some("s-1"));
    }

    #[test]
    fn non_string_results_become_text() {
        let output: ContainerOutput =
            serde_json::from_str(r#"{"status":"success","result":{"a":1}}"#).unwrap();
        assert_eq!(output.result_text().as_deref(), Some(r#"{"a":1}"#));

        let marker: ContainerOutput =
            serde_json::from_str(r#"{"status":"success","result":null}"#).unwrap();
        assert_eq!(marker.result_text(), None);
    }

    #[test]
    fn input_serialization_never_includes_secrets() {
        let mut input = ContainerInput {
            prompt: "hello".to_string(),
            group_folder: "main".to_string(),
            chat_jid: "cli:local".to_string(),
            is_main: true,
            ..ContainerInput::default()
        };
        input.secrets = Arc::new(HashMap::from([(
            "ANTHROPIC_API_KEY".to_string(),
            SecretString::from("sk-test".to_string()),
        )]));

        let json = serde_json::to_string(&input).unwrap();
        assert!(!json.contains("sk-test"));
        assert!(json.contains(r#""groupFolder":"main""#));
        assert!(!json.contains("isScheduledTask"));
        assert!(!format!("{input:?}").contains("sk-test"));
    }

    #[tokio::test]
    async fn kill_wakes_waiters() {
        let handle = ProcessHandle::new("nanoclaw-main-1");
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.killed().await })
        };
        assert!(!handle.kill_requested());
        handle.kill();
        waiter.await.unwrap();
        assert!(handle.kill_requested());
        assert!(!handle.has_exited());
    }
}
