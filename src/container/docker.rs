//! Docker-backed container runner.
//!
//! One `docker run -i --rm` per invocation. The JSON input goes in on stdin,
//! which is then closed; results come back on stdout wrapped in
//! `OUTPUT_START_MARKER` / `OUTPUT_END_MARKER` frames. Follow-up messages
//! reach the running agent through the IPC input directory, never stdin.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::container::{
    ContainerEvent, ContainerInput, ContainerOutput, ContainerRunner, OutputStatus, ProcessHandle,
    read_secrets,
};
use crate::error::ContainerError;
use crate::group_folder::{resolve_group_folder_path, resolve_group_ipc_path};
use crate::types::RegisteredGroup;

pub const OUTPUT_START_MARKER: &str = "---NANOCLAW_OUTPUT_START---";
pub const OUTPUT_END_MARKER: &str = "---NANOCLAW_OUTPUT_END---";

/// Prefix shared by every container this host starts.
pub const CONTAINER_PREFIX: &str = "nanoclaw-";

/// Grace added on top of the idle timeout before a container is considered hung.
const IDLE_GRACE: Duration = Duration::from_secs(30);

/// Bytes of stderr kept for error reports.
const STDERR_TAIL: usize = 4096;

/// Settings for [`DockerRunner`].
#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub runtime: String,
    pub image: String,
    pub groups_dir: PathBuf,
    pub data_dir: PathBuf,
    pub container_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_output_size: usize,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for DockerConfig {
    fn from(config: &Config) -> Self {
        Self {
            runtime: config.container_runtime.clone(),
            image: config.container_image.clone(),
            groups_dir: config.groups_dir(),
            data_dir: config.data_dir(),
            container_timeout: config.container_timeout,
            idle_timeout: config.idle_timeout,
            max_output_size: config.container_max_output_size,
        }
    }
}

/// Runs agent containers through the docker CLI.
pub struct DockerRunner {
    config: DockerConfig,
}

impl DockerRunner {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    /// Fail unless the container runtime answers `info`.
    pub async fn ensure_runtime_running(&self) -> Result<(), ContainerError> {
        let output = Command::new(&self.config.runtime)
            .arg("info")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                ContainerError::RuntimeUnavailable(format!("{}: {e}", self.config.runtime))
            })?;

        if !output.status.success() {
            return Err(ContainerError::RuntimeUnavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        debug!(runtime = %self.config.runtime, "Container runtime is running");
        Ok(())
    }

    /// Stop containers left behind by a previous run. Returns how many were stopped.
    pub async fn cleanup_orphans(&self) -> Result<usize, ContainerError> {
        let filter = format!("name={CONTAINER_PREFIX}");
        let output = Command::new(&self.config.runtime)
            .args(["ps", "--filter", filter.as_str(), "--format", "{{.Names}}"])
            .output()
            .await?;

        let names: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|n| n.starts_with(CONTAINER_PREFIX))
            .map(str::to_string)
            .collect();

        for name in &names {
            self.stop_container(name).await;
        }
        if !names.is_empty() {
            info!(count = names.len(), names = ?names, "Stopped orphaned containers");
        }
        Ok(names.len())
    }

    async fn stop_container(&self, name: &str) {
        match Command::new(&self.config.runtime)
            .args(["stop", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) if status.success() => debug!(container = %name, "Container stopped"),
            Ok(status) => debug!(container = %name, %status, "Container stop returned non-zero"),
            Err(e) => warn!(container = %name, error = %e, "Failed to stop container"),
        }
    }

    fn effective_timeout(&self, group: &RegisteredGroup) -> Duration {
        let hard = group
            .container_config
            .timeout
            .map(Duration::from_millis)
            .unwrap_or(self.config.container_timeout);
        hard.max(self.config.idle_timeout + IDLE_GRACE)
    }

    fn build_args(&self, group: &RegisteredGroup, container_name: &str) -> Result<Vec<String>, ContainerError> {
        let spawn_err = |reason: String| ContainerError::SpawnFailed {
            name: container_name.to_string(),
            reason,
        };
        let group_dir = resolve_group_folder_path(&self.config.groups_dir, &group.folder)
            .map_err(|e| spawn_err(e.to_string()))?;
        let ipc_dir = resolve_group_ipc_path(&self.config.data_dir, &group.folder)
            .map_err(|e| spawn_err(e.to_string()))?;
        let claude_dir = self
            .config
            .data_dir
            .join("sessions")
            .join(&group.folder)
            .join(".claude");

        for dir in [
            group_dir.clone(),
            group_dir.join("logs"),
            ipc_dir.join("input"),
            ipc_dir.join("files"),
            claude_dir.clone(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| spawn_err(format!("create {}: {e}", dir.display())))?;
        }

        let mount = |host: &PathBuf, guest: &str| format!("{}:{guest}", host.display());
        Ok(vec![
            "run".to_string(),
            "-i".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.to_string(),
            "-v".to_string(),
            mount(&group_dir, "/workspace/group"),
            "-v".to_string(),
            mount(&ipc_dir, "/workspace/ipc"),
            "-v".to_string(),
            mount(&claude_dir, "/home/node/.claude"),
            self.config.image.clone(),
        ])
    }
}

/// `nanoclaw-<folder>-<millis>`, restricted to characters docker accepts.
pub fn container_name_for(folder: &str) -> String {
    let safe: String = folder
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!(
        "{CONTAINER_PREFIX}{safe}-{}",
        chrono::Utc::now().timestamp_millis()
    )
}

/// Stdin payload: the serialized input plus exposed secrets.
fn stdin_payload(input: &ContainerInput) -> Result<Vec<u8>, ContainerError> {
    let mut value = serde_json::to_value(input)
        .map_err(|e| ContainerError::InvalidOutput(format!("serialize input: {e}")))?;
    if input.secrets.is_empty() {
        return serde_json::to_vec(&value)
            .map_err(|e| ContainerError::InvalidOutput(format!("serialize input: {e}")));
    }
    if let Some(obj) = value.as_object_mut() {
        let secrets: serde_json::Map<String, serde_json::Value> = input
            .secrets
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.expose_secret().to_string())))
            .collect();
        obj.insert("secrets".to_string(), serde_json::Value::Object(secrets));
    }
    serde_json::to_vec(&value).map_err(|e| ContainerError::InvalidOutput(format!("serialize input: {e}")))
}

/// Incremental parser for marker-framed stdout.
#[derive(Debug, Default)]
pub struct FrameParser {
    frame: Option<String>,
    retained: usize,
    max_retained: usize,
    truncated: bool,
}

impl FrameParser {
    pub fn new(max_retained: usize) -> Self {
        Self {
            max_retained,
            ..Self::default()
        }
    }

    /// Feed one stdout line; returns a completed frame, if any.
    pub fn push_line(&mut self, line: &str) -> Option<Result<ContainerOutput, serde_json::Error>> {
        if self.retained >= self.max_retained {
            self.truncated = true;
        } else {
            self.retained += line.len() + 1;
        }

        let trimmed = line.trim();
        if trimmed == OUTPUT_START_MARKER {
            self.frame = Some(String::new());
            return None;
        }
        if trimmed == OUTPUT_END_MARKER {
            let body = self.frame.take()?;
            return Some(serde_json::from_str(body.trim()));
        }
        if let Some(frame) = self.frame.as_mut() {
            if frame.len() + line.len() <= self.max_retained {
                frame.push_str(line);
                frame.push('\n');
            } else {
                self.truncated = true;
            }
        }
        None
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

#[async_trait]
impl ContainerRunner for DockerRunner {
    async fn run(
        &self,
        group: &RegisteredGroup,
        mut input: ContainerInput,
        events: mpsc::UnboundedSender<ContainerEvent>,
    ) -> Result<ContainerOutput, ContainerError> {
        let container_name = container_name_for(&group.folder);
        let args = self.build_args(group, &container_name)?;
        if input.secrets.is_empty() {
            input.secrets = std::sync::Arc::new(read_secrets());
        }
        let payload = stdin_payload(&input)?;

        let mut child = Command::new(&self.config.runtime)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ContainerError::SpawnFailed {
                name: container_name.clone(),
                reason: e.to_string(),
            })?;

        info!(
            group = %group.name,
            container = %container_name,
            standby = input.is_scheduled_task,
            "Spawning container agent"
        );

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }

        let handle = ProcessHandle::new(&container_name);
        let _ = events.send(ContainerEvent::Spawned(handle.clone()));

        let stderr_task = child.stderr.take().map(|stderr| {
            let name = container_name.clone();
            tokio::spawn(async move {
                let mut tail = String::new();
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(container = %name, "{line}");
                    tail.push_str(&line);
                    tail.push('\n');
                    if tail.len() > STDERR_TAIL * 2 {
                        let mut cut = tail.len() - STDERR_TAIL;
                        while !tail.is_char_boundary(cut) {
                            cut += 1;
                        }
                        tail = tail.split_off(cut);
                    }
                }
                tail
            })
        });

        let timeout = self.effective_timeout(group);
        let mut deadline = Instant::now() + timeout;
        let mut parser = FrameParser::new(self.config.max_output_size);
        let mut last_output: Option<ContainerOutput> = None;
        let mut new_session_id: Option<String> = None;
        let mut timed_out = false;
        let mut killed = false;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => match parser.push_line(&line) {
                            Some(Ok(output)) => {
                                if let Some(id) = &output.new_session_id {
                                    new_session_id = Some(id.clone());
                                }
                                deadline = Instant::now() + timeout;
                                // Receiver gone means the caller stopped listening.
                                let _ = events.send(ContainerEvent::Output(output.clone()));
                                last_output = Some(output);
                            }
                            Some(Err(e)) => {
                                warn!(container = %container_name, error = %e, "Discarding malformed output frame");
                            }
                            None => {}
                        },
                        Ok(None) => break,
                        Err(e) => {
                            warn!(container = %container_name, error = %e, "Error reading container stdout");
                            break;
                        }
                    },
                    _ = tokio::time::sleep_until(deadline) => {
                        warn!(container = %container_name, ?timeout, "Container timed out, stopping");
                        timed_out = true;
                        self.stop_container(&container_name).await;
                        let _ = child.start_kill();
                        break;
                    }
                    _ = handle.killed() => {
                        info!(container = %container_name, "Kill requested, stopping container");
                        killed = true;
                        self.stop_container(&container_name).await;
                        let _ = child.start_kill();
                        break;
                    }
                }
            }
        }

        let status = child.wait().await;
        handle.mark_exited();
        let stderr_tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if parser.truncated() {
            warn!(container = %container_name, limit = self.config.max_output_size, "Container output truncated");
        }

        if timed_out {
            // Output already streamed means this was idle cleanup, not a failure.
            return match last_output {
                Some(_) => Ok(ContainerOutput {
                    status: OutputStatus::Success,
                    result: None,
                    new_session_id,
                    error: None,
                }),
                None => Err(ContainerError::Timeout {
                    name: container_name,
                    timeout,
                }),
            };
        }

        let code = status.as_ref().ok().and_then(|s| s.code()).unwrap_or(-1);
        let success = status.as_ref().is_ok_and(|s| s.success());
        debug!(container = %container_name, code, killed, "Container exited");

        if !success && !killed {
            return Err(ContainerError::Exited {
                name: container_name,
                code,
                stderr: stderr_tail.trim().to_string(),
            });
        }

        match last_output {
            Some(last) => Ok(ContainerOutput {
                status: last.status,
                result: None,
                new_session_id,
                error: last.error,
            }),
            None if killed => Err(ContainerError::Exited {
                name: container_name,
                code,
                stderr: "killed".to_string(),
            }),
            None => Err(ContainerError::InvalidOutput(format!(
                "{container_name} exited without an output frame"
            ))),
        }
    }
}
