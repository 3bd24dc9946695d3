//! Scripted container runner for tests.
//!
//! Every `run` call surfaces as a [`FakeInvocation`] the test drives by hand:
//! spawn the process, stream outputs, then exit.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::container::{ContainerEvent, ContainerInput, ContainerOutput, ContainerRunner, ProcessHandle};
use crate::error::ContainerError;
use crate::types::RegisteredGroup;

/// Test-side control for one running fake container.
pub struct FakeInvocation {
    pub input: ContainerInput,
    pub handle: ProcessHandle,
    events: mpsc::UnboundedSender<ContainerEvent>,
    exit_tx: Option<oneshot::Sender<Result<ContainerOutput, ContainerError>>>,
}

impl FakeInvocation {
    /// Report the process as started.
    pub fn spawn(&self) {
        let _ = self.events.send(ContainerEvent::Spawned(self.handle.clone()));
    }

    /// Stream one output.
    pub fn emit(&self, output: ContainerOutput) {
        let _ = self.events.send(ContainerEvent::Output(output));
    }

    /// Finish the run with `result`.
    pub fn exit(mut self, result: Result<ContainerOutput, ContainerError>) {
        if let Some(tx) = self.exit_tx.take() {
            let _ = tx.send(result);
        }
    }

    pub fn exit_ok(self) {
        self.exit(Ok(ContainerOutput::success(None)));
    }
}

/// Runner whose containers are driven from the test body.
pub struct FakeRunner {
    auto_spawn: bool,
    started: AtomicUsize,
    inputs: Mutex<Vec<ContainerInput>>,
    tx: mpsc::UnboundedSender<FakeInvocation>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeInvocation>>,
}

impl FakeRunner {
    /// Containers report `Spawned` immediately.
    pub fn new() -> Self {
        Self::with_auto_spawn(true)
    }

    /// Containers stay un-spawned until [`FakeInvocation::spawn`].
    pub fn manual_spawn() -> Self {
        Self::with_auto_spawn(false)
    }

    fn with_auto_spawn(auto_spawn: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            auto_spawn,
            started: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<ContainerInput> {
        self.inputs.lock().unwrap().clone()
    }

    /// Wait for the next `run` call.
    pub async fn next_invocation(&self) -> FakeInvocation {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("timed out waiting for a container run")
            .expect("fake runner channel closed")
    }

    /// The next `run` call, if one is already queued.
    pub async fn try_next_invocation(&self) -> Option<FakeInvocation> {
        self.rx.lock().await.try_recv().ok()
    }
}

#[async_trait]
impl ContainerRunner for FakeRunner {
    async fn run(
        &self,
        group: &RegisteredGroup,
        input: ContainerInput,
        events: mpsc::UnboundedSender<ContainerEvent>,
    ) -> Result<ContainerOutput, ContainerError> {
        let n = self.started.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push(input.clone());

        let handle = ProcessHandle::new(format!("nanoclaw-{}-{n}", group.folder));
        let (exit_tx, exit_rx) = oneshot::channel();
        let invocation = FakeInvocation {
            input,
            handle: handle.clone(),
            events,
            exit_tx: Some(exit_tx),
        };
        if self.auto_spawn {
            invocation.spawn();
        }
        let _ = self.tx.send(invocation);

        let result = tokio::select! {
            result = exit_rx => result.unwrap_or_else(|_| Err(ContainerError::InvalidOutput("fake invocation dropped".to_string()))),
            _ = handle.killed() => Err(ContainerError::Exited {
                name: handle.container_name().to_string(),
                code: 137,
                stderr: "killed".to_string(),
            }),
        };
        handle.mark_exited();
        result
    }
}
