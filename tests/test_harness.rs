//! Test harness for worker and supervisor integration tests.
//!
//! Provides a scripted in-memory transport, an output capture sink, and
//! builders for inventories and fast-ticking worker configurations.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use hostwarden::claim::ClaimStore;
use hostwarden::config::WorkerConfig;
use hostwarden::error::{HostwardenError, Result};
use hostwarden::inventory::{HostEntry, Inventory};
use hostwarden::remote::{
    BoxedWriter, RemoteExit, RemoteSession, RemoteStreams, SessionConnector,
};
use hostwarden::supervisor::OutputSinks;
use hostwarden::worker::Worker;

/// What one opened session does.
#[derive(Debug, Clone)]
pub enum Step {
    /// `open` fails with a network error.
    Refuse,
    /// The command exits with `code` after `after`.
    Exit { code: i32, after: Duration },
    /// The channel breaks after `after`.
    Disconnect { after: Duration },
    /// The command runs until the session is closed.
    Hang,
}

#[derive(Debug, Clone)]
pub struct OpenRecord {
    pub host: String,
    pub env: BTreeMap<String, String>,
}

/// Connector that plays back a script of session behaviours, one step per
/// `open`, then repeats `fallback`.
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    output: Vec<u8>,
    opens: Mutex<Vec<OpenRecord>>,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new(script: impl IntoIterator<Item = Step>, fallback: Step) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            output: Vec::new(),
            opens: Mutex::new(Vec::new()),
            live: Arc::new(AtomicUsize::new(0)),
            max_live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn hanging() -> Self {
        Self::new([], Step::Hang)
    }

    /// Bytes every session writes to stdout.
    pub fn with_output(mut self, output: &[u8]) -> Self {
        self.output = output.to_vec();
        self
    }

    pub fn opens(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    pub fn open_records(&self) -> Vec<OpenRecord> {
        self.opens.lock().unwrap().clone()
    }

    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live_sessions(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionConnector for ScriptedConnector {
    async fn open(
        &self,
        host: &HostEntry,
        env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn RemoteSession>> {
        self.opens.lock().unwrap().push(OpenRecord {
            host: host.name.clone(),
            env: env.clone(),
        });
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        if let Step::Refuse = step {
            return Err(HostwardenError::Network {
                host: host.name.clone(),
                message: "connection refused".into(),
            });
        }

        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            host: host.name.clone(),
            step,
            output: self.output.clone(),
            live: self.live.clone(),
            open: true,
        }))
    }
}

struct ScriptedSession {
    host: String,
    step: Step,
    output: Vec<u8>,
    live: Arc<AtomicUsize>,
    open: bool,
}

impl ScriptedSession {
    fn mark_closed(&mut self) {
        if self.open {
            self.open = false;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn start(&mut self, _command: &str) -> Result<RemoteStreams> {
        Ok(RemoteStreams {
            stdin: None,
            stdout: Some(Box::new(std::io::Cursor::new(self.output.clone()))),
            stderr: Some(Box::new(tokio::io::empty())),
        })
    }

    async fn wait(&mut self) -> Result<RemoteExit> {
        match self.step.clone() {
            Step::Exit { code, after } => {
                tokio::time::sleep(after).await;
                Ok(RemoteExit { code: Some(code) })
            }
            Step::Disconnect { after } => {
                tokio::time::sleep(after).await;
                Err(HostwardenError::Network {
                    host: self.host.clone(),
                    message: "connection reset".into(),
                })
            }
            Step::Hang | Step::Refuse => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.mark_closed();
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.mark_closed();
    }
}

/// Shared in-memory writer used to capture remote output.
#[derive(Clone, Default)]
pub struct CaptureBuffer(Arc<Mutex<Vec<u8>>>);

impl CaptureBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl AsyncWrite for CaptureBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Sinks capturing stdout and stderr separately.
pub fn capture_sinks() -> (OutputSinks, CaptureBuffer, CaptureBuffer) {
    let stdout = CaptureBuffer::default();
    let stderr = CaptureBuffer::default();
    let sinks = {
        let stdout = stdout.clone();
        let stderr = stderr.clone();
        OutputSinks::new(
            Arc::new(move || Box::new(stdout.clone()) as BoxedWriter),
            Arc::new(move || Box::new(stderr.clone()) as BoxedWriter),
        )
    };
    (sinks, stdout, stderr)
}

/// Worker configuration with short timings for tests.
pub fn test_config(worker_id: &str) -> WorkerConfig {
    let mut config = WorkerConfig::new(worker_id, "run.sh");
    config.claim.stale_after_ms = 600;
    config.claim.heartbeat_interval_ms = 50;
    config.claim.acquire_retry_ms = 20;
    config.backoff.initial_ms = 10;
    config.backoff.max_ms = 80;
    config.supervisor.connect_timeout_ms = 500;
    config.supervisor.release_timeout_ms = 500;
    config
}

/// Inventory of `local` hosts with the given names.
pub fn local_inventory(names: &[&str]) -> Arc<Inventory> {
    Arc::new(
        Inventory::new(names.iter().map(|name| HostEntry::local(*name)).collect()).unwrap(),
    )
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Handle to a worker running in the background.
pub struct TestWorker {
    pub worker: Arc<Worker>,
    pub shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl TestWorker {
    pub fn spawn(
        config: WorkerConfig,
        inventory: Arc<Inventory>,
        store: Arc<dyn ClaimStore>,
        connector: Arc<dyn SessionConnector>,
    ) -> Self {
        let worker = Arc::new(
            Worker::new(config, inventory, store, connector).with_output(OutputSinks::discard()),
        );
        let shutdown = CancellationToken::new();
        let handle = {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };
        Self {
            worker,
            shutdown,
            handle,
        }
    }

    /// Simulate a crash: stop the worker without releasing anything.
    pub fn kill(self) {
        self.handle.abort();
    }

    /// Request graceful shutdown and wait for the worker to finish.
    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("worker did not stop in time")
            .expect("worker task panicked")
    }
}
