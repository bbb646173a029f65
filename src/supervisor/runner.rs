use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::claim::{ClaimState, HeldClaim};
use crate::config::{BackoffConfig, SupervisorConfig, WorkerConfig};
use crate::error::{HostwardenError, Result};
use crate::inventory::HostEntry;
use crate::remote::{BoxedReader, BoxedWriter, RemoteSession, RemoteStreams, SessionConnector};
use crate::supervisor::backoff::Backoff;
use crate::supervisor::reporter::StatusReporter;
use crate::supervisor::state::{SupervisorState, SupervisorStatus};

/// Name of the claimed host, injected into the remote environment.
pub const HOST_ENV: &str = "HOSTWARDEN_HOST";
/// Id of the supervising worker, injected into the remote environment.
pub const WORKER_ENV: &str = "HOSTWARDEN_WORKER_ID";

/// How long output copies may keep draining after the command ended.
const STREAM_DRAIN_GRACE: Duration = Duration::from_secs(2);

pub type SinkFactory = Arc<dyn Fn() -> BoxedWriter + Send + Sync>;

/// Where remote stdout and stderr are copied to. A fresh writer is made for
/// every run.
#[derive(Clone)]
pub struct OutputSinks {
    stdout: SinkFactory,
    stderr: SinkFactory,
}

impl OutputSinks {
    pub fn new(stdout: SinkFactory, stderr: SinkFactory) -> Self {
        Self { stdout, stderr }
    }

    /// The worker's own stdout and stderr.
    pub fn stdio() -> Self {
        Self::new(
            Arc::new(|| Box::new(tokio::io::stdout()) as BoxedWriter),
            Arc::new(|| Box::new(tokio::io::stderr()) as BoxedWriter),
        )
    }

    pub fn discard() -> Self {
        Self::new(
            Arc::new(|| Box::new(tokio::io::sink()) as BoxedWriter),
            Arc::new(|| Box::new(tokio::io::sink()) as BoxedWriter),
        )
    }
}

impl Default for OutputSinks {
    fn default() -> Self {
        Self::stdio()
    }
}

/// Why supervision of a host ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Shutdown was requested and the claim was released.
    Stopped,
    /// Another worker took the claim over.
    Abandoned,
    /// Too many consecutive failures; the claim was marked failed.
    Failed,
}

enum RunEnd {
    Exited(Option<i32>),
    Disconnected(HostwardenError),
    Stopped,
    Abandoned,
}

/// Drives the remote command on one claimed host through
/// connect, run, backoff and reconnect until shutdown, claim loss or
/// give-up.
pub struct ProcessSupervisor {
    worker_id: String,
    config: SupervisorConfig,
    backoff: BackoffConfig,
    heartbeat_interval: Duration,
    connector: Arc<dyn SessionConnector>,
    output: OutputSinks,
    status: watch::Sender<SupervisorStatus>,
}

impl ProcessSupervisor {
    pub fn new(config: &WorkerConfig, connector: Arc<dyn SessionConnector>) -> Self {
        let (status, _) = watch::channel(SupervisorStatus::default());
        Self {
            worker_id: config.worker_id.clone(),
            config: config.supervisor.clone(),
            backoff: config.backoff.clone(),
            heartbeat_interval: config.claim.heartbeat_interval(),
            connector,
            output: OutputSinks::default(),
            status,
        }
    }

    pub fn with_output(mut self, output: OutputSinks) -> Self {
        self.output = output;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.subscribe()
    }

    /// Supervise `host` until shutdown, claim loss or give-up.
    ///
    /// Only configuration errors are returned as `Err`; the claim is marked
    /// failed first.
    pub async fn supervise(
        &self,
        host: &HostEntry,
        claim: Arc<HeldClaim>,
        shutdown: CancellationToken,
    ) -> Result<SupervisorExit> {
        self.status.send_replace(SupervisorStatus::for_host(&host.name));
        tracing::info!(host = %host.name, worker_id = %self.worker_id, "Supervising host");

        // Heartbeats must stop even if this future is dropped mid-flight.
        let reporter_stop = CancellationToken::new();
        let _reporter_guard = reporter_stop.clone().drop_guard();
        let reporter = {
            let reporter = StatusReporter::new(self.heartbeat_interval);
            let claim = claim.clone();
            let status = self.status.subscribe();
            let stop = reporter_stop.clone();
            tokio::spawn(async move { reporter.run(claim, status, stop).await })
        };

        let outcome = self.run_loop(host, &claim, &shutdown).await;

        reporter_stop.cancel();
        if let Err(e) = reporter.await {
            tracing::warn!(host = %host.name, error = %e, "Status reporter task failed");
        }

        match &outcome {
            Ok(SupervisorExit::Stopped) => {
                self.release(&claim).await;
                self.enter(SupervisorState::Stopped);
                tracing::info!(host = %host.name, "Supervisor stopped");
            }
            Ok(SupervisorExit::Abandoned) => {
                self.enter(SupervisorState::Abandoned);
                tracing::warn!(host = %host.name, "Claim lost, abandoning host");
            }
            Ok(SupervisorExit::Failed) | Err(_) => {
                if let Err(e) = claim.mark_failed().await {
                    tracing::warn!(host = %host.name, error = %e, "Failed to mark claim failed");
                }
                self.enter(SupervisorState::Failed);
            }
        }
        outcome
    }

    async fn run_loop(
        &self,
        host: &HostEntry,
        claim: &HeldClaim,
        shutdown: &CancellationToken,
    ) -> Result<SupervisorExit> {
        let lost = claim.lost_token();
        let env = self.environment(host);
        let mut backoff = Backoff::new(&self.backoff);
        let reset_after = Duration::from_millis(self.backoff.reset_after_ms);
        let mut failures: u32 = 0;
        let mut runs: u32 = 0;

        loop {
            let launched = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(SupervisorExit::Stopped),
                _ = lost.cancelled() => return Ok(SupervisorExit::Abandoned),
                launched = self.launch(host, &env) => launched,
            };

            match launched {
                Ok((session, streams)) => {
                    runs += 1;
                    let started = Instant::now();
                    let end = self
                        .run_once(host, claim, session, streams, runs, shutdown, &lost)
                        .await;
                    if started.elapsed() >= reset_after {
                        backoff.reset();
                    }

                    match end {
                        RunEnd::Stopped => return Ok(SupervisorExit::Stopped),
                        RunEnd::Abandoned => return Ok(SupervisorExit::Abandoned),
                        RunEnd::Exited(code) => {
                            if code == Some(0) {
                                tracing::info!(host = %host.name, exit_code = ?code, "Remote command exited");
                            } else {
                                tracing::warn!(host = %host.name, exit_code = ?code, "Remote command exited");
                            }
                            self.status.send_modify(|s| {
                                s.last_exit_code = code;
                                s.enter(SupervisorState::Exited);
                            });
                            failures = 0;
                        }
                        RunEnd::Disconnected(e) => {
                            tracing::warn!(host = %host.name, error = %e, "Remote session disconnected");
                            self.enter(SupervisorState::Disconnected);
                            failures += 1;
                        }
                    }
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(host = %host.name, error = %e, "Host configuration is unusable");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(host = %host.name, error = %e, "Failed to connect to host");
                    failures += 1;
                }
            }

            if let Some(max) = self.config.max_consecutive_failures {
                if failures > 0 && failures >= max {
                    tracing::error!(
                        host = %host.name,
                        failures,
                        "Giving up on host after consecutive failures"
                    );
                    return Ok(SupervisorExit::Failed);
                }
            }

            let delay = backoff.next_delay();
            self.enter(SupervisorState::Backoff);
            tracing::info!(
                host = %host.name,
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "Backing off before reconnecting"
            );
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(SupervisorExit::Stopped),
                _ = lost.cancelled() => return Ok(SupervisorExit::Abandoned),
                _ = tokio::time::sleep(delay) => {}
            }
            self.enter(SupervisorState::Connecting);
        }
    }

    /// Open a session and start the command, bounded by the connect timeout.
    async fn launch(
        &self,
        host: &HostEntry,
        env: &BTreeMap<String, String>,
    ) -> Result<(Box<dyn RemoteSession>, RemoteStreams)> {
        let timeout = self.config.connect_timeout();
        let mut session = match tokio::time::timeout(timeout, self.connector.open(host, env)).await
        {
            Ok(opened) => opened?,
            Err(_) => {
                return Err(HostwardenError::Network {
                    host: host.name.clone(),
                    message: format!("connect timed out after {}ms", timeout.as_millis()),
                })
            }
        };

        match session.start(&self.config.command).await {
            Ok(streams) => Ok((session, streams)),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_once(
        &self,
        host: &HostEntry,
        claim: &HeldClaim,
        mut session: Box<dyn RemoteSession>,
        streams: RemoteStreams,
        runs: u32,
        shutdown: &CancellationToken,
        lost: &CancellationToken,
    ) -> RunEnd {
        self.status.send_modify(|s| {
            s.restarts = runs.saturating_sub(1);
            s.enter(SupervisorState::Running);
        });
        tracing::info!(
            host = %host.name,
            command = %self.config.command,
            restarts = runs.saturating_sub(1),
            "Remote command running"
        );

        match claim.refresh(ClaimState::Running).await {
            Ok(()) => {}
            Err(HostwardenError::ClaimLost(_)) => {
                session.close().await;
                return RunEnd::Abandoned;
            }
            Err(e) => {
                tracing::warn!(host = %host.name, error = %e, "Failed to record running state");
            }
        }

        let copies = self.spawn_copies(&host.name, streams);
        let end = tokio::select! {
            biased;
            _ = shutdown.cancelled() => RunEnd::Stopped,
            _ = lost.cancelled() => RunEnd::Abandoned,
            waited = session.wait() => match waited {
                Ok(exit) => RunEnd::Exited(exit.code),
                Err(e) => RunEnd::Disconnected(e),
            },
        };

        session.close().await;
        copies.finish().await;
        end
    }

    fn spawn_copies(&self, host: &str, mut streams: RemoteStreams) -> StreamCopies {
        let mut output = Vec::with_capacity(2);
        if let Some(stdout) = streams.stdout.take() {
            output.push(copy_stream(host, "stdout", stdout, (self.output.stdout)()));
        }
        if let Some(stderr) = streams.stderr.take() {
            output.push(copy_stream(host, "stderr", stderr, (self.output.stderr)()));
        }

        // Dropping the remote stdin closes it when input is not forwarded.
        let input = match streams.stdin.take() {
            Some(stdin) if self.config.forward_stdin => Some(copy_stream(
                host,
                "stdin",
                Box::new(tokio::io::stdin()),
                stdin,
            )),
            _ => None,
        };

        StreamCopies { output, input }
    }

    async fn release(&self, claim: &HeldClaim) {
        match tokio::time::timeout(self.config.release_timeout(), claim.release()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(host = %claim.host(), error = %e, "Failed to release claim");
            }
            Err(_) => {
                tracing::warn!(host = %claim.host(), "Timed out releasing claim");
            }
        }
    }

    fn environment(&self, host: &HostEntry) -> BTreeMap<String, String> {
        let mut env = host.environment.clone();
        env.insert(HOST_ENV.to_string(), host.name.clone());
        env.insert(WORKER_ENV.to_string(), self.worker_id.clone());
        env
    }

    fn enter(&self, state: SupervisorState) {
        self.status.send_modify(|s| s.enter(state));
    }
}

struct StreamCopies {
    output: Vec<JoinHandle<()>>,
    input: Option<JoinHandle<()>>,
}

impl StreamCopies {
    /// Let output drain after the session closed, then stop every copy.
    async fn finish(self) {
        if let Some(input) = self.input {
            input.abort();
        }
        for mut handle in self.output {
            if tokio::time::timeout(STREAM_DRAIN_GRACE, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
    }
}

fn copy_stream(
    host: &str,
    stream: &'static str,
    mut reader: BoxedReader,
    mut writer: BoxedWriter,
) -> JoinHandle<()> {
    let host = host.to_string();
    tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
            tracing::debug!(host = %host, stream, error = %e, "Stream copy ended");
        }
        if stream == "stdin" {
            let _ = writer.shutdown().await;
        } else {
            let _ = writer.flush().await;
        }
    })
}
