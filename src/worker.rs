use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::claim::{ClaimStore, HeldClaim, HostClaimer};
use crate::config::WorkerConfig;
use crate::error::{HostwardenError, Result};
use crate::inventory::Inventory;
use crate::remote::SessionConnector;
use crate::status::{run_status_server, StatusState};
use crate::supervisor::{OutputSinks, ProcessSupervisor, SupervisorExit, SupervisorStatus};

/// What the worker as a whole is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Acquiring,
    Supervising,
    Stopped,
    /// Terminated by a configuration error.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub phase: WorkerPhase,
    pub host: Option<String>,
    /// Hosts this worker has acquired so far.
    pub acquisitions: u32,
}

/// One replica: claims a host, supervises the command on it, and claims
/// another one whenever it loses or gives up the current host.
pub struct Worker {
    config: WorkerConfig,
    inventory: Arc<Inventory>,
    store: Arc<dyn ClaimStore>,
    claimer: HostClaimer,
    supervisor: ProcessSupervisor,
    status: watch::Sender<WorkerStatus>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        inventory: Arc<Inventory>,
        store: Arc<dyn ClaimStore>,
        connector: Arc<dyn SessionConnector>,
    ) -> Self {
        let (status, _) = watch::channel(WorkerStatus {
            worker_id: config.worker_id.clone(),
            phase: WorkerPhase::Acquiring,
            host: None,
            acquisitions: 0,
        });
        Self {
            claimer: HostClaimer::new(config.worker_id.clone(), config.claim.clone()),
            supervisor: ProcessSupervisor::new(&config, connector),
            config,
            inventory,
            store,
            status,
        }
    }

    pub fn with_output(mut self, output: OutputSinks) -> Self {
        self.supervisor = self.supervisor.with_output(output);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.status.subscribe()
    }

    pub fn supervisor_status(&self) -> watch::Receiver<SupervisorStatus> {
        self.supervisor.subscribe()
    }

    pub fn status_state(&self) -> StatusState {
        StatusState::new(self.subscribe(), self.supervisor_status())
    }

    /// Run until `shutdown` is cancelled or a configuration error occurs.
    ///
    /// # Errors
    ///
    /// Returns configuration-class errors only; everything else is retried.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        if let Err(e) = self.config.validate() {
            self.set_phase(WorkerPhase::Failed, None);
            return Err(e);
        }

        if let Some(addr) = self.config.status_addr {
            let state = self.status_state();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_status_server(addr, state, shutdown).await;
            });
        }

        tracing::info!(
            worker_id = %self.config.worker_id,
            hosts = self.inventory.len(),
            "Worker starting"
        );

        let result = self.run_loop(&shutdown).await;
        match &result {
            Ok(()) => {
                self.set_phase(WorkerPhase::Stopped, None);
                tracing::info!(worker_id = %self.config.worker_id, "Worker stopped");
            }
            Err(e) => {
                self.set_phase(WorkerPhase::Failed, None);
                tracing::error!(worker_id = %self.config.worker_id, error = %e, "Worker failed");
            }
        }
        result
    }

    async fn run_loop(&self, shutdown: &CancellationToken) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            self.set_phase(WorkerPhase::Acquiring, None);

            let acquisition = match self
                .claimer
                .acquire(&self.inventory, self.store.as_ref())
                .await
            {
                Ok(acquisition) => acquisition,
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    let delay = self.claimer.retry_delay();
                    if matches!(
                        e,
                        HostwardenError::NoHostAvailable | HostwardenError::ClaimConflict(_)
                    ) {
                        tracing::info!(
                            worker_id = %self.config.worker_id,
                            delay_ms = delay.as_millis() as u64,
                            "No host available, retrying"
                        );
                    } else {
                        tracing::warn!(
                            worker_id = %self.config.worker_id,
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "Failed to acquire host, retrying"
                        );
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            let host = acquisition.host;
            self.status.send_modify(|s| {
                s.phase = WorkerPhase::Supervising;
                s.host = Some(host.name.clone());
                s.acquisitions += 1;
            });

            let claim = Arc::new(HeldClaim::new(
                self.store.clone(),
                host.name.clone(),
                acquisition.claim,
            ));
            match self
                .supervisor
                .supervise(&host, claim, shutdown.clone())
                .await?
            {
                SupervisorExit::Stopped => return Ok(()),
                SupervisorExit::Abandoned => {
                    tracing::warn!(host = %host.name, "Host abandoned, acquiring another");
                }
                SupervisorExit::Failed => {
                    tracing::warn!(host = %host.name, "Host given up, acquiring another");
                }
            }
        }
    }

    fn set_phase(&self, phase: WorkerPhase, host: Option<String>) {
        self.status.send_modify(|s| {
            s.phase = phase;
            s.host = host;
        });
    }
}
