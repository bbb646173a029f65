//! Supervision of the remote command on a claimed host.
//!
//! [`ProcessSupervisor`] owns the connect/run/backoff cycle and publishes
//! its [`SupervisorStatus`] on a watch channel; [`StatusReporter`] mirrors
//! that status into the claim store as heartbeats.

pub mod backoff;
pub mod reporter;
pub mod runner;
pub mod state;

pub use backoff::Backoff;
pub use reporter::StatusReporter;
pub use runner::{OutputSinks, ProcessSupervisor, SinkFactory, SupervisorExit, HOST_ENV, WORKER_ENV};
pub use state::{SupervisorState, SupervisorStatus};
