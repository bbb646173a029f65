//! Host-claim coordination.
//!
//! Workers coordinate through nothing but a shared key/value store with
//! per-key compare-and-swap:
//!
//! - [`HostClaimer`]: scans the inventory against the stored claims and races
//!   peers for one free or abandoned host
//! - [`HeldClaim`]: the claim a worker owns; heartbeats, release and failure
//!   are conditional writes guarded by the value this worker last wrote
//! - [`ClaimStore`]: the store contract, with an in-memory implementation and
//!   one backed by Kubernetes object annotations
//!
//! # Safety
//!
//! For any host at most one claim in state Claiming or Running with a fresh
//! heartbeat exists at a time. Takeover is only possible once a claim is
//! stale, released or failed, and even then only one of the racing workers'
//! conditional writes can succeed.

pub mod claimer;
pub mod held;
pub mod kube;
pub mod record;
pub mod store;

pub use claimer::{Acquisition, HostClaimer};
pub use held::HeldClaim;
pub use kube::{KubeClaimStore, KubeResourceKind, KubeStoreConfig};
pub use record::{claim_key, Claim, ClaimState};
pub use store::{CasOutcome, ClaimStore, MemoryClaimStore};
