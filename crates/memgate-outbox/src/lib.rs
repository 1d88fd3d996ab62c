//! Reliable-delivery core for the memory write gateway.
//!
//! This crate provides:
//! - `Router` - the policy-gated entry point applying the decision table
//! - `OutboxWorker` - lease-based delivery of deferred writes
//! - `Reconciler` - repair passes for the crash windows the protocols leave
//! - `DeliveryClient` - the downstream memory store boundary
//!
//! The durable state lives in `memgate-database`; everything here is
//! stateless apart from its configuration, so any number of workers and
//! routers can share one database.

mod backoff;
mod delivery;
mod error;
mod reconciler;
mod router;
mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::{compute_backoff, compute_backoff_jittered, BackoffConfig};
pub use delivery::{
    DeliveryClient, DeliveryConfig, DeliveryFailure, DeliveryRequest, HttpDeliveryClient,
};
pub use error::{OutboxError, OutboxResult};
pub use reconciler::{
    run_reconcile, ReconcileConfig, ReconcileReport, ReconcileStatus, Reconciler,
};
pub use router::{content_sha, PolicyDecision, Router, WriteOutcome, WriteRequest};
pub use worker::{OutboxWorker, WorkerConfig};
