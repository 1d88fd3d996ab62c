//! Lease-based outbox worker.
//!
//! Workers share no in-memory state; coordination happens entirely through
//! the lease columns on `memory_write_outbox`. Any store mutation returning
//! `false` means the lease was lost and the record is abandoned mid-flight;
//! whoever re-claims it will repeat the (idempotent) delivery.

use crate::backoff::{compute_backoff_jittered, BackoffConfig};
use crate::delivery::{DeliveryClient, DeliveryRequest};
use crate::error::OutboxResult;
use chrono::{Duration, Utc};
use memgate_database::{
    AuditRefs, AuditSource, AuditStatus, Database, OutboxRecord, PolicyAction,
    TerminalAuditRecord,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Max records claimed per batch.
    pub batch_size: usize,
    /// How long a claim remains exclusive without renewal.
    pub lease_duration: Duration,
    /// Retryable failures beyond this count mark the record dead.
    pub max_retries: u32,
    pub backoff: BackoffConfig,
    /// Delay between claim attempts.
    pub poll_interval: std::time::Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            lease_duration: Duration::minutes(5),
            max_retries: 10,
            backoff: BackoffConfig::default(),
            poll_interval: std::time::Duration::from_millis(500),
        }
    }
}

/// Drains the outbox: claims due records, delivers them, resolves each to
/// sent, retry, or dead.
pub struct OutboxWorker<D: DeliveryClient> {
    worker_id: String,
    db: Arc<Database>,
    delivery: D,
    config: WorkerConfig,
}

impl<D: DeliveryClient> OutboxWorker<D> {
    pub fn new(db: Arc<Database>, delivery: D, config: WorkerConfig) -> Self {
        Self::with_worker_id(format!("worker-{}", Uuid::new_v4()), db, delivery, config)
    }

    pub fn with_worker_id(
        worker_id: String,
        db: Arc<Database>,
        delivery: D,
        config: WorkerConfig,
    ) -> Self {
        Self {
            worker_id,
            db,
            delivery,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim and process one batch. Returns the number of records claimed.
    pub async fn run_once(&self) -> OutboxResult<usize> {
        let batch = self.db.claim_outbox(
            &self.worker_id,
            self.config.batch_size,
            self.config.lease_duration,
        )?;
        let claimed = batch.len();
        for record in batch {
            let outbox_id = record.id;
            if let Err(e) = self.process_record(record).await {
                error!(
                    worker_id = %self.worker_id,
                    outbox_id,
                    error = %e,
                    "Failed to process outbox record"
                );
            }
        }
        Ok(claimed)
    }

    /// Run until shutdown is signalled, claiming a batch every poll interval.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(worker_id = %self.worker_id, "Outbox worker started");
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(0) => {}
                        Ok(claimed) => {
                            debug!(worker_id = %self.worker_id, claimed, "Processed outbox batch");
                        }
                        Err(e) => {
                            error!(worker_id = %self.worker_id, error = %e, "Outbox batch failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(worker_id = %self.worker_id, "Outbox worker stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn process_record(&self, record: OutboxRecord) -> OutboxResult<()> {
        // A matching write already delivered for this space and content hash
        // resolves the record without a downstream call.
        if let Some(duplicate) = self
            .db
            .find_delivered_duplicate(&record.target_space, &record.payload_sha)?
        {
            if self
                .db
                .ack_sent(record.id, &self.worker_id, &format!("duplicate-of-{}", duplicate.id))?
            {
                debug!(
                    outbox_id = record.id,
                    duplicate_of = duplicate.id,
                    "Resolved duplicate without delivery"
                );
                let mut refs = self.flush_refs(&record);
                refs.extra
                    .insert("duplicate_of".to_string(), duplicate.id.to_string());
                self.write_flush_audit(
                    &record,
                    AuditStatus::Success,
                    PolicyAction::Allow,
                    Some(format!("duplicate of outbox {}", duplicate.id)),
                    refs,
                );
            }
            return Ok(());
        }

        if !self.db.renew_lease(record.id, &self.worker_id)? {
            debug!(outbox_id = record.id, "Lease lost before delivery");
            return Ok(());
        }

        let request = DeliveryRequest {
            target_space: record.target_space.clone(),
            payload: record.payload.clone(),
            payload_sha: record.payload_sha.clone(),
        };
        let outcome = self.delivery.deliver(&request).await;

        // The resolution below would be rejected on a lost lease anyway;
        // renewing first distinguishes "lease lost" from "already resolved".
        if !self.db.renew_lease(record.id, &self.worker_id)? {
            warn!(outbox_id = record.id, "Lease lost during delivery, abandoning resolution");
            return Ok(());
        }

        match outcome {
            Ok(result_id) => {
                if self.db.ack_sent(record.id, &self.worker_id, &result_id)? {
                    info!(outbox_id = record.id, result_id = %result_id, "Outbox record delivered");
                    let mut refs = self.flush_refs(&record);
                    refs.result_id = Some(result_id);
                    self.write_flush_audit(
                        &record,
                        AuditStatus::Success,
                        PolicyAction::Allow,
                        None,
                        refs,
                    );
                }
            }
            Err(failure) if failure.retryable && (record.retry_count as u32) < self.config.max_retries => {
                let delay = compute_backoff_jittered(record.retry_count as u32, &self.config.backoff);
                let next_attempt_at = Utc::now() + delay;
                if self
                    .db
                    .fail_retry(record.id, &self.worker_id, &failure.to_string(), next_attempt_at)?
                {
                    debug!(
                        outbox_id = record.id,
                        retry_count = record.retry_count + 1,
                        next_attempt_at = %next_attempt_at,
                        error = %failure,
                        "Outbox delivery failed, scheduled retry"
                    );
                }
            }
            Err(failure) => {
                let reason = if failure.retryable {
                    format!("retries exhausted: {failure}")
                } else {
                    failure.to_string()
                };
                if self.db.mark_dead(record.id, &self.worker_id, &reason)? {
                    warn!(outbox_id = record.id, error = %reason, "Outbox record marked dead");
                    let refs = self.flush_refs(&record);
                    self.write_flush_audit(
                        &record,
                        AuditStatus::Failed,
                        PolicyAction::Reject,
                        Some(reason),
                        refs,
                    );
                }
            }
        }
        Ok(())
    }

    fn flush_refs(&self, record: &OutboxRecord) -> AuditRefs {
        AuditRefs {
            outbox_id: Some(record.id),
            payload_sha: Some(record.payload_sha.clone()),
            source: Some(AuditSource::Worker),
            ..Default::default()
        }
    }

    /// Best-effort audit row for a terminal flush outcome. The outbox
    /// resolution already committed and stands either way; the reconciler
    /// backfills any row missed here.
    fn write_flush_audit(
        &self,
        record: &OutboxRecord,
        status: AuditStatus,
        action: PolicyAction,
        reason: Option<String>,
        refs: AuditRefs,
    ) {
        let audit = TerminalAuditRecord {
            correlation_id: format!("outbox-{}-{}", record.id, Uuid::new_v4()),
            actor: self.worker_id.clone(),
            target_space: record.target_space.clone(),
            action,
            reason,
            status,
            refs,
        };
        if let Err(e) = self.db.write_terminal_audit(&audit) {
            warn!(outbox_id = record.id, error = %e, "Failed to write flush audit row");
        }
    }
}
