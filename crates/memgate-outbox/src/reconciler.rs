//! Repair passes for the gateway's crash windows.
//!
//! Three passes, each isolating per-record failures so one bad row never
//! blocks the rest:
//! 1. terminal outbox records missing their flush audit row get one
//!    backfilled (the outbox row itself is never touched),
//! 2. leases held past the stale threshold are released (the record stays
//!    pending and becomes claimable again),
//! 3. audit rows stuck in `pending` past the timeout are finalized to
//!    `failed`.

use crate::error::OutboxResult;
use chrono::{Duration, Utc};
use memgate_database::{
    AuditRefs, AuditSource, AuditStatus, Database, OutboxStatus, PolicyAction,
    TerminalAuditRecord,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Reconciliation tuning.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// How far back the terminal-without-audit scan looks.
    pub scan_window: Duration,
    /// Leases held longer than this are considered abandoned. Configure it
    /// longer than the worker lease duration so claim-time reclaim stays the
    /// fast path.
    pub stale_lease_threshold: Duration,
    /// Pending audit rows older than this are failed.
    pub pending_audit_timeout: Duration,
    /// Report what would be repaired without writing anything.
    pub dry_run: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            scan_window: Duration::hours(24),
            stale_lease_threshold: Duration::minutes(30),
            pending_audit_timeout: Duration::minutes(15),
            dry_run: false,
        }
    }
}

/// Overall result of a reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStatus {
    /// Nothing needed repair.
    Clean,
    /// Repairs were made (or would be, in dry-run).
    Repaired,
    /// At least one repair or scan failed.
    Error,
}

impl ReconcileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Repaired => "repaired",
            Self::Error => "error",
        }
    }

    /// Process exit code for the `reconcile` command.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::Repaired => 1,
            Self::Error => 2,
        }
    }
}

/// Per-run counters.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Inconsistencies repaired (in dry-run: that would be repaired).
    pub repaired: usize,
    /// Rows examined and found already consistent.
    pub skipped: usize,
    /// Rows whose repair failed.
    pub failed: usize,
}

impl ReconcileReport {
    pub fn status(&self) -> ReconcileStatus {
        if self.failed > 0 {
            ReconcileStatus::Error
        } else if self.repaired > 0 {
            ReconcileStatus::Repaired
        } else {
            ReconcileStatus::Clean
        }
    }
}

/// Runs the three repair passes.
pub struct Reconciler {
    db: Arc<Database>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(db: Arc<Database>, config: ReconcileConfig) -> Self {
        Self { db, config }
    }

    pub fn run(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        self.backfill_flush_audits(&mut report);
        self.release_stale_leases(&mut report);
        self.fail_stuck_audits(&mut report);
        info!(
            repaired = report.repaired,
            skipped = report.skipped,
            failed = report.failed,
            status = report.status().as_str(),
            dry_run = self.config.dry_run,
            "Reconciliation complete"
        );
        report
    }

    /// Pass 1: terminal outbox records with no worker/reconciler audit row.
    fn backfill_flush_audits(&self, report: &mut ReconcileReport) {
        let window_start = Utc::now() - self.config.scan_window;
        let records = match self.db.find_terminal_outbox_missing_audit(window_start) {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Scan for terminal records without audit failed");
                report.failed += 1;
                return;
            }
        };

        for record in records {
            let (status, action, reason) = match record.status {
                OutboxStatus::Sent => (AuditStatus::Success, PolicyAction::Allow, None),
                OutboxStatus::Dead => (
                    AuditStatus::Failed,
                    PolicyAction::Reject,
                    record.last_error.clone(),
                ),
                OutboxStatus::Pending => {
                    report.skipped += 1;
                    continue;
                }
            };

            if self.config.dry_run {
                info!(outbox_id = record.id, "Would backfill flush audit row");
                report.repaired += 1;
                continue;
            }

            // ack_sent stores `delivered:{result_id}`; recover it when present
            let result_id = record
                .last_error
                .as_deref()
                .and_then(|note| note.strip_prefix("delivered:"))
                .map(str::to_string);

            let audit = TerminalAuditRecord {
                correlation_id: format!("outbox-{}-{}", record.id, Uuid::new_v4()),
                actor: "reconciler".to_string(),
                target_space: record.target_space.clone(),
                action,
                reason,
                status,
                refs: AuditRefs {
                    outbox_id: Some(record.id),
                    result_id,
                    payload_sha: Some(record.payload_sha.clone()),
                    source: Some(AuditSource::Reconciler),
                    ..Default::default()
                },
            };
            match self.db.write_terminal_audit(&audit) {
                Ok(_) => {
                    info!(
                        outbox_id = record.id,
                        outbox_status = record.status.as_str(),
                        "Backfilled flush audit row"
                    );
                    report.repaired += 1;
                }
                Err(e) => {
                    error!(outbox_id = record.id, error = %e, "Failed to backfill flush audit row");
                    report.failed += 1;
                }
            }
        }
    }

    /// Pass 2: release leases held past the stale threshold.
    fn release_stale_leases(&self, report: &mut ReconcileReport) {
        let cutoff = Utc::now() - self.config.stale_lease_threshold;
        let records = match self.db.find_stale_leases(cutoff) {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Scan for stale leases failed");
                report.failed += 1;
                return;
            }
        };

        for record in records {
            // Scan rows always carry both lease fields
            let (holder, locked_at) = match (record.locked_by.clone(), record.locked_at) {
                (Some(holder), Some(locked_at)) => (holder, locked_at),
                _ => {
                    report.skipped += 1;
                    continue;
                }
            };

            if self.config.dry_run {
                info!(
                    outbox_id = record.id,
                    holder = %holder,
                    "Would release stale lease"
                );
                report.repaired += 1;
                continue;
            }

            match self.db.clear_lease(record.id, &holder, locked_at) {
                Ok(true) => {
                    warn!(
                        outbox_id = record.id,
                        holder = %holder,
                        "Released stale lease"
                    );
                    self.write_repair_audit(&record, &holder);
                    report.repaired += 1;
                }
                // Resolved, released, or reclaimed since the scan; whatever
                // lease is on the row now is not the one we observed
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    error!(outbox_id = record.id, error = %e, "Failed to release stale lease");
                    report.failed += 1;
                }
            }
        }
    }

    /// Pass 3: fail audit rows stuck in `pending`.
    fn fail_stuck_audits(&self, report: &mut ReconcileReport) {
        let cutoff = Utc::now() - self.config.pending_audit_timeout;
        let records = match self.db.find_stuck_pending_audits(cutoff) {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Scan for stuck pending audits failed");
                report.failed += 1;
                return;
            }
        };

        for record in records {
            if self.config.dry_run {
                info!(
                    audit_id = record.id,
                    correlation_id = %record.correlation_id,
                    "Would fail stuck pending audit"
                );
                report.repaired += 1;
                continue;
            }

            let mut patch = AuditRefs::default();
            patch.extra.insert(
                "reconcile_action".to_string(),
                "mark_failed_timeout".to_string(),
            );
            match self
                .db
                .finalize_audit(&record.correlation_id, AuditStatus::Failed, &patch, None)
            {
                Ok(true) => {
                    warn!(
                        audit_id = record.id,
                        correlation_id = %record.correlation_id,
                        "Failed stuck pending audit"
                    );
                    report.repaired += 1;
                }
                // Finalized by its owner since the scan
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    error!(audit_id = record.id, error = %e, "Failed to finalize stuck audit");
                    report.failed += 1;
                }
            }
        }
    }

    /// Diagnostic row recording a lease release. The outbox id goes in
    /// `extra`, not the typed `outbox_id` ref: that field marks flush
    /// outcomes, and this record has not flushed yet.
    fn write_repair_audit(&self, record: &memgate_database::OutboxRecord, holder: &str) {
        let mut refs = AuditRefs {
            payload_sha: Some(record.payload_sha.clone()),
            source: Some(AuditSource::Reconciler),
            ..Default::default()
        };
        refs.extra
            .insert("reconcile_action".to_string(), "release_stale_lease".to_string());
        refs.extra
            .insert("outbox_id".to_string(), record.id.to_string());
        refs.extra
            .insert("stale_holder".to_string(), holder.to_string());

        let audit = TerminalAuditRecord {
            correlation_id: format!("outbox-{}-{}", record.id, Uuid::new_v4()),
            actor: "reconciler".to_string(),
            target_space: record.target_space.clone(),
            action: PolicyAction::Allow,
            reason: Some(format!("released stale lease held by {holder}")),
            status: AuditStatus::Success,
            refs,
        };
        if let Err(e) = self.db.write_terminal_audit(&audit) {
            warn!(outbox_id = record.id, error = %e, "Failed to write lease-release audit row");
        }
    }
}

/// Open the database and run one reconciliation.
pub fn run_reconcile(db_path: &std::path::Path, config: ReconcileConfig) -> OutboxResult<ReconcileReport> {
    let db = Arc::new(Database::open(db_path)?);
    let reconciler = Reconciler::new(db, config);
    Ok(reconciler.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::SecondsFormat;
    use memgate_database::{NewAuditRecord, NewOutboxRecord};

    fn test_config() -> ReconcileConfig {
        ReconcileConfig {
            scan_window: Duration::hours(24),
            stale_lease_threshold: Duration::minutes(30),
            pending_audit_timeout: Duration::minutes(15),
            dry_run: false,
        }
    }

    fn enqueue(db: &Database, n: u32) -> i64 {
        db.enqueue_outbox(&NewOutboxRecord {
            payload: format!("{{\"note\":\"remember {n}\"}}"),
            target_space: "team/general".to_string(),
            payload_sha: format!("sha-{n}"),
        })
        .unwrap()
    }

    fn backdate_column(db: &Database, table: &str, column: &str, id: i64, minutes: i64) {
        let past = (Utc::now() - Duration::minutes(minutes))
            .to_rfc3339_opts(SecondsFormat::Micros, false);
        db.connection()
            .unwrap()
            .execute(
                &format!("UPDATE {table} SET {column} = ?2 WHERE id = ?1"),
                (id, past),
            )
            .unwrap();
    }

    #[test]
    fn test_backfills_missing_flush_audit_for_sent_record() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let id = enqueue(&db, 1);
        db.claim_outbox("worker-a", 1, Duration::minutes(5)).unwrap();
        db.ack_sent(id, "worker-a", "mem_1").unwrap();

        let reconciler = Reconciler::new(db.clone(), test_config());
        let report = reconciler.run();
        assert_eq!(report.repaired, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.status(), ReconcileStatus::Repaired);

        let audits = db.list_audit_for_outbox(id).unwrap();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].status, AuditStatus::Success);
        assert_eq!(audits[0].actor, "reconciler");
        assert_eq!(audits[0].refs.result_id.as_deref(), Some("mem_1"));

        // The outbox row itself was not modified
        let record = db.get_outbox_record(id).unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Sent);
        assert_eq!(record.last_error.as_deref(), Some("delivered:mem_1"));
    }

    #[test]
    fn test_backfills_failed_audit_for_dead_record() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let id = enqueue(&db, 1);
        db.claim_outbox("worker-a", 1, Duration::minutes(5)).unwrap();
        db.mark_dead(id, "worker-a", "http 400: malformed").unwrap();

        let report = Reconciler::new(db.clone(), test_config()).run();
        assert_eq!(report.repaired, 1);

        let audits = db.list_audit_for_outbox(id).unwrap();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].status, AuditStatus::Failed);
        assert_eq!(audits[0].action, PolicyAction::Reject);
        assert_eq!(audits[0].reason.as_deref(), Some("http 400: malformed"));
        assert!(audits[0].refs.result_id.is_none());
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let id = enqueue(&db, 1);
        db.claim_outbox("worker-a", 1, Duration::minutes(5)).unwrap();
        db.ack_sent(id, "worker-a", "mem_1").unwrap();

        let reconciler = Reconciler::new(db.clone(), test_config());
        assert_eq!(reconciler.run().repaired, 1);

        let second = reconciler.run();
        assert_eq!(second.repaired, 0);
        assert_eq!(second.failed, 0);
        assert_eq!(second.status(), ReconcileStatus::Clean);
        assert_eq!(db.list_audit_for_outbox(id).unwrap().len(), 1);
    }

    #[test]
    fn test_releases_stale_lease_and_keeps_record_pending() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let id = enqueue(&db, 1);
        db.claim_outbox("worker-a", 1, Duration::minutes(5)).unwrap();
        backdate_column(&db, "memory_write_outbox", "locked_at", id, 120);

        let report = Reconciler::new(db.clone(), test_config()).run();
        assert_eq!(report.repaired, 1);

        let record = db.get_outbox_record(id).unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Pending);
        assert!(record.locked_by.is_none());
        assert!(record.locked_at.is_none());
        assert_eq!(record.retry_count, 0);
    }

    #[test]
    fn test_lease_release_audit_does_not_shadow_flush_backfill() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let id = enqueue(&db, 1);
        db.claim_outbox("worker-a", 1, Duration::minutes(5)).unwrap();
        backdate_column(&db, "memory_write_outbox", "locked_at", id, 120);

        let reconciler = Reconciler::new(db.clone(), test_config());
        assert_eq!(reconciler.run().repaired, 1);

        // The record later resolves without a worker audit row; the backfill
        // pass must still see it despite the earlier diagnostic row.
        db.claim_outbox("worker-b", 1, Duration::minutes(5)).unwrap();
        db.ack_sent(id, "worker-b", "mem_1").unwrap();

        let report = reconciler.run();
        assert_eq!(report.repaired, 1);
        let audits = db.list_audit_for_outbox(id).unwrap();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].refs.source, Some(AuditSource::Reconciler));
    }

    #[test]
    fn test_fails_stuck_pending_audit() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let audit_id = db
            .write_pending_audit(&NewAuditRecord {
                correlation_id: "corr-1".to_string(),
                actor: "agent-7".to_string(),
                target_space: "team/general".to_string(),
                action: PolicyAction::Allow,
                reason: None,
                refs: AuditRefs::default(),
            })
            .unwrap();
        backdate_column(&db, "memory_write_audit", "created_at", audit_id, 60);

        let reconciler = Reconciler::new(db.clone(), test_config());
        let report = reconciler.run();
        assert_eq!(report.repaired, 1);

        let audit = db.get_audit_record(audit_id).unwrap().unwrap();
        assert_eq!(audit.status, AuditStatus::Failed);
        assert_eq!(
            audit.refs.extra.get("reconcile_action").map(String::as_str),
            Some("mark_failed_timeout")
        );

        // Second run finds nothing pending
        assert_eq!(reconciler.run().status(), ReconcileStatus::Clean);
    }

    #[test]
    fn test_second_run_over_all_three_classes_is_clean() {
        let db = Arc::new(Database::open_in_memory().unwrap());

        // Terminal without audit
        let sent = enqueue(&db, 1);
        db.claim_outbox("worker-a", 1, Duration::minutes(5)).unwrap();
        db.ack_sent(sent, "worker-a", "mem_1").unwrap();

        // Stale lease
        let stale = enqueue(&db, 2);
        db.claim_outbox("worker-a", 1, Duration::minutes(5)).unwrap();
        backdate_column(&db, "memory_write_outbox", "locked_at", stale, 120);

        // Stuck pending audit
        let stuck = db
            .write_pending_audit(&NewAuditRecord {
                correlation_id: "corr-stuck".to_string(),
                actor: "agent-7".to_string(),
                target_space: "team/general".to_string(),
                action: PolicyAction::Allow,
                reason: None,
                refs: AuditRefs::default(),
            })
            .unwrap();
        backdate_column(&db, "memory_write_audit", "created_at", stuck, 60);

        let reconciler = Reconciler::new(db.clone(), test_config());
        let first = reconciler.run();
        assert_eq!(first.repaired, 3);
        assert_eq!(first.failed, 0);

        let second = reconciler.run();
        assert_eq!(second.repaired, 0);
        assert_eq!(second.failed, 0);
        assert_eq!(second.status(), ReconcileStatus::Clean);

        // Terminal state never flipped
        assert_eq!(
            db.get_outbox_record(sent).unwrap().unwrap().status,
            OutboxStatus::Sent
        );
        assert_eq!(
            db.get_outbox_record(stale).unwrap().unwrap().status,
            OutboxStatus::Pending
        );
    }

    #[test]
    fn test_fresh_pending_audit_is_left_alone() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.write_pending_audit(&NewAuditRecord {
            correlation_id: "corr-1".to_string(),
            actor: "agent-7".to_string(),
            target_space: "team/general".to_string(),
            action: PolicyAction::Allow,
            reason: None,
            refs: AuditRefs::default(),
        })
        .unwrap();

        let report = Reconciler::new(db.clone(), test_config()).run();
        assert_eq!(report.status(), ReconcileStatus::Clean);
        let audit = db.get_audit_by_correlation("corr-1").unwrap().unwrap();
        assert_eq!(audit.status, AuditStatus::Pending);
    }

    #[test]
    fn test_dry_run_reports_without_writing() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let sent = enqueue(&db, 1);
        db.claim_outbox("worker-a", 1, Duration::minutes(5)).unwrap();
        db.ack_sent(sent, "worker-a", "mem_1").unwrap();

        let stale = enqueue(&db, 2);
        db.claim_outbox("worker-a", 1, Duration::minutes(5)).unwrap();
        backdate_column(&db, "memory_write_outbox", "locked_at", stale, 120);

        let mut config = test_config();
        config.dry_run = true;
        let report = Reconciler::new(db.clone(), config).run();
        assert_eq!(report.repaired, 2);
        assert_eq!(report.status(), ReconcileStatus::Repaired);

        // Nothing actually changed
        assert!(db.list_audit_for_outbox(sent).unwrap().is_empty());
        let record = db.get_outbox_record(stale).unwrap().unwrap();
        assert_eq!(record.locked_by.as_deref(), Some("worker-a"));
    }
}
