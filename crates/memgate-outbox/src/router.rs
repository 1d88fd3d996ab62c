//! Policy-gated write entry point.
//!
//! The router applies the decision table: rejects become single-phase audit
//! rows, allowed and redirected writes open a pending audit row, attempt an
//! inline delivery, and finalize the row according to the outcome. A
//! retryable failure defers the write to the outbox instead of failing it.

use crate::delivery::{DeliveryClient, DeliveryRequest};
use crate::error::OutboxResult;
use memgate_database::{
    AuditRefs, AuditSource, AuditStatus, Database, NewAuditRecord, NewOutboxRecord,
    PolicyAction, TerminalAuditRecord,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The policy engine's verdict for one write request.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    pub reason: Option<String>,
    /// Replacement target space, set only for `redirect`.
    pub redirect_space: Option<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            action: PolicyAction::Allow,
            reason: None,
            redirect_space: None,
        }
    }

    pub fn redirect(space: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action: PolicyAction::Redirect,
            reason: Some(reason.into()),
            redirect_space: Some(space.into()),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            action: PolicyAction::Reject,
            reason: Some(reason.into()),
            redirect_space: None,
        }
    }
}

/// One incoming write request.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub correlation_id: String,
    pub actor: String,
    pub target_space: String,
    pub payload: String,
}

/// How the router resolved a request.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Policy refused the write; the audit row is the entire effect.
    Rejected { audit_id: i64 },
    /// Delivered inline.
    Written { audit_id: i64, result_id: String },
    /// Deferred to the outbox after a retryable delivery failure.
    Deferred { audit_id: i64, outbox_id: i64 },
    /// Permanent delivery failure; nothing was enqueued.
    Failed { audit_id: i64, error: String },
}

/// Hex SHA-256 of a payload, used for dedup and audit references.
pub fn content_sha(payload: &str) -> String {
    let digest = Sha256::digest(payload.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Applies policy decisions to write requests.
pub struct Router<D: DeliveryClient> {
    db: Arc<Database>,
    delivery: D,
}

impl<D: DeliveryClient> Router<D> {
    pub fn new(db: Arc<Database>, delivery: D) -> Self {
        Self { db, delivery }
    }

    pub async fn handle(
        &self,
        request: &WriteRequest,
        decision: &PolicyDecision,
    ) -> OutboxResult<WriteOutcome> {
        let payload_sha = content_sha(&request.payload);

        if decision.action == PolicyAction::Reject {
            let audit_id = self.db.write_terminal_audit(&TerminalAuditRecord {
                correlation_id: request.correlation_id.clone(),
                actor: request.actor.clone(),
                target_space: request.target_space.clone(),
                action: PolicyAction::Reject,
                reason: decision.reason.clone(),
                status: AuditStatus::Success,
                refs: AuditRefs {
                    payload_sha: Some(payload_sha),
                    source: Some(AuditSource::Router),
                    ..Default::default()
                },
            })?;
            info!(
                correlation_id = %request.correlation_id,
                actor = %request.actor,
                target_space = %request.target_space,
                "Write rejected by policy"
            );
            return Ok(WriteOutcome::Rejected { audit_id });
        }

        // Fail closed: no downstream side effect unless the pending audit
        // row committed first.
        let audit_id = self.db.write_pending_audit(&NewAuditRecord {
            correlation_id: request.correlation_id.clone(),
            actor: request.actor.clone(),
            target_space: request.target_space.clone(),
            action: decision.action,
            reason: decision.reason.clone(),
            refs: AuditRefs {
                payload_sha: Some(payload_sha.clone()),
                source: Some(AuditSource::Router),
                ..Default::default()
            },
        })?;

        let effective_space = decision
            .redirect_space
            .clone()
            .unwrap_or_else(|| request.target_space.clone());

        let delivery_request = DeliveryRequest {
            target_space: effective_space.clone(),
            payload: request.payload.clone(),
            payload_sha: payload_sha.clone(),
        };

        match self.delivery.deliver(&delivery_request).await {
            Ok(result_id) => {
                let patch = AuditRefs {
                    result_id: Some(result_id.clone()),
                    ..Default::default()
                };
                self.db
                    .finalize_audit(&request.correlation_id, AuditStatus::Success, &patch, None)?;
                debug!(
                    correlation_id = %request.correlation_id,
                    result_id = %result_id,
                    "Write delivered inline"
                );
                Ok(WriteOutcome::Written { audit_id, result_id })
            }
            Err(failure) if failure.retryable => {
                let outbox_id = self.db.enqueue_outbox(&NewOutboxRecord {
                    payload: request.payload.clone(),
                    target_space: effective_space,
                    payload_sha,
                })?;
                let patch = AuditRefs {
                    outbox_id: Some(outbox_id),
                    ..Default::default()
                };
                self.db.finalize_audit(
                    &request.correlation_id,
                    AuditStatus::Redirected,
                    &patch,
                    Some(decision.action),
                )?;
                info!(
                    correlation_id = %request.correlation_id,
                    outbox_id,
                    error = %failure,
                    "Write deferred to outbox"
                );
                Ok(WriteOutcome::Deferred { audit_id, outbox_id })
            }
            Err(failure) => {
                let mut patch = AuditRefs::default();
                patch
                    .extra
                    .insert("error".to_string(), failure.to_string());
                self.db
                    .finalize_audit(&request.correlation_id, AuditStatus::Failed, &patch, None)?;
                warn!(
                    correlation_id = %request.correlation_id,
                    error = %failure,
                    "Write failed permanently"
                );
                Ok(WriteOutcome::Failed {
                    audit_id,
                    error: failure.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliveryFailure;
    use crate::testing::MockDelivery;
    use memgate_database::OutboxStatus;

    fn request(correlation_id: &str) -> WriteRequest {
        WriteRequest {
            correlation_id: correlation_id.to_string(),
            actor: "agent-7".to_string(),
            target_space: "team/general".to_string(),
            payload: "{\"note\":\"ship it\"}".to_string(),
        }
    }

    #[test]
    fn test_content_sha_is_stable_hex() {
        let sha = content_sha("hello");
        assert_eq!(sha.len(), 64);
        assert_eq!(sha, content_sha("hello"));
        assert_ne!(sha, content_sha("hello!"));
    }

    #[tokio::test]
    async fn test_reject_writes_single_phase_audit_only() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let delivery = Arc::new(MockDelivery::new(vec![]));
        let router = Router::new(db.clone(), delivery.clone());

        let outcome = router
            .handle(&request("corr-1"), &PolicyDecision::reject("pii detected"))
            .await
            .unwrap();

        let audit_id = match outcome {
            WriteOutcome::Rejected { audit_id } => audit_id,
            other => panic!("expected Rejected, got {other:?}"),
        };
        assert_eq!(delivery.call_count(), 0);
        assert_eq!(db.count_outbox_by_status(OutboxStatus::Pending).unwrap(), 0);

        let audit = db.get_audit_record(audit_id).unwrap().unwrap();
        assert_eq!(audit.action, PolicyAction::Reject);
        assert_eq!(audit.status, AuditStatus::Success);
        assert_eq!(audit.reason.as_deref(), Some("pii detected"));
        assert!(audit.finalized_at.is_some());
    }

    #[tokio::test]
    async fn test_pending_audit_failure_aborts_before_delivery() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let delivery = Arc::new(MockDelivery::new(vec![Ok("mem_1".to_string())]));
        let router = Router::new(db.clone(), delivery.clone());

        // Make the pending audit insert fail
        db.connection()
            .unwrap()
            .execute("DROP TABLE memory_write_audit", [])
            .unwrap();

        let result = router
            .handle(&request("corr-1"), &PolicyDecision::allow())
            .await;
        assert!(result.is_err());

        // No downstream call and nothing enqueued
        assert_eq!(delivery.call_count(), 0);
        assert_eq!(db.count_outbox_by_status(OutboxStatus::Pending).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_allow_with_success_finalizes_success() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let delivery = Arc::new(MockDelivery::new(vec![Ok("mem_1".to_string())]));
        let router = Router::new(db.clone(), delivery.clone());

        let outcome = router
            .handle(&request("corr-1"), &PolicyDecision::allow())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            WriteOutcome::Written { ref result_id, .. } if result_id == "mem_1"
        ));
        assert_eq!(delivery.call_count(), 1);

        let audit = db.get_audit_by_correlation("corr-1").unwrap().unwrap();
        assert_eq!(audit.status, AuditStatus::Success);
        assert_eq!(audit.refs.result_id.as_deref(), Some("mem_1"));
        // Pending-phase refs survive the finalize merge
        assert!(audit.refs.payload_sha.is_some());
        assert!(audit.intended_action.is_none());
    }

    #[tokio::test]
    async fn test_redirect_delivers_to_replacement_space() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let delivery = Arc::new(MockDelivery::new(vec![Ok("mem_1".to_string())]));
        let router = Router::new(db.clone(), delivery.clone());

        router
            .handle(
                &request("corr-1"),
                &PolicyDecision::redirect("team/quarantine", "sensitive content"),
            )
            .await
            .unwrap();

        let calls = delivery.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].target_space, "team/quarantine");
        drop(calls);

        let audit = db.get_audit_by_correlation("corr-1").unwrap().unwrap();
        assert_eq!(audit.action, PolicyAction::Redirect);
        // The audit row keeps the requested space
        assert_eq!(audit.target_space, "team/general");
    }

    #[tokio::test]
    async fn test_retryable_failure_defers_to_outbox() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let delivery = Arc::new(MockDelivery::new(vec![Err(DeliveryFailure::from_status(
            503, "busy",
        ))]));
        let router = Router::new(db.clone(), delivery);

        let outcome = router
            .handle(&request("corr-1"), &PolicyDecision::allow())
            .await
            .unwrap();

        let outbox_id = match outcome {
            WriteOutcome::Deferred { outbox_id, .. } => outbox_id,
            other => panic!("expected Deferred, got {other:?}"),
        };

        let record = db.get_outbox_record(outbox_id).unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.payload, "{\"note\":\"ship it\"}");
        assert_eq!(record.payload_sha, content_sha("{\"note\":\"ship it\"}"));

        let audit = db.get_audit_by_correlation("corr-1").unwrap().unwrap();
        assert_eq!(audit.status, AuditStatus::Redirected);
        assert_eq!(audit.refs.outbox_id, Some(outbox_id));
        assert_eq!(audit.intended_action, Some(PolicyAction::Allow));
    }

    #[tokio::test]
    async fn test_permanent_failure_finalizes_failed_without_enqueue() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let delivery = Arc::new(MockDelivery::new(vec![Err(DeliveryFailure::from_status(
            400, "malformed",
        ))]));
        let router = Router::new(db.clone(), delivery);

        let outcome = router
            .handle(&request("corr-1"), &PolicyDecision::allow())
            .await
            .unwrap();

        assert!(matches!(outcome, WriteOutcome::Failed { .. }));
        assert_eq!(db.count_outbox_by_status(OutboxStatus::Pending).unwrap(), 0);

        let audit = db.get_audit_by_correlation("corr-1").unwrap().unwrap();
        assert_eq!(audit.status, AuditStatus::Failed);
        assert_eq!(
            audit.refs.extra.get("error").map(String::as_str),
            Some("http 400: malformed")
        );
    }

    #[tokio::test]
    async fn test_deferred_write_is_delivered_by_worker() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let router_delivery = Arc::new(MockDelivery::new(vec![Err(
            DeliveryFailure::retryable("connection refused"),
        )]));
        let router = Router::new(db.clone(), router_delivery);

        let outcome = router
            .handle(&request("corr-1"), &PolicyDecision::allow())
            .await
            .unwrap();
        let outbox_id = match outcome {
            WriteOutcome::Deferred { outbox_id, .. } => outbox_id,
            other => panic!("expected Deferred, got {other:?}"),
        };

        let worker_delivery = Arc::new(MockDelivery::new(vec![Ok("mem_1".to_string())]));
        let worker = crate::worker::OutboxWorker::with_worker_id(
            "worker-a".to_string(),
            db.clone(),
            worker_delivery,
            crate::worker::WorkerConfig::default(),
        );
        assert_eq!(worker.run_once().await.unwrap(), 1);

        let record = db.get_outbox_record(outbox_id).unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Sent);

        // The redirected router row plus exactly one worker flush row
        let audits = db.list_audit_for_outbox(outbox_id).unwrap();
        assert_eq!(audits.len(), 2);
        assert_eq!(audits[0].status, AuditStatus::Redirected);
        assert_eq!(audits[1].status, AuditStatus::Success);
        assert_eq!(audits[1].actor, "worker-a");
    }
}
