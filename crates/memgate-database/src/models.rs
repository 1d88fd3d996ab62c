//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outbox record - one durable write intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: i64,
    /// Opaque content blob (JSON text).
    pub payload: String,
    pub target_space: String,
    pub payload_sha: String,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub next_attempt_at: DateTime<Utc>,
    /// Last failure or success note.
    pub last_error: Option<String>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outbox status. `Sent` and `Dead` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Dead,
}

impl Default for OutboxStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Dead => "dead",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "sent" => Self::Sent,
            "dead" => Self::Dead,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Dead)
    }
}

/// Fields for inserting a new outbox record.
#[derive(Debug, Clone)]
pub struct NewOutboxRecord {
    pub payload: String,
    pub target_space: String,
    pub payload_sha: String,
}

/// Audit record - one row per write decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub correlation_id: String,
    pub actor: String,
    pub target_space: String,
    pub action: PolicyAction,
    pub reason: Option<String>,
    /// Original policy action, set only when the write was deferred to the outbox.
    pub intended_action: Option<PolicyAction>,
    pub status: AuditStatus,
    pub refs: AuditRefs,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

/// Audit status. `Pending` is the only non-terminal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Pending,
    Success,
    Redirected,
    Failed,
}

impl Default for AuditStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Redirected => "redirected",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "success" => Self::Success,
            "redirected" => Self::Redirected,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Policy decision action for a write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Allow,
    Redirect,
    Reject,
}

impl Default for PolicyAction {
    fn default() -> Self {
        // Fail closed
        Self::Reject
    }
}

impl PolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Redirect => "redirect",
            Self::Reject => "reject",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "allow" => Self::Allow,
            "redirect" => Self::Redirect,
            _ => Self::Reject,
        }
    }
}

/// Which component authored an audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSource {
    Router,
    Worker,
    Reconciler,
}

impl AuditSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Router => "router",
            Self::Worker => "worker",
            Self::Reconciler => "reconciler",
        }
    }
}

/// Structured references attached to an audit row, stored as JSON.
///
/// Known fields are typed; `extra` carries free-form diagnostics. Merging a
/// patch overwrites only the fields the patch sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditRefs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbox_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<AuditSource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl AuditRefs {
    /// Merge a patch into these refs. Patch fields overwrite same-named
    /// fields; everything else is preserved.
    pub fn merge(&mut self, patch: &AuditRefs) {
        if patch.outbox_id.is_some() {
            self.outbox_id = patch.outbox_id;
        }
        if patch.result_id.is_some() {
            self.result_id = patch.result_id.clone();
        }
        if patch.payload_sha.is_some() {
            self.payload_sha = patch.payload_sha.clone();
        }
        if patch.source.is_some() {
            self.source = patch.source;
        }
        for (key, value) in &patch.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }
}

/// Fields for opening a pending audit row.
#[derive(Debug, Clone)]
pub struct NewAuditRecord {
    pub correlation_id: String,
    pub actor: String,
    pub target_space: String,
    pub action: PolicyAction,
    pub reason: Option<String>,
    pub refs: AuditRefs,
}

/// Fields for a single-phase audit row written directly at a terminal status.
#[derive(Debug, Clone)]
pub struct TerminalAuditRecord {
    pub correlation_id: String,
    pub actor: String,
    pub target_space: String,
    pub action: PolicyAction,
    pub reason: Option<String>,
    pub status: AuditStatus,
    pub refs: AuditRefs,
}
