//! Database connection and query operations.

use crate::{
    migrations, AuditRecord, AuditRefs, AuditStatus, DatabaseError, DatabaseResult,
    NewAuditRecord, NewOutboxRecord, OutboxRecord, OutboxStatus, PolicyAction,
    TerminalAuditRecord,
};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

const OUTBOX_COLUMNS: &str = "id, payload, target_space, payload_sha, status, retry_count, \
     next_attempt_at, last_error, locked_by, locked_at, created_at, updated_at";

const AUDIT_COLUMNS: &str = "id, correlation_id, actor, target_space, action, reason, \
     intended_action, status, refs, created_at, finalized_at";

/// Database wrapper with query methods.
///
/// The connection sits behind a mutex so workers can share one handle across
/// tasks; every mutation additionally carries its own ownership predicate, so
/// correctness does not depend on the mutex (other processes on the same file
/// are equally safe).
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open a database at the given path, running migrations if needed.
    pub fn open(path: &Path) -> DatabaseResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode and performance optimizations
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        // Run migrations
        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database for testing.
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        // Note: WAL mode doesn't apply to in-memory databases
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
        ",
        )?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock and return the underlying connection.
    pub fn connection(&self) -> DatabaseResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| DatabaseError::Connection("connection mutex poisoned".to_string()))
    }

    // ==========================================
    // Outbox
    // ==========================================

    /// Insert a new outbox record, immediately eligible for delivery.
    pub fn enqueue_outbox(&self, record: &NewOutboxRecord) -> DatabaseResult<i64> {
        let conn = self.connection()?;
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO memory_write_outbox
                (payload, target_space, payload_sha, status, retry_count, next_attempt_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4, ?4)",
            params![record.payload, record.target_space, record.payload_sha, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!(outbox_id = id, target_space = %record.target_space, "Outbox record enqueued");
        Ok(id)
    }

    /// Get an outbox record by ID.
    pub fn get_outbox_record(&self, id: i64) -> DatabaseResult<Option<OutboxRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM memory_write_outbox WHERE id = ?1"
        ))?;

        let result = stmt.query_row(params![id], outbox_from_row);

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Find the most recent delivered record for the same target space and
    /// payload hash, if any. Used to skip redundant downstream calls.
    pub fn find_delivered_duplicate(
        &self,
        target_space: &str,
        payload_sha: &str,
    ) -> DatabaseResult<Option<OutboxRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM memory_write_outbox
             WHERE target_space = ?1 AND payload_sha = ?2 AND status = 'sent'
             ORDER BY updated_at DESC LIMIT 1"
        ))?;

        let result = stmt.query_row(params![target_space, payload_sha], outbox_from_row);

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically claim up to `limit` due outbox records for a worker.
    ///
    /// Eligible rows are pending, due, and either unleased or holding a lease
    /// older than `lease_duration`. The single conditional UPDATE stamps the
    /// lease, so concurrent claimers partition the eligible set: a row goes
    /// to exactly one of them.
    pub fn claim_outbox(
        &self,
        worker_id: &str,
        limit: usize,
        lease_duration: Duration,
    ) -> DatabaseResult<Vec<OutboxRecord>> {
        let conn = self.connection()?;
        let now = Utc::now();
        let now_s = format_datetime(now);
        let reclaim_cutoff = format_datetime(now - lease_duration);

        let claimed = conn.execute(
            "UPDATE memory_write_outbox
             SET locked_by = ?1, locked_at = ?2, updated_at = ?2
             WHERE id IN (
                 SELECT id FROM memory_write_outbox
                 WHERE status = 'pending'
                   AND next_attempt_at <= ?2
                   AND (locked_at IS NULL OR locked_at <= ?3)
                 ORDER BY next_attempt_at ASC
                 LIMIT ?4
             )",
            params![worker_id, now_s, reclaim_cutoff, limit as i64],
        )?;

        if claimed == 0 {
            return Ok(Vec::new());
        }
        debug!(worker_id = %worker_id, claimed, "Claimed outbox batch");

        let mut stmt = conn.prepare(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM memory_write_outbox
             WHERE locked_by = ?1 AND locked_at = ?2
             ORDER BY next_attempt_at ASC"
        ))?;
        let records = stmt
            .query_map(params![worker_id, now_s], outbox_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Mark a claimed record as delivered. Returns false if the caller no
    /// longer holds the lease or the record already reached a terminal state.
    pub fn ack_sent(&self, id: i64, worker_id: &str, result_id: &str) -> DatabaseResult<bool> {
        let conn = self.connection()?;
        let updated = conn.execute(
            "UPDATE memory_write_outbox
             SET status = 'sent', last_error = ?3, locked_by = NULL, locked_at = NULL, updated_at = ?4
             WHERE id = ?1 AND status = 'pending' AND locked_by = ?2",
            params![id, worker_id, format!("delivered:{result_id}"), now_rfc3339()],
        )?;
        Ok(updated > 0)
    }

    /// Record a retryable failure: bump the retry count, schedule the next
    /// attempt, release the lease. Returns false on a lost lease.
    pub fn fail_retry(
        &self,
        id: i64,
        worker_id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> DatabaseResult<bool> {
        let conn = self.connection()?;
        let updated = conn.execute(
            "UPDATE memory_write_outbox
             SET retry_count = retry_count + 1, next_attempt_at = ?3, last_error = ?4,
                 locked_by = NULL, locked_at = NULL, updated_at = ?5
             WHERE id = ?1 AND status = 'pending' AND locked_by = ?2",
            params![id, worker_id, format_datetime(next_attempt_at), error, now_rfc3339()],
        )?;
        Ok(updated > 0)
    }

    /// Mark a claimed record as permanently failed. Returns false on a lost
    /// lease or an already-terminal record.
    pub fn mark_dead(&self, id: i64, worker_id: &str, error: &str) -> DatabaseResult<bool> {
        let conn = self.connection()?;
        let updated = conn.execute(
            "UPDATE memory_write_outbox
             SET status = 'dead', last_error = ?3, locked_by = NULL, locked_at = NULL, updated_at = ?4
             WHERE id = ?1 AND status = 'pending' AND locked_by = ?2",
            params![id, worker_id, error, now_rfc3339()],
        )?;
        Ok(updated > 0)
    }

    /// Extend a held lease. Returns false if the lease was lost; the caller
    /// must stop processing the record.
    pub fn renew_lease(&self, id: i64, worker_id: &str) -> DatabaseResult<bool> {
        let conn = self.connection()?;
        let now = now_rfc3339();
        let updated = conn.execute(
            "UPDATE memory_write_outbox
             SET locked_at = ?3, updated_at = ?3
             WHERE id = ?1 AND status = 'pending' AND locked_by = ?2",
            params![id, worker_id, now],
        )?;
        Ok(updated > 0)
    }

    /// Clear the lease a stale-lease scan observed, without touching the
    /// record's status or retry schedule. Reconciler-only. The guard matches
    /// the scanned holder and timestamp, so a lease reclaimed since the scan
    /// is left intact and the call returns false.
    pub fn clear_lease(
        &self,
        id: i64,
        locked_by: &str,
        locked_at: DateTime<Utc>,
    ) -> DatabaseResult<bool> {
        let conn = self.connection()?;
        let updated = conn.execute(
            "UPDATE memory_write_outbox
             SET locked_by = NULL, locked_at = NULL, updated_at = ?4
             WHERE id = ?1 AND status = 'pending' AND locked_by = ?2 AND locked_at = ?3",
            params![id, locked_by, format_datetime(locked_at), now_rfc3339()],
        )?;
        Ok(updated > 0)
    }

    /// Count outbox records in a given status.
    pub fn count_outbox_by_status(&self, status: OutboxStatus) -> DatabaseResult<i64> {
        let conn = self.connection()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM memory_write_outbox WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ==========================================
    // Audit
    // ==========================================

    /// Open a pending audit row. Must succeed before any downstream side
    /// effect is attempted for the request it covers.
    pub fn write_pending_audit(&self, record: &NewAuditRecord) -> DatabaseResult<i64> {
        let conn = self.connection()?;
        let refs = serde_json::to_string(&record.refs)?;
        conn.execute(
            "INSERT INTO memory_write_audit
                (correlation_id, actor, target_space, action, reason, status, refs, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7)",
            params![
                record.correlation_id,
                record.actor,
                record.target_space,
                record.action.as_str(),
                record.reason,
                refs,
                now_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert a single-phase audit row directly at a terminal status.
    pub fn write_terminal_audit(&self, record: &TerminalAuditRecord) -> DatabaseResult<i64> {
        if !record.status.is_terminal() {
            return Err(DatabaseError::InvalidData(format!(
                "terminal audit row cannot have status '{}'",
                record.status.as_str()
            )));
        }
        let conn = self.connection()?;
        let refs = serde_json::to_string(&record.refs)?;
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO memory_write_audit
                (correlation_id, actor, target_space, action, reason, status, refs, created_at, finalized_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                record.correlation_id,
                record.actor,
                record.target_space,
                record.action.as_str(),
                record.reason,
                record.status.as_str(),
                refs,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Finalize the pending audit row for a correlation ID, merging
    /// `refs_patch` into the stored refs without dropping existing keys.
    ///
    /// Returns false when no pending row matches; since finalizing removes
    /// the row from the match set, at most one finalize per correlation ID
    /// can ever succeed.
    pub fn finalize_audit(
        &self,
        correlation_id: &str,
        status: AuditStatus,
        refs_patch: &AuditRefs,
        intended_action: Option<PolicyAction>,
    ) -> DatabaseResult<bool> {
        if !status.is_terminal() {
            return Err(DatabaseError::InvalidData(format!(
                "cannot finalize audit to non-terminal status '{}'",
                status.as_str()
            )));
        }

        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        let existing = tx.query_row(
            "SELECT id, refs FROM memory_write_audit
             WHERE correlation_id = ?1 AND status = 'pending'",
            params![correlation_id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        );
        let (id, refs_json) = match existing {
            Ok(pair) => pair,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let mut refs: AuditRefs = serde_json::from_str(&refs_json).unwrap_or_default();
        refs.merge(refs_patch);

        let updated = tx.execute(
            "UPDATE memory_write_audit
             SET status = ?2, refs = ?3,
                 intended_action = COALESCE(?4, intended_action),
                 finalized_at = ?5
             WHERE id = ?1 AND status = 'pending'",
            params![
                id,
                status.as_str(),
                serde_json::to_string(&refs)?,
                intended_action.map(|a| a.as_str()),
                now_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(updated > 0)
    }

    /// Get an audit record by ID.
    pub fn get_audit_record(&self, id: i64) -> DatabaseResult<Option<AuditRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM memory_write_audit WHERE id = ?1"
        ))?;

        let result = stmt.query_row(params![id], audit_from_row);

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Get the latest audit record for a correlation ID.
    pub fn get_audit_by_correlation(
        &self,
        correlation_id: &str,
    ) -> DatabaseResult<Option<AuditRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM memory_write_audit
             WHERE correlation_id = ?1 ORDER BY id DESC LIMIT 1"
        ))?;

        let result = stmt.query_row(params![correlation_id], audit_from_row);

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List audit rows referencing an outbox record via `refs.outbox_id`.
    pub fn list_audit_for_outbox(&self, outbox_id: i64) -> DatabaseResult<Vec<AuditRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM memory_write_audit
             WHERE CAST(json_extract(refs, '$.outbox_id') AS INTEGER) = ?1
             ORDER BY id ASC"
        ))?;
        let records = stmt
            .query_map(params![outbox_id], audit_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    // ==========================================
    // Reconciliation scans
    // ==========================================

    /// Terminal outbox records (within the scan window) that have no
    /// worker- or reconciler-authored audit row referencing them.
    pub fn find_terminal_outbox_missing_audit(
        &self,
        window_start: DateTime<Utc>,
    ) -> DatabaseResult<Vec<OutboxRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM memory_write_outbox o
             WHERE o.status IN ('sent', 'dead')
               AND o.updated_at >= ?1
               AND NOT EXISTS (
                   SELECT 1 FROM memory_write_audit a
                   WHERE CAST(json_extract(a.refs, '$.outbox_id') AS INTEGER) = o.id
                     AND json_extract(a.refs, '$.source') IN ('worker', 'reconciler')
               )
             ORDER BY o.id ASC"
        ))?;
        let records = stmt
            .query_map(params![format_datetime(window_start)], outbox_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Pending records whose lease has been held since before `cutoff`.
    pub fn find_stale_leases(&self, cutoff: DateTime<Utc>) -> DatabaseResult<Vec<OutboxRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM memory_write_outbox
             WHERE status = 'pending' AND locked_at IS NOT NULL AND locked_at <= ?1
             ORDER BY locked_at ASC"
        ))?;
        let records = stmt
            .query_map(params![format_datetime(cutoff)], outbox_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Pending audit rows opened before `cutoff` that were never finalized.
    pub fn find_stuck_pending_audits(
        &self,
        cutoff: DateTime<Utc>,
    ) -> DatabaseResult<Vec<AuditRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM memory_write_audit
             WHERE status = 'pending' AND created_at <= ?1
             ORDER BY created_at ASC"
        ))?;
        let records = stmt
            .query_map(params![format_datetime(cutoff)], audit_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

fn outbox_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxRecord> {
    Ok(OutboxRecord {
        id: row.get(0)?,
        payload: row.get(1)?,
        target_space: row.get(2)?,
        payload_sha: row.get(3)?,
        status: OutboxStatus::from_str(&row.get::<_, String>(4)?),
        retry_count: row.get(5)?,
        next_attempt_at: parse_datetime(row.get::<_, String>(6)?),
        last_error: row.get(7)?,
        locked_by: row.get(8)?,
        locked_at: row.get::<_, Option<String>>(9)?.map(parse_datetime),
        created_at: parse_datetime(row.get::<_, String>(10)?),
        updated_at: parse_datetime(row.get::<_, String>(11)?),
    })
}

fn audit_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRecord> {
    Ok(AuditRecord {
        id: row.get(0)?,
        correlation_id: row.get(1)?,
        actor: row.get(2)?,
        target_space: row.get(3)?,
        action: PolicyAction::from_str(&row.get::<_, String>(4)?),
        reason: row.get(5)?,
        intended_action: row
            .get::<_, Option<String>>(6)?
            .map(|s| PolicyAction::from_str(&s)),
        status: AuditStatus::from_str(&row.get::<_, String>(7)?),
        refs: serde_json::from_str(&row.get::<_, String>(8)?).unwrap_or_default(),
        created_at: parse_datetime(row.get::<_, String>(9)?),
        finalized_at: row.get::<_, Option<String>>(10)?.map(parse_datetime),
    })
}

/// Fixed-width RFC3339 so stored TEXT timestamps compare lexicographically.
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn now_rfc3339() -> String {
    format_datetime(Utc::now())
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
