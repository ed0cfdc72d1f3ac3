// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! Fire-and-forget audit trail for idle-lock transitions.
//!
//! Every lock/unlock transition produces one row keyed by day and host. The
//! concrete store client lives outside this workspace; delivery failures are
//! logged and must never affect frame scheduling. Stores are expected to
//! expire rows after roughly six months (`nimby.audit_ttl`).

use chrono::{DateTime, NaiveDate, Utc};
use std::time::SystemTime;
use tracing::debug;
use uuid::{NoContext, Timestamp, Uuid};

/// One idle-lock transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockAuditRow {
    /// Day bucket of the transition (UTC).
    pub day: NaiveDate,
    /// Host the transition happened on.
    pub hostname: String,
    /// Time-ordered id of the transition.
    pub ts: Uuid,
    /// Whether the host became locked.
    pub locked: bool,
    /// Whether the controller was active at transition time.
    pub active: bool,
}

impl LockAuditRow {
    /// Builds a row stamped at `as_of` (now when unset).
    pub fn new(hostname: &str, locked: bool, active: bool, as_of: Option<SystemTime>) -> Self {
        let as_of = as_of.unwrap_or_else(SystemTime::now);
        let instant: DateTime<Utc> = as_of.into();
        let unix = as_of
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            day: instant.date_naive(),
            hostname: hostname.to_owned(),
            ts: Uuid::new_v7(Timestamp::from_unix(
                NoContext,
                unix.as_secs(),
                unix.subsec_nanos(),
            )),
            locked,
            active,
        }
    }
}

/// Destination of lock-audit rows.
pub trait LockAuditSink: Send + Sync {
    /// Records one transition. Implementations must not block the caller on
    /// delivery and must swallow (but may log) failures.
    fn record(&self, row: LockAuditRow);
}

/// Audit sink that only logs rows.
#[derive(Debug, Default)]
pub struct LogAuditSink;

impl LockAuditSink for LogAuditSink {
    fn record(&self, row: LockAuditRow) {
        debug!(
            hostname = %row.hostname,
            day = %row.day,
            locked = row.locked,
            active = row.active,
            "idle-lock transition (no audit store attached)"
        );
    }
}
