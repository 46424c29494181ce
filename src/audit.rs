//! Shared, SQLite-backed tool-call audit log.
//!
//! Every tool dispatch — allowed or denied — appends one row here. Used for
//! crash-recovery reasoning and post-hoc review; failures to write the audit
//! row are logged rather than propagated, since a missing audit entry should
//! never fail an otherwise-successful tool call.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::error;

use crate::db::Store;

/// Append-only log of tool invocations.
pub struct AuditLog {
    store: Arc<Store>,
}

impl AuditLog {
    /// Wrap `store` as an audit log.
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Append one audit row. Errors are logged, not returned: a failed audit
    /// write must never fail the tool call it is recording.
    pub fn record(&self, run_id: &str, tool_name: &str, arguments: &Value, allowed: bool, reason: &str) {
        let result = self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tool_audit_log (run_id, tool_name, arguments_json, allowed, reason, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    run_id,
                    tool_name,
                    arguments.to_string(),
                    i64::from(allowed),
                    reason,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        });
        if let Err(e) = result {
            error!(run_id, tool = tool_name, error = %e, "failed to write audit log entry");
        }
    }

    /// Count audit rows for a run — used in tests and diagnostics.
    pub fn count_for_run(&self, run_id: &str) -> i64 {
        self.store
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM tool_audit_log WHERE run_id = ?1",
                    rusqlite::params![run_id],
                    |row| row.get(0),
                )
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_appends_row() {
        let audit = AuditLog::new(Arc::new(Store::open_in_memory().expect("open_in_memory should succeed")));
        audit.record("run1", "echo", &json!({"a": 1}), true, "ok");
        audit.record("run1", "echo", &json!({"a": 2}), false, "denied");
        assert_eq!(audit.count_for_run("run1"), 2);
        assert_eq!(audit.count_for_run("run2"), 0);
    }
}
