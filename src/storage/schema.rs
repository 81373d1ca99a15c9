//! Database schema constants.

/// Monitors registered by users. The producer reads this table.
pub const CREATE_MONITORS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS monitors (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    user_id TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// One row per executed check. Reprocessed entries add rows with the same
/// `entry_id`.
pub const CREATE_CHECK_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS check_results (
    id BIGSERIAL PRIMARY KEY,
    monitor_id TEXT NOT NULL,
    entry_id TEXT NOT NULL,
    status VARCHAR(16) NOT NULL,
    location VARCHAR(16) NOT NULL,
    response_time_ms BIGINT,
    checked_at TIMESTAMPTZ NOT NULL
)
"#;

pub const CREATE_CHECK_RESULTS_MONITOR_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_check_results_monitor_checked_at
    ON check_results(monitor_id, checked_at DESC)
"#;

pub const CREATE_CHECK_RESULTS_ENTRY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_check_results_entry_id ON check_results(entry_id)
"#;

/// Returns all schema creation statements in the correct order.
///
/// Each element is a single statement; prepared queries reject batches.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_MONITORS_TABLE,
        CREATE_CHECK_RESULTS_TABLE,
        CREATE_CHECK_RESULTS_MONITOR_INDEX,
        CREATE_CHECK_RESULTS_ENTRY_INDEX,
    ]
}

/// Table names in the schema.
pub mod tables {
    pub const MONITORS: &str = "monitors";
    pub const CHECK_RESULTS: &str = "check_results";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 4);
        assert!(statements[0].contains(tables::MONITORS));
        assert!(statements[1].contains(tables::CHECK_RESULTS));
        assert!(statements[2..].iter().all(|s| s.contains("CREATE INDEX")));
    }

    #[test]
    fn test_statements_are_single() {
        for statement in all_schema_statements() {
            assert!(!statement.trim().trim_end_matches(';').contains(';'));
        }
    }
}
