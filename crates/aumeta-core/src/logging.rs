//! Structured logging field name constants for aumeta.
//!
//! All crates use these constants for consistent structured logging fields.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Task failure or data loss risk, requires operator attention |
//! | WARN  | Recoverable issue, reference-data mismatch, task rescheduled |
//! | INFO  | Lifecycle events (task start/finish, schema upgrade steps) |
//! | DEBUG | Decision points, admission choices, config values |
//! | TRACE | Per-article iteration, per-record inserts |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "jobs"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "schema", "recorder", "reindex", "removal", "manager"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "upgrade", "record", "step", "finish", "admit"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Archival unit identifier.
pub const AU_ID: &str = "au_id";

/// Archival unit display name.
pub const AU_NAME: &str = "au_name";

/// Terminal or current task status.
pub const STATUS: &str = "status";

/// Schema version being applied.
pub const VERSION: &str = "version";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of records written, removed or read.
pub const RECORD_COUNT: &str = "record_count";

/// Retry attempt number.
pub const ATTEMPT: &str = "attempt";

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_field_names_are_distinct() {
        let fields = [
            SUBSYSTEM,
            COMPONENT,
            OPERATION,
            AU_ID,
            AU_NAME,
            STATUS,
            VERSION,
            DURATION_MS,
            RECORD_COUNT,
            ATTEMPT,
        ];
        let unique: HashSet<_> = fields.iter().collect();
        assert_eq!(unique.len(), fields.len());
    }
}
