//! SQLite schema for the idempotency guard

/// SQL schema for the guard database
pub const SCHEMA_SQL: &str = r#"
-- One row per unit of work; state is PROCESSING, COMPLETED or FAILED
CREATE TABLE IF NOT EXISTS idempotency_keys (
    key TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 1,
    error TEXT,
    -- Unix milliseconds
    started_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_idempotency_state ON idempotency_keys(state);
"#;
