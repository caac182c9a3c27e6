/// SQL DDL for the relay store.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS terminals (
    id TEXT PRIMARY KEY,
    clinician_id TEXT NOT NULL,
    department TEXT NOT NULL,
    remote_addr TEXT,
    status TEXT NOT NULL,
    connected_at TEXT,
    last_heartbeat TEXT,
    disconnected_at TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    session_key TEXT PRIMARY KEY,
    patient_id TEXT NOT NULL,
    session_date TEXT NOT NULL,
    terminal_id TEXT,
    hospital_code TEXT,
    department TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    last_active_at TEXT NOT NULL,
    UNIQUE (patient_id, session_date)
);

CREATE TABLE IF NOT EXISTS session_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_key TEXT NOT NULL REFERENCES sessions(session_key),
    record_type TEXT NOT NULL,
    content TEXT NOT NULL,
    trace_id TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS traces (
    id TEXT PRIMARY KEY,
    stimulus TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    status TEXT NOT NULL DEFAULT 'running',
    total_duration_ms INTEGER
);

CREATE TABLE IF NOT EXISTS spans (
    id TEXT PRIMARY KEY,
    trace_id TEXT NOT NULL REFERENCES traces(id),
    parent_span_id TEXT,
    service_name TEXT NOT NULL,
    terminal_id TEXT,
    start_time TEXT NOT NULL,
    end_time TEXT,
    duration_ms INTEGER,
    status TEXT NOT NULL DEFAULT 'running',
    request_summary TEXT,
    response_summary TEXT,
    error_message TEXT,
    non_critical INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS role_bindings (
    terminal_id TEXT NOT NULL,
    role_id TEXT NOT NULL,
    PRIMARY KEY (terminal_id, role_id)
);

CREATE TABLE IF NOT EXISTS role_acl (
    role_id TEXT NOT NULL,
    service_id TEXT NOT NULL,
    allow INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (role_id, service_id)
);

CREATE TABLE IF NOT EXISTS service_calls (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    terminal_id TEXT NOT NULL,
    service_id TEXT NOT NULL,
    latency_ms INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_patient_date ON sessions(patient_id, session_date);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_session_records_key ON session_records(session_key);
CREATE INDEX IF NOT EXISTS idx_spans_trace ON spans(trace_id);
CREATE INDEX IF NOT EXISTS idx_spans_parent ON spans(parent_span_id);
CREATE INDEX IF NOT EXISTS idx_service_calls_terminal ON service_calls(terminal_id, service_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
