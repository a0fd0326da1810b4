//! Idempotent schema bootstrap.
//!
//! The relay core writes `mail_logs` and the usage columns of
//! `smtp_credentials`; the remaining tables (`credential_quotas`,
//! `dkim_keys`) belong to the admin surface but are created here so a fresh
//! database is complete.

use sqlx::SqlitePool;

const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL,
        email TEXT NOT NULL,
        password_hash TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        daily_quota INTEGER NOT NULL DEFAULT 0,
        hourly_quota INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_username ON users (username)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_email ON users (email)",
    "CREATE TABLE IF NOT EXISTS smtp_credentials (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        username TEXT NOT NULL,
        password_hash TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'active',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        last_used TEXT,
        usage_count INTEGER NOT NULL DEFAULT 0,
        daily_quota INTEGER NOT NULL DEFAULT 0,
        hourly_quota INTEGER NOT NULL DEFAULT 0,
        allowed_domains TEXT NOT NULL DEFAULT '[]',
        max_recipients INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_credentials_username
        ON smtp_credentials (username)",
    "CREATE INDEX IF NOT EXISTS idx_credentials_user ON smtp_credentials (user_id)",
    "CREATE INDEX IF NOT EXISTS idx_credentials_status ON smtp_credentials (status)",
    "CREATE TABLE IF NOT EXISTS mail_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        credential_id INTEGER NOT NULL,
        message_id TEXT NOT NULL,
        mail_from TEXT NOT NULL,
        rcpt_to TEXT NOT NULL,
        subject TEXT NOT NULL DEFAULT '',
        size INTEGER NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_attempt TEXT,
        error_message TEXT,
        created_at TEXT NOT NULL,
        completed_at TEXT,
        relay_ip TEXT NOT NULL DEFAULT ''
    )",
    "CREATE INDEX IF NOT EXISTS idx_mail_logs_user
        ON mail_logs (user_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_mail_logs_credential
        ON mail_logs (credential_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_mail_logs_message_id ON mail_logs (message_id)",
    "CREATE INDEX IF NOT EXISTS idx_mail_logs_status ON mail_logs (status)",
    "CREATE INDEX IF NOT EXISTS idx_mail_logs_created ON mail_logs (created_at DESC)",
    "CREATE TABLE IF NOT EXISTS credential_quotas (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        credential_id INTEGER NOT NULL,
        date TEXT NOT NULL,
        daily_count INTEGER NOT NULL DEFAULT 0,
        daily_limit INTEGER NOT NULL DEFAULT 0,
        hourly_count INTEGER NOT NULL DEFAULT 0,
        hourly_limit INTEGER NOT NULL DEFAULT 0,
        last_reset_hour TEXT,
        last_reset_day TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_credential_quotas_day
        ON credential_quotas (credential_id, date)",
    "CREATE TABLE IF NOT EXISTS smtp_configs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        username TEXT,
        password TEXT,
        tls INTEGER NOT NULL DEFAULT 0,
        active INTEGER NOT NULL DEFAULT 1,
        priority INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_smtp_configs_host
        ON smtp_configs (host, port)",
    "CREATE INDEX IF NOT EXISTS idx_smtp_configs_active ON smtp_configs (active)",
    "CREATE INDEX IF NOT EXISTS idx_smtp_configs_priority ON smtp_configs (priority)",
    "CREATE TABLE IF NOT EXISTS dkim_keys (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        domain TEXT NOT NULL,
        selector TEXT NOT NULL,
        private_key TEXT NOT NULL,
        public_key TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
];

pub(crate) async fn bootstrap(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
