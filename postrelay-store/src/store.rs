use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use postrelay_common::models::{
    CredentialSettings, MailLog, MailStatus, RelayHost, SmtpCredential, User,
};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};

use crate::error::StoreError;
use crate::schema;

/// Deadline for point lookups and single-row writes.
const POINT_DEADLINE: Duration = Duration::from_secs(5);
/// Deadline for scans and counts.
const SCAN_DEADLINE: Duration = Duration::from_secs(10);

/// Handle to the relay database. Cheap to clone; the pool is shared.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// Fields the ingress server provides when recording an accepted message.
/// Status starts as `queued` with zero attempts.
#[derive(Debug, Clone)]
pub struct NewMailLog {
    pub user_id: i64,
    pub credential_id: i64,
    pub message_id: String,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub size: i64,
    pub relay_ip: String,
}

/// Partial mail-log update. Only the populated fields are written.
#[derive(Debug, Clone, Default)]
pub struct MailLogPatch {
    pub status: Option<MailStatus>,
    pub attempts: Option<i64>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(FromRow)]
struct UserRow {
    id: i64,
    username: String,
    email: String,
    password_hash: String,
    status: String,
    daily_quota: i64,
    hourly_quota: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl UserRow {
    fn into_model(self) -> Result<User, StoreError> {
        Ok(User {
            id: self.id,
            username: self.username,
            email: self.email,
            password_hash: self.password_hash,
            status: self
                .status
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("user {}: {e}", self.id)))?,
            daily_quota: self.daily_quota,
            hourly_quota: self.hourly_quota,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct CredentialRow {
    id: i64,
    user_id: i64,
    name: String,
    username: String,
    password_hash: String,
    description: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_used: Option<DateTime<Utc>>,
    usage_count: i64,
    daily_quota: i64,
    hourly_quota: i64,
    allowed_domains: String,
    max_recipients: i64,
}

impl CredentialRow {
    fn into_model(self) -> Result<SmtpCredential, StoreError> {
        let allowed_domains = serde_json::from_str(&self.allowed_domains)
            .map_err(|e| StoreError::Corrupt(format!("credential {}: {e}", self.id)))?;
        Ok(SmtpCredential {
            id: self.id,
            user_id: self.user_id,
            name: self.name,
            username: self.username,
            password_hash: self.password_hash,
            description: self.description,
            status: self
                .status
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("credential {}: {e}", self.id)))?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_used: self.last_used,
            usage_count: self.usage_count,
            settings: CredentialSettings {
                daily_quota: self.daily_quota,
                hourly_quota: self.hourly_quota,
                allowed_domains,
                max_recipients: self.max_recipients,
            },
        })
    }
}

#[derive(FromRow)]
struct MailLogRow {
    id: i64,
    user_id: i64,
    credential_id: i64,
    message_id: String,
    mail_from: String,
    rcpt_to: String,
    subject: String,
    size: i64,
    status: String,
    attempts: i64,
    last_attempt: Option<DateTime<Utc>>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    relay_ip: String,
}

impl MailLogRow {
    fn into_model(self) -> Result<MailLog, StoreError> {
        let to = serde_json::from_str(&self.rcpt_to)
            .map_err(|e| StoreError::Corrupt(format!("mail_log {}: {e}", self.id)))?;
        Ok(MailLog {
            id: self.id,
            user_id: self.user_id,
            credential_id: self.credential_id,
            message_id: self.message_id,
            from: self.mail_from,
            to,
            subject: self.subject,
            size: self.size,
            status: self
                .status
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("mail_log {}: {e}", self.id)))?,
            attempts: self.attempts,
            last_attempt: self.last_attempt,
            error_message: self.error_message,
            created_at: self.created_at,
            completed_at: self.completed_at,
            relay_ip: self.relay_ip,
        })
    }
}

#[derive(FromRow)]
struct RelayRow {
    id: i64,
    name: String,
    host: String,
    port: i64,
    username: Option<String>,
    password: Option<String>,
    tls: bool,
    active: bool,
    priority: i64,
}

impl From<RelayRow> for RelayHost {
    fn from(row: RelayRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            host: row.host,
            port: row.port as u16,
            username: row.username,
            password: row.password,
            tls: row.tls,
            active: row.active,
            priority: row.priority,
        }
    }
}

impl Store {
    /// Connect to the database and run the idempotent schema bootstrap.
    ///
    /// # Errors
    /// Returns an error if the database is unreachable or the schema cannot
    /// be created.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        // A pooled in-memory sqlite database is one database per
        // connection; keep a single connection in that case.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        schema::bootstrap(&pool).await?;

        Ok(Self { pool })
    }

    async fn bounded<T, F>(&self, deadline: Duration, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(deadline, fut)
            .await
            .map_err(|_| StoreError::Deadline(deadline))?
    }

    /// Fetch a user by id.
    ///
    /// # Errors
    /// Returns an error on database failure or a corrupt record.
    pub async fn get_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        self.bounded(POINT_DEADLINE, async {
            let row: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            row.map(UserRow::into_model).transpose()
        })
        .await
    }

    /// Look up an active credential by its exact SMTP username.
    ///
    /// # Errors
    /// Returns an error on database failure or a corrupt record.
    pub async fn find_credential_by_username(
        &self,
        username: &str,
    ) -> Result<Option<SmtpCredential>, StoreError> {
        self.bounded(POINT_DEADLINE, async {
            let row: Option<CredentialRow> =
                sqlx::query_as("SELECT * FROM smtp_credentials WHERE username = ? AND status = 'active'")
                    .bind(username)
                    .fetch_optional(&self.pool)
                    .await?;
            row.map(CredentialRow::into_model).transpose()
        })
        .await
    }

    /// Record an accepted message with status `queued` and zero attempts.
    /// Returns the new mail-log id.
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn insert_mail_log(&self, record: &NewMailLog) -> Result<i64, StoreError> {
        let to = serde_json::to_string(&record.to).unwrap_or_else(|_| "[]".to_string());
        self.bounded(POINT_DEADLINE, async {
            let result = sqlx::query(
                "INSERT INTO mail_logs
                    (user_id, credential_id, message_id, mail_from, rcpt_to,
                     subject, size, status, attempts, created_at, relay_ip)
                 VALUES (?, ?, ?, ?, ?, ?, ?, 'queued', 0, ?, ?)",
            )
            .bind(record.user_id)
            .bind(record.credential_id)
            .bind(&record.message_id)
            .bind(&record.from)
            .bind(&to)
            .bind(&record.subject)
            .bind(record.size)
            .bind(Utc::now())
            .bind(&record.relay_ip)
            .execute(&self.pool)
            .await?;
            Ok(result.last_insert_rowid())
        })
        .await
    }

    /// Fetch a mail-log by id.
    ///
    /// # Errors
    /// Returns an error on database failure or a corrupt record.
    pub async fn get_mail_log(&self, id: i64) -> Result<Option<MailLog>, StoreError> {
        self.bounded(POINT_DEADLINE, async {
            let row: Option<MailLogRow> = sqlx::query_as("SELECT * FROM mail_logs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            row.map(MailLogRow::into_model).transpose()
        })
        .await
    }

    /// Apply a partial update to a mail-log. A patch with no populated
    /// fields is a no-op.
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn update_mail_log(&self, id: i64, patch: &MailLogPatch) -> Result<(), StoreError> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE mail_logs SET ");
        let mut any = false;

        if let Some(status) = patch.status {
            builder.push("status = ").push_bind(status.as_str());
            any = true;
        }
        if let Some(attempts) = patch.attempts {
            if any {
                builder.push(", ");
            }
            builder.push("attempts = ").push_bind(attempts);
            any = true;
        }
        if let Some(last_attempt) = patch.last_attempt {
            if any {
                builder.push(", ");
            }
            builder.push("last_attempt = ").push_bind(last_attempt);
            any = true;
        }
        if let Some(error_message) = &patch.error_message {
            if any {
                builder.push(", ");
            }
            builder.push("error_message = ").push_bind(error_message);
            any = true;
        }
        if let Some(completed_at) = patch.completed_at {
            if any {
                builder.push(", ");
            }
            builder.push("completed_at = ").push_bind(completed_at);
            any = true;
        }

        if !any {
            return Ok(());
        }

        builder.push(" WHERE id = ").push_bind(id);

        self.bounded(POINT_DEADLINE, async {
            builder.build().execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    /// Count mail-logs for a credential inside a half-open time window.
    /// This is the authoritative quota check on ingress.
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn count_mail_logs(
        &self,
        credential_id: i64,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.bounded(SCAN_DEADLINE, async {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM mail_logs
                 WHERE credential_id = ? AND created_at >= ? AND created_at < ?",
            )
            .bind(credential_id)
            .bind(since)
            .bind(until)
            .fetch_one(&self.pool)
            .await?;
            Ok(count)
        })
        .await
    }

    /// Bump the usage counter and last-used stamp of a credential.
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn increment_credential_usage(&self, id: i64) -> Result<(), StoreError> {
        self.bounded(POINT_DEADLINE, async {
            sqlx::query(
                "UPDATE smtp_credentials
                 SET usage_count = usage_count + 1, last_used = ?
                 WHERE id = ?",
            )
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// All active upstream relays, highest priority first.
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn list_active_relays(&self) -> Result<Vec<RelayHost>, StoreError> {
        self.bounded(SCAN_DEADLINE, async {
            let rows: Vec<RelayRow> =
                sqlx::query_as("SELECT * FROM smtp_configs WHERE active = 1 ORDER BY priority DESC, id")
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows.into_iter().map(RelayHost::from).collect())
        })
        .await
    }

    /// Insert a user record. Used by the admin surface and by tests; the
    /// relay core never calls this.
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn insert_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<i64, StoreError> {
        self.bounded(POINT_DEADLINE, async {
            let now = Utc::now();
            let result = sqlx::query(
                "INSERT INTO users (username, email, password_hash, status, created_at, updated_at)
                 VALUES (?, ?, ?, 'active', ?, ?)",
            )
            .bind(username)
            .bind(email)
            .bind(password_hash)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.last_insert_rowid())
        })
        .await
    }

    /// Insert a credential record. Used by the admin surface and by tests.
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn insert_credential(
        &self,
        user_id: i64,
        name: &str,
        username: &str,
        password_hash: &str,
        settings: &CredentialSettings,
    ) -> Result<i64, StoreError> {
        let domains =
            serde_json::to_string(&settings.allowed_domains).unwrap_or_else(|_| "[]".to_string());
        self.bounded(POINT_DEADLINE, async {
            let now = Utc::now();
            let result = sqlx::query(
                "INSERT INTO smtp_credentials
                    (user_id, name, username, password_hash, status, created_at, updated_at,
                     daily_quota, hourly_quota, allowed_domains, max_recipients)
                 VALUES (?, ?, ?, ?, 'active', ?, ?, ?, ?, ?, ?)",
            )
            .bind(user_id)
            .bind(name)
            .bind(username)
            .bind(password_hash)
            .bind(now)
            .bind(now)
            .bind(settings.daily_quota)
            .bind(settings.hourly_quota)
            .bind(&domains)
            .bind(settings.max_recipients)
            .execute(&self.pool)
            .await?;
            Ok(result.last_insert_rowid())
        })
        .await
    }

    #[cfg(test)]
    pub(crate) fn pool_for_tests(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert an upstream relay entry. Used by the admin surface and tests.
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn insert_relay(&self, relay: &RelayHost) -> Result<i64, StoreError> {
        self.bounded(POINT_DEADLINE, async {
            let result = sqlx::query(
                "INSERT INTO smtp_configs
                    (name, host, port, username, password, tls, active, priority)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&relay.name)
            .bind(&relay.host)
            .bind(i64::from(relay.port))
            .bind(&relay.username)
            .bind(&relay.password)
            .bind(relay.tls)
            .bind(relay.active)
            .bind(relay.priority)
            .execute(&self.pool)
            .await?;
            Ok(result.last_insert_rowid())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Timelike};
    use postrelay_common::models::{CredentialSettings, MailStatus, RelayHost};

    use super::*;

    async fn memory_store() -> Store {
        Store::connect("sqlite::memory:").await.expect("connect")
    }

    fn sample_mail(user_id: i64, credential_id: i64) -> NewMailLog {
        NewMailLog {
            user_id,
            credential_id,
            message_id: "1700000000-1-00c0ffee@example.com".to_string(),
            from: "a@ex.com".to_string(),
            to: vec!["b@x".to_string(), "c@x".to_string()],
            subject: "hi".to_string(),
            size: 19,
            relay_ip: "127.0.0.1".to_string(),
        }
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let store = memory_store().await;
        schema::bootstrap(&store.pool).await.expect("second run");
    }

    #[tokio::test]
    async fn credential_lookup_filters_inactive() {
        let store = memory_store().await;
        let user = store.insert_user("alice", "alice@ex.com", "x").await.unwrap();
        store
            .insert_credential(user, "primary", "smtp-alice", "hash", &CredentialSettings::default())
            .await
            .unwrap();

        let found = store
            .find_credential_by_username("smtp-alice")
            .await
            .unwrap()
            .expect("credential");
        assert_eq!(found.user_id, user);
        assert_eq!(found.usage_count, 0);

        sqlx::query("UPDATE smtp_credentials SET status = 'disabled' WHERE username = 'smtp-alice'")
            .execute(&store.pool)
            .await
            .unwrap();
        assert!(store
            .find_credential_by_username("smtp-alice")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn mail_log_lifecycle() {
        let store = memory_store().await;
        let id = store.insert_mail_log(&sample_mail(1, 1)).await.unwrap();

        let log = store.get_mail_log(id).await.unwrap().expect("mail log");
        assert_eq!(log.status, MailStatus::Queued);
        assert_eq!(log.attempts, 0);
        assert_eq!(log.to, vec!["b@x", "c@x"]);
        assert!(log.completed_at.is_none());

        // queued -> sending leaves attempts untouched
        store
            .update_mail_log(
                id,
                &MailLogPatch {
                    status: Some(MailStatus::Sending),
                    last_attempt: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let log = store.get_mail_log(id).await.unwrap().unwrap();
        assert_eq!(log.status, MailStatus::Sending);
        assert_eq!(log.attempts, 0);

        // sending -> sent sets attempts and completion time
        store
            .update_mail_log(
                id,
                &MailLogPatch {
                    status: Some(MailStatus::Sent),
                    attempts: Some(1),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let log = store.get_mail_log(id).await.unwrap().unwrap();
        assert_eq!(log.status, MailStatus::Sent);
        assert_eq!(log.attempts, 1);
        assert!(log.completed_at.is_some());
    }

    #[tokio::test]
    async fn empty_patch_is_a_noop() {
        let store = memory_store().await;
        let id = store.insert_mail_log(&sample_mail(1, 1)).await.unwrap();
        store
            .update_mail_log(id, &MailLogPatch::default())
            .await
            .unwrap();
        let log = store.get_mail_log(id).await.unwrap().unwrap();
        assert_eq!(log.status, MailStatus::Queued);
    }

    #[tokio::test]
    async fn quota_count_respects_window() {
        let store = memory_store().await;
        store.insert_mail_log(&sample_mail(1, 7)).await.unwrap();
        store.insert_mail_log(&sample_mail(1, 7)).await.unwrap();
        store.insert_mail_log(&sample_mail(1, 8)).await.unwrap();

        let now = Utc::now();
        let hour_start = now
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap();

        let count = store
            .count_mail_logs(7, hour_start, hour_start + ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(count, 2);

        // a window in the past sees nothing
        let count = store
            .count_mail_logs(
                7,
                hour_start - ChronoDuration::hours(2),
                hour_start - ChronoDuration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn usage_increment_is_monotonic() {
        let store = memory_store().await;
        let user = store.insert_user("bob", "bob@ex.com", "x").await.unwrap();
        let cred = store
            .insert_credential(user, "main", "smtp-bob", "hash", &CredentialSettings::default())
            .await
            .unwrap();

        store.increment_credential_usage(cred).await.unwrap();
        store.increment_credential_usage(cred).await.unwrap();

        let found = store
            .find_credential_by_username("smtp-bob")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.usage_count, 2);
        assert!(found.last_used.is_some());
    }

    #[tokio::test]
    async fn relay_listing_orders_by_priority() {
        let store = memory_store().await;
        for (name, active, priority) in
            [("low", true, 1), ("off", false, 99), ("high", true, 10)]
        {
            store
                .insert_relay(&RelayHost {
                    id: 0,
                    name: name.to_string(),
                    host: format!("{name}.example.com"),
                    port: 25,
                    username: None,
                    password: None,
                    tls: false,
                    active,
                    priority,
                })
                .await
                .unwrap();
        }

        let relays = store.list_active_relays().await.unwrap();
        assert_eq!(relays.len(), 2);
        assert_eq!(relays[0].name, "high");
        assert_eq!(relays[1].name, "low");
    }
}
