use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use tracing::debug;

use super::{
    check_append, continuation_token, parse_continuation, InstanceInfo, InstancePage, InstanceQuery, InstanceStatus,
    InstanceUpdate, NewInstance, Provider, ProviderError,
};
use crate::HistoryEvent;

/// SQLite-backed provider with transactional appends
///
/// Works against a file (durable across restarts) or a shared-cache in-memory
/// database for tests.
pub struct SqliteProvider {
    pool: SqlitePool,
}

impl SqliteProvider {
    /// Convert sqlx error to ProviderError with appropriate retry classification
    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let error_msg = e.to_string();

        if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
            return ProviderError::retryable(operation, format!("Database locked: {error_msg}"));
        }

        if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
            return ProviderError::permanent(operation, format!("Constraint violation: {error_msg}"));
        }

        if error_msg.contains("connection") || error_msg.contains("timeout") {
            return ProviderError::retryable(operation, format!("Connection error: {error_msg}"));
        }

        ProviderError::retryable(operation, error_msg)
    }

    /// Open (and create if missing) a database.
    ///
    /// `database_url` is an sqlx SQLite URL such as `sqlite:/tmp/orders.db?mode=rwc`
    /// or `sqlite::memory:`.
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let mut options = SqlitePoolOptions::new().max_connections(5);
        if is_memory {
            // Each connection to `:memory:` is its own database; keep exactly one alive.
            options = options.max_connections(1).idle_timeout(None).max_lifetime(None);
        }
        let pool = options
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        // WAL mode: only sync the WAL file, not the main database
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA cache_size = -64000").execute(&mut *conn).await?;
                    }
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        Self::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Convenience: in-memory store for tests. A single pooled connection keeps
    /// every query on the same database.
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:").await
    }

    /// Open a database file at `path`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn open_file(path: impl AsRef<std::path::Path>) -> Result<Self, sqlx::Error> {
        let url = format!("sqlite:{}?mode=rwc", path.as_ref().display());
        Self::new(&url).await
    }

    /// Force a WAL checkpoint to ensure all changes are written to main database file
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint operation fails.
    pub async fn checkpoint(&self) -> Result<(), sqlx::Error> {
        sqlx::query("PRAGMA wal_checkpoint(FULL)").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool, waiting for connections to be released.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                orchestration_name TEXT NOT NULL,
                orchestration_version TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'Running',
                input TEXT NOT NULL,
                output TEXT,
                custom_status TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_instances_listing ON instances(status, created_at DESC, instance_id DESC)"#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_instances_by_name ON instances(orchestration_name, status, created_at DESC)"#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                instance_id TEXT NOT NULL REFERENCES instances(instance_id),
                seq INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (instance_id, seq)
            )
            "#,
        )
        .execute(pool)
        .await?;

        debug!("sqlite schema ready");
        Ok(())
    }

    async fn read_history_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        instance: &str,
    ) -> Result<Vec<HistoryEvent>, ProviderError> {
        let rows = sqlx::query(
            r#"
            SELECT event_data
            FROM history
            WHERE instance_id = ?
            ORDER BY seq
            "#,
        )
        .bind(instance)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("read", e))?;
        Self::decode_history(instance, rows)
    }

    fn decode_history(instance: &str, rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<HistoryEvent>, ProviderError> {
        let mut events = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            let event_data: String = row
                .try_get("event_data")
                .map_err(|e| ProviderError::permanent("read", format!("Failed to get event_data: {e}")))?;
            // Unknown or corrupt rows must surface, never be skipped.
            let event: HistoryEvent = serde_json::from_str(&event_data).map_err(|e| {
                ProviderError::permanent(
                    "read",
                    format!("Failed to deserialize history event at position {idx} for instance '{instance}': {e}"),
                )
            })?;
            events.push(event);
        }
        Ok(events)
    }

    fn row_to_info(row: &sqlx::sqlite::SqliteRow, operation: &str) -> Result<InstanceInfo, ProviderError> {
        let get_err = |e: sqlx::Error| Self::sqlx_to_provider_error(operation, e);
        let status: String = row.try_get("status").map_err(get_err)?;
        let status = InstanceStatus::parse(&status)
            .ok_or_else(|| ProviderError::permanent(operation, format!("unknown instance status '{status}'")))?;
        let created_at: i64 = row.try_get("created_at").map_err(get_err)?;
        let updated_at: i64 = row.try_get("updated_at").map_err(get_err)?;
        Ok(InstanceInfo {
            instance_id: row.try_get("instance_id").map_err(get_err)?,
            orchestration_name: row.try_get("orchestration_name").map_err(get_err)?,
            orchestration_version: row.try_get("orchestration_version").map_err(get_err)?,
            status,
            input: row.try_get("input").map_err(get_err)?,
            output: row.try_get("output").map_err(get_err)?,
            custom_status: row.try_get("custom_status").map_err(get_err)?,
            created_at: from_millis(created_at),
            updated_at: from_millis(updated_at),
        })
    }

    async fn insert_events_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        instance: &str,
        events: &[HistoryEvent],
    ) -> Result<(), ProviderError> {
        for event in events {
            let event_data = serde_json::to_string(event)
                .map_err(|e| ProviderError::permanent("append", format!("Failed to serialize event: {e}")))?;
            sqlx::query(
                r#"
                INSERT INTO history (instance_id, seq, event_type, event_data, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(instance)
            .bind(event.seq as i64)
            .bind(event.kind.name())
            .bind(event_data)
            .bind(event.timestamp.timestamp_millis())
            .execute(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("append", e))?;
        }
        Ok(())
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

const INFO_COLUMNS: &str = "instance_id, orchestration_name, orchestration_version, status, input, output, \
                            custom_status, created_at, updated_at";

#[async_trait::async_trait]
impl Provider for SqliteProvider {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_instance(&self, instance: NewInstance) -> Result<bool, ProviderError> {
        let op = "create_instance";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;

        let created_ms = instance.created_at.timestamp_millis();
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO instances
                (instance_id, orchestration_name, orchestration_version, status, input, created_at, updated_at)
            VALUES (?, ?, ?, 'Running', ?, ?, ?)
            "#,
        )
        .bind(&instance.instance_id)
        .bind(&instance.orchestration_name)
        .bind(&instance.orchestration_version)
        .bind(&instance.input)
        .bind(created_ms)
        .bind(created_ms)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(op, e))?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
            return Ok(false);
        }

        Self::insert_events_in_tx(&mut tx, &instance.instance_id, &[instance.started_event()]).await?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        debug!(instance = %instance.instance_id, "created instance");
        Ok(true)
    }

    async fn append(
        &self,
        instance: &str,
        events: Vec<HistoryEvent>,
        update: InstanceUpdate,
    ) -> Result<u64, ProviderError> {
        let op = "append";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;

        let row = sqlx::query("SELECT status, updated_at FROM instances WHERE instance_id = ?")
            .bind(instance)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?
            .ok_or_else(|| ProviderError::permanent(op, format!("instance not found: {instance}")))?;
        let status: String = row.try_get("status").map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        let status = InstanceStatus::parse(&status)
            .ok_or_else(|| ProviderError::permanent(op, format!("unknown instance status '{status}'")))?;
        let prev_updated: i64 = row.try_get("updated_at").map_err(|e| Self::sqlx_to_provider_error(op, e))?;

        let existing = Self::read_history_in_tx(&mut tx, instance).await?;
        if check_append(op, instance, &existing, status, &events)? {
            tx.rollback().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
            return Ok(events.last().map(|e| e.seq).unwrap_or_default());
        }

        Self::insert_events_in_tx(&mut tx, instance, &events).await?;

        let updated_ms = events
            .last()
            .map(|e| e.timestamp.timestamp_millis())
            .unwrap_or_else(|| Utc::now().timestamp_millis())
            .max(prev_updated);
        sqlx::query(
            r#"
            UPDATE instances
            SET status = COALESCE(?, status),
                output = COALESCE(?, output),
                custom_status = COALESCE(?, custom_status),
                updated_at = ?
            WHERE instance_id = ?
            "#,
        )
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.output)
        .bind(update.custom_status)
        .bind(updated_ms)
        .bind(instance)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(op, e))?;

        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        Ok((existing.len() + events.len()) as u64 - 1)
    }

    async fn read(&self, instance: &str) -> Result<Vec<HistoryEvent>, ProviderError> {
        let rows = sqlx::query(
            r#"
            SELECT event_data
            FROM history
            WHERE instance_id = ?
            ORDER BY seq
            "#,
        )
        .bind(instance)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("read", e))?;
        Self::decode_history(instance, rows)
    }

    async fn get_instance(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError> {
        let row = sqlx::query(&format!("SELECT {INFO_COLUMNS} FROM instances WHERE instance_id = ?"))
            .bind(instance)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("get_instance", e))?;
        row.as_ref().map(|r| Self::row_to_info(r, "get_instance")).transpose()
    }

    async fn list_instances(&self, query: InstanceQuery) -> Result<InstancePage, ProviderError> {
        let op = "list_instances";
        let after = match query.continuation.as_deref() {
            Some(token) => Some(
                parse_continuation(token)
                    .ok_or_else(|| ProviderError::permanent(op, format!("invalid continuation token: {token}")))?,
            ),
            None => None,
        };
        let page_size = query.page_size.max(1);

        let mut sql = format!("SELECT {INFO_COLUMNS} FROM instances WHERE 1 = 1");
        if query.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if query.orchestration_name.is_some() {
            sql.push_str(" AND orchestration_name = ?");
        }
        if after.is_some() {
            sql.push_str(" AND (created_at < ? OR (created_at = ? AND instance_id < ?))");
        }
        sql.push_str(" ORDER BY created_at DESC, instance_id DESC LIMIT ?");

        let mut q = sqlx::query(&sql);
        if let Some(status) = query.status {
            q = q.bind(status.as_str());
        }
        if let Some(name) = &query.orchestration_name {
            q = q.bind(name.clone());
        }
        if let Some((ms, id)) = &after {
            q = q.bind(*ms).bind(*ms).bind(id.clone());
        }
        q = q.bind(page_size as i64 + 1);

        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        let has_more = rows.len() > page_size;
        let instances = rows
            .iter()
            .take(page_size)
            .map(|r| Self::row_to_info(r, op))
            .collect::<Result<Vec<_>, _>>()?;
        let continuation = if has_more {
            instances.last().map(continuation_token)
        } else {
            None
        };
        Ok(InstancePage {
            instances,
            continuation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;
    use chrono::Duration;

    async fn create_test_store() -> SqliteProvider {
        SqliteProvider::new_in_memory().await.expect("Failed to create test store")
    }

    fn new_instance(id: &str) -> NewInstance {
        NewInstance {
            instance_id: id.to_string(),
            orchestration_name: "Orch".to_string(),
            orchestration_version: "1.0.0".to_string(),
            input: "{\"n\":1}".to_string(),
            created_at: DateTime::<Utc>::UNIX_EPOCH + Duration::milliseconds(1_000),
        }
    }

    #[tokio::test]
    async fn test_create_and_read() {
        let store = create_test_store().await;
        assert!(store.create_instance(new_instance("s-1")).await.unwrap());
        assert!(!store.create_instance(new_instance("s-1")).await.unwrap());

        let history = store.read("s-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].seq, 0);

        let info = store.get_instance("s-1").await.unwrap().expect("instance should exist");
        assert_eq!(info.status, InstanceStatus::Running);
        assert_eq!(info.input, "{\"n\":1}");
        assert!(store.get_instance("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_updates_metadata_atomically() {
        let store = create_test_store().await;
        store.create_instance(new_instance("s-2")).await.unwrap();

        let ts = DateTime::<Utc>::UNIX_EPOCH + Duration::milliseconds(5_000);
        let events = vec![
            HistoryEvent::new(1, ts, EventKind::ExternalSubscribed { name: "Go".into() }),
            HistoryEvent::new(
                2,
                ts,
                EventKind::OrchestratorFailed {
                    error: "boom".into(),
                },
            ),
        ];
        let last = store
            .append("s-2", events.clone(), InstanceUpdate::terminal(InstanceStatus::Failed, "boom"))
            .await
            .unwrap();
        assert_eq!(last, 2);

        let info = store.get_instance("s-2").await.unwrap().unwrap();
        assert_eq!(info.status, InstanceStatus::Failed);
        assert_eq!(info.output.as_deref(), Some("boom"));
        assert_eq!(info.updated_at, ts);

        // Retried write is a no-op, a conflicting one is rejected.
        assert_eq!(store.append("s-2", events, InstanceUpdate::default()).await.unwrap(), 2);
        let conflicting = vec![HistoryEvent::new(1, ts, EventKind::ExternalSubscribed { name: "Other".into() })];
        let err = store
            .append("s-2", conflicting, InstanceUpdate::default())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(store.read("s-2").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_list_instances_filter_and_pages() {
        let store = create_test_store().await;
        for (i, id) in ["x", "y", "z"].iter().enumerate() {
            let mut n = new_instance(id);
            n.created_at = DateTime::<Utc>::UNIX_EPOCH + Duration::milliseconds(i as i64 * 10);
            store.create_instance(n).await.unwrap();
        }
        store
            .append(
                "y",
                vec![HistoryEvent::new(
                    1,
                    Utc::now(),
                    EventKind::OrchestratorCompleted { output: "done".into() },
                )],
                InstanceUpdate::terminal(InstanceStatus::Completed, "done"),
            )
            .await
            .unwrap();

        let running = store
            .list_instances(InstanceQuery {
                status: Some(InstanceStatus::Running),
                page_size: 1,
                ..InstanceQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(running.instances.len(), 1);
        assert_eq!(running.instances[0].instance_id, "z");

        let rest = store
            .list_instances(InstanceQuery {
                status: Some(InstanceStatus::Running),
                page_size: 1,
                continuation: running.continuation,
                ..InstanceQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(rest.instances[0].instance_id, "x");
        assert!(rest.continuation.is_none());
    }

    #[tokio::test]
    async fn test_list_instances_by_orchestration_name() {
        let store = create_test_store().await;
        store.create_instance(new_instance("orch-1")).await.unwrap();
        let mut other = new_instance("other-1");
        other.orchestration_name = "Other".to_string();
        store.create_instance(other).await.unwrap();

        let page = store
            .list_instances(InstanceQuery {
                orchestration_name: Some("Other".to_string()),
                page_size: 10,
                ..InstanceQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(page.instances.len(), 1);
        assert_eq!(page.instances[0].instance_id, "other-1");
        assert!(page.continuation.is_none());
    }
}
