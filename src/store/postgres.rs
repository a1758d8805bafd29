//! Postgres command store via direct SQLx.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::CommandStore;
use crate::command::Command;
use crate::error::{Error, Result};
use crate::model::{CommandId, CommandModel, Status};

const SELECT_COMMAND: &str = "SELECT id, name, body, priority, trigger_info, status, queued_at, started_at, ended_at, duration_ms, exception FROM commands";

/// Postgres-backed store. Owns the connection pool.
pub struct PgCommandStore {
    pool: PgPool,
}

impl PgCommandStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn list_by_status(&self, status: Status) -> Result<Vec<CommandModel>> {
        let rows: Vec<CommandRow> =
            sqlx::query_as(&format!("{SELECT_COMMAND} WHERE status = $1 ORDER BY queued_at ASC, id ASC"))
                .bind(status.to_string())
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(CommandRow::try_into_model).collect()
    }
}

#[async_trait]
impl CommandStore for PgCommandStore {
    async fn insert(&self, record: &CommandModel) -> Result<CommandId> {
        let body = encode_body(&record.body)?;
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO commands (name, body, priority, trigger_info, status, queued_at, started_at, ended_at, duration_ms, exception)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING id",
        )
        .bind(&record.name)
        .bind(&body)
        .bind(record.priority.to_string())
        .bind(record.trigger.to_string())
        .bind(record.status.to_string())
        .bind(record.queued_at)
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(record.duration_ms)
        .bind(&record.exception)
        .fetch_one(&self.pool)
        .await?;

        Ok(CommandId(id))
    }

    async fn update(&self, record: &CommandModel) -> Result<()> {
        let body = encode_body(&record.body)?;
        let rows_affected = sqlx::query(
            "UPDATE commands SET name = $1, body = $2, priority = $3, trigger_info = $4, status = $5,
                queued_at = $6, started_at = $7, ended_at = $8, duration_ms = $9, exception = $10
             WHERE id = $11",
        )
        .bind(&record.name)
        .bind(&body)
        .bind(record.priority.to_string())
        .bind(record.trigger.to_string())
        .bind(record.status.to_string())
        .bind(record.queued_at)
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(record.duration_ms)
        .bind(&record.exception)
        .bind(record.id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(format!("command {}", record.id)));
        }
        Ok(())
    }

    async fn get(&self, id: CommandId) -> Result<CommandModel> {
        let row: Option<CommandRow> = sqlx::query_as(&format!("{SELECT_COMMAND} WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| Error::NotFound(format!("command {id}")))?
            .try_into_model()
    }

    async fn list_queued(&self) -> Result<Vec<CommandModel>> {
        self.list_by_status(Status::Queued).await
    }

    async fn list_started(&self) -> Result<Vec<CommandModel>> {
        self.list_by_status(Status::Started).await
    }

    async fn mark_all_started_as_orphaned(&self) -> Result<u64> {
        let rows_affected = sqlx::query(
            "UPDATE commands SET status = 'orphaned', ended_at = now(),
                duration_ms = (EXTRACT(EPOCH FROM (now() - COALESCE(started_at, now()))) * 1000)::BIGINT
             WHERE status = 'started'",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected)
    }
}

fn encode_body(body: &Command) -> Result<serde_json::Value> {
    serde_json::to_value(body).map_err(|e| Error::Other(format!("serialize command body: {e}")))
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct CommandRow {
    id: i64,
    name: String,
    body: serde_json::Value,
    priority: String,
    trigger_info: String,
    status: String,
    queued_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    ended_at: Option<chrono::DateTime<chrono::Utc>>,
    duration_ms: Option<i64>,
    exception: Option<String>,
}

impl CommandRow {
    fn try_into_model(self) -> Result<CommandModel> {
        let body: Command = serde_json::from_value(self.body)
            .map_err(|e| Error::Other(format!("command {} has a bad body: {e}", self.id)))?;

        Ok(CommandModel {
            id: CommandId(self.id),
            name: self.name,
            body,
            priority: self.priority.parse()?,
            trigger: self.trigger_info.parse()?,
            status: self.status.parse()?,
            queued_at: self.queued_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration_ms: self.duration_ms,
            exception: self.exception,
            message: None,
        })
    }
}
