use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use super::{partition_name, Message, MessagePage, MessageStats, TenantStore};
use crate::error::{ApiaryError, ApiaryResult};
use crate::tenant::{Tenant, TenantId};

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

/// PostgreSQL-backed implementation of the tenant store.
///
/// Tenants and configs are plain rows; messages live in a table partitioned
/// by list on `tenant_id`, one partition per tenant.
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new store over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn tenant_from_row(row: &sqlx::postgres::PgRow) -> ApiaryResult<Tenant> {
        Ok(Tenant {
            id: TenantId(row.try_get("id")?),
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn message_from_row(
        row: &sqlx::postgres::PgRow,
    ) -> ApiaryResult<Message> {
        Ok(Message {
            id: row.try_get("id")?,
            tenant_id: TenantId(row.try_get("tenant_id")?),
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl TenantStore for PostgresStore {
    async fn bootstrap(&self) -> ApiaryResult<()> {
        let migrations = [
            r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id UUID PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id UUID NOT NULL,
                tenant_id UUID NOT NULL,
                payload JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (id, tenant_id)
            ) PARTITION BY LIST (tenant_id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tenant_configs (
                tenant_id UUID PRIMARY KEY
                    REFERENCES tenants(id) ON DELETE CASCADE,
                workers INTEGER NOT NULL DEFAULT 3,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        ];

        for migration in migrations {
            sqlx::query(migration).execute(&self.pool).await?;
        }

        debug!("store schema bootstrapped");
        Ok(())
    }

    async fn create_partition(&self, tenant_id: TenantId) -> ApiaryResult<()> {
        // DDL cannot take bind parameters. The partition name is sanitized
        // and the VALUES IN literal is a rendered UUID, both hex-and-
        // separator only.
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} PARTITION OF messages \
             FOR VALUES IN ('{}')",
            partition_name(tenant_id),
            tenant_id.as_uuid(),
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn drop_partition(&self, tenant_id: TenantId) -> ApiaryResult<()> {
        let ddl =
            format!("DROP TABLE IF EXISTS {}", partition_name(tenant_id));
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_tenant(
        &self,
        id: TenantId,
        name: &str,
    ) -> ApiaryResult<Tenant> {
        let row = sqlx::query(
            r#"
            INSERT INTO tenants (id, name)
            VALUES ($1, $2)
            RETURNING created_at, updated_at
            "#,
        )
        .bind(id.as_uuid())
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(Tenant {
            id,
            name: name.to_string(),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn insert_tenant_config(
        &self,
        tenant_id: TenantId,
        workers: usize,
    ) -> ApiaryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tenant_configs (tenant_id, workers)
            VALUES ($1, $2)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(workers as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_tenants(&self) -> ApiaryResult<Vec<Tenant>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, created_at, updated_at
            FROM tenants
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::tenant_from_row).collect()
    }

    async fn get_tenant(&self, id: TenantId) -> ApiaryResult<Tenant> {
        let row = sqlx::query(
            r#"
            SELECT id, name, created_at, updated_at
            FROM tenants
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::tenant_from_row(&row),
            None => Err(ApiaryError::NotFound("tenant")),
        }
    }

    async fn update_workers(
        &self,
        tenant_id: TenantId,
        workers: usize,
    ) -> ApiaryResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_configs
            SET workers = $1, updated_at = NOW()
            WHERE tenant_id = $2
            "#,
        )
        .bind(workers as i32)
        .bind(tenant_id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get_workers(&self, tenant_id: TenantId) -> ApiaryResult<usize> {
        let row = sqlx::query(
            r#"
            SELECT workers
            FROM tenant_configs
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let workers: i32 = row.try_get("workers")?;
                Ok(workers as usize)
            }
            None => Err(ApiaryError::NotFound("tenant config")),
        }
    }

    async fn delete_tenant(&self, id: TenantId) -> ApiaryResult<()> {
        sqlx::query("DELETE FROM tenants WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_message(
        &self,
        tenant_id: TenantId,
        payload: serde_json::Value,
    ) -> ApiaryResult<Message> {
        let id = Uuid::now_v7();
        let row = sqlx::query(
            r#"
            INSERT INTO messages (id, tenant_id, payload)
            VALUES ($1, $2, $3)
            RETURNING created_at
            "#,
        )
        .bind(id)
        .bind(tenant_id.as_uuid())
        .bind(&payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(Message {
            id,
            tenant_id,
            payload,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn list_messages(
        &self,
        tenant_id: TenantId,
        cursor: Option<&str>,
        limit: usize,
    ) -> ApiaryResult<MessagePage> {
        let limit = if limit == 0 || limit > MAX_PAGE_SIZE {
            DEFAULT_PAGE_SIZE
        } else {
            limit
        };

        // Fetch one extra row to learn whether a next page exists.
        let rows = if let Some(cursor) = cursor {
            let before: DateTime<Utc> = DateTime::parse_from_rfc3339(cursor)
                .map_err(|err| {
                    ApiaryError::validation(format!(
                        "invalid cursor format: {err}"
                    ))
                })?
                .with_timezone(&Utc);

            sqlx::query(
                r#"
                SELECT id, tenant_id, payload, created_at
                FROM messages
                WHERE tenant_id = $1 AND created_at < $2
                ORDER BY created_at DESC
                LIMIT $3
                "#,
            )
            .bind(tenant_id.as_uuid())
            .bind(before)
            .bind((limit + 1) as i64)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                SELECT id, tenant_id, payload, created_at
                FROM messages
                WHERE tenant_id = $1
                ORDER BY created_at DESC
                LIMIT $2
                "#,
            )
            .bind(tenant_id.as_uuid())
            .bind((limit + 1) as i64)
            .fetch_all(&self.pool)
            .await?
        };

        let mut messages: Vec<Message> = rows
            .iter()
            .map(Self::message_from_row)
            .collect::<ApiaryResult<_>>()?;

        let next_cursor = if messages.len() > limit {
            messages.truncate(limit);
            // The Z suffix keeps the cursor query-string safe; a numeric
            // offset would carry a '+' that decodes to a space.
            messages.last().map(|m| {
                m.created_at
                    .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
            })
        } else {
            None
        };

        Ok(MessagePage {
            data: messages,
            next_cursor,
        })
    }

    async fn get_message(&self, id: Uuid) -> ApiaryResult<Message> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, payload, created_at
            FROM messages
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::message_from_row(&row),
            None => Err(ApiaryError::NotFound("message")),
        }
    }

    async fn delete_message(&self, id: Uuid) -> ApiaryResult<()> {
        let result = sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ApiaryError::NotFound("message"));
        }
        Ok(())
    }

    async fn message_stats(
        &self,
        tenant_id: TenantId,
    ) -> ApiaryResult<MessageStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_messages,
                COUNT(*) FILTER (
                    WHERE created_at >= NOW() - INTERVAL '24 hours'
                ) AS messages_24h,
                COUNT(*) FILTER (
                    WHERE created_at >= NOW() - INTERVAL '1 hour'
                ) AS messages_1h
            FROM messages
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        Ok(MessageStats {
            total_messages: row.try_get("total_messages")?,
            messages_24h: row.try_get("messages_24h")?,
            messages_1h: row.try_get("messages_1h")?,
        })
    }
}
