use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiaryResult;
use crate::tenant::{Tenant, TenantId};

/// PostgreSQL-backed store implementation.
pub mod postgres;

pub use postgres::PostgresStore;

/// Name of a tenant's partition of the `messages` table.
///
/// Hyphens in the id are mapped to underscores so the name is a valid SQL
/// identifier; the id is never interpolated into DDL untransformed.
pub fn partition_name(tenant_id: TenantId) -> String {
    format!("messages_{}", tenant_id.to_string().replace('-', "_"))
}

/// A message row from a tenant's partition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One page of messages plus the cursor for the next page, if any.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessagePage {
    pub data: Vec<Message>,
    pub next_cursor: Option<String>,
}

/// Aggregate counts over a tenant's messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageStats {
    pub total_messages: i64,
    pub messages_24h: i64,
    pub messages_1h: i64,
}

/// Trait for durable tenant and message state.
///
/// All operations are single statements or single transactions; callers
/// compose them without holding store-level locks.
#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Create the `tenants`, partitioned `messages`, and `tenant_configs`
    /// tables if absent. Idempotent.
    async fn bootstrap(&self) -> ApiaryResult<()>;

    /// Attach a partition of `messages` for the tenant. Idempotent.
    async fn create_partition(&self, tenant_id: TenantId) -> ApiaryResult<()>;

    /// Drop the tenant's partition.
    async fn drop_partition(&self, tenant_id: TenantId) -> ApiaryResult<()>;

    /// Insert a tenant row and return it with store-assigned timestamps.
    async fn insert_tenant(
        &self,
        id: TenantId,
        name: &str,
    ) -> ApiaryResult<Tenant>;

    /// Insert the tenant's config row with its initial worker count.
    async fn insert_tenant_config(
        &self,
        tenant_id: TenantId,
        workers: usize,
    ) -> ApiaryResult<()>;

    /// All tenants, newest first.
    async fn list_tenants(&self) -> ApiaryResult<Vec<Tenant>>;

    async fn get_tenant(&self, id: TenantId) -> ApiaryResult<Tenant>;

    /// Persist a new worker count; returns the number of rows affected
    /// (zero means the tenant has no config row).
    async fn update_workers(
        &self,
        tenant_id: TenantId,
        workers: usize,
    ) -> ApiaryResult<u64>;

    /// The persisted worker count for the tenant.
    async fn get_workers(&self, tenant_id: TenantId) -> ApiaryResult<usize>;

    /// Delete the tenant row; the config row cascades.
    async fn delete_tenant(&self, id: TenantId) -> ApiaryResult<()>;

    /// Insert a message into the tenant's partition.
    async fn insert_message(
        &self,
        tenant_id: TenantId,
        payload: serde_json::Value,
    ) -> ApiaryResult<Message>;

    /// Page through a tenant's messages, newest first. The cursor is the
    /// RFC 3339 `created_at` of the last message on the previous page.
    async fn list_messages(
        &self,
        tenant_id: TenantId,
        cursor: Option<&str>,
        limit: usize,
    ) -> ApiaryResult<MessagePage>;

    async fn get_message(&self, id: Uuid) -> ApiaryResult<Message>;

    async fn delete_message(&self, id: Uuid) -> ApiaryResult<()>;

    async fn message_stats(
        &self,
        tenant_id: TenantId,
    ) -> ApiaryResult<MessageStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_name_is_a_valid_identifier() {
        let id = TenantId::from(Uuid::nil());
        assert_eq!(
            partition_name(id),
            "messages_00000000_0000_0000_0000_000000000000"
        );
    }

    #[test]
    fn partition_name_contains_no_hyphens() {
        let name = partition_name(TenantId::new());
        assert!(name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }
}
