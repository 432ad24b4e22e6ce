use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use apiary::error::{ApiaryError, ApiaryResult};
use apiary::store::{Message, MessagePage, MessageStats, TenantStore};
use apiary::tenant::{Tenant, TenantId};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

/// In-memory stand-in for the PostgreSQL store.
///
/// Mirrors the durable schema closely enough for lifecycle tests: tenant
/// and config rows, partition bookkeeping, and cursor-paginated messages.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<StoreState>>,
}

#[derive(Default)]
struct StoreState {
    tenants: HashMap<TenantId, Tenant>,
    configs: HashMap<TenantId, usize>,
    partitions: HashSet<TenantId>,
    messages: Vec<Message>,
    last_message_at: Option<DateTime<Utc>>,
}

impl StoreState {
    /// Microsecond-resolution timestamps, strictly increasing.
    ///
    /// Cursors truncate to microseconds the way timestamptz does, so
    /// stored timestamps must not carry extra nanoseconds or ties.
    fn next_message_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let mut now = now
            - Duration::nanoseconds(i64::from(
                now.timestamp_subsec_nanos() % 1_000,
            ));
        if let Some(last) = self.last_message_at {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }
        self.last_message_at = Some(now);
        now
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a partition exists for the tenant.
    pub fn has_partition(&self, tenant_id: TenantId) -> bool {
        self.inner.lock().partitions.contains(&tenant_id)
    }

    /// The tenant's persisted worker count, if a config row exists.
    pub fn config_workers(&self, tenant_id: TenantId) -> Option<usize> {
        self.inner.lock().configs.get(&tenant_id).copied()
    }
}

#[async_trait]
impl TenantStore for InMemoryStore {
    async fn bootstrap(&self) -> ApiaryResult<()> {
        Ok(())
    }

    async fn create_partition(&self, tenant_id: TenantId) -> ApiaryResult<()> {
        self.inner.lock().partitions.insert(tenant_id);
        Ok(())
    }

    async fn drop_partition(&self, tenant_id: TenantId) -> ApiaryResult<()> {
        let mut state = self.inner.lock();
        state.partitions.remove(&tenant_id);
        state.messages.retain(|m| m.tenant_id != tenant_id);
        Ok(())
    }

    async fn insert_tenant(
        &self,
        id: TenantId,
        name: &str,
    ) -> ApiaryResult<Tenant> {
        let now = Utc::now();
        let tenant = Tenant {
            id,
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.inner.lock().tenants.insert(id, tenant.clone());
        Ok(tenant)
    }

    async fn insert_tenant_config(
        &self,
        tenant_id: TenantId,
        workers: usize,
    ) -> ApiaryResult<()> {
        self.inner.lock().configs.insert(tenant_id, workers);
        Ok(())
    }

    async fn list_tenants(&self) -> ApiaryResult<Vec<Tenant>> {
        let mut tenants: Vec<Tenant> =
            self.inner.lock().tenants.values().cloned().collect();
        tenants.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.id.as_uuid().cmp(&a.id.as_uuid()))
        });
        Ok(tenants)
    }

    async fn get_tenant(&self, id: TenantId) -> ApiaryResult<Tenant> {
        self.inner
            .lock()
            .tenants
            .get(&id)
            .cloned()
            .ok_or(ApiaryError::NotFound("tenant"))
    }

    async fn update_workers(
        &self,
        tenant_id: TenantId,
        workers: usize,
    ) -> ApiaryResult<u64> {
        let mut state = self.inner.lock();
        match state.configs.get_mut(&tenant_id) {
            Some(existing) => {
                *existing = workers;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn get_workers(&self, tenant_id: TenantId) -> ApiaryResult<usize> {
        self.inner
            .lock()
            .configs
            .get(&tenant_id)
            .copied()
            .ok_or(ApiaryError::NotFound("tenant config"))
    }

    async fn delete_tenant(&self, id: TenantId) -> ApiaryResult<()> {
        let mut state = self.inner.lock();
        state.tenants.remove(&id);
        // Config cascades with the tenant row.
        state.configs.remove(&id);
        Ok(())
    }

    async fn insert_message(
        &self,
        tenant_id: TenantId,
        payload: serde_json::Value,
    ) -> ApiaryResult<Message> {
        let mut state = self.inner.lock();
        if !state.partitions.contains(&tenant_id) {
            return Err(ApiaryError::NotFound("partition"));
        }
        let created_at = state.next_message_timestamp();
        let message = Message {
            id: Uuid::now_v7(),
            tenant_id,
            payload,
            created_at,
        };
        state.messages.push(message.clone());
        Ok(message)
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

        let before: Option<DateTime<Utc>> = match cursor {
            Some(cursor) => Some(
                DateTime::parse_from_rfc3339(cursor)
                    .map_err(|err| {
                        ApiaryError::validation(format!(
                            "invalid cursor format: {err}"
                        ))
                    })?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        let mut messages: Vec<Message> = self
            .inner
            .lock()
            .messages
            .iter()
            .filter(|m| m.tenant_id == tenant_id)
            .filter(|m| before.map_or(true, |b| m.created_at < b))
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let next_cursor = if messages.len() > limit {
            messages.truncate(limit);
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
        self.inner
            .lock()
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or(ApiaryError::NotFound("message"))
    }

    async fn delete_message(&self, id: Uuid) -> ApiaryResult<()> {
        let mut state = self.inner.lock();
        let before = state.messages.len();
        state.messages.retain(|m| m.id != id);
        if state.messages.len() == before {
            return Err(ApiaryError::NotFound("message"));
        }
        Ok(())
    }

    async fn message_stats(
        &self,
        tenant_id: TenantId,
    ) -> ApiaryResult<MessageStats> {
        let now = Utc::now();
        let state = self.inner.lock();
        let messages = state
            .messages
            .iter()
            .filter(|m| m.tenant_id == tenant_id);

        let mut stats = MessageStats {
            total_messages: 0,
            messages_24h: 0,
            messages_1h: 0,
        };
        for message in messages {
            stats.total_messages += 1;
            if message.created_at >= now - Duration::hours(24) {
                stats.messages_24h += 1;
            }
            if message.created_at >= now - Duration::hours(1) {
                stats.messages_1h += 1;
            }
        }
        Ok(stats)
    }
}
