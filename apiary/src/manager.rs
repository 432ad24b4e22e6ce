use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::broker::MessageBroker;
use crate::error::{ApiaryError, ApiaryResult};
use crate::handler::JobHandler;
use crate::metrics;
use crate::pool::WorkerPool;
use crate::runtime::TenantRuntime;
use crate::store::TenantStore;
use crate::tenant::{Tenant, TenantId};

/// Smallest allowed per-tenant worker count.
pub const MIN_WORKERS: usize = 1;
/// Largest allowed per-tenant worker count.
pub const MAX_WORKERS: usize = 100;

/// Configuration for the tenant manager.
#[derive(Clone, Debug)]
pub struct TenantManagerConfig {
    /// Worker count assigned to newly created tenants.
    pub default_workers: usize,
    /// Upper bound on graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for TenantManagerConfig {
    fn default() -> Self {
        Self {
            default_workers: 3,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Orchestrator for the tenant set.
///
/// Couples the durable store, the broker topology, and the in-process
/// runtimes under one registry. Reads take the registry lock shared;
/// create, delete, resize, and shutdown take it exclusively, which also
/// serializes control-plane operations on the same tenant.
pub struct TenantManager {
    store: Arc<dyn TenantStore>,
    broker: Arc<dyn MessageBroker>,
    handler: Arc<dyn JobHandler>,
    config: TenantManagerConfig,
    runtimes: RwLock<HashMap<TenantId, TenantRuntime>>,
}

impl TenantManager {
    pub fn new(
        store: Arc<dyn TenantStore>,
        broker: Arc<dyn MessageBroker>,
        handler: Arc<dyn JobHandler>,
        config: TenantManagerConfig,
    ) -> Self {
        Self {
            store,
            broker,
            handler,
            config,
            runtimes: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild runtimes for every persisted tenant.
    ///
    /// Queue declaration is idempotent, so re-running this after a restart
    /// converges on the durable tenant set. A tenant whose topology cannot
    /// be declared is logged and skipped; it stays durable and is retried
    /// on the next restart.
    pub async fn recover(&self) -> ApiaryResult<()> {
        let tenants = self.store.list_tenants().await?;
        let total = tenants.len();

        for tenant in tenants {
            match self.start_runtime(tenant.id).await {
                Ok(()) => {
                    metrics::inc_active_tenants();
                }
                Err(err) => {
                    tracing::warn!(
                        tenant_id = %tenant.id,
                        "failed to recover tenant runtime: {err}"
                    );
                }
            }
        }

        tracing::info!(tenants = total, "startup recovery complete");
        Ok(())
    }

    /// Create a tenant and materialize all of its resources.
    ///
    /// Ordering matters for recovery safety: the durable rows come first,
    /// so a crash mid-way leaves a tenant that the next startup can still
    /// recover. No compensation is attempted on failure; resource names are
    /// deterministic in the id and ids are never reused, so partial state
    /// is inert.
    pub async fn create_tenant(&self, name: &str) -> ApiaryResult<Tenant> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ApiaryError::validation(
                "tenant name must not be empty",
            ));
        }

        let id = TenantId::new();
        let tenant = self.store.insert_tenant(id, name).await?;
        self.store.create_partition(id).await?;
        self.store
            .insert_tenant_config(id, self.config.default_workers)
            .await?;

        self.start_runtime(id).await?;
        metrics::inc_active_tenants();

        tracing::info!(tenant_id = %id, name, "tenant created");
        Ok(tenant)
    }

    pub async fn get_tenant(&self, id: TenantId) -> ApiaryResult<Tenant> {
        self.store.get_tenant(id).await
    }

    pub async fn list_tenants(&self) -> ApiaryResult<Vec<Tenant>> {
        self.store.list_tenants().await
    }

    /// Retune a tenant's parallelism.
    ///
    /// The store is the source of truth and is updated first; a restart
    /// between persist and resize still recovers the new value.
    pub async fn update_concurrency(
        &self,
        id: TenantId,
        workers: usize,
    ) -> ApiaryResult<()> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&workers) {
            return Err(ApiaryError::validation(format!(
                "workers must be between {MIN_WORKERS} and {MAX_WORKERS}"
            )));
        }

        let affected = self.store.update_workers(id, workers).await?;
        if affected == 0 {
            return Err(ApiaryError::NotFound("tenant"));
        }

        let runtimes = self.runtimes.write().await;
        if let Some(runtime) = runtimes.get(&id) {
            runtime.pool().resize(workers).await;
        }

        tracing::info!(tenant_id = %id, workers, "concurrency updated");
        Ok(())
    }

    /// Tear down a tenant.
    ///
    /// The runtime stops before any durable state is touched so no delivery
    /// is dropped mid-flight. Broker and partition cleanup are best-effort;
    /// the tenant row is the source of truth and its deletion is the only
    /// fatal step.
    pub async fn delete_tenant(&self, id: TenantId) -> ApiaryResult<()> {
        let mut runtimes = self.runtimes.write().await;

        if let Some(runtime) = runtimes.get(&id) {
            runtime.stop().await;
        }

        if let Err(err) = self.broker.delete_tenant_topology(id).await {
            tracing::warn!(
                tenant_id = %id,
                "failed to delete broker topology: {err}"
            );
        }

        self.store.delete_tenant(id).await?;

        if let Err(err) = self.store.drop_partition(id).await {
            tracing::warn!(
                tenant_id = %id,
                "failed to drop partition: {err}"
            );
        }

        // The registry entry leaves only after the runtime has fully
        // stopped.
        if runtimes.remove(&id).is_some() {
            metrics::dec_active_tenants();
        }

        tracing::info!(tenant_id = %id, "tenant deleted");
        Ok(())
    }

    /// Worker count of the tenant's live pool, if a runtime is registered.
    pub async fn worker_count(&self, id: TenantId) -> Option<usize> {
        let runtimes = self.runtimes.read().await;
        match runtimes.get(&id) {
            Some(runtime) => Some(runtime.pool().worker_count().await),
            None => None,
        }
    }

    /// Whether the tenant has a live runtime.
    pub async fn has_runtime(&self, id: TenantId) -> bool {
        self.runtimes.read().await.contains_key(&id)
    }

    /// Stop every runtime, waiting for in-flight handlers to drain.
    ///
    /// Bounded by the configured shutdown timeout; runtimes still draining
    /// when it elapses are abandoned.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down tenant manager");

        let runtimes = {
            let mut guard = self.runtimes.write().await;
            std::mem::take(&mut *guard)
        };

        let drain = async {
            for (id, runtime) in runtimes {
                runtime.stop().await;
                tracing::info!(tenant_id = %id, "tenant runtime stopped");
            }
        };

        if tokio::time::timeout(self.config.shutdown_timeout, drain)
            .await
            .is_err()
        {
            tracing::warn!(
                "shutdown deadline elapsed before all runtimes drained"
            );
        }

        tracing::info!("tenant manager shutdown complete");
    }

    /// Declare topology, open the stream, and register a runtime sized from
    /// the persisted worker count.
    async fn start_runtime(&self, id: TenantId) -> ApiaryResult<()> {
        let stream = self.broker.ensure_tenant_topology(id).await?;

        let workers = match self.store.get_workers(id).await {
            Ok(workers) => workers,
            Err(_) => self.config.default_workers,
        };

        let pool = WorkerPool::new(id, workers, Arc::clone(&self.handler));
        let runtime = TenantRuntime::start(id, stream, pool);

        self.runtimes.write().await.insert(id, runtime);
        Ok(())
    }
}

impl std::fmt::Debug for TenantManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tenant_count = self
            .runtimes
            .try_read()
            .map(|runtimes| runtimes.len())
            .unwrap_or_default();
        f.debug_struct("TenantManager")
            .field("config", &self.config)
            .field("registered_tenants", &tenant_count)
            .finish_non_exhaustive()
    }
}
