//! Apiary - multi-tenant message processing.
//!
//! Each tenant owns an isolated pair of broker queues (primary plus
//! dead-letter), a dedicated partition of the message table, and an
//! in-process worker pool whose concurrency can be retuned at runtime. A
//! control-plane API creates and destroys tenants; the [`TenantManager`]
//! keeps the three resources consistent across restarts and partial
//! failures.
//!
//! # Core Concepts
//!
//! - **Tenant**: the isolation unit. One row in the store, one queue pair
//!   on the broker, one partition, one worker pool.
//!
//! - **Broker**: the [`MessageBroker`] trait abstracts the queue backend.
//!   The production implementation is [`AmqpBroker`] over RabbitMQ.
//!
//! - **Store**: the [`TenantStore`] trait abstracts durable state, backed
//!   by [`PostgresStore`] with one list partition per tenant.
//!
//! - **Worker pool**: a bounded intake feeding N concurrent workers that
//!   invoke a pluggable [`JobHandler`]. Pools resize without dropping
//!   accepted jobs.
//!
//! - **Runtime**: a [`TenantRuntime`] pumps one tenant's delivery stream
//!   into its pool, acking accepted deliveries and dead-lettering
//!   rejections.
//!
//! # Data flow
//!
//! ```text
//! publisher -> tenant queue -> DeliveryStream -> TenantRuntime
//!           -> WorkerPool -> JobHandler
//! ```
//!
//! Control flow goes through the HTTP surface in [`api`] to the
//! [`TenantManager`], which coordinates the store, the broker, and the
//! in-memory runtime registry.

/// HTTP control-plane surface.
pub mod api;

/// Broker seam and the AMQP implementation.
///
/// Defines [`MessageBroker`], [`Delivery`], and [`DeliveryStream`] along
/// with deterministic queue-name derivation.
pub mod broker;

/// Process configuration loaded from `config.yaml` and the environment.
pub mod config;

/// Error types shared across the crate.
pub mod error;

/// The pluggable business handler invoked by pool workers.
pub mod handler;

/// Tenant lifecycle orchestration.
///
/// The [`TenantManager`] owns the registry of live runtimes and drives
/// create, delete, reconfigure, startup recovery, and shutdown.
pub mod manager;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Fixed-intake, resizable worker pool.
pub mod pool;

/// Per-tenant runtime binding a delivery stream to a worker pool.
pub mod runtime;

/// Stop signalling shared by pools, workers, and delivery pumps.
pub mod shutdown;

/// Store seam and the PostgreSQL implementation.
pub mod store;

/// Tenant identity and record types.
pub mod tenant;

pub use broker::{
    AmqpBroker, Delivery, DeliveryStream, MessageBroker,
};
pub use config::AppConfig;
pub use error::{ApiaryError, ApiaryResult};
pub use handler::{JobHandler, JsonLogHandler};
pub use manager::{TenantManager, TenantManagerConfig};
pub use pool::{SubmitError, WorkerPool, INTAKE_CAPACITY};
pub use runtime::TenantRuntime;
pub use shutdown::StopToken;
pub use store::{
    Message, MessagePage, MessageStats, PostgresStore, TenantStore,
};
pub use tenant::{Tenant, TenantConfig, TenantId};
