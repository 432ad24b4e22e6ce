//! Test support for apiary.
//!
//! Provides in-memory implementations of the broker and store seams plus a
//! configurable test handler, so integration tests can exercise the tenant
//! lifecycle without RabbitMQ or PostgreSQL.

pub mod broker;
pub mod handler;
pub mod store;

pub use broker::InMemoryBroker;
pub use handler::{PanickingHandler, TestHandler};
pub use store::InMemoryStore;
