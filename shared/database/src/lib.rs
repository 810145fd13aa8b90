//! Persistence layer: one master database plus one database per workspace,
//! reached through the workspace registry. Repositories follow one-struct-
//! per-table with row structs decoding into the domain models.

pub mod engagement;
pub mod migrations;
pub mod postgres;
pub mod registry;
pub mod repositories;
pub mod secrets;

pub use engagement::EngagementRecorder;
pub use postgres::{create_postgres_pool, health_check as postgres_health_check, PostgresPool};
pub use registry::WorkspaceRegistry;
pub use repositories::*;
