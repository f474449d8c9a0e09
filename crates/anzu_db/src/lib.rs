//! Persistent store for Anzu.
//!
//! Provides the connection pool, the idempotent bootstrap migration, the
//! `FromRow` models, typed query modules, the character->project TTL cache
//! and the audit-decision writer.

#![allow(clippy::too_many_arguments)]

pub mod audit;
pub mod cache;
pub mod migrate;
pub mod models;
pub mod pool;
pub mod store;

pub use audit::{AuditLog, Decision};
pub use cache::CharacterProjectCache;
pub use migrate::{run_migrations, run_migrations_non_fatal};
pub use models::{
    Approval, AuditDecision, Character, Episode, GenerationRecord, GenerationStyle,
    LearnedPattern, PipelineRow, Project, QualityGate, Rejection, Scene, Shot,
};
pub use pool::{create_pool, DbConfig, DbError, DbPool, DbRow};
