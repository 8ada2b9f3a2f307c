pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod models;
pub mod services;

pub use services::{AuditLogIndex, ElasticsearchAuditIndex};
