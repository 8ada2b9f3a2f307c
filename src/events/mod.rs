pub mod admin;
pub mod consumer;
pub mod dlq;
pub mod inspector;
