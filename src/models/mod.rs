//! Core data models for the folder download service.
//!
//! These entities mirror the `folders` and `files` tables via `sqlx::FromRow`
//! and serialize as camelCase JSON for the HTTP API.

pub mod file;
pub mod folder;
