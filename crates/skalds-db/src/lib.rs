//! Store adapter for the Skalds controller: the `tasks` collection lives in
//! PostgreSQL, accessed through `sqlx` with compare-and-set status updates.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
