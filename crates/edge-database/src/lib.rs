//! SQLite persistence for the edge dispatcher.
//!
//! This crate provides:
//! - [`AsyncDatabase`]: a single dedicated SQLite thread fed through a channel
//! - Migrations for the hit queue, held events, store payloads and state
//! - Model types and standalone query functions
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! let head = db.call(|conn| queries::head_hit(conn)).await?;
//! ```
//!
//! Every query runs on the executor thread in FIFO order, so each `call` is
//! atomic with respect to every other `call`. Multi-statement writes use a
//! transaction so that a crash never leaves a partial update behind.

mod error;
mod executor;
mod migrations;
mod models;
pub mod queries;

pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use models::*;
