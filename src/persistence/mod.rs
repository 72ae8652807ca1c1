// src/persistence/mod.rs
// Entity storage: stores, change tracking, repositories and units of work

pub mod context;
pub mod entity;
pub mod error;
pub mod memory;
pub mod repository;
pub mod sqlite;
pub mod store;
pub mod unit_of_work;

pub use context::DbContext;
pub use entity::Entity;
pub use error::{PersistenceError, PersistenceResult};
pub use memory::{MemorySession, MemoryStore};
pub use repository::Repository;
pub use sqlite::{SqliteSession, SqliteStore};
pub use store::{Change, ChangeOp, Store, StoreSession};
pub use unit_of_work::UnitOfWork;
