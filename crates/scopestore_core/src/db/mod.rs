//! SQLite connection bootstrap.
//!
//! # Responsibility
//! - Open file or in-memory SQLite connections for the storage driver.
//! - Configure connection pragmas the session layer relies on.
//!
//! # Invariants
//! - Returned connections have `foreign_keys=ON`.
//! - Schema management stays with the application; nothing here creates tables.

mod open;

pub use open::{open_db, open_db_in_memory, open_with};
