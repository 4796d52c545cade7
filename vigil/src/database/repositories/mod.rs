//! Repository layer for database access.

pub mod alert;
pub mod index;

pub use alert::*;
pub use index::*;
