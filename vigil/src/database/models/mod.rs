//! Database models.

pub mod alert;
pub mod analysis;

pub use alert::*;
pub use analysis::*;
