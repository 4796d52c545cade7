//! vigil library crate.
//!
//! Continuous capture of a live video stream into fixed-duration chunks,
//! with each finished chunk run through an upload, analysis, alert and
//! indexing pipeline.

pub mod alerts;
pub mod capture;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod recordings;
pub mod services;
pub mod session;
pub mod utils;
pub mod watcher;

pub use error::{Error, Result};
