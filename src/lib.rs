//! QUARTERMASTER — settlement resource accounting and market trading agent
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod net;
pub mod scrape;
pub mod tracker;
pub mod market;
pub mod premium;
