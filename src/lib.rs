//! Data layer for the shop admin dashboard.
//!
//! [`query`] holds the cache engine; [`infra::http`] talks to the REST API the
//! cache reads from.

pub mod application;
pub mod config;
pub mod infra;
pub mod query;
