//! Tutor API Library Crate
//!
//! Hosting for the tutoring engine: configuration, the PostgreSQL history
//! store, the hosted session store, HTTP handlers and routing. The `api` and
//! `tutor` binaries are thin wrappers around this library.

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod sessions;
pub mod state;
