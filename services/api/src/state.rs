//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the process-lifetime
//! collaborators every handler needs.

use crate::{config::Config, sessions::SessionStore};
use std::sync::Arc;
use tutor_core::{history::HistoryStore, stack::TutorStack};

/// The shared application state, created once at startup and passed to all handlers.
/// All fields are public to be accessible from other modules.
#[derive(Clone)]
pub struct AppState {
    pub stack: Arc<TutorStack>,
    pub history: Arc<dyn HistoryStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub config: Arc<Config>,
}
