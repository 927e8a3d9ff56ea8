//! Shared Application State
//!
//! Holds the long-lived resources every connection shares: the agent, with
//! its tool catalog and conversation memory, and the loaded configuration.

use crate::config::Config;
use nfz_voice_core::agent::Agent;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<Agent>,
    pub config: Arc<Config>,
}
