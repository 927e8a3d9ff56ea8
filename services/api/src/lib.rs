//! NFZ Voice API Library Crate
//!
//! The hosting service for the voice assistant: configuration, shared
//! state, HTTP handlers, the per-connection WebSocket session, and routing.
//! The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod ws;
