//! HTTP handler surface: thin adapters from requests to the relay core.
//!
//! Handlers authenticate, pick the environment, and delegate; they respond
//! locally to client errors and never log them at error level.

pub mod auth;
pub mod cors;
pub mod events;
pub mod poll;
pub mod response;
pub mod status;
pub mod stream;
