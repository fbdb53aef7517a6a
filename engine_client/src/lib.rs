//! `engine_client`
//!
//! Client-side systems:
//! - Connection to the server (one-shot connect task)
//! - Scene replica kept in step with the server's object events
//! - Rendering through the `RenderBackend` seam
//! - Input capture published as INPUT/WINDOW events

pub mod client;
pub mod input;

pub use client::{ClientGameState, ConnectionState};
