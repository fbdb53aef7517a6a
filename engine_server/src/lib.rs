//! `engine_server`
//!
//! Authoritative side of the engine:
//! - Accepts TCP clients on the shared socket reactor
//! - Owns the scene graph and assigns object ids
//! - Sends a snapshot on join, then periodic transform updates
//! - Applies and relays object events sent by clients

pub mod server;

pub use server::ServerGameState;
