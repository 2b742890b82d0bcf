//! OpenAI-compatible HTTP surface for the gateway.
//!
//! Mounts the endpoint table under `/api/v0` and `/api/v1`, hosts the
//! realtime transcription WebSocket, and maps every failure onto the
//! structured error shape.

pub mod error;
pub mod handlers;
pub mod realtime;
pub mod server;

pub use server::{create_router, serve, ServerState};
