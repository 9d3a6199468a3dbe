//! Thin HTTP adapter: REST routes over the in-process contracts plus the
//! WebSocket upgrade that feeds the push fabric. Framing and error mapping
//! live here; none of the core components know about HTTP.

pub mod handlers;
pub mod server;

pub use server::{start_web_server, AppState};
