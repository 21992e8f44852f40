//! Remote execution over WebSocket.
//!
//! An [`AgentServer`] hosts commands; an [`AgentClient`] drives one of them
//! stage by stage and implements [`Engine`](crate::engine::Engine) so it can
//! stand in for a local backend.

pub mod client;
pub mod event;
pub mod server;

pub use client::{AgentClient, AgentClientOptions};
pub use event::{Event, Stage};
pub use server::{AgentServer, AgentServerOptions};
