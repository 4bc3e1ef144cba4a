pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod orchestrator;
pub mod router;
pub mod sdp;
pub mod session;
pub mod signaling;
