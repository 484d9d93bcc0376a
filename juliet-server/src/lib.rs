//! # juliet-server
//!
//! Chat server for juliet.
//!
//! This crate provides:
//! - TCP connection handling with async I/O
//! - Line framing and command dispatch
//! - Session, nickname and channel registries
//! - Password-protected registration
//! - Idle client probing and eviction
//! - Delivery of radio traffic into channels
//! - A relay bot mode that joins channels on another chat server

pub mod auth;
pub mod bridge;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod line;
pub mod liveness;
pub mod registry;
pub mod reply;
pub mod server;
pub mod session;

pub use auth::PasswordValidator;
pub use bridge::RadioBridge;
pub use channel::Channel;
pub use client::RelayClient;
pub use config::{
    ClientChannel, ClientConfig, Config, ConfigError, NetworkConfig, RadioConfig, ServerIdentity,
};
pub use error::ServerError;
pub use handler::{CommandHandler, ServerInfo};
pub use line::{Line, LineBuffer};
pub use liveness::LivenessMonitor;
pub use registry::Registry;
pub use reply::Reply;
pub use server::{Server, ServerConfig};
pub use session::Session;
