//! Network communication layer.

pub mod client;
pub mod handler;
pub mod rpc;
pub mod server;

pub use client::RemoteClient;
pub use handler::CacheServer;
pub use rpc::{Envelope, Message};
pub use server::{MessageHandler, NetworkServer};
