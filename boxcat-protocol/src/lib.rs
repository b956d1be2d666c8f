#![allow(clippy::cargo_common_metadata)]

pub mod client;
pub mod connection;
pub mod message;

pub use client::{ClientChannels, ClientRuntime, ClientState};
pub use connection::{Connection, ConnectionOptions};
pub use message::{CodecError, Message};
