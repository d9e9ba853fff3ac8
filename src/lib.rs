#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod message;
pub(crate) mod queue;
pub mod transport;

use crate::error::Error;

pub use client::WebsocketClient;
pub use config::{ClientConfig, MessageEncoding};
pub use events::{Disconnection, DisconnectionKind, Reconnection, ReconnectionKind};
pub use message::{CloseCode, Message};

pub type Result<T> = std::result::Result<T, Error>;
