#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]

pub mod config;
pub mod error;
pub mod handler;
pub mod id;
pub mod mailbox;
pub mod observability;
pub mod registry;
pub mod relay;
pub mod routing;
pub mod server;
pub mod transaction;
pub mod wire;

pub use config::RelayConfig;
pub use error::{ConnectionError, RegistryError, SendError};
pub use handler::{ConnectionOptions, DisconnectPolicy, Role};
pub use id::ConnectionId;
pub use registry::Registry;
pub use relay::{Relay, RelayOptions, RelayStats};
pub use routing::{BroadcastPolicy, DeliveryStrategy};
pub use transaction::Transaction;
