pub mod client;
pub mod core;

pub use client::endpoints::{default_endpoints, Endpoint, EndpointSelector};
pub use client::OptionClient;
pub use core::config::{ClientConfig, SessionCredentials};
pub use core::errors::ClientError;
pub use core::events::{CallbackId, Event, EventCallback, EventKind};
pub use core::types::*;
