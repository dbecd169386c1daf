pub mod codec;
pub mod ws;

pub use codec::{Frame, FrameBuffer};
pub use ws::{Connector, Transport, TungsteniteTransport, WsConfig, WsConnector};
