// scrutiny-api: wire layer for Scrutiny Debugger servers (framing, links, JSON protocol)

pub mod error;
pub mod expr;
pub mod framing;
pub mod protocol;
pub mod transport;

pub use error::Error;
pub use framing::{DatagramCodec, FramingConfig};
pub use protocol::{ClientMessage, Request, ServerBody, ServerMessage, WireValue};
pub use transport::{Link, LinkCounters, LinkKind, LinkReceiver, LinkSender, TransportConfig};
