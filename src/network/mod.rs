//! Network subsystem for framed TCP streaming between two peers

pub mod flow;
pub mod framing;
pub mod session;
pub mod transport;

pub use flow::FlowWindow;
pub use session::{Handshake, SessionEvent, SessionStats, StreamingSession};
pub use transport::{listen, DisconnectCallback, PacketTransport, TransportStats};
