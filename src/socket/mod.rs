mod connection;
mod dispatcher;
mod server;
mod socket;

use crate::tcp;

pub use self::connection::{Connection, Role, State, Step};
pub use self::dispatcher::Dispatcher;
pub use self::server::Listener;
pub use self::socket::Socket;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    /// Handshake finished.
    Established,
    /// A bare acknowledgment arrived.
    Acknowledged,
    /// The peer pushed data.
    Data,
    /// The peer pushed data with DTH set; no more will follow.
    Terminated,
    /// The peer sent FIN+ACK.
    Closed,
}

/// What the dispatcher hands the session for each segment that changed something.
#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventKind,
    /// The inbound segment behind the event.
    pub segment: tcp::Segment,
    pub sender: tcp::Endpoint,
    /// Next sequence number we send.
    pub seq: u32,
    /// Next sequence number we expect from the peer.
    pub ack: u32,
}

impl Event {
    pub fn payload(&self) -> &[u8] {
        &self.segment.payload
    }
}
