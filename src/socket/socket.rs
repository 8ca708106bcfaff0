use std::cmp;
use std::io;
use std::sync::mpsc;

use rand::Rng;

use super::dispatcher::{self, Dispatcher};
use super::{Connection, Event, EventKind, Role};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ipv4;
use crate::platform::{Network, RawNetwork};
use crate::tcp::{Endpoint, Flags, Segment};

/// One side of an exchange.
///
/// Every call that waits consumes events in order until one it can complete on. Nothing is
/// retransmitted and there are no timeouts: a lost reply blocks forever.
pub struct Socket<N: Network = RawNetwork> {
    // Declared before `dispatcher` so it is dropped first, which frees a dispatcher blocked on
    // delivering an event.
    events: mpsc::Receiver<Result<Event>>,
    dispatcher: Dispatcher,
    net: N,
    config: Config,
    role: Role,
    local: Endpoint,
    remote: Endpoint,
    seq: u32,
    ack: u32,

    rx_buffer: Vec<u8>,
    terminated: bool,
}

impl Socket<RawNetwork> {
    /// Connect over the host's raw sockets with the default configuration.
    pub fn dial(client_addr: ipv4::Address,
                server_addr: ipv4::Address,
                server_port: u16)
                -> Result<Self> {
        Socket::dial_with(RawNetwork,
                          Config::default(),
                          &mut rand::rng(),
                          client_addr,
                          Endpoint::new(server_addr, server_port))
    }
}

impl<N: Network> Socket<N> {
    /// Pick an ephemeral port from `config.port_range`, send SYN and block until the handshake
    /// completes.
    pub fn dial_with<R: Rng + ?Sized>(net: N,
                                      config: Config,
                                      rng: &mut R,
                                      client_addr: ipv4::Address,
                                      server: Endpoint)
                                      -> Result<Self> {
        let port = rng.random_range(config.port_range.clone());
        let local = Endpoint::new(client_addr, port);

        let mut connection = Connection::client(config.clone(), local);
        let syn = connection.connect(server);

        let (tx, rx) = mpsc::sync_channel(1);
        let dispatcher = Dispatcher::spawn(net.clone(), connection, tx, config.recv_timeout)?;
        dispatcher::transmit(&net, &syn)?;
        info!("{}: dialing {}", local, server);

        let mut socket = Socket::new(rx, dispatcher, net, config, Role::Client, local, server);
        socket.next_event_where(|kind| kind == EventKind::Established)?;
        info!("{}: connected to {}", local, server);
        Ok(socket)
    }

    pub(super) fn new(events: mpsc::Receiver<Result<Event>>,
                      dispatcher: Dispatcher,
                      net: N,
                      config: Config,
                      role: Role,
                      local: Endpoint,
                      remote: Endpoint)
                      -> Self {
        Socket {
            events: events,
            dispatcher: dispatcher,
            net: net,
            config: config,
            role: role,
            local: local,
            remote: remote,
            seq: 0,
            ack: 0,
            rx_buffer: Vec::new(),
            terminated: false,
        }
    }

    /// Adopt the bookkeeping carried by the event that established the connection.
    pub(super) fn established(mut self, event: &Event) -> Self {
        self.remote = event.sender;
        self.seq = event.seq;
        self.ack = event.ack;
        self
    }

    /// Push `data` and block until the peer answers, returning its payload.
    ///
    /// Bare acknowledgments on the way are absorbed. A reply with DTH set comes back as
    /// `Error::SessionTerminated` carrying that reply. Writing nothing sends nothing.
    pub fn write(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        self.push(data)?;

        let event = self.next_event_where(|kind| kind != EventKind::Acknowledged)?;
        match event.kind {
            EventKind::Data => Ok(event.segment.payload),
            EventKind::Terminated => {
                self.terminated = true;
                Err(Error::SessionTerminated(event.segment.payload))
            }
            _ => Err(Error::Closed),
        }
    }

    /// Push `data` and block until the peer has acknowledged it.
    ///
    /// Data the peer pushes in the meantime is kept for `read`.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.push(data)?;

        loop {
            let event = self.next_event()?;
            match event.kind {
                EventKind::Acknowledged => return Ok(()),
                EventKind::Data => {
                    self.rx_buffer.extend_from_slice(event.payload());
                    return Ok(());
                }
                EventKind::Terminated => {
                    self.terminated = true;
                    self.rx_buffer.extend_from_slice(event.payload());
                    return Err(Error::SessionTerminated(event.segment.payload));
                }
                EventKind::Closed => return Err(Error::Closed),
                EventKind::Established => (),
            }
        }
    }

    /// Send FIN+ACK and wait for the peer to acknowledge it, then stop the dispatcher.
    pub fn close(mut self) -> Result<()> {
        let fin = self.outbound(Flags::fin_ack());
        dispatcher::transmit(&self.net, &fin)?;
        self.seq = self.seq.wrapping_add(1);

        let acknowledged =
            |kind: EventKind| kind == EventKind::Acknowledged || kind == EventKind::Closed;
        match self.next_event_where(acknowledged) {
            // The dispatcher ending first means the peer closed too.
            Ok(_) | Err(Error::Closed) => {
                info!("{}: closed connection to {}", self.local, self.remote);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// The next event, whatever it is. Blocks without a timeout.
    pub fn wait(&mut self) -> Result<Event> {
        self.next_event()
    }

    pub fn local(&self) -> Endpoint {
        self.local
    }

    pub fn remote(&self) -> Endpoint {
        self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Next sequence number this end sends.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn ack(&self) -> u32 {
        self.ack
    }

    /// Whether the peer has ended the exchange with DTH.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn is_open(&self) -> bool {
        self.dispatcher.is_running()
    }

    fn push(&mut self, data: &[u8]) -> Result<()> {
        let mut segment = self.outbound(Flags::psh_ack());
        segment.clear_options();
        segment.payload = data.to_vec();
        dispatcher::transmit(&self.net, &segment)?;
        self.seq = self.seq.wrapping_add(data.len() as u32);
        debug!("{}: pushed {} bytes to {}", self.local, data.len(), self.remote);
        Ok(())
    }

    fn outbound(&self, flags: Flags) -> Segment {
        let mut segment = Segment::new(self.local, self.remote, self.seq, self.ack, flags);
        segment.window = self.config.window;
        segment
    }

    fn next_event(&mut self) -> Result<Event> {
        let event = self.events.recv().map_err(|_| Error::Closed)??;
        self.seq = event.seq;
        self.ack = event.ack;
        Ok(event)
    }

    fn next_event_where<F>(&mut self, done: F) -> Result<Event>
        where F: Fn(EventKind) -> bool
    {
        loop {
            let event = self.next_event()?;
            if done(event.kind) {
                return Ok(event);
            }
            trace!("{}: passing over {:?}", self.local, event.kind);
        }
    }
}

impl<N: Network> io::Write for Socket<N> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.send(buf).map(|_| buf.len()).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<N: Network> io::Read for Socket<N> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.rx_buffer.is_empty() {
            if self.terminated {
                return Ok(0);
            }
            let event = match self.next_event() {
                Ok(event) => event,
                Err(Error::Closed) => return Ok(0),
                Err(err) => return Err(err.into()),
            };
            match event.kind {
                EventKind::Data => self.rx_buffer.extend_from_slice(event.payload()),
                EventKind::Terminated => {
                    self.terminated = true;
                    self.rx_buffer.extend_from_slice(event.payload());
                }
                EventKind::Closed => return Ok(0),
                EventKind::Established | EventKind::Acknowledged => (),
            }
        }

        let len = cmp::min(buf.len(), self.rx_buffer.len());
        buf[..len].copy_from_slice(&self.rx_buffer[..len]);
        self.rx_buffer.drain(..len);
        Ok(len)
    }
}
