use super::{Event, EventKind};
use crate::config::Config;
use crate::tcp::{option, Endpoint, Flags, Kind, Segment};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    /// DTH has been sent or seen. The exchange is over but nobody has sent FIN yet.
    Terminating,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Role {
    Client,
    Server,
}

/// Replies to transmit for one inbound segment, and what to tell the session about it.
#[derive(Debug, Default)]
pub struct Step {
    pub replies: Vec<Segment>,
    pub event: Option<Event>,
}

/// Per-connection bookkeeping driven by inbound segments.
///
/// Nothing here touches the network: `on_segment` returns the segments to send and the
/// dispatcher does the sending.
#[derive(Debug)]
pub struct Connection {
    config: Config,
    role: Role,
    state: State,
    local: Endpoint,
    remote: Option<Endpoint>,
    seq: u32,
    ack: u32,
}

impl Connection {
    pub fn client(config: Config, local: Endpoint) -> Self {
        Connection::new(config, Role::Client, State::Closed, local)
    }

    pub fn listen(config: Config, local: Endpoint) -> Self {
        Connection::new(config, Role::Server, State::Listen, local)
    }

    fn new(config: Config, role: Role, state: State, local: Endpoint) -> Self {
        Connection {
            config: config,
            role: role,
            state: state,
            local: local,
            remote: None,
            seq: 0,
            ack: 0,
        }
    }

    /// Build the opening SYN towards `remote` and move to SYN-SENT.
    pub fn connect(&mut self, remote: Endpoint) -> Segment {
        let isn = self.config.client_isn;
        let mut syn = Segment::new(self.local, remote, isn, 0, Flags::syn());
        syn.window = self.config.window;
        syn.set_options(option::emit(&option::syn_set(self.config.syn_timestamp)));

        self.remote = Some(remote);
        self.seq = isn.wrapping_add(1);
        self.ack = 0;
        self.state = State::SynSent;
        syn
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local(&self) -> Endpoint {
        self.local
    }

    pub fn remote(&self) -> Option<Endpoint> {
        self.remote
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn ack(&self) -> u32 {
        self.ack
    }

    pub fn on_segment(&mut self, segment: Segment) -> Step {
        match (segment.kind(), self.state) {
            (Kind::Syn, State::Listen) => self.on_syn(segment),
            (Kind::SynAck, State::SynSent) => self.on_syn_ack(segment),
            (Kind::Ack, State::SynReceived) => self.on_handshake_ack(segment),
            (Kind::PshAck, State::Established) => self.on_push(segment),
            (Kind::FinAck, State::Established) | (Kind::FinAck, State::Terminating) => {
                self.on_fin(segment)
            }
            // Plain acknowledgments are reported whatever the state.
            (Kind::Ack, _) => self.on_ack(segment),
            (kind, state) => {
                trace!("{}: ignoring {:?} in {:?}", self.local, kind, state);
                Step::default()
            }
        }
    }

    fn on_syn(&mut self, syn: Segment) -> Step {
        self.remote = Some(syn.source());
        self.ack = syn.seq.wrapping_add(1);

        let isn = self.config.server_isn;
        let mut reply = self.reply(&syn, isn, Flags::syn_ack());
        reply.set_options(option::emit(&option::syn_set(self.config.syn_timestamp)));

        self.seq = isn.wrapping_add(1);
        self.state = State::SynReceived;
        debug!("{}: SYN from {}, answering SYN+ACK", self.local, syn.source());
        Step {
            replies: vec![reply],
            event: None,
        }
    }

    fn on_syn_ack(&mut self, syn_ack: Segment) -> Step {
        self.remote = Some(syn_ack.source());
        self.seq = syn_ack.ack;
        self.ack = syn_ack.seq.wrapping_add(1);
        let reply = self.reply(&syn_ack, self.seq, Flags::ack());

        self.state = State::Established;
        debug!("{}: established with {}", self.local, syn_ack.source());
        Step {
            replies: vec![reply],
            event: Some(self.event(EventKind::Established, syn_ack)),
        }
    }

    fn on_handshake_ack(&mut self, ack: Segment) -> Step {
        self.track(&ack);
        self.state = State::Established;
        debug!("{}: established with {}", self.local, ack.source());
        Step {
            replies: Vec::new(),
            event: Some(self.event(EventKind::Established, ack)),
        }
    }

    fn on_ack(&mut self, ack: Segment) -> Step {
        self.track(&ack);
        Step {
            replies: Vec::new(),
            event: Some(self.event(EventKind::Acknowledged, ack)),
        }
    }

    fn on_push(&mut self, push: Segment) -> Step {
        self.track(&push);
        let mut replies = vec![self.data_ack(&push)];
        if push.payload.is_empty() {
            return Step {
                replies: replies,
                event: None,
            };
        }

        let kind = match self.responder() {
            Some(responder) => {
                let body = responder(&push.payload[..]);
                let mut response = self.reply(&push, self.seq, Flags::psh_ack());
                response.dth = true;
                response.payload = body;
                self.seq = self.seq.wrapping_add(response.payload.len() as u32);
                replies.push(response);

                self.state = State::Terminating;
                debug!("{}: answered {} and set DTH", self.local, push.source());
                EventKind::Data
            }
            None if push.dth => {
                self.state = State::Terminating;
                debug!("{}: {} ended the exchange", self.local, push.source());
                EventKind::Terminated
            }
            None => EventKind::Data,
        };

        Step {
            replies: replies,
            event: Some(self.event(kind, push)),
        }
    }

    /// Acknowledges any data riding on the FIN as well as the FIN itself.
    fn on_fin(&mut self, fin: Segment) -> Step {
        self.seq = fin.ack;
        self.ack = fin.seq.wrapping_add(fin.payload.len() as u32).wrapping_add(1);
        let reply = self.reply(&fin, self.seq, Flags::ack());

        self.state = State::Closed;
        debug!("{}: closed by {}", self.local, fin.source());
        Step {
            replies: vec![reply],
            event: Some(self.event(EventKind::Closed, fin)),
        }
    }

    /// The responder, when this end answers requests itself.
    fn responder(&self) -> Option<crate::config::Responder> {
        if self.role == Role::Server && self.local.port == self.config.app_port {
            self.config.responder.clone()
        } else {
            None
        }
    }

    /// Take the peer's view of the byte stream as ours.
    fn track(&mut self, inbound: &Segment) {
        self.seq = inbound.ack;
        self.ack = inbound.seq.wrapping_add(inbound.payload.len() as u32);
    }

    fn reply(&self, inbound: &Segment, seq: u32, flags: Flags) -> Segment {
        let local = Endpoint::new(inbound.dst_addr, self.local.port);
        let mut reply = Segment::new(local, inbound.source(), seq, self.ack, flags);
        reply.window = self.config.window;
        reply
    }

    fn data_ack(&self, push: &Segment) -> Segment {
        let mut ack = self.reply(push, self.seq, Flags::ack());
        if !self.config.timestamps {
            return ack;
        }
        match option::parse(&push.options) {
            Ok(options) => {
                if let Some(timestamp) = option::timestamp(&options) {
                    ack.set_options(option::emit(&option::data_ack_set(timestamp)));
                }
            }
            Err(err) => warn!("{}: not echoing timestamp: {}", self.local, err),
        }
        ack
    }

    fn event(&self, kind: EventKind, segment: Segment) -> Event {
        Event {
            kind: kind,
            sender: segment.source(),
            segment: segment,
            seq: self.seq,
            ack: self.ack,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ipv4;
    use crate::tcp;

    const CLIENT: Endpoint = Endpoint {
        addr: ipv4::Address([127, 0, 0, 1]),
        port: 50000,
    };
    const SERVER: Endpoint = Endpoint {
        addr: ipv4::Address([127, 0, 0, 1]),
        port: 18000,
    };

    fn segment(from: Endpoint, to: Endpoint, seq: u32, ack: u32, flags: Flags) -> Segment {
        let mut segment = Segment::new(from, to, seq, ack, flags);
        segment.window = 65495;
        segment
    }

    fn push(from: Endpoint, to: Endpoint, seq: u32, ack: u32, payload: &[u8]) -> Segment {
        let mut segment = segment(from, to, seq, ack, Flags::psh_ack());
        segment.payload = payload.to_vec();
        segment
    }

    fn established_server(config: Config) -> Connection {
        let mut server = Connection::listen(config, SERVER);
        server.on_segment(segment(CLIENT, SERVER, 209828892, 0, Flags::syn()));
        server.on_segment(segment(CLIENT, SERVER, 209828893, 1, Flags::ack()));
        assert_eq!(server.state(), State::Established);
        server
    }

    #[test]
    fn test_syn_gets_syn_ack() {
        let mut server = Connection::listen(Config::default(), SERVER);
        let step = server.on_segment(segment(CLIENT, SERVER, 209828892, 0, Flags::syn()));

        assert!(step.event.is_none());
        assert_eq!(step.replies.len(), 1);
        let reply = &step.replies[0];
        assert_eq!(reply.flags, Flags::syn_ack());
        assert_eq!(reply.seq, 0);
        assert_eq!(reply.ack, 209828893);
        assert_eq!(reply.source(), SERVER);
        assert_eq!(reply.destination(), CLIENT);
        assert_eq!(reply.data_offset, 10);
        assert_eq!(reply.options, option::emit(&option::syn_set(3766008248)));
        assert_eq!(server.state(), State::SynReceived);
        assert_eq!(server.remote(), Some(CLIENT));
    }

    #[test]
    fn test_client_handshake() {
        let mut client = Connection::client(Config::default(), CLIENT);
        let syn = client.connect(SERVER);
        assert_eq!(syn.kind(), Kind::Syn);
        assert_eq!(syn.seq, 209828892);
        assert_eq!(syn.data_offset, 10);
        assert_eq!(syn.window, 65495);
        assert_eq!(client.state(), State::SynSent);

        // Unrelated acknowledgments do not disturb the handshake.
        let step = client.on_segment(segment(SERVER, CLIENT, 7, 8, Flags::ack()));
        assert_eq!(step.event.unwrap().kind, EventKind::Acknowledged);
        assert_eq!(client.state(), State::SynSent);

        let step = client.on_segment(segment(SERVER, CLIENT, 0, 209828893, Flags::syn_ack()));
        let event = step.event.unwrap();
        assert_eq!(event.kind, EventKind::Established);
        assert_eq!(event.sender, SERVER);
        assert_eq!((event.seq, event.ack), (209828893, 1));

        let ack = &step.replies[0];
        assert_eq!(ack.flags, Flags::ack());
        assert_eq!((ack.seq, ack.ack), (209828893, 1));
        assert_eq!(ack.data_offset, 5);
        assert_eq!(client.state(), State::Established);
    }

    #[test]
    fn test_server_handshake_with_stray_ack() {
        let mut server = Connection::listen(Config::default(), SERVER);
        let step = server.on_segment(segment(CLIENT, SERVER, 1, 1, Flags::ack()));
        assert_eq!(step.event.unwrap().kind, EventKind::Acknowledged);
        assert_eq!(server.state(), State::Listen);

        server.on_segment(segment(CLIENT, SERVER, 209828892, 0, Flags::syn()));
        let step = server.on_segment(segment(CLIENT, SERVER, 209828893, 1, Flags::ack()));
        assert!(step.replies.is_empty());
        assert_eq!(step.event.unwrap().kind, EventKind::Established);
        assert_eq!(server.state(), State::Established);
        assert_eq!((server.seq(), server.ack()), (1, 209828893));
    }

    #[test]
    fn test_app_port_answers_with_dth() {
        let config = Config::default().with_responder(|request| {
            let mut body = b"re: ".to_vec();
            body.extend_from_slice(request);
            body
        });
        let mut server = established_server(config);

        let step = server.on_segment(push(CLIENT, SERVER, 209828893, 1, b"hoge"));
        assert_eq!(step.replies.len(), 2);

        let ack = &step.replies[0];
        assert_eq!(ack.flags, Flags::ack());
        assert_eq!((ack.seq, ack.ack), (1, 209828897));
        assert!(!ack.dth);

        let response = &step.replies[1];
        assert_eq!(response.flags, Flags::psh_ack());
        assert!(response.dth);
        assert_eq!((response.seq, response.ack), (1, 209828897));
        assert_eq!(response.payload, b"re: hoge");

        let event = step.event.unwrap();
        assert_eq!(event.kind, EventKind::Data);
        assert_eq!(event.payload(), b"hoge");
        assert_eq!(server.state(), State::Terminating);
        assert_eq!(server.seq(), 9);
    }

    #[test]
    fn test_other_port_delivers_data() {
        let mut config = Config::default().with_responder(|_| b"unused".to_vec());
        config.app_port = 8080;
        let mut server = established_server(config);

        let step = server.on_segment(push(CLIENT, SERVER, 209828893, 1, b"hoge"));
        assert_eq!(step.replies.len(), 1);
        assert_eq!(step.event.unwrap().kind, EventKind::Data);
        assert_eq!(server.state(), State::Established);
    }

    #[test]
    fn test_dth_terminates_client() {
        let mut client = Connection::client(Config::default(), CLIENT);
        client.connect(SERVER);
        client.on_segment(segment(SERVER, CLIENT, 0, 209828893, Flags::syn_ack()));

        let mut response = push(SERVER, CLIENT, 1, 209828897, b"bye");
        response.dth = true;
        let step = client.on_segment(response);
        let event = step.event.unwrap();
        assert_eq!(event.kind, EventKind::Terminated);
        assert_eq!(event.payload(), b"bye");
        assert_eq!(step.replies[0].ack, 4);
        assert_eq!(client.state(), State::Terminating);
    }

    #[test]
    fn test_empty_push_is_only_acknowledged() {
        let mut server = established_server(Config::default());
        let step = server.on_segment(push(CLIENT, SERVER, 209828893, 1, b""));
        assert_eq!(step.replies.len(), 1);
        assert!(step.event.is_none());
    }

    #[test]
    fn test_fin_closes() {
        let mut server = established_server(Config::default());
        let step = server.on_segment(segment(CLIENT, SERVER, 209828893, 1, Flags::fin_ack()));
        assert_eq!(step.event.unwrap().kind, EventKind::Closed);
        let ack = &step.replies[0];
        assert_eq!(ack.flags, Flags::ack());
        assert_eq!((ack.seq, ack.ack), (1, 209828894));
        assert_eq!(server.state(), State::Closed);
    }

    #[test]
    fn test_fin_carrying_data() {
        let mut server = established_server(Config::default());
        let mut fin = segment(CLIENT, SERVER, 209828893, 1, Flags::fin_ack());
        fin.payload = b"bye".to_vec();
        let step = server.on_segment(fin);

        // The data and the FIN are both acknowledged.
        assert_eq!(step.replies[0].ack, 209828893 + 3 + 1);
        assert_eq!(server.ack(), 209828897);
        assert_eq!(step.event.unwrap().payload(), b"bye");
    }

    #[test]
    fn test_sequence_wraps() {
        let mut config = Config::default();
        config.client_isn = u32::max_value();
        let mut server = Connection::listen(config.clone(), SERVER);
        let step = server.on_segment(segment(CLIENT, SERVER, u32::max_value(), 0, Flags::syn()));
        assert_eq!(step.replies[0].ack, 0);

        let mut client = Connection::client(config, CLIENT);
        let syn = client.connect(SERVER);
        assert_eq!(syn.seq, u32::max_value());
        assert_eq!(client.seq(), 0);
    }

    #[test]
    fn test_timestamp_echo() {
        let mut config = Config::default();
        config.timestamps = true;
        let mut server = established_server(config);

        let mut request = push(CLIENT, SERVER, 209828893, 1, b"hoge");
        request.set_options(option::emit(&option::data_ack_set(0x01020304)));
        let step = server.on_segment(request);
        let ack = &step.replies[0];
        assert_eq!(ack.data_offset, 8);
        assert_eq!(option::timestamp(&option::parse(&ack.options).unwrap()), Some(0x01020304));
    }

    #[test]
    fn test_unexpected_segments_are_ignored() {
        let mut client = Connection::client(Config::default(), CLIENT);
        client.connect(SERVER);

        let rst = Flags { rst: true, ..Flags::default() };
        let step = client.on_segment(segment(SERVER, CLIENT, 0, 0, rst));
        assert!(step.replies.is_empty() && step.event.is_none());

        // Data before the handshake completed.
        let step = client.on_segment(push(SERVER, CLIENT, 0, 0, b"early"));
        assert!(step.replies.is_empty() && step.event.is_none());
        assert_eq!(client.state(), State::SynSent);
    }

    #[test]
    fn test_replies_encode() {
        let mut server = Connection::listen(Config::default(), SERVER);
        let step = server.on_segment(segment(CLIENT, SERVER, 209828892, 0, Flags::syn()));
        let bytes = step.replies[0].encode().unwrap();
        let packet = tcp::Packet::new(&bytes[..]).unwrap();
        assert!(packet.checksum_valid(&SERVER.addr, &CLIENT.addr));
    }
}
