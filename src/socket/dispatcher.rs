use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{Connection, Event, State};
use crate::error::{Error, Result};
use crate::ipv4;
use crate::platform::{self, Network, Receive};
use crate::tcp;

pub type EventSender = mpsc::SyncSender<Result<Event>>;

/// Owns the thread that reads raw datagrams for one local port and feeds them to a
/// `Connection`.
///
/// The thread ends on its own after the connection closes, after a socket error, or when the
/// event receiver is dropped. Dropping the dispatcher stops it and waits for it.
pub struct Dispatcher {
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Dispatcher {
    /// The receive side is opened before returning, so nothing sent after this can be missed.
    pub fn spawn<N: Network>(net: N,
                             connection: Connection,
                             events: EventSender,
                             timeout: Duration)
                             -> Result<Self> {
        let local = connection.local();
        let receiver = net.receiver(local.addr, timeout)?;
        let running = Arc::new(AtomicBool::new(true));

        let thread = {
            let running = running.clone();
            thread::Builder::new()
                .name(format!("dispatch-{}", local.port))
                .spawn(move || run(net, receiver, connection, running, events))?
        };
        debug!("dispatcher started for {}", local);

        Ok(Dispatcher {
            running: running,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);

        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("dispatcher thread panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<N: Network>(net: N,
                   mut receiver: N::Receiver,
                   mut connection: Connection,
                   running: Arc<AtomicBool>,
                   events: EventSender) {
    let local = connection.local();
    let mut buf = [0; platform::MTU];

    while running.load(Ordering::Relaxed) {
        let len = match receiver.recv(&mut buf) {
            Ok(Some(len)) => len,
            Ok(None) => continue,
            Err(err) => {
                error!("{}: receive failed: {}", local, err);
                let _ = events.send(Err(Error::Socket(err)));
                break;
            }
        };

        let segment = match decode(&buf[..len]) {
            Ok(segment) => segment,
            Err(Error::UnknownProtocol) => continue,
            Err(err) => {
                trace!("{}: skipping datagram: {}", local, err);
                continue;
            }
        };
        if segment.dst_port != local.port {
            continue;
        }
        debug!("{}: <- {} {:?} seq={} ack={} len={}",
               local,
               segment.source(),
               segment.flags,
               segment.seq,
               segment.ack,
               segment.payload.len());

        let step = connection.on_segment(segment);
        let sent: Result<()> = step.replies.iter().map(|reply| transmit(&net, reply)).collect();
        if let Err(err) = sent {
            error!("{}: reply failed: {}", local, err);
            let _ = events.send(Err(err));
            break;
        }
        if let Some(event) = step.event {
            if events.send(Ok(event)).is_err() {
                debug!("{}: session went away", local);
                break;
            }
        }
        if connection.state() == State::Closed {
            break;
        }
    }

    running.store(false, Ordering::Relaxed);
    debug!("dispatcher for {} stopped", local);
}

/// Pull the TCP segment out of a raw IPv4 datagram.
pub fn decode(datagram: &[u8]) -> Result<tcp::Segment> {
    let packet = ipv4::Packet::new(datagram)?;
    let repr = ipv4::Repr::parse(&packet)?;
    tcp::Segment::decode(&packet.payload()[..repr.payload_len], repr.src_addr, repr.dst_addr)
}

/// Encode `segment` and hand it to the network, addressed by its own addresses.
pub fn transmit<N: Network>(net: &N, segment: &tcp::Segment) -> Result<()> {
    let bytes = segment.encode()?;
    net.send(segment.src_addr, segment.dst_addr, &bytes)?;
    debug!("{}: -> {} {:?} seq={} ack={} len={}",
           segment.source(),
           segment.destination(),
           segment.flags,
           segment.seq,
           segment.ack,
           segment.payload.len());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::platform::Loopback;
    use crate::socket::EventKind;
    use crate::tcp::{Endpoint, Flags};

    const CLIENT: Endpoint = Endpoint {
        addr: ipv4::Address([127, 0, 0, 1]),
        port: 50001,
    };
    const SERVER: Endpoint = Endpoint {
        addr: ipv4::Address([127, 0, 0, 1]),
        port: 18000,
    };

    #[test]
    fn test_decode_datagram() {
        let segment = tcp::Segment::new(CLIENT, SERVER, 5, 6, Flags::ack());
        let bytes = segment.encode().unwrap();
        let repr = ipv4::Repr {
            src_addr: CLIENT.addr,
            dst_addr: SERVER.addr,
            payload_len: bytes.len(),
        };
        let mut datagram = vec![0; repr.buffer_len()];
        {
            let mut packet = ipv4::Packet::new_unchecked(&mut datagram[..]);
            repr.emit(&mut packet);
            packet.payload_mut().copy_from_slice(&bytes);
        }

        let decoded = decode(&datagram).unwrap();
        assert_eq!(decoded.source(), CLIENT);
        assert_eq!(decoded.destination(), SERVER);
        assert_eq!((decoded.seq, decoded.ack), (5, 6));
    }

    #[test]
    fn test_answers_syn_and_filters_ports() {
        let net = Loopback::new();
        let timeout = Duration::from_millis(10);
        let mut sniffer = net.receiver(CLIENT.addr, Duration::from_secs(1)).unwrap();

        let (tx, rx) = mpsc::sync_channel(1);
        let connection = Connection::listen(Config::default(), SERVER);
        let _dispatcher = Dispatcher::spawn(net.clone(), connection, tx, timeout).unwrap();

        // Addressed to someone else.
        let stray = tcp::Segment::new(CLIENT, Endpoint::new(SERVER.addr, 9), 1, 0, Flags::syn());
        transmit(&net, &stray).unwrap();
        transmit(&net, &tcp::Segment::new(CLIENT, SERVER, 100, 0, Flags::syn())).unwrap();

        let mut buf = [0; platform::MTU];
        let syn_ack = loop {
            let len = sniffer.recv(&mut buf).unwrap().expect("no SYN+ACK");
            let segment = decode(&buf[..len]).unwrap();
            if segment.dst_port == CLIENT.port && segment.src_port == SERVER.port {
                break segment;
            }
        };
        assert_eq!(syn_ack.flags, Flags::syn_ack());
        assert_eq!(syn_ack.ack, 101);

        transmit(&net, &tcp::Segment::new(CLIENT, SERVER, 101, 1, Flags::ack())).unwrap();
        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Established);
        assert_eq!(event.sender, CLIENT);
    }

    #[test]
    fn test_stops_after_close() {
        let net = Loopback::new();
        let timeout = Duration::from_millis(10);
        let (tx, rx) = mpsc::sync_channel(1);
        let mut connection = Connection::client(Config::default(), CLIENT);
        connection.connect(SERVER);
        let dispatcher = Dispatcher::spawn(net.clone(), connection, tx, timeout).unwrap();

        let syn_ack = tcp::Segment::new(SERVER, CLIENT, 0, 209828893, Flags::syn_ack());
        transmit(&net, &syn_ack).unwrap();
        assert_eq!(rx.recv().unwrap().unwrap().kind, EventKind::Established);

        transmit(&net, &tcp::Segment::new(SERVER, CLIENT, 1, 209828893, Flags::fin_ack())).unwrap();
        assert_eq!(rx.recv().unwrap().unwrap().kind, EventKind::Closed);

        // The thread drops its sender on the way out.
        assert!(rx.recv().is_err());
        assert!(!dispatcher.is_running());
    }
}
