use std::sync::mpsc;

use super::{Connection, Dispatcher, Event, EventKind, Role, Socket};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::platform::{Network, RawNetwork};
use crate::tcp::Endpoint;

/// A port waiting for one peer to handshake.
///
/// With a responder configured and `local.port == config.app_port`, the accepted socket answers
/// each request by itself and ends the exchange with DTH.
pub struct Listener<N: Network = RawNetwork> {
    events: mpsc::Receiver<Result<Event>>,
    dispatcher: Dispatcher,
    net: N,
    config: Config,
    local: Endpoint,
}

impl<N: Network> Listener<N> {
    pub fn bind(net: N, config: Config, local: Endpoint) -> Result<Self> {
        let connection = Connection::listen(config.clone(), local);
        let (tx, rx) = mpsc::sync_channel(1);
        let dispatcher = Dispatcher::spawn(net.clone(), connection, tx, config.recv_timeout)?;
        info!("listening on {}", local);

        Ok(Listener {
            events: rx,
            dispatcher: dispatcher,
            net: net,
            config: config,
            local: local,
        })
    }

    pub fn local(&self) -> Endpoint {
        self.local
    }

    /// Block until a peer completes the handshake and hand the session over.
    pub fn accept(self) -> Result<Socket<N>> {
        let Listener { events, dispatcher, net, config, local } = self;
        let established = loop {
            let event = events.recv().map_err(|_| Error::Closed)??;
            if event.kind == EventKind::Established {
                break event;
            }
            trace!("{}: passing over {:?} while listening", local, event.kind);
        };
        info!("{}: accepted {}", local, established.sender);

        let socket = Socket::new(events,
                                 dispatcher,
                                 net,
                                 config,
                                 Role::Server,
                                 local,
                                 established.sender);
        Ok(socket.established(&established))
    }
}
