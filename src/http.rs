//! Just enough HTTP/1.1 text to demonstrate an exchange: GET and POST requests, a canned
//! `200 OK`, a lenient response parser and a serve loop.
use rand::Rng;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::ipv4;
use crate::platform::Network;
use crate::socket::{EventKind, Listener, Socket};
use crate::tcp::Endpoint;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Response {
    /// Zero when no status line was found.
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|&&(ref key, _)| key.eq_ignore_ascii_case(name))
            .map(|&(_, ref value)| value.as_str())
    }
}

/// The request curl would send for `/`, with bare `\n` line endings.
pub fn request_get(host: &str, port: u16) -> Vec<u8> {
    format!("GET / HTTP/1.1\nHost: {}:{}\nUser-Agent: curl/7.81.0\nAccept: */*\n\n",
            host,
            port)
        .into_bytes()
}

/// Like `request_get`, with `body` sent as a form and its length in bytes.
pub fn request_post(host: &str, port: u16, body: &str) -> Vec<u8> {
    format!("POST / HTTP/1.1\nHost: {}:{}\nUser-Agent: curl/7.81.0\nAccept: */*\n\
             Content-Length: {}\nContent-Type: application/x-www-form-urlencoded\n\n{}",
            host,
            port,
            body.len(),
            body)
        .into_bytes()
}

/// The date is fixed.
pub fn response_ok(body: &str) -> Vec<u8> {
    format!("HTTP/1.1 200 OK\r\nDate: Sun, 04 Jun 2023 10:15:28 GMT\r\nContent-Length: \
             {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}",
            body.len(),
            body)
        .into_bytes()
}

/// Status, headers and body. The body is the last `Content-Length` bytes when that header is
/// present, otherwise whatever follows the blank line.
pub fn parse_response(text: &str) -> Response {
    let (head, rest) = match text.find("\r\n\r\n") {
        Some(end) => (&text[..end], &text[end + 4..]),
        None => (text, ""),
    };

    let mut response = Response::default();
    for line in head.split("\r\n") {
        if line.starts_with("HTTP/1.1 ") {
            response.status = line.split(' ').nth(1).and_then(|s| s.parse().ok()).unwrap_or(0);
        } else if let Some(split) = line.find(": ") {
            response.headers.push((line[..split].to_string(), line[split + 2..].to_string()));
        }
    }

    let length = response.header("Content-Length").and_then(|len| len.parse::<usize>().ok());
    response.body = match length {
        Some(len) if len <= text.len() && text.is_char_boundary(text.len() - len) => {
            text[text.len() - len..].to_string()
        }
        _ => rest.to_string(),
    };
    response
}

/// A server-side responder that answers every request with `200 OK` and `body`.
pub fn responder(body: &str) -> impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static {
    let response = response_ok(body);
    move |request: &[u8]| {
        debug!("answering {} byte request", request.len());
        response.clone()
    }
}

/// Dial `server:port` over raw sockets, send a GET, close and return the reply text.
///
/// A reply ending the session with DTH is still an error, carrying the reply.
pub fn get(client: ipv4::Address, server: ipv4::Address, port: u16) -> Result<String> {
    let socket = Socket::dial(client, server, port)?;
    exchange(socket, &request_get(&server.to_string(), port))
}

pub fn get_with<N: Network, R: Rng + ?Sized>(net: N,
                                             config: Config,
                                             rng: &mut R,
                                             client: ipv4::Address,
                                             server: Endpoint)
                                             -> Result<String> {
    let socket = Socket::dial_with(net, config, rng, client, server)?;
    exchange(socket, &request_get(&server.addr.to_string(), server.port))
}

/// `get`, posting `body` instead.
pub fn post(client: ipv4::Address,
            server: ipv4::Address,
            port: u16,
            body: &str)
            -> Result<String> {
    let socket = Socket::dial(client, server, port)?;
    exchange(socket, &request_post(&server.to_string(), port, body))
}

pub fn post_with<N: Network, R: Rng + ?Sized>(net: N,
                                              config: Config,
                                              rng: &mut R,
                                              client: ipv4::Address,
                                              server: Endpoint,
                                              body: &str)
                                              -> Result<String> {
    let socket = Socket::dial_with(net, config, rng, client, server)?;
    exchange(socket, &request_post(&server.addr.to_string(), server.port, body))
}

/// Accept sessions on `local` one after the other, answering each request with the configured
/// responder and DTH.
///
/// Only returns when binding or accepting fails. A session that fails is logged and the next
/// one is accepted.
pub fn listen_and_serve<N: Network>(net: N, mut config: Config, local: Endpoint) -> Result<()> {
    config.app_port = local.port;
    loop {
        let listener = Listener::bind(net.clone(), config.clone(), local)?;
        let socket = listener.accept()?;
        serve(socket);
    }
}

fn serve<N: Network>(mut socket: Socket<N>) {
    let remote = socket.remote();
    info!("{}: session with {}", socket.local(), remote);
    loop {
        match socket.wait() {
            Ok(event) => {
                if !event.payload().is_empty() {
                    info!("{}: {:?} {}",
                          remote,
                          event.kind,
                          String::from_utf8_lossy(event.payload()));
                }
                if event.kind == EventKind::Closed {
                    info!("{}: session closed", remote);
                    return;
                }
            }
            Err(err) => {
                error!("session with {} failed: {}", remote, err);
                return;
            }
        }
    }
}

fn exchange<N: Network>(mut socket: Socket<N>, request: &[u8]) -> Result<String> {
    let reply = match socket.write(request) {
        Ok(reply) => Ok(String::from_utf8_lossy(&reply).into_owned()),
        Err(Error::SessionTerminated(reply)) => {
            info!("{}: server ended the session", socket.local());
            Err(Error::SessionTerminated(reply))
        }
        Err(err) => return Err(err),
    };
    socket.close()?;
    reply
}
