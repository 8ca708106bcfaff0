//! Where segments meet the wire.
//!
//! `RawNetwork` talks to the host through `AF_INET`/`SOCK_RAW` sockets and needs
//! `CAP_NET_RAW`. `Loopback` is an in-memory stand-in used by the tests.
mod loopback;

pub use self::loopback::{Loopback, LoopbackReceiver};

use crate::ipv4;

use std::cmp;
use std::io;
use std::mem;
use std::time::Duration;

/// Largest datagram a dispatcher reads in one go.
pub const MTU: usize = 1500;

/// A medium that carries TCP segments inside IPv4.
pub trait Network: Clone + Send + 'static {
    type Receiver: Receive;

    /// Open the receive side for `local`. Reads give up after `timeout` so the caller can poll a
    /// stop flag.
    fn receiver(&self, local: ipv4::Address, timeout: Duration) -> io::Result<Self::Receiver>;

    /// Transmit one encoded TCP segment; the IPv4 header is added below us.
    fn send(&self, src: ipv4::Address, dst: ipv4::Address, segment: &[u8]) -> io::Result<usize>;
}

pub trait Receive: Send + 'static {
    /// Read one whole IPv4 datagram, header included. `None` when the timeout passed first.
    fn recv(&mut self, buffer: &mut [u8]) -> io::Result<Option<usize>>;
}

/// The host's raw IP sockets.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawNetwork;

impl Network for RawNetwork {
    type Receiver = RawSocket;

    fn receiver(&self, local: ipv4::Address, timeout: Duration) -> io::Result<RawSocket> {
        let socket = RawSocket::open()?;
        socket.bind(local)?;
        socket.set_recv_timeout(timeout)?;
        debug!("raw receive socket bound to {}", local);
        Ok(socket)
    }

    /// Every transmission gets a socket of its own, closed again before returning.
    fn send(&self, src: ipv4::Address, dst: ipv4::Address, segment: &[u8]) -> io::Result<usize> {
        let socket = RawSocket::open()?;
        socket.bind(src)?;
        socket.send_to(dst, segment)
    }
}

/// An owned `SOCK_RAW`/`IPPROTO_TCP` descriptor. The kernel writes the IPv4 header on send and
/// hands it to us on receive.
pub struct RawSocket {
    fd: libc::c_int,
}

fn sockaddr(addr: ipv4::Address) -> libc::sockaddr_in {
    let mut sockaddr: libc::sockaddr_in = unsafe { mem::zeroed() };
    sockaddr.sin_family = libc::AF_INET as libc::sa_family_t;
    sockaddr.sin_port = 0;
    sockaddr.sin_addr = libc::in_addr { s_addr: addr.as_u32().to_be() };
    sockaddr
}

/// A zero `SO_RCVTIMEO` means "block forever", so anything shorter than a microsecond is
/// rounded up to one.
fn timeval(timeout: Duration) -> libc::timeval {
    let timeout = cmp::max(timeout, Duration::from_micros(1));
    libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    }
}

impl RawSocket {
    pub fn open() -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_TCP) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(RawSocket { fd: fd })
    }

    pub fn bind(&self, local: ipv4::Address) -> io::Result<()> {
        let addr = sockaddr(local);
        let res = unsafe {
            libc::bind(self.fd,
                       &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                       mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn set_recv_timeout(&self, timeout: Duration) -> io::Result<()> {
        let tv = timeval(timeout);
        let res = unsafe {
            libc::setsockopt(self.fd,
                             libc::SOL_SOCKET,
                             libc::SO_RCVTIMEO,
                             &tv as *const _ as *const libc::c_void,
                             mem::size_of::<libc::timeval>() as libc::socklen_t)
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn send_to(&self, dest: ipv4::Address, buffer: &[u8]) -> io::Result<usize> {
        let addr = sockaddr(dest);
        let res = unsafe {
            libc::sendto(self.fd,
                         buffer.as_ptr() as *const libc::c_void,
                         buffer.len(),
                         0,
                         &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                         mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(res as usize)
    }
}

impl Receive for RawSocket {
    fn recv(&mut self, buffer: &mut [u8]) -> io::Result<Option<usize>> {
        let res = unsafe {
            libc::recv(self.fd,
                       buffer.as_mut_ptr() as *mut libc::c_void,
                       buffer.len(),
                       0)
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                    Ok(None)
                }
                _ => Err(err),
            };
        }
        Ok(Some(res as usize))
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
