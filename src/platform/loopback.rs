use super::{Network, Receive};
use crate::ipv4;

use std::cmp;
use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A software medium shared by every clone.
///
/// Like a raw socket, each receiver sees every datagram sent, whoever it is addressed to.
/// Datagrams carry a real IPv4 header so the receive path is the same as on the host.
#[derive(Clone, Default)]
pub struct Loopback {
    taps: Arc<Mutex<Vec<mpsc::Sender<Vec<u8>>>>>,
}

pub struct LoopbackReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
    timeout: Duration,
}

impl Loopback {
    pub fn new() -> Self {
        Loopback::default()
    }
}

impl Network for Loopback {
    type Receiver = LoopbackReceiver;

    fn receiver(&self, _local: ipv4::Address, timeout: Duration) -> io::Result<LoopbackReceiver> {
        let (tx, rx) = mpsc::channel();
        self.taps.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(tx);
        Ok(LoopbackReceiver {
            rx: rx,
            timeout: timeout,
        })
    }

    fn send(&self, src: ipv4::Address, dst: ipv4::Address, segment: &[u8]) -> io::Result<usize> {
        let repr = ipv4::Repr {
            src_addr: src,
            dst_addr: dst,
            payload_len: segment.len(),
        };
        let mut datagram = vec![0; repr.buffer_len()];
        {
            let mut packet = ipv4::Packet::new_unchecked(&mut datagram[..]);
            repr.emit(&mut packet);
            packet.payload_mut().copy_from_slice(segment);
        }

        // Receivers that went away are forgotten.
        let mut taps = self.taps.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        taps.retain(|tap| tap.send(datagram.clone()).is_ok());
        Ok(segment.len())
    }
}

impl Receive for LoopbackReceiver {
    fn recv(&mut self, buffer: &mut [u8]) -> io::Result<Option<usize>> {
        match self.rx.recv_timeout(self.timeout) {
            Ok(datagram) => {
                let len = cmp::min(datagram.len(), buffer.len());
                buffer[..len].copy_from_slice(&datagram[..len]);
                Ok(Some(len))
            }
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(io::Error::from(io::ErrorKind::BrokenPipe))
            }
        }
    }
}
