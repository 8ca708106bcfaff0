//! TCP options.
//!
//! Only the kinds this stack emits or meets on loopback are understood. There is no
//! skip-by-length fallback: any other kind aborts the parse.
use crate::error::{Error, Result};

use byteorder::{ByteOrder, NetworkEndian};

pub const END_OF_LIST: u8 = 0;
pub const NO_OPERATION: u8 = 1;
pub const MAXIMUM_SEGMENT_SIZE: u8 = 2;
pub const WINDOW_SCALE: u8 = 3;
pub const SACK_PERMITTED: u8 = 4;
pub const TIMESTAMPS: u8 = 8;

/// Advertised in every SYN, the loopback MTU minus headers.
pub const SYN_MSS: u16 = 65495;
pub const SYN_WINDOW_SHIFT: u8 = 7;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TcpOption {
    EndOfList,
    NoOp,
    MaximumSegmentSize(u16),
    WindowScale(u8),
    SackPermitted,
    Timestamp { value: u32, echo: u32 },
}

impl TcpOption {
    pub fn kind(&self) -> u8 {
        match *self {
            TcpOption::EndOfList => END_OF_LIST,
            TcpOption::NoOp => NO_OPERATION,
            TcpOption::MaximumSegmentSize(_) => MAXIMUM_SEGMENT_SIZE,
            TcpOption::WindowScale(_) => WINDOW_SCALE,
            TcpOption::SackPermitted => SACK_PERMITTED,
            TcpOption::Timestamp { .. } => TIMESTAMPS,
        }
    }

    /// Encoded length, kind byte included.
    pub fn len(&self) -> usize {
        match *self {
            TcpOption::EndOfList | TcpOption::NoOp => 1,
            TcpOption::MaximumSegmentSize(_) => 4,
            TcpOption::WindowScale(_) => 3,
            TcpOption::SackPermitted => 2,
            TcpOption::Timestamp { .. } => 10,
        }
    }

    /// Parse one option off the front of `data`, returning it with the rest.
    pub fn parse(data: &[u8]) -> Result<(TcpOption, &[u8])> {
        let kind = *data.first().ok_or(Error::MalformedSegment)?;
        let option = match kind {
            END_OF_LIST => TcpOption::EndOfList,
            NO_OPERATION => TcpOption::NoOp,
            MAXIMUM_SEGMENT_SIZE => {
                let body = body(data, 4)?;
                TcpOption::MaximumSegmentSize(NetworkEndian::read_u16(body))
            }
            WINDOW_SCALE => TcpOption::WindowScale(body(data, 3)?[0]),
            SACK_PERMITTED => {
                body(data, 2)?;
                TcpOption::SackPermitted
            }
            TIMESTAMPS => {
                let body = body(data, 10)?;
                TcpOption::Timestamp {
                    value: NetworkEndian::read_u32(&body[..4]),
                    echo: NetworkEndian::read_u32(&body[4..]),
                }
            }
            other => return Err(Error::UnknownOption(other)),
        };
        Ok((option, &data[option.len()..]))
    }

    pub fn emit(&self, out: &mut Vec<u8>) {
        out.push(self.kind());
        if self.len() > 1 {
            out.push(self.len() as u8);
        }
        match *self {
            TcpOption::MaximumSegmentSize(value) => {
                let mut bytes = [0; 2];
                NetworkEndian::write_u16(&mut bytes, value);
                out.extend_from_slice(&bytes);
            }
            TcpOption::WindowScale(shift) => out.push(shift),
            TcpOption::Timestamp { value, echo } => {
                let mut bytes = [0; 8];
                NetworkEndian::write_u32(&mut bytes[..4], value);
                NetworkEndian::write_u32(&mut bytes[4..], echo);
                out.extend_from_slice(&bytes);
            }
            TcpOption::EndOfList
            | TcpOption::NoOp
            | TcpOption::SackPermitted => (),
        }
    }
}

/// Checks the length byte and returns the bytes following it.
fn body(data: &[u8], len: usize) -> Result<&[u8]> {
    if data.len() < len || data[1] as usize != len {
        return Err(Error::MalformedSegment);
    }
    Ok(&data[2..len])
}

/// Decode an options blob in order. Parsing stops after an end-of-list marker.
pub fn parse(data: &[u8]) -> Result<Vec<TcpOption>> {
    let mut options = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let (option, next) = TcpOption::parse(rest)?;
        options.push(option);
        if option == TcpOption::EndOfList {
            break;
        }
        rest = next;
    }
    Ok(options)
}

pub fn emit(options: &[TcpOption]) -> Vec<u8> {
    let mut out = Vec::with_capacity(options.iter().map(TcpOption::len).sum());
    for option in options {
        option.emit(&mut out);
    }
    out
}

/// The fixed option set sent with SYN and SYN+ACK.
pub fn syn_set(timestamp: u32) -> Vec<TcpOption> {
    vec![
        TcpOption::MaximumSegmentSize(SYN_MSS),
        TcpOption::SackPermitted,
        TcpOption::Timestamp { value: timestamp, echo: 0 },
        TcpOption::NoOp,
        TcpOption::WindowScale(SYN_WINDOW_SHIFT),
    ]
}

/// The option set for data and acknowledgments, echoing the peer's timestamp back.
pub fn data_ack_set(timestamp: u32) -> Vec<TcpOption> {
    vec![
        TcpOption::NoOp,
        TcpOption::NoOp,
        TcpOption::Timestamp { value: timestamp, echo: timestamp },
    ]
}

pub fn timestamp(options: &[TcpOption]) -> Option<u32> {
    options.iter().filter_map(|option| match *option {
        TcpOption::Timestamp { value, .. } => Some(value),
        _ => None,
    }).next()
}
