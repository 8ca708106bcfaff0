use crate::error::{Error, Result};

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use byteorder::{ByteOrder, NetworkEndian};

pub const TCP_PROTOCOL: u8 = 6;

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Address(pub [u8; 4]);

impl Address {
    pub const LOCALHOST: Address = Address([127, 0, 0, 1]);

    pub fn from_bytes(data: &[u8]) -> Self {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(data);
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_u32(&self) -> u32 {
        NetworkEndian::read_u32(&self.0)
    }
}

impl From<Ipv4Addr> for Address {
    fn from(addr: Ipv4Addr) -> Self {
        Address(addr.octets())
    }
}

impl From<Address> for Ipv4Addr {
    fn from(addr: Address) -> Self {
        Ipv4Addr::from(addr.0)
    }
}

impl FromStr for Address {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<Ipv4Addr>().map(Address::from)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    type Field = ::core::ops::Range<usize>;

    pub const VER_IHL: usize = 0;
    pub const DSCP_ECN: usize = 1;
    pub const LENGTH: Field = 2..4;
    pub const ID: Field = 4..6;
    pub const FLG_OFF: Field = 6..8;
    pub const TTL: usize = 8;
    pub const PROTOCOL: usize = 9;
    pub const CHECKSUM: Field = 10..12;
    pub const SRC_ADDR: Field = 12..16;
    pub const DST_ADDR: Field = 16..20;
}

pub const HEADER_LEN: usize = field::DST_ADDR.end;

impl<T: AsRef<[u8]>> Packet<T> {
    pub fn new(buffer: T) -> Result<Self> {
        let len = buffer.as_ref().len();
        if len < field::DST_ADDR.end {
            Err(Error::Truncated)
        } else {
            let packet = Packet { buffer: buffer };
            let header_len = packet.header_len() as usize;
            if header_len < field::DST_ADDR.end || len < header_len {
                Err(Error::Truncated)
            } else {
                Ok(packet)
            }
        }
    }

    /// Wrap a buffer without validating it, for emitting into zeroed memory.
    pub fn new_unchecked(buffer: T) -> Self {
        Packet { buffer: buffer }
    }

    #[inline]
    pub fn version(&self) -> u8 {
        let buf = self.buffer.as_ref();
        buf[field::VER_IHL] >> 4
    }

    #[inline]
    pub fn header_len(&self) -> u8 {
        let buf = self.buffer.as_ref();
        (buf[field::VER_IHL] & 0x0F) * 4
    }

    #[inline]
    pub fn dscp(&self) -> u8 {
        let buf = self.buffer.as_ref();
        buf[field::DSCP_ECN] >> 2
    }

    #[inline]
    pub fn ecn(&self) -> u8 {
        let buf = self.buffer.as_ref();
        buf[field::DSCP_ECN] & 0b11
    }

    #[inline]
    pub fn total_len(&self) -> u16 {
        let buf = self.buffer.as_ref();
        NetworkEndian::read_u16(&buf[field::LENGTH])
    }

    #[inline]
    pub fn identification(&self) -> u16 {
        let buf = self.buffer.as_ref();
        NetworkEndian::read_u16(&buf[field::ID])
    }

    /// Don't Fragment (DF) flag
    #[inline]
    pub fn flag_df(&self) -> bool {
        let buf = self.buffer.as_ref();
        buf[field::FLG_OFF.start] & 0x40 != 0
    }

    /// More Fragments (MF) flag
    #[inline]
    pub fn flag_mf(&self) -> bool {
        let buf = self.buffer.as_ref();
        buf[field::FLG_OFF.start] & 0x20 != 0
    }

    #[inline]
    pub fn fragment_offset(&self) -> u16 {
        let buf = self.buffer.as_ref();
        (NetworkEndian::read_u16(&buf[field::FLG_OFF]) & 0x1FFF) << 3
    }

    #[inline]
    pub fn ttl(&self) -> u8 {
        let buf = self.buffer.as_ref();
        buf[field::TTL]
    }

    #[inline]
    pub fn protocol(&self) -> u8 {
        let buf = self.buffer.as_ref();
        buf[field::PROTOCOL]
    }

    #[inline]
    pub fn checksum(&self) -> u16 {
        let buf = self.buffer.as_ref();
        NetworkEndian::read_u16(&buf[field::CHECKSUM])
    }

    #[inline]
    pub fn src_addr(&self) -> Address {
        let buf = self.buffer.as_ref();
        Address::from_bytes(&buf[field::SRC_ADDR])
    }

    #[inline]
    pub fn dst_addr(&self) -> Address {
        let buf = self.buffer.as_ref();
        Address::from_bytes(&buf[field::DST_ADDR])
    }

    pub fn checksum_valid(&self) -> bool {
        let buf = self.buffer.as_ref();
        checksum::compute(&buf[..self.header_len() as usize], 0) == 0
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let buf = self.buffer.as_ref();
        &buf[self.header_len() as usize..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    #[inline]
    pub fn set_version(&mut self, version: u8) {
        let buf = self.buffer.as_mut();
        buf[field::VER_IHL] = (buf[field::VER_IHL] & 0x0F) | ((version & 0x0F) << 4);
    }

    #[inline]
    pub fn set_header_len(&mut self, length: u8) {
        let buf = self.buffer.as_mut();
        buf[field::VER_IHL] = (buf[field::VER_IHL] & 0xF0) | ((length / 4) & 0x0F);
    }

    #[inline]
    pub fn set_dscp(&mut self, value: u8) {
        let buf = self.buffer.as_mut();
        buf[field::DSCP_ECN] = (buf[field::DSCP_ECN] & 0x03) | ((value << 2) & 0xFC);
    }

    #[inline]
    pub fn set_ecn(&mut self, value: u8) {
        let buf = self.buffer.as_mut();
        buf[field::DSCP_ECN] = (buf[field::DSCP_ECN] & 0xFC) | (value & 0x03);
    }

    #[inline]
    pub fn set_total_len(&mut self, length: u16) {
        let buf = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut buf[field::LENGTH], length);
    }

    #[inline]
    pub fn set_identification(&mut self, value: u16) {
        let buf = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut buf[field::ID], value)
    }

    /// Don't Fragment (DF) flag
    #[inline]
    pub fn set_flag_df(&mut self, flag: bool) {
        let buf = self.buffer.as_mut();
        buf[field::FLG_OFF.start] =
            (buf[field::FLG_OFF.start] & !0x40) | (if flag { 0x40 } else { 0 });
    }

    /// More Fragments (MF) flag
    #[inline]
    pub fn set_flag_mf(&mut self, flag: bool) {
        let buf = self.buffer.as_mut();
        buf[field::FLG_OFF.start] =
            (buf[field::FLG_OFF.start] & !0x20) | (if flag { 0x20 } else { 0 });
    }

    #[inline]
    pub fn set_ttl(&mut self, value: u8) {
        let buf = self.buffer.as_mut();
        buf[field::TTL] = value;
    }

    #[inline]
    pub fn set_protocol(&mut self, protocol: u8) {
        let buf = self.buffer.as_mut();
        buf[field::PROTOCOL] = protocol;
    }

    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        let buf = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut buf[field::CHECKSUM], value);
    }

    #[inline]
    pub fn set_src_addr(&mut self, addr: &Address) {
        let buf = self.buffer.as_mut();
        buf[field::SRC_ADDR].copy_from_slice(addr.as_bytes());
    }

    #[inline]
    pub fn set_dst_addr(&mut self, addr: &Address) {
        let buf = self.buffer.as_mut();
        buf[field::DST_ADDR].copy_from_slice(addr.as_bytes());
    }

    pub fn fill_checksum(&mut self) {
        self.set_checksum(0);
        let sum = {
            let len = self.header_len() as usize;
            let buf = self.buffer.as_ref();
            checksum::compute(&buf[..len], 0)
        };
        self.set_checksum(sum);
    }
}

impl<'a, T: AsRef<[u8]> + AsMut<[u8]> + ?Sized> Packet<&'a mut T> {
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.header_len() as usize;
        let buf = self.buffer.as_mut();
        &mut buf[start..]
    }
}

impl<T: AsRef<[u8]>> fmt::Debug for Packet<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Ipv4Packet")
            .field("ihl", &self.header_len())
            .field("dscp", &self.dscp())
            .field("ecn", &self.ecn())
            .field("identification", &self.identification())
            .field("df", &self.flag_df())
            .field("mf", &self.flag_mf())
            .field("ttl", &self.ttl())
            .field("protocol", &self.protocol())
            .field("checksum", &self.checksum())
            .field("src_addr", &self.src_addr())
            .field("dst_addr", &self.dst_addr())
            .finish()
    }
}

/// The parts of an IPv4 header the tcp layer cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Repr {
    pub src_addr: Address,
    pub dst_addr: Address,
    pub payload_len: usize,
}

impl Repr {
    pub fn parse<T: AsRef<[u8]> + ?Sized>(packet: &Packet<&T>) -> Result<Self> {
        if packet.version() != 4 {
            return Err(Error::Unrecognized);
        }

        if packet.flag_mf() || packet.fragment_offset() != 0 {
            return Err(Error::Fragmented);
        }

        if packet.protocol() != TCP_PROTOCOL {
            return Err(Error::UnknownProtocol);
        }

        if !packet.checksum_valid() {
            return Err(Error::Checksum);
        }

        let total_len = packet.total_len() as usize;
        let header_len = packet.header_len() as usize;
        if total_len < header_len {
            return Err(Error::Truncated);
        }
        let payload_len = total_len - header_len;
        if packet.payload().len() < payload_len {
            return Err(Error::Truncated);
        }

        Ok(Repr {
            src_addr: packet.src_addr(),
            dst_addr: packet.dst_addr(),
            payload_len: payload_len,
        })
    }

    pub fn buffer_len(&self) -> usize {
        HEADER_LEN + self.payload_len
    }

    /// Write a plain 20 byte header, as the kernel does for raw sockets without `IP_HDRINCL`.
    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(&self, packet: &mut Packet<T>) {
        packet.set_version(4);
        packet.set_header_len(HEADER_LEN as u8);
        packet.set_dscp(0);
        packet.set_ecn(0);
        packet.set_total_len(self.buffer_len() as u16);
        packet.set_identification(0);
        packet.set_flag_df(true);
        packet.set_flag_mf(false);
        packet.set_ttl(64);
        packet.set_protocol(TCP_PROTOCOL);
        packet.set_src_addr(&self.src_addr);
        packet.set_dst_addr(&self.dst_addr);
        packet.fill_checksum();
    }
}

/// Internet checksum, RFC 1071.
pub mod checksum {
    use super::{Address, TCP_PROTOCOL};
    use byteorder::{ByteOrder, NetworkEndian};

    fn propagate_carries(word: u32) -> u16 {
        let mut word = word;
        while (word >> 16) != 0 {
            word = (word & 0xFFFF) + (word >> 16);
        }
        word as u16
    }

    /// Sums big-endian words. An odd trailing byte is summed as if followed by a zero byte.
    pub fn sum(data: &[u8]) -> u32 {
        let mut chunks = data.chunks_exact(2);
        let mut sum = (&mut chunks).fold(0u32, |acc, word| {
            acc + NetworkEndian::read_u16(word) as u32
        });
        if let [last] = chunks.remainder() {
            sum += (*last as u32) << 8;
        }
        sum
    }

    pub fn compute(data: &[u8], start: u32) -> u16 {
        !propagate_carries(start + sum(data))
    }

    /// Partial sum of the virtual header: both addresses, protocol and segment length.
    pub fn pseudo_header(src_addr: &Address, dst_addr: &Address, length: u16) -> u32 {
        let mut header = [0u8; 12];
        header[0..4].copy_from_slice(src_addr.as_bytes());
        header[4..8].copy_from_slice(dst_addr.as_bytes());
        header[9] = TCP_PROTOCOL;
        NetworkEndian::write_u16(&mut header[10..12], length);
        sum(&header)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // 20 byte header + 4 byte payload, 10.0.0.1 -> 10.0.0.2, tcp.
    static PACKET_BYTES: [u8; 24] = [
        0x45, 0x00, 0x00, 0x18,
        0x00, 0x00, 0x40, 0x00,
        0x40, 0x06, 0x26, 0xde,
        0x0a, 0x00, 0x00, 0x01,
        0x0a, 0x00, 0x00, 0x02,
        0xaa, 0x00, 0x00, 0xff,
    ];

    #[test]
    fn test_deconstruct() {
        let packet = Packet::new(&PACKET_BYTES[..]).unwrap();
        assert_eq!(packet.version(), 4);
        assert_eq!(packet.header_len(), 20);
        assert_eq!(packet.total_len(), 24);
        assert!(packet.flag_df());
        assert!(!packet.flag_mf());
        assert_eq!(packet.ttl(), 64);
        assert_eq!(packet.protocol(), TCP_PROTOCOL);
        assert_eq!(packet.src_addr(), Address([10, 0, 0, 1]));
        assert_eq!(packet.dst_addr(), Address([10, 0, 0, 2]));
        assert!(packet.checksum_valid());
        assert_eq!(packet.payload(), &[0xaa, 0x00, 0x00, 0xff]);
    }

    #[test]
    fn test_parse_and_emit() {
        let packet = Packet::new(&PACKET_BYTES[..]).unwrap();
        let repr = Repr::parse(&packet).unwrap();
        assert_eq!(repr, Repr {
            src_addr: Address([10, 0, 0, 1]),
            dst_addr: Address([10, 0, 0, 2]),
            payload_len: 4,
        });

        let mut bytes = vec![0; repr.buffer_len()];
        {
            let mut packet = Packet::new_unchecked(&mut bytes[..]);
            repr.emit(&mut packet);
            packet.payload_mut().copy_from_slice(&[0xaa, 0x00, 0x00, 0xff]);
        }
        assert_eq!(&bytes[..], &PACKET_BYTES[..]);
    }

    #[test]
    fn test_reject_other_protocols() {
        let mut bytes = PACKET_BYTES;
        bytes[9] = 17;
        let packet = Packet::new(&bytes[..]).unwrap();
        match Repr::parse(&packet) {
            Err(Error::UnknownProtocol) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_truncated() {
        assert!(Packet::new(&PACKET_BYTES[..12]).is_err());
    }

    #[test]
    fn test_checksum_odd_length() {
        // The trailing byte is treated as the high half of a padded word.
        assert_eq!(checksum::sum(&[0x12, 0x34, 0x56]), 0x1234 + 0x5600);
        assert_eq!(checksum::compute(&[0xff, 0xff], 0), 0);
    }

    #[test]
    fn test_address_text() {
        let addr: Address = "127.0.0.1".parse().unwrap();
        assert_eq!(addr, Address::LOCALHOST);
        assert_eq!(addr.to_string(), "127.0.0.1");
        assert_eq!(addr.as_u32(), 0x7f000001);
    }
}
