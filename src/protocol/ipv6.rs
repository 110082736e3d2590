//! IPv6 protocol - RFC 8200

use crate::{Error, Result};
use std::net::Ipv6Addr;

/// IPv6 fixed header size (always 40 bytes)
pub const HEADER_SIZE: usize = 40;

/// Fragment extension header size (always 8 bytes)
pub const FRAGMENT_HEADER_SIZE: usize = 8;

/// Next Header value for the fragment extension header.
pub const NEXT_HEADER_FRAGMENT: u8 = 44;

/// IPv6 Next Header values (RFC 8200, IANA assignments)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NextHeader {
    HopByHop = 0,
    Tcp = 6,
    Udp = 17,
    Routing = 43,
    Fragment = 44,
    Icmpv6 = 58,
    NoNextHeader = 59,
    DestinationOptions = 60,
}

impl NextHeader {
    /// Check if this Next Header value indicates an extension header
    pub fn is_extension_header(value: u8) -> bool {
        matches!(value, 0 | 43 | 44 | 60)
    }
}

/// Parsed IPv6 header (zero-copy reference)
#[derive(Debug)]
pub struct Ipv6Header<'a> {
    buffer: &'a [u8],
}

impl<'a> Ipv6Header<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("IPv6 header too short".into()));
        }

        let version = buffer[0] >> 4;
        if version != 6 {
            return Err(Error::Parse("not an IPv6 packet".into()));
        }

        let payload_len = u16::from_be_bytes([buffer[4], buffer[5]]) as usize;
        if buffer.len() < HEADER_SIZE + payload_len {
            return Err(Error::Parse("IPv6 payload length inconsistent".into()));
        }

        Ok(Self { buffer })
    }

    /// Parses a packet embedded in an ICMPv6 error. Such packets are
    /// commonly truncated, so the Payload Length field is not checked
    /// against the buffer; use `trailing()` instead of `payload()`.
    pub fn parse_embedded(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("embedded IPv6 header too short".into()));
        }
        if buffer[0] >> 4 != 6 {
            return Err(Error::Parse("embedded packet is not IPv6".into()));
        }
        Ok(Self { buffer })
    }

    /// The bytes after the fixed header, unbounded by Payload Length. Meant
    /// for embedded (possibly truncated) packets.
    pub fn trailing(&self) -> &[u8] {
        &self.buffer[HEADER_SIZE..]
    }

    /// Traffic Class (8 bits: 6-bit DSCP + 2-bit ECN)
    pub fn traffic_class(&self) -> u8 {
        ((self.buffer[0] & 0x0F) << 4) | (self.buffer[1] >> 4)
    }

    /// Flow Label (20 bits)
    pub fn flow_label(&self) -> u32 {
        let b1 = (self.buffer[1] & 0x0F) as u32;
        let b2 = self.buffer[2] as u32;
        let b3 = self.buffer[3] as u32;
        (b1 << 16) | (b2 << 8) | b3
    }

    /// Payload Length (excludes the 40-byte header)
    pub fn payload_length(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }

    pub fn next_header(&self) -> u8 {
        self.buffer[6]
    }

    pub fn hop_limit(&self) -> u8 {
        self.buffer[7]
    }

    pub fn src_addr(&self) -> Ipv6Addr {
        let bytes: [u8; 16] = self.buffer[8..24].try_into().unwrap();
        Ipv6Addr::from(bytes)
    }

    pub fn dst_addr(&self) -> Ipv6Addr {
        let bytes: [u8; 16] = self.buffer[24..40].try_into().unwrap();
        Ipv6Addr::from(bytes)
    }

    /// Payload (everything after the fixed header, bounded by Payload Length)
    pub fn payload(&self) -> &[u8] {
        &self.buffer[HEADER_SIZE..HEADER_SIZE + self.payload_length() as usize]
    }
}

/// Fragment Header contents (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub next_header: u8,
    /// Offset in bytes (the wire field counts 8-byte units).
    pub fragment_offset: u16,
    pub more_fragments: bool,
    pub identification: u32,
}

impl FragmentHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FRAGMENT_HEADER_SIZE {
            return Err(Error::Parse("fragment header too short".into()));
        }

        let frag_word = u16::from_be_bytes([data[2], data[3]]);
        Ok(Self {
            next_header: data[0],
            fragment_offset: frag_word & 0xFFF8,
            more_fragments: (frag_word & 0x01) != 0,
            identification: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; FRAGMENT_HEADER_SIZE] {
        let frag_word = (self.fragment_offset & 0xFFF8) | (self.more_fragments as u16);
        let mut bytes = [0u8; FRAGMENT_HEADER_SIZE];
        bytes[0] = self.next_header;
        bytes[2..4].copy_from_slice(&frag_word.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.identification.to_be_bytes());
        bytes
    }

    /// Check if this header marks an actual fragment (MF set or offset > 0)
    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.fragment_offset > 0
    }
}

/// Result of walking a header chain up to the upper-layer protocol.
#[derive(Debug)]
pub struct HeaderChain {
    /// The upper-layer protocol (TCP, UDP, ICMPv6, ...)
    pub upper_proto: u8,
    /// Offset of the upper-layer header, relative to the start of the payload
    pub l4_offset: usize,
    /// Fragment header contents, when one was present in the chain
    pub fragment: Option<FragmentHeader>,
}

/// Walk the extension-header chain of "payload" (the bytes after the fixed
/// header), starting from the fixed header's Next Header value.
pub fn walk_header_chain(first_next_header: u8, payload: &[u8]) -> Result<HeaderChain> {
    let mut current_nh = first_next_header;
    let mut offset = 0;
    let mut fragment = None;
    let mut visited = 0;

    while NextHeader::is_extension_header(current_nh) {
        if offset + 2 > payload.len() {
            return Err(Error::Parse("extension header truncated".into()));
        }

        let ext_len = if current_nh == NEXT_HEADER_FRAGMENT {
            FRAGMENT_HEADER_SIZE
        } else {
            (payload[offset + 1] as usize + 1) * 8
        };

        if offset + ext_len > payload.len() {
            return Err(Error::Parse("extension header extends beyond packet".into()));
        }

        if current_nh == NEXT_HEADER_FRAGMENT {
            fragment = Some(FragmentHeader::parse(&payload[offset..])?);
        }

        current_nh = payload[offset];
        offset += ext_len;

        visited += 1;
        if visited > 10 {
            return Err(Error::Parse("too many extension headers".into()));
        }
    }

    Ok(HeaderChain {
        upper_proto: current_nh,
        l4_offset: offset,
        fragment,
    })
}

/// Builder for constructing IPv6 packets
#[derive(Debug, Clone)]
pub struct Ipv6Builder {
    traffic_class: u8,
    flow_label: u32,
    next_header: u8,
    hop_limit: u8,
    src_addr: Ipv6Addr,
    dst_addr: Ipv6Addr,
    payload: Vec<u8>,
}

impl Ipv6Builder {
    pub fn new() -> Self {
        Self {
            traffic_class: 0,
            flow_label: 0,
            next_header: 0,
            hop_limit: 64,
            src_addr: Ipv6Addr::UNSPECIFIED,
            dst_addr: Ipv6Addr::UNSPECIFIED,
            payload: Vec::new(),
        }
    }

    pub fn traffic_class(mut self, tc: u8) -> Self {
        self.traffic_class = tc;
        self
    }

    pub fn flow_label(mut self, label: u32) -> Self {
        self.flow_label = label & 0xFFFFF;
        self
    }

    pub fn next_header(mut self, nh: u8) -> Self {
        self.next_header = nh;
        self
    }

    pub fn hop_limit(mut self, hl: u8) -> Self {
        self.hop_limit = hl;
        self
    }

    pub fn src_addr(mut self, addr: Ipv6Addr) -> Self {
        self.src_addr = addr;
        self
    }

    pub fn dst_addr(mut self, addr: Ipv6Addr) -> Self {
        self.dst_addr = addr;
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn build(self) -> Vec<u8> {
        let payload_len = self.payload.len() as u16;
        let mut buffer = vec![0u8; HEADER_SIZE + self.payload.len()];

        buffer[0] = 0x60 | (self.traffic_class >> 4);
        buffer[1] = (self.traffic_class << 4) | ((self.flow_label >> 16) as u8 & 0x0F);
        buffer[2] = (self.flow_label >> 8) as u8;
        buffer[3] = self.flow_label as u8;
        buffer[4..6].copy_from_slice(&payload_len.to_be_bytes());
        buffer[6] = self.next_header;
        buffer[7] = self.hop_limit;
        buffer[8..24].copy_from_slice(&self.src_addr.octets());
        buffer[24..40].copy_from_slice(&self.dst_addr.octets());
        buffer[HEADER_SIZE..].copy_from_slice(&self.payload);

        buffer
    }
}

impl Default for Ipv6Builder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Vec<u8> {
        Ipv6Builder::new()
            .src_addr("2001:db8::1".parse().unwrap())
            .dst_addr("64:ff9b::c000:201".parse().unwrap())
            .hop_limit(64)
            .next_header(NextHeader::Udp as u8)
            .traffic_class(0xA2)
            .payload(&[1, 2, 3, 4, 5, 6, 7, 8])
            .build()
    }

    #[test]
    fn test_build_and_parse_roundtrip() {
        let packet = sample_packet();
        let hdr = Ipv6Header::parse(&packet).unwrap();

        assert_eq!(hdr.src_addr(), "2001:db8::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(
            hdr.dst_addr(),
            "64:ff9b::c000:201".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(hdr.hop_limit(), 64);
        assert_eq!(hdr.next_header(), 17);
        assert_eq!(hdr.traffic_class(), 0xA2);
        assert_eq!(hdr.payload_length(), 8);
        assert_eq!(hdr.payload(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_parse_too_short() {
        assert!(Ipv6Header::parse(&[0x60; 39]).is_err());
    }

    #[test]
    fn test_parse_wrong_version() {
        let mut packet = sample_packet();
        packet[0] = 0x45;
        assert!(Ipv6Header::parse(&packet).is_err());
    }

    #[test]
    fn test_walk_no_extensions() {
        let packet = sample_packet();
        let hdr = Ipv6Header::parse(&packet).unwrap();
        let chain = walk_header_chain(hdr.next_header(), hdr.payload()).unwrap();

        assert_eq!(chain.upper_proto, 17);
        assert_eq!(chain.l4_offset, 0);
        assert!(chain.fragment.is_none());
    }

    #[test]
    fn test_walk_fragment_header() {
        let frag = FragmentHeader {
            next_header: NextHeader::Udp as u8,
            fragment_offset: 1232,
            more_fragments: true,
            identification: 0x12345678,
        };
        let mut payload = frag.to_bytes().to_vec();
        payload.extend_from_slice(&[1, 2, 3, 4]);

        let packet = Ipv6Builder::new()
            .next_header(NextHeader::Fragment as u8)
            .payload(&payload)
            .build();
        let hdr = Ipv6Header::parse(&packet).unwrap();
        let chain = walk_header_chain(hdr.next_header(), hdr.payload()).unwrap();

        assert_eq!(chain.upper_proto, 17);
        assert_eq!(chain.l4_offset, 8);
        assert_eq!(chain.fragment, Some(frag));
    }

    #[test]
    fn test_fragment_header_roundtrip() {
        let frag = FragmentHeader {
            next_header: 6,
            fragment_offset: 2960,
            more_fragments: false,
            identification: 0xCAFEBABE,
        };
        let parsed = FragmentHeader::parse(&frag.to_bytes()).unwrap();
        assert_eq!(parsed, frag);
        assert!(parsed.is_fragment());
    }

    #[test]
    fn test_walk_truncated_extension() {
        let packet = Ipv6Builder::new()
            .next_header(NextHeader::Fragment as u8)
            .payload(&[0x3a])
            .build();
        let hdr = Ipv6Header::parse(&packet).unwrap();
        assert!(walk_header_chain(hdr.next_header(), hdr.payload()).is_err());
    }
}
