//! ICMP (Internet Control Message Protocol) - RFC 792

use super::checksum;
use super::ipv4::{Ipv4Builder, Ipv4Header};
use crate::{Error, Result};

/// ICMP header size (type, code, checksum, rest-of-header)
pub const HEADER_SIZE: usize = 8;

/// ICMP protocol number
pub const PROTOCOL_NUMBER: u8 = 1;

/// An ICMPv4 error message must not exceed 576 bytes including the IP header.
const MAX_ERROR_PACKET: usize = 576;

/// ICMP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IcmpType {
    EchoReply = 0,
    DestinationUnreachable = 3,
    SourceQuench = 4,
    Redirect = 5,
    EchoRequest = 8,
    TimeExceeded = 11,
    ParameterProblem = 12,
}

/// Destination Unreachable codes (RFC 792, RFC 1812)
pub mod dest_unreachable {
    pub const NET: u8 = 0;
    pub const HOST: u8 = 1;
    pub const PROTOCOL: u8 = 2;
    pub const PORT: u8 = 3;
    pub const FRAG_NEEDED: u8 = 4;
    /// Communication administratively prohibited
    pub const ADMIN_PROHIBITED: u8 = 13;
}

/// Time Exceeded codes
pub mod time_exceeded {
    pub const TTL: u8 = 0;
    pub const FRAGMENT_REASSEMBLY: u8 = 1;
}

/// Parameter Problem codes
pub mod parameter_problem {
    pub const POINTER: u8 = 0;
    pub const BAD_LENGTH: u8 = 2;
}

/// Returns true for messages involved in a ping.
pub fn is_info(icmp_type: u8) -> bool {
    matches!(icmp_type, 0 | 8)
}

/// Returns true for error responses.
pub fn is_error(icmp_type: u8) -> bool {
    matches!(icmp_type, 3 | 4 | 5 | 11 | 12)
}

/// Parsed ICMP message (zero-copy reference)
#[derive(Debug)]
pub struct IcmpHeader<'a> {
    buffer: &'a [u8],
}

impl<'a> IcmpHeader<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("ICMP message too short".into()));
        }
        Ok(Self { buffer })
    }

    pub fn icmp_type(&self) -> u8 {
        self.buffer[0]
    }

    pub fn code(&self) -> u8 {
        self.buffer[1]
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    /// For Echo Request/Reply: identifier
    pub fn identifier(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }

    /// For Echo Request/Reply: sequence number
    pub fn sequence(&self) -> u16 {
        u16::from_be_bytes([self.buffer[6], self.buffer[7]])
    }

    /// The whole rest-of-header word
    pub fn rest(&self) -> u32 {
        u32::from_be_bytes([self.buffer[4], self.buffer[5], self.buffer[6], self.buffer[7]])
    }

    /// For Fragmentation Needed: the next-hop MTU (low 16 bits of rest)
    pub fn mtu(&self) -> u16 {
        u16::from_be_bytes([self.buffer[6], self.buffer[7]])
    }

    /// For Parameter Problem: the pointer (high 8 bits of rest)
    pub fn pointer(&self) -> u8 {
        self.buffer[4]
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[HEADER_SIZE..]
    }
}

/// Serializes an ICMP header with zeroed checksum.
pub fn header_bytes(icmp_type: u8, code: u8, rest: u32) -> [u8; HEADER_SIZE] {
    let mut hdr = [0u8; HEADER_SIZE];
    hdr[0] = icmp_type;
    hdr[1] = code;
    hdr[4..8].copy_from_slice(&rest.to_be_bytes());
    hdr
}

/// Recomputes the checksum of a complete ICMP message (header + payload).
/// ICMPv4 has no pseudo-header.
pub fn write_checksum(message: &mut [u8]) {
    message[2..4].copy_from_slice(&[0, 0]);
    let ck = checksum::internet_checksum(message);
    message[2..4].copy_from_slice(&ck.to_be_bytes());
}

/// Builds a complete echo message with a valid checksum.
pub fn build_echo(icmp_type: u8, identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let rest = ((identifier as u32) << 16) | sequence as u32;
    let mut message = header_bytes(icmp_type, 0, rest).to_vec();
    message.extend_from_slice(payload);
    write_checksum(&mut message);
    message
}

/// Builds a complete IPv4 packet carrying an ICMP error about "invoking",
/// addressed back to the invoking packet's source. The invoking packet is
/// embedded from its IP header on, truncated to honor the 576-byte limit.
pub fn error_reply(invoking: &[u8], icmp_type: u8, code: u8, rest: u32) -> Result<Vec<u8>> {
    let hdr = Ipv4Header::parse(invoking)?;

    let max_inner = MAX_ERROR_PACKET - super::ipv4::MIN_HEADER_SIZE - HEADER_SIZE;
    let inner_len = invoking.len().min(max_inner);

    let mut message = header_bytes(icmp_type, code, rest).to_vec();
    message.extend_from_slice(&invoking[..inner_len]);
    write_checksum(&mut message);

    Ok(Ipv4Builder::new()
        .src_addr(hdr.dst_addr())
        .dst_addr(hdr.src_addr())
        .protocol(PROTOCOL_NUMBER)
        .ttl(64)
        .payload(&message)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_build_and_parse_echo() {
        let message = build_echo(IcmpType::EchoRequest as u8, 0x1234, 7, b"ping");
        let hdr = IcmpHeader::parse(&message).unwrap();

        assert_eq!(hdr.icmp_type(), 8);
        assert_eq!(hdr.code(), 0);
        assert_eq!(hdr.identifier(), 0x1234);
        assert_eq!(hdr.sequence(), 7);
        assert_eq!(hdr.payload(), b"ping");
        assert_eq!(checksum::internet_checksum(&message), 0);
    }

    #[test]
    fn test_parse_too_short() {
        assert!(IcmpHeader::parse(&[8, 0, 0]).is_err());
    }

    #[test]
    fn test_classification() {
        assert!(is_info(0));
        assert!(is_info(8));
        assert!(!is_info(3));
        assert!(is_error(3));
        assert!(is_error(11));
        assert!(!is_error(8));
        assert!(!is_error(13)); // timestamp: neither
        assert!(!is_info(13));
    }

    #[test]
    fn test_error_reply_swaps_addresses() {
        let invoking = Ipv4Builder::new()
            .src_addr(Ipv4Addr::new(198, 51, 100, 7))
            .dst_addr(Ipv4Addr::new(192, 0, 2, 1))
            .protocol(6)
            .payload(&[0u8; 20])
            .build();

        let reply = error_reply(
            &invoking,
            IcmpType::DestinationUnreachable as u8,
            dest_unreachable::HOST,
            0,
        )
        .unwrap();

        let hdr = Ipv4Header::parse(&reply).unwrap();
        assert_eq!(hdr.src_addr(), Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(hdr.dst_addr(), Ipv4Addr::new(198, 51, 100, 7));
        assert_eq!(hdr.protocol(), PROTOCOL_NUMBER);

        let icmp = IcmpHeader::parse(hdr.payload()).unwrap();
        assert_eq!(icmp.icmp_type(), 3);
        assert_eq!(icmp.code(), 1);
        // The invoking packet is embedded verbatim.
        assert_eq!(icmp.payload(), &invoking[..]);
    }

    #[test]
    fn test_error_reply_truncates_large_invoking() {
        let invoking = Ipv4Builder::new()
            .src_addr(Ipv4Addr::new(198, 51, 100, 7))
            .dst_addr(Ipv4Addr::new(192, 0, 2, 1))
            .protocol(17)
            .payload(&vec![0xAB; 1400])
            .build();

        let reply = error_reply(&invoking, 3, 4, 1280).unwrap();
        assert!(reply.len() <= 576);
    }

    #[test]
    fn test_mtu_accessor() {
        let message = header_bytes(3, 4, 1400);
        let hdr = IcmpHeader::parse(&message).unwrap();
        assert_eq!(hdr.mtu(), 1400);
    }
}
